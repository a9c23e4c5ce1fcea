//! Request shielding: admission control in front of the gateway.
//!
//! The [`gate::ShieldGate`] runs the pipeline; the submodules supply
//! its parts: counter/flag storage, the flat-file blacklist, browser
//! challenges, load sampling, and pattern scanning.

pub mod blacklist;
pub mod challenge;
pub mod gate;
pub mod load;
pub mod patterns;
pub mod store;

pub use blacklist::BlacklistIndex;
pub use challenge::{ChallengeEngine, ChallengeKind};
pub use gate::{AdmitContext, Decision, RejectReason, ShieldGate};
pub use load::{LoadMonitor, SystemLoadProbe};
pub use store::{build_store, FileStore, MemoryStore, RedisStore, ShieldStore};
