//! Browser challenges for loaded periods.
//!
//! Two tiers: a JS arithmetic challenge for moderate load and a
//! proof-of-work challenge for high load. Verification state lives in
//! the shared store under `challenge:<token>` and `pow:<token>` flags
//! keyed by the client's cookie token.
//!
//! The JS tier is deliberately presence-verified only: completing the
//! page sets the cookie, and a later request with a known token passes.
//! It filters clients that don't execute JS, nothing more. The PoW tier
//! verifies the submitted digest.

use crate::config::ChallengeConfig;
use crate::error::StoreError;
use crate::shield::store::ShieldStore;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Which challenge tier to present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Arithmetic-in-JS page; filters non-browser clients.
    JsMath,
    /// SHA-256 proof-of-work; costs the client real compute.
    ProofOfWork,
}

/// Issues and verifies challenge tokens against the shared store.
pub struct ChallengeEngine {
    store: Arc<dyn ShieldStore>,
    config: ChallengeConfig,
}

impl ChallengeEngine {
    pub fn new(store: Arc<dyn ShieldStore>, config: ChallengeConfig) -> Self {
        Self { store, config }
    }

    pub fn cookie_name(&self) -> &str {
        &self.config.cookie_name
    }

    pub fn cookie_lifetime(&self) -> Duration {
        Duration::from_secs(self.config.cookie_lifetime_secs)
    }

    pub fn pow_difficulty(&self) -> usize {
        self.config.pow_difficulty
    }

    /// Generate a fresh opaque token for a new challenge.
    pub fn new_token() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Record that a JS challenge page was served for `token`. The flag
    /// lives only as long as an unanswered challenge should.
    pub async fn issue_js(&self, token: &str) -> Result<(), StoreError> {
        self.store
            .set_flag(
                &format!("challenge:{token}"),
                Duration::from_secs(self.config.challenge_timeout_secs),
            )
            .await
    }

    /// Whether `token` has passed either challenge tier.
    ///
    /// A live JS flag counts as passed and is promoted to the full
    /// cookie lifetime on first sight.
    pub async fn is_verified(&self, token: &str) -> Result<bool, StoreError> {
        if self.store.flag_exists(&format!("pow:{token}")).await? {
            return Ok(true);
        }
        let js_key = format!("challenge:{token}");
        if self.store.flag_exists(&js_key).await? {
            self.store
                .refresh_flag(&js_key, self.cookie_lifetime())
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Check a `<nonce>:<hash>` proof-of-work submission for `token`.
    ///
    /// The hash must equal sha256(token + nonce) and carry at least
    /// `pow_difficulty` leading zero hex digits. On success the token
    /// is marked verified for the cookie lifetime.
    pub async fn verify_pow(&self, token: &str, solution: &str) -> Result<bool, StoreError> {
        let Some((nonce, submitted)) = solution.split_once(':') else {
            return Ok(false);
        };
        let digest = hex::encode(Sha256::digest(format!("{token}{nonce}").as_bytes()));
        let target = "0".repeat(self.config.pow_difficulty);
        if digest != submitted || !digest.starts_with(&target) {
            return Ok(false);
        }
        self.store
            .set_flag(&format!("pow:{token}"), self.cookie_lifetime())
            .await?;
        Ok(true)
    }
}
