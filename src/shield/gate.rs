//! The admission pipeline.
//!
//! Every request passes through an ordered series of checks that
//! short-circuits at the first decisive answer:
//!
//! 1. whitelist pass-through
//! 2. active ban lookup (plus the flat-file blacklist when the host is
//!    under high load)
//! 3. challenge escalation by load level
//! 4. suspicious-pattern scan, with an immediate ban on a hit
//! 5. sliding-window rate check, tightened for verified clients while
//!    the host is loaded
//!
//! Store failures fail open: a broken backend must never ban legitimate
//! traffic, so errors log and the check passes.

use crate::config::ShieldConfig;
use crate::metrics;
use crate::shield::blacklist::BlacklistIndex;
use crate::shield::challenge::{ChallengeEngine, ChallengeKind};
use crate::shield::load::{LoadLevel, LoadMonitor};
use crate::shield::patterns::SuspectScanner;
use crate::shield::store::ShieldStore;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What the gate decided for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Proceed to the handler.
    Allow,
    /// Present a challenge page of the given tier.
    Challenge(ChallengeKind),
    /// Refuse with the given status.
    Reject { status: u16, reason: RejectReason },
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Banned,
    Blacklisted,
    SuspiciousPattern,
    RateLimited,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Banned => "banned",
            Self::Blacklisted => "blacklisted",
            Self::SuspiciousPattern => "suspicious_pattern",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Everything the gate needs to know about one request.
#[derive(Debug)]
pub struct AdmitContext<'a> {
    pub ip: IpAddr,
    /// Challenge cookie value, if the client sent one.
    pub token: Option<&'a str>,
    /// Request line, user agent, and query string joined for scanning.
    pub corpus: &'a str,
}

/// The assembled admission gate.
pub struct ShieldGate {
    config: ShieldConfig,
    store: Arc<dyn ShieldStore>,
    blacklist: Arc<BlacklistIndex>,
    challenges: Arc<ChallengeEngine>,
    load: LoadMonitor,
    scanner: SuspectScanner,
    whitelist: HashSet<IpAddr>,
}

impl ShieldGate {
    pub fn new(
        config: ShieldConfig,
        store: Arc<dyn ShieldStore>,
        blacklist: Arc<BlacklistIndex>,
        challenges: Arc<ChallengeEngine>,
        load: LoadMonitor,
    ) -> Self {
        let whitelist = config
            .whitelist
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(entry = %s, "Skipping malformed whitelist entry");
                    None
                }
            })
            .collect();
        let scanner = SuspectScanner::new(&config.extra_patterns);
        Self {
            config,
            store,
            blacklist,
            challenges,
            load,
            scanner,
            whitelist,
        }
    }

    /// Run the full pipeline for one request.
    pub async fn admit(&self, ctx: &AdmitContext<'_>) -> Decision {
        if self.whitelist.contains(&ctx.ip) {
            return Decision::Allow;
        }

        // Sampled once so every later step sees the same level.
        let load = self.load.level();

        if self.is_banned_open(ctx.ip).await {
            metrics::record_reject(RejectReason::Banned.as_str());
            return Decision::Reject {
                status: 403,
                reason: RejectReason::Banned,
            };
        }

        // The flat-file lookup costs file I/O on a cold snapshot, so it
        // only runs when the host is already struggling.
        if load == LoadLevel::High && self.blacklist.is_denied(ctx.ip).await {
            info!(ip = %ctx.ip, "Rejecting blacklisted address");
            metrics::record_reject(RejectReason::Blacklisted.as_str());
            return Decision::Reject {
                status: 403,
                reason: RejectReason::Blacklisted,
            };
        }

        let verified = match ctx.token {
            Some(token) => match self.challenges.is_verified(token).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Challenge verification unavailable, treating as unverified");
                    false
                }
            },
            None => false,
        };

        if !verified {
            match load {
                LoadLevel::Medium => {
                    metrics::record_challenge("js");
                    return Decision::Challenge(ChallengeKind::JsMath);
                }
                LoadLevel::High => {
                    metrics::record_challenge("pow");
                    return Decision::Challenge(ChallengeKind::ProofOfWork);
                }
                LoadLevel::Normal => {}
            }
        }

        if let Some(pattern) = self.scanner.scan(ctx.corpus) {
            warn!(ip = %ctx.ip, pattern = %pattern, "Banning address for suspicious request");
            self.ban_open(ctx.ip).await;
            // Under high load the ban also goes to the flat-file deny
            // list so it outlives the store
            if load == LoadLevel::High {
                if let Err(e) = self.blacklist.persist_deny(ctx.ip).await {
                    warn!(error = %e, ip = %ctx.ip, "Failed to persist deny-list entry");
                }
            }
            metrics::record_reject(RejectReason::SuspiciousPattern.as_str());
            return Decision::Reject {
                status: 403,
                reason: RejectReason::SuspiciousPattern,
            };
        }

        // Even verified clients get a tightened allowance while the
        // host is loaded.
        let limit = if verified && load > LoadLevel::Normal {
            (self.config.request_limit / 3).max(5)
        } else {
            self.config.request_limit
        };

        let window = Duration::from_secs(self.config.time_window_secs);
        let count = match self.store.record_request(&ctx.ip.to_string(), window).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, ip = %ctx.ip, "Rate store unavailable, admitting without count");
                return Decision::Allow;
            }
        };
        if count > u64::from(limit) {
            info!(ip = %ctx.ip, count = count, limit = limit, "Banning address for exceeding rate limit");
            self.ban_open(ctx.ip).await;
            metrics::record_reject(RejectReason::RateLimited.as_str());
            return Decision::Reject {
                status: 429,
                reason: RejectReason::RateLimited,
            };
        }

        Decision::Allow
    }

    /// The cheap checks for auxiliary endpoints such as challenge
    /// submissions: whitelist, active ban, and the sliding window.
    /// Never challenges; the caller is already mid-challenge.
    pub async fn precheck(&self, ip: IpAddr) -> Decision {
        if self.whitelist.contains(&ip) {
            return Decision::Allow;
        }
        if self.is_banned_open(ip).await {
            metrics::record_reject(RejectReason::Banned.as_str());
            return Decision::Reject {
                status: 403,
                reason: RejectReason::Banned,
            };
        }
        let window = Duration::from_secs(self.config.time_window_secs);
        let count = match self.store.record_request(&ip.to_string(), window).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, ip = %ip, "Rate store unavailable, admitting without count");
                return Decision::Allow;
            }
        };
        if count > u64::from(self.config.request_limit) {
            info!(ip = %ip, count = count, "Banning address for exceeding rate limit");
            self.ban_open(ip).await;
            metrics::record_reject(RejectReason::RateLimited.as_str());
            return Decision::Reject {
                status: 429,
                reason: RejectReason::RateLimited,
            };
        }
        Decision::Allow
    }

    async fn is_banned_open(&self, ip: IpAddr) -> bool {
        match self.store.is_banned(&ip.to_string()).await {
            Ok(banned) => banned,
            Err(e) => {
                warn!(error = %e, ip = %ip, "Ban store unavailable, treating as not banned");
                false
            }
        }
    }

    async fn ban_open(&self, ip: IpAddr) {
        let duration = Duration::from_secs(self.config.ban_time_secs);
        if let Err(e) = self.store.ban(&ip.to_string(), duration).await {
            warn!(error = %e, ip = %ip, "Failed to record ban");
        }
    }
}
