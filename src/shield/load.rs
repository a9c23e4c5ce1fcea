//! System load sampling for challenge escalation.

use crate::config::LoadConfig;

/// How stressed the host is, derived from the 1-minute load average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadLevel {
    Normal,
    Medium,
    High,
}

/// Source of the 1-minute load average. Swappable so tests can pin a
/// level.
pub trait LoadProbe: Send + Sync {
    /// Current 1-minute load average, or `None` if unavailable.
    fn one_minute(&self) -> Option<f64>;
}

/// Reads `/proc/loadavg`. On platforms without it, reports no load,
/// which keeps the gate at its normal tier.
#[derive(Debug, Default)]
pub struct SystemLoadProbe;

impl LoadProbe for SystemLoadProbe {
    fn one_minute(&self) -> Option<f64> {
        let content = std::fs::read_to_string("/proc/loadavg").ok()?;
        content.split_whitespace().next()?.parse().ok()
    }
}

/// Fixed probe for tests.
#[derive(Debug)]
pub struct FixedLoadProbe(pub f64);

impl LoadProbe for FixedLoadProbe {
    fn one_minute(&self) -> Option<f64> {
        Some(self.0)
    }
}

/// Maps a probe reading onto a [`LoadLevel`] via configured thresholds.
pub struct LoadMonitor {
    probe: Box<dyn LoadProbe>,
    config: LoadConfig,
}

impl LoadMonitor {
    pub fn new(probe: Box<dyn LoadProbe>, config: LoadConfig) -> Self {
        Self { probe, config }
    }

    /// Sample once. An unreadable probe counts as normal load.
    pub fn level(&self) -> LoadLevel {
        match self.probe.one_minute() {
            Some(avg) if avg > self.config.high_threshold => LoadLevel::High,
            Some(avg) if avg > self.config.medium_threshold => LoadLevel::Medium,
            _ => LoadLevel::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(load: f64) -> LoadMonitor {
        LoadMonitor::new(Box::new(FixedLoadProbe(load)), LoadConfig::default())
    }

    #[test]
    fn thresholds() {
        assert_eq!(monitor(0.5).level(), LoadLevel::Normal);
        assert_eq!(monitor(3.0).level(), LoadLevel::Normal);
        assert_eq!(monitor(3.1).level(), LoadLevel::Medium);
        assert_eq!(monitor(5.0).level(), LoadLevel::Medium);
        assert_eq!(monitor(5.1).level(), LoadLevel::High);
    }

    #[test]
    fn unreadable_probe_is_normal() {
        struct NoProbe;
        impl LoadProbe for NoProbe {
            fn one_minute(&self) -> Option<f64> {
                None
            }
        }
        let monitor = LoadMonitor::new(Box::new(NoProbe), LoadConfig::default());
        assert_eq!(monitor.level(), LoadLevel::Normal);
    }

    #[test]
    fn levels_are_ordered() {
        assert!(LoadLevel::Normal < LoadLevel::Medium);
        assert!(LoadLevel::Medium < LoadLevel::High);
    }
}
