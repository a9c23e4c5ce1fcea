//! Flat-file IP blacklist with allow-list overrides.
//!
//! Four files feed the index: IPv4 deny, IPv6 deny, IPv4 allow, IPv6
//! allow. Entries are single addresses or CIDR ranges, one per line,
//! `#` comments and blank lines ignored. Allow entries are checked
//! before deny entries, so an allow match always wins.
//!
//! Reloads are wholesale and TTL-gated: the first check after
//! `cache_time_secs` rebuilds the whole snapshot and atomically swaps
//! it in. Per-IP verdicts are memoized separately with their own TTL.

use crate::config::BlacklistConfig;
use crate::shield::store::{now_epoch, ShieldStore};
use dashmap::DashMap;
use ipnet::Ipv6Net;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// IPv4 side of a list: exact addresses plus precomputed
/// (network, mask) pairs for CIDR entries.
#[derive(Debug, Default)]
struct ListV4 {
    exact: HashSet<Ipv4Addr>,
    ranges: Vec<(u32, u32)>,
}

impl ListV4 {
    fn contains(&self, addr: Ipv4Addr) -> bool {
        if self.exact.contains(&addr) {
            return true;
        }
        let bits = u32::from(addr);
        self.ranges
            .iter()
            .any(|(network, mask)| bits & mask == *network)
    }
}

/// IPv6 side of a list: exact addresses plus CIDR networks.
#[derive(Debug, Default)]
struct ListV6 {
    exact: HashSet<Ipv6Addr>,
    ranges: Vec<Ipv6Net>,
}

impl ListV6 {
    fn contains(&self, addr: Ipv6Addr) -> bool {
        self.exact.contains(&addr) || self.ranges.iter().any(|net| net.contains(&addr))
    }
}

/// One immutable load of all four files.
#[derive(Debug, Default)]
struct Snapshot {
    deny_v4: ListV4,
    deny_v6: ListV6,
    allow_v4: ListV4,
    allow_v6: ListV6,
    loaded_at: u64,
}

/// TTL-reloaded blacklist index with per-IP memoization.
pub struct BlacklistIndex {
    config: BlacklistConfig,
    snapshot: RwLock<Arc<Snapshot>>,
    // ip -> (verdict, expiry)
    memo: DashMap<IpAddr, (bool, u64)>,
    store: Option<Arc<dyn ShieldStore>>,
}

impl BlacklistIndex {
    pub fn new(config: BlacklistConfig, store: Option<Arc<dyn ShieldStore>>) -> Self {
        Self {
            config,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            memo: DashMap::new(),
            store,
        }
    }

    /// Whether `ip` is denied: allow lists override deny lists.
    ///
    /// Reloads the file snapshot if stale; memoizes per-IP verdicts.
    /// Any file error leaves the previous snapshot in place.
    pub async fn is_denied(&self, ip: IpAddr) -> bool {
        let now = now_epoch();
        if let Some(entry) = self.memo.get(&ip) {
            if entry.1 > now {
                return entry.0;
            }
        }

        self.reload_if_stale().await;

        let snapshot = self.snapshot.read().clone();
        let denied = match ip {
            IpAddr::V4(v4) => !snapshot.allow_v4.contains(v4) && snapshot.deny_v4.contains(v4),
            IpAddr::V6(v6) => !snapshot.allow_v6.contains(v6) && snapshot.deny_v6.contains(v6),
        };
        self.memo
            .insert(ip, (denied, now + self.config.memo_ttl_secs));
        denied
    }

    /// Append `ip` to the relevant deny file and update the in-memory
    /// snapshot without waiting for the next reload.
    pub async fn persist_deny(&self, ip: IpAddr) -> std::io::Result<()> {
        let path = match ip {
            IpAddr::V4(_) => &self.config.ipv4_deny_path,
            IpAddr::V6(_) => &self.config.ipv6_deny_path,
        };
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{ip}")?;

        {
            let mut guard = self.snapshot.write();
            let mut snapshot = Snapshot {
                loaded_at: guard.loaded_at,
                ..Snapshot::default()
            };
            // Rebuild by cloning sets; snapshots are small enough that
            // copy-on-write here beats interior mutability everywhere.
            snapshot.deny_v4.exact = guard.deny_v4.exact.clone();
            snapshot.deny_v4.ranges = guard.deny_v4.ranges.clone();
            snapshot.deny_v6.exact = guard.deny_v6.exact.clone();
            snapshot.deny_v6.ranges = guard.deny_v6.ranges.clone();
            snapshot.allow_v4.exact = guard.allow_v4.exact.clone();
            snapshot.allow_v4.ranges = guard.allow_v4.ranges.clone();
            snapshot.allow_v6.exact = guard.allow_v6.exact.clone();
            snapshot.allow_v6.ranges = guard.allow_v6.ranges.clone();
            match ip {
                IpAddr::V4(v4) => {
                    snapshot.deny_v4.exact.insert(v4);
                }
                IpAddr::V6(v6) => {
                    snapshot.deny_v6.exact.insert(v6);
                }
            }
            *guard = Arc::new(snapshot);
        }
        self.memo.remove(&ip);
        Ok(())
    }

    /// Drop expired memo entries.
    pub fn prune_memo(&self) -> usize {
        let now = now_epoch();
        let before = self.memo.len();
        self.memo.retain(|_, (_, exp)| *exp > now);
        before - self.memo.len()
    }

    async fn reload_if_stale(&self) {
        let now = now_epoch();
        {
            let guard = self.snapshot.read();
            if guard.loaded_at != 0 && now < guard.loaded_at + self.config.cache_time_secs {
                return;
            }
        }

        let snapshot = Snapshot {
            deny_v4: self.load_v4(&self.config.ipv4_deny_path).await,
            deny_v6: self.load_v6(&self.config.ipv6_deny_path).await,
            allow_v4: self.load_v4(&self.config.ipv4_allow_path).await,
            allow_v6: self.load_v6(&self.config.ipv6_allow_path).await,
            loaded_at: now,
        };
        debug!(
            deny_v4 = snapshot.deny_v4.exact.len() + snapshot.deny_v4.ranges.len(),
            deny_v6 = snapshot.deny_v6.exact.len() + snapshot.deny_v6.ranges.len(),
            "Reloaded blacklist snapshot"
        );
        // Old memo verdicts may contradict the new snapshot
        self.memo.clear();
        *self.snapshot.write() = Arc::new(snapshot);
    }

    async fn load_v4(&self, path: &str) -> ListV4 {
        let mut list = ListV4::default();
        let Some(content) = self.read_list_file(path).await else {
            return list;
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((addr_part, prefix_part)) = line.split_once('/') {
                let parsed = addr_part
                    .parse::<Ipv4Addr>()
                    .ok()
                    .zip(prefix_part.parse::<u32>().ok().filter(|p| *p <= 32));
                match parsed {
                    Some((addr, prefix)) => {
                        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                        list.ranges.push((u32::from(addr) & mask, mask));
                    }
                    None => warn!(path = %path, line = %line, "Skipping malformed IPv4 list entry"),
                }
            } else {
                match line.parse::<Ipv4Addr>() {
                    Ok(addr) => {
                        list.exact.insert(addr);
                    }
                    Err(_) => warn!(path = %path, line = %line, "Skipping malformed IPv4 list entry"),
                }
            }
        }
        list
    }

    async fn load_v6(&self, path: &str) -> ListV6 {
        let mut list = ListV6::default();
        let Some(content) = self.read_list_file(path).await else {
            return list;
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.contains('/') {
                match line.parse::<Ipv6Net>() {
                    Ok(net) => list.ranges.push(net),
                    Err(_) => warn!(path = %path, line = %line, "Skipping malformed IPv6 list entry"),
                }
            } else {
                match line.parse::<Ipv6Addr>() {
                    Ok(addr) => {
                        list.exact.insert(addr);
                    }
                    Err(_) => warn!(path = %path, line = %line, "Skipping malformed IPv6 list entry"),
                }
            }
        }
        list
    }

    /// Read a list file, preferring a store-mirrored copy when mirroring
    /// is on so sibling workers amortize disk reads.
    async fn read_list_file(&self, path: &str) -> Option<String> {
        if self.config.mirror_to_store {
            if let Some(store) = &self.store {
                let key = format!("blacklist:{path}");
                if let Ok(Some(blob)) = store.get_blob(&key).await {
                    return String::from_utf8(blob).ok();
                }
                if let Ok(content) = std::fs::read_to_string(path) {
                    let ttl = Duration::from_secs(self.config.cache_time_secs);
                    if let Err(e) = store.put_blob(&key, content.as_bytes(), ttl).await {
                        warn!(error = %e, path = %path, "Failed to mirror blacklist file to store");
                    }
                    return Some(content);
                }
                return None;
            }
        }
        std::fs::read_to_string(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_list(dir: &std::path::Path, name: &str, lines: &[&str]) -> String {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    fn index_with(dir: &tempfile::TempDir, deny: &[&str], allow: &[&str]) -> BlacklistIndex {
        let config = BlacklistConfig {
            ipv4_deny_path: write_list(dir.path(), "ban.txt", deny),
            ipv6_deny_path: write_list(dir.path(), "banv6.txt", &[]),
            ipv4_allow_path: write_list(dir.path(), "unban.txt", allow),
            ipv6_allow_path: write_list(dir.path(), "unbanv6.txt", &[]),
            mirror_to_store: false,
            ..BlacklistConfig::default()
        };
        BlacklistIndex::new(config, None)
    }

    #[tokio::test]
    async fn exact_deny_match() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_with(&dir, &["192.0.2.1"], &[]);
        assert!(index.is_denied("192.0.2.1".parse().unwrap()).await);
        assert!(!index.is_denied("192.0.2.2".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn cidr_deny_match() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_with(&dir, &["10.0.0.0/24"], &[]);
        assert!(index.is_denied("10.0.0.5".parse().unwrap()).await);
        assert!(!index.is_denied("10.0.1.5".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn allow_overrides_deny() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_with(&dir, &["10.0.0.0/24"], &["10.0.0.5"]);
        assert!(!index.is_denied("10.0.0.5".parse().unwrap()).await);
        assert!(index.is_denied("10.0.0.6".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn comments_and_garbage_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_with(&dir, &["# comment", "", "not-an-ip", "192.0.2.7"], &[]);
        assert!(index.is_denied("192.0.2.7".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn ipv6_exact_and_cidr() {
        let dir = tempfile::tempdir().unwrap();
        let config = BlacklistConfig {
            ipv4_deny_path: write_list(dir.path(), "ban.txt", &[]),
            ipv6_deny_path: write_list(dir.path(), "banv6.txt", &["2001:db8::1", "2001:db8:1::/48"]),
            ipv4_allow_path: write_list(dir.path(), "unban.txt", &[]),
            ipv6_allow_path: write_list(dir.path(), "unbanv6.txt", &[]),
            mirror_to_store: false,
            ..BlacklistConfig::default()
        };
        let index = BlacklistIndex::new(config, None);
        assert!(index.is_denied("2001:db8::1".parse().unwrap()).await);
        assert!(index.is_denied("2001:db8:1::42".parse().unwrap()).await);
        assert!(!index.is_denied("2001:db8:2::1".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn missing_files_deny_nothing() {
        let config = BlacklistConfig {
            ipv4_deny_path: "/nonexistent/ban.txt".to_string(),
            ipv6_deny_path: "/nonexistent/banv6.txt".to_string(),
            ipv4_allow_path: "/nonexistent/unban.txt".to_string(),
            ipv6_allow_path: "/nonexistent/unbanv6.txt".to_string(),
            mirror_to_store: false,
            ..BlacklistConfig::default()
        };
        let index = BlacklistIndex::new(config, None);
        assert!(!index.is_denied("192.0.2.1".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn mirroring_covers_both_address_families() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ShieldStore> = Arc::new(crate::shield::store::MemoryStore::new());
        let config = BlacklistConfig {
            ipv4_deny_path: write_list(dir.path(), "ban.txt", &["192.0.2.1"]),
            ipv6_deny_path: write_list(dir.path(), "banv6.txt", &["2001:db8::1"]),
            ipv4_allow_path: write_list(dir.path(), "unban.txt", &[]),
            ipv6_allow_path: write_list(dir.path(), "unbanv6.txt", &[]),
            mirror_to_store: true,
            ..BlacklistConfig::default()
        };
        let paths = [config.ipv4_deny_path.clone(), config.ipv6_deny_path.clone()];
        let index = BlacklistIndex::new(config, Some(store.clone()));
        assert!(index.is_denied("2001:db8::1".parse().unwrap()).await);
        // One reload mirrored every file, v6 included
        for path in paths {
            let blob = store.get_blob(&format!("blacklist:{path}")).await.unwrap();
            assert!(blob.is_some(), "{path} not mirrored");
        }
    }

    #[tokio::test]
    async fn persist_deny_takes_effect_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_with(&dir, &[], &[]);
        let ip: IpAddr = "198.51.100.9".parse().unwrap();
        assert!(!index.is_denied(ip).await);
        index.persist_deny(ip).await.unwrap();
        assert!(index.is_denied(ip).await);
        // And it is on disk for the next reload
        let content = std::fs::read_to_string(&index.config.ipv4_deny_path).unwrap();
        assert!(content.contains("198.51.100.9"));
    }

    #[tokio::test]
    async fn memo_caches_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_with(&dir, &["192.0.2.1"], &[]);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(index.is_denied(ip).await);
        assert!(index.memo.contains_key(&ip));
        assert_eq!(index.prune_memo(), 0);
    }
}
