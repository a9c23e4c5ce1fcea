//! Counter/flag/blob storage behind the shielding layer.
//!
//! Three interchangeable backends:
//! - [`MemoryStore`]: in-process DashMaps, fastest, per-worker only
//! - [`RedisStore`]: shared KV with native TTLs and atomic sorted-set
//!   operations for the sliding window
//! - [`FileStore`]: filesystem fallback using temp-file + rename for
//!   atomic replacement; weaker concurrency guarantees, documented and
//!   accepted
//!
//! All expiry is lazy: an entry past its deadline reads as absent. The
//! file backend additionally gets a periodic [`FileStore::sweep`] since
//! files don't self-expire.

use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Current Unix time in seconds.
pub(crate) fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Pluggable counter/flag/blob storage.
///
/// `record_request` must have increment-and-read semantics: the count
/// it returns includes the request being recorded, so two racing
/// requests from one IP cannot both observe the pre-increment count.
#[async_trait]
pub trait ShieldStore: Send + Sync {
    /// Record a request timestamp for `ip`, evict entries older than
    /// `window`, and return the number of requests remaining in the
    /// window (including this one).
    async fn record_request(&self, ip: &str, window: Duration) -> Result<u64, StoreError>;

    /// Whether `ip` currently has an active ban.
    async fn is_banned(&self, ip: &str) -> Result<bool, StoreError>;

    /// Ban `ip` for `duration`.
    async fn ban(&self, ip: &str, duration: Duration) -> Result<(), StoreError>;

    /// Whether a boolean flag exists and has not expired.
    async fn flag_exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Set a boolean flag with a TTL.
    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Reset the TTL of an existing flag. No-op if the flag is absent.
    async fn refresh_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Fetch a cached blob, or `None` if absent or expired.
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store a blob with a TTL.
    async fn put_blob(&self, key: &str, data: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Remove a key of any kind.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Backend-specific maintenance pass. Redis expires keys natively;
    /// the memory and file backends drop stale entries here. Returns
    /// the number of entries removed.
    fn maintain(&self) -> usize {
        0
    }
}

// ============================================================================
// Memory backend
// ============================================================================

/// In-process store. Shared across tasks within one worker, invisible
/// to other workers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<String, Vec<u64>>,
    bans: DashMap<String, u64>,
    flags: DashMap<String, u64>,
    blobs: DashMap<String, (Vec<u8>, u64)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Called from a maintenance task; not
    /// required for correctness since reads check expiry themselves.
    pub fn prune(&self) -> usize {
        let now = now_epoch();
        let mut removed = 0;
        self.bans.retain(|_, exp| {
            let keep = *exp > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.flags.retain(|_, exp| {
            let keep = *exp > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.blobs.retain(|_, (_, exp)| {
            let keep = *exp > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}

#[async_trait]
impl ShieldStore for MemoryStore {
    async fn record_request(&self, ip: &str, window: Duration) -> Result<u64, StoreError> {
        let now = now_epoch();
        let cutoff = now.saturating_sub(window.as_secs());
        // The entry lock makes this an atomic increment-and-read.
        let mut entry = self.windows.entry(ip.to_string()).or_default();
        entry.retain(|ts| *ts > cutoff);
        entry.push(now);
        Ok(entry.len() as u64)
    }

    async fn is_banned(&self, ip: &str) -> Result<bool, StoreError> {
        // Copy the expiry out: the read guard and the removal below
        // contend for the same shard lock.
        let expiry = self.bans.get(ip).map(|exp| *exp);
        match expiry {
            Some(exp) if exp > now_epoch() => Ok(true),
            Some(_) => {
                self.bans.remove(ip);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn ban(&self, ip: &str, duration: Duration) -> Result<(), StoreError> {
        self.bans
            .insert(ip.to_string(), now_epoch() + duration.as_secs());
        Ok(())
    }

    async fn flag_exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .flags
            .get(key)
            .is_some_and(|exp| *exp > now_epoch()))
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.flags
            .insert(key.to_string(), now_epoch() + ttl.as_secs());
        Ok(())
    }

    async fn refresh_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut exp) = self.flags.get_mut(key) {
            *exp = now_epoch() + ttl.as_secs();
        }
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.blobs.get(key) {
            Some(entry) if entry.1 > now_epoch() => Ok(Some(entry.0.clone())),
            _ => Ok(None),
        }
    }

    async fn put_blob(&self, key: &str, data: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.blobs
            .insert(key.to_string(), (data.to_vec(), now_epoch() + ttl.as_secs()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.windows.remove(key);
        self.bans.remove(key);
        self.flags.remove(key);
        self.blobs.remove(key);
        Ok(())
    }

    fn maintain(&self) -> usize {
        self.prune()
    }
}

// ============================================================================
// Redis backend
// ============================================================================

/// Shared KV store. Sliding windows live in sorted sets so that
/// concurrent workers see one consistent count; everything else uses
/// native key TTLs.
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect to Redis. Fails fast so the caller can fall back to
    /// another backend.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        debug!(url = %url, "Connected to Redis store");
        Ok(Self {
            manager,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, kind: &str, rest: &str) -> String {
        format!("{}{}:{}", self.prefix, kind, rest)
    }
}

#[async_trait]
impl ShieldStore for RedisStore {
    async fn record_request(&self, ip: &str, window: Duration) -> Result<u64, StoreError> {
        let key = self.key("rate", ip);
        let now = now_epoch();
        let member = format!(
            "{}:{}",
            now,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_micros())
                .unwrap_or(0)
        );
        let mut con = self.manager.clone();
        let _: () = con.zadd(&key, member, now).await?;
        let cutoff = now.saturating_sub(window.as_secs());
        let _: () = con.zrembyscore(&key, 0, cutoff).await?;
        let _: () = con.expire(&key, (window.as_secs() * 2) as i64).await?;
        let count: u64 = con.zcard(&key).await?;
        Ok(count)
    }

    async fn is_banned(&self, ip: &str) -> Result<bool, StoreError> {
        let mut con = self.manager.clone();
        let exists: bool = con.exists(self.key("banned", ip)).await?;
        Ok(exists)
    }

    async fn ban(&self, ip: &str, duration: Duration) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let expiry = now_epoch() + duration.as_secs();
        let _: () = con
            .set_ex(self.key("banned", ip), expiry, duration.as_secs())
            .await?;
        Ok(())
    }

    async fn flag_exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut con = self.manager.clone();
        let exists: bool = con.exists(self.key("flag", key)).await?;
        Ok(exists)
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.set_ex(self.key("flag", key), 1, ttl.as_secs()).await?;
        Ok(())
    }

    async fn refresh_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con
            .expire(self.key("flag", key), ttl.as_secs() as i64)
            .await?;
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut con = self.manager.clone();
        let value: Option<Vec<u8>> = con.get(self.key("blob", key)).await?;
        Ok(value)
    }

    async fn put_blob(&self, key: &str, data: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con
            .set_ex(self.key("blob", key), data, ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        for kind in ["rate", "banned", "flag", "blob"] {
            let _: () = con.del(self.key(kind, key)).await?;
        }
        Ok(())
    }
}

// ============================================================================
// File backend
// ============================================================================

/// JSON envelope for file-backed entries. Expiry travels inside the
/// file so a reader never has to trust mtimes.
#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    expires_at: u64,
    #[serde(default)]
    timestamps: Vec<u64>,
    #[serde(default)]
    data: Vec<u8>,
}

/// Filesystem fallback store.
///
/// Writes go through a temp file and rename so readers never observe a
/// partial entry. Cross-process increment-and-read is weaker than the
/// Redis backend (two processes can race between read and rename);
/// accepted for the fallback tier.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, kind: &str, key: &str) -> PathBuf {
        let digest = Sha256::digest(format!("{kind}:{key}").as_bytes());
        self.dir.join(format!("{}_{}.json", kind, &hex::encode(digest)[..24]))
    }

    fn read_entry(path: &Path) -> Option<FileEntry> {
        let raw = std::fs::read(path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn write_entry(&self, path: &Path, entry: &FileEntry) -> Result<(), StoreError> {
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, serde_json::to_vec(entry)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Remove files whose embedded expiry has passed. The file backend
    /// needs this occasionally since nothing else deletes stale files.
    pub fn sweep(&self) -> usize {
        let now = now_epoch();
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let stale = match Self::read_entry(&path) {
                Some(e) => e.expires_at <= now,
                // Unparseable file: treat as stale
                None => true,
            };
            if stale && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed = removed, "Swept expired file-store entries");
        }
        removed
    }
}

#[async_trait]
impl ShieldStore for FileStore {
    async fn record_request(&self, ip: &str, window: Duration) -> Result<u64, StoreError> {
        let path = self.path_for("rate", ip);
        let now = now_epoch();
        let cutoff = now.saturating_sub(window.as_secs());
        let mut timestamps = Self::read_entry(&path)
            .filter(|e| e.expires_at > now)
            .map(|e| e.timestamps)
            .unwrap_or_default();
        timestamps.retain(|ts| *ts > cutoff);
        timestamps.push(now);
        let count = timestamps.len() as u64;
        self.write_entry(
            &path,
            &FileEntry {
                expires_at: now + window.as_secs() * 2,
                timestamps,
                data: Vec::new(),
            },
        )?;
        Ok(count)
    }

    async fn is_banned(&self, ip: &str) -> Result<bool, StoreError> {
        let path = self.path_for("banned", ip);
        match Self::read_entry(&path) {
            Some(entry) if entry.expires_at > now_epoch() => Ok(true),
            Some(_) => {
                // Expired ban: remove the record
                let _ = std::fs::remove_file(&path);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn ban(&self, ip: &str, duration: Duration) -> Result<(), StoreError> {
        self.write_entry(
            &self.path_for("banned", ip),
            &FileEntry {
                expires_at: now_epoch() + duration.as_secs(),
                timestamps: Vec::new(),
                data: Vec::new(),
            },
        )
    }

    async fn flag_exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(Self::read_entry(&self.path_for("flag", key))
            .is_some_and(|e| e.expires_at > now_epoch()))
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.write_entry(
            &self.path_for("flag", key),
            &FileEntry {
                expires_at: now_epoch() + ttl.as_secs(),
                timestamps: Vec::new(),
                data: Vec::new(),
            },
        )
    }

    async fn refresh_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let path = self.path_for("flag", key);
        if let Some(entry) = Self::read_entry(&path) {
            if entry.expires_at > now_epoch() {
                return self.write_entry(
                    &path,
                    &FileEntry {
                        expires_at: now_epoch() + ttl.as_secs(),
                        ..entry
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(Self::read_entry(&self.path_for("blob", key))
            .filter(|e| e.expires_at > now_epoch())
            .map(|e| e.data))
    }

    async fn put_blob(&self, key: &str, data: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.write_entry(
            &self.path_for("blob", key),
            &FileEntry {
                expires_at: now_epoch() + ttl.as_secs(),
                timestamps: Vec::new(),
                data: data.to_vec(),
            },
        )
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        for kind in ["rate", "banned", "flag", "blob"] {
            let _ = std::fs::remove_file(self.path_for(kind, key));
        }
        Ok(())
    }

    fn maintain(&self) -> usize {
        self.sweep()
    }
}

/// Build the configured store, falling back memory-ward when the
/// preferred backend is unavailable.
pub async fn build_store(
    config: &crate::config::StoreConfig,
) -> std::sync::Arc<dyn ShieldStore> {
    use crate::config::StoreBackend;
    match config.backend {
        StoreBackend::Redis => {
            match RedisStore::connect(&config.redis_url, &config.prefix).await {
                Ok(store) => return std::sync::Arc::new(store),
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, falling back to memory store");
                }
            }
            std::sync::Arc::new(MemoryStore::new())
        }
        StoreBackend::File => {
            let dir = if config.file_dir.is_empty() {
                std::env::temp_dir().join("subgate-store")
            } else {
                PathBuf::from(&config.file_dir)
            };
            match FileStore::new(&dir) {
                Ok(store) => std::sync::Arc::new(store),
                Err(e) => {
                    warn!(error = %e, dir = %dir.display(), "File store unavailable, falling back to memory store");
                    std::sync::Arc::new(MemoryStore::new())
                }
            }
        }
        StoreBackend::Memory => std::sync::Arc::new(MemoryStore::new()),
    }
}
