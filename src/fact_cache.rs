//! Host fact caches: an in-memory variant for one-shot runs and a
//! filesystem variant with a freshness window.
//!
//! A miss is an explicit `None`, never an error; the cache either returns a
//! fresh entry or signals that the host needs gathering. It never returns
//! stale data.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::value::ValueMap;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cannot create fact cache directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub enum FactCache {
    Memory(MemoryFactCache),
    Filesystem(FilesystemFactCache),
}

impl FactCache {
    pub fn memory() -> Self {
        FactCache::Memory(MemoryFactCache::default())
    }

    pub fn filesystem(
        directory: impl Into<PathBuf>,
        lifetime: Duration,
    ) -> Result<Self, CacheError> {
        Ok(FactCache::Filesystem(FilesystemFactCache::new(
            directory, lifetime,
        )?))
    }

    /// The cached facts for `hostname`, or `None` when the host needs an
    /// update.
    pub fn get(&self, hostname: &str) -> Option<ValueMap> {
        match self {
            FactCache::Memory(cache) => cache.get(hostname),
            FactCache::Filesystem(cache) => cache.get(hostname),
        }
    }

    /// Store freshly gathered facts. Failures degrade silently: the host
    /// simply stays uncached.
    pub fn update(&mut self, hostname: &str, facts: &ValueMap) {
        match self {
            FactCache::Memory(cache) => cache.update(hostname, facts),
            FactCache::Filesystem(cache) => cache.update(hostname, facts),
        }
    }
}

impl Display for FactCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FactCache::Memory(_) => write!(f, "<memory fact cache>"),
            FactCache::Filesystem(cache) => write!(
                f,
                "<filesystem fact cache at {} (lifetime {:?})>",
                cache.directory.display(),
                cache.lifetime
            ),
        }
    }
}

#[derive(Default)]
pub struct MemoryFactCache {
    cache: HashMap<String, ValueMap>,
}

impl MemoryFactCache {
    fn get(&self, hostname: &str) -> Option<ValueMap> {
        self.cache.get(hostname).cloned()
    }

    fn update(&mut self, hostname: &str, facts: &ValueMap) {
        self.cache.insert(hostname.to_owned(), facts.clone());
    }
}

pub struct FilesystemFactCache {
    directory: PathBuf,
    lifetime: Duration,
}

impl FilesystemFactCache {
    fn new(directory: impl Into<PathBuf>, lifetime: Duration) -> Result<Self, CacheError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)
            .map_err(|source| CacheError::Create { path: directory.clone(), source })?;
        set_mode(&directory, 0o755);
        Ok(FilesystemFactCache { directory, lifetime })
    }

    /// Entries are named by the hash of the host name, kept md5 for
    /// compatibility with existing cache directories.
    fn entry_path(&self, hostname: &str) -> PathBuf {
        let digest = md5::compute(hostname.as_bytes());
        self.directory.join(format!("{digest:x}.p"))
    }

    /// An entry is valid until its creation time plus the configured
    /// lifetime. A missing file is not valid.
    fn is_valid(&self, entry: &Path) -> bool {
        let Ok(meta) = entry.metadata() else {
            return false;
        };

        let created = created_at(&meta);
        let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) else {
            return false;
        };
        now < created + self.lifetime
    }

    fn get(&self, hostname: &str) -> Option<ValueMap> {
        let entry = self.entry_path(hostname);
        if !self.is_valid(&entry) {
            return None;
        }

        let bytes = std::fs::read(&entry).ok()?;
        match bincode::deserialize(&bytes) {
            Ok(facts) => Some(facts),
            Err(e) => {
                warn!("discarding unreadable cache entry {}: {e}", entry.display());
                None
            }
        }
    }

    fn update(&mut self, hostname: &str, facts: &ValueMap) {
        let entry = self.entry_path(hostname);
        let encoded = match bincode::serialize(facts) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("cannot encode facts for {hostname}: {e}");
                return;
            }
        };

        if let Err(e) = std::fs::write(&entry, encoded) {
            warn!("cannot write cache entry {}: {e}", entry.display());
            return;
        }
        set_mode(&entry, 0o640);
    }
}

/// ctime of the entry as a duration since the epoch.
fn created_at(meta: &std::fs::Metadata) -> Duration {
    use std::os::unix::fs::MetadataExt;
    Duration::new(meta.ctime().max(0) as u64, meta.ctime_nsec().max(0) as u32)
}

fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        warn!("cannot set mode {mode:o} on {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use crate::value::Value;

    use super::*;

    fn facts() -> ValueMap {
        let mut facts = ValueMap::new();
        facts.insert("region".into(), Value::from("iad"));
        facts
    }

    #[test]
    fn memory_miss_then_hit() {
        let mut cache = FactCache::memory();
        assert!(cache.get("h").is_none());
        cache.update("h", &facts());
        assert_eq!(cache.get("h"), Some(facts()));
    }

    #[test]
    fn filesystem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache =
            FactCache::filesystem(dir.path().join("cache"), Duration::from_secs(3600)).unwrap();
        assert!(cache.get("web-n01").is_none());
        cache.update("web-n01", &facts());
        assert_eq!(cache.get("web-n01"), Some(facts()));
    }

    #[test]
    fn filesystem_entry_names_are_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache =
            FactCache::filesystem(dir.path(), Duration::from_secs(3600)).unwrap();
        cache.update("web-n01", &facts());

        let expected = format!("{:x}.p", md5::compute(b"web-n01"));
        assert!(dir.path().join(expected).is_file());
    }

    #[test]
    fn filesystem_entries_expire() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FactCache::filesystem(dir.path(), Duration::from_secs(1)).unwrap();
        cache.update("h", &facts());
        assert!(cache.get("h").is_some());

        std::thread::sleep(Duration::from_millis(1500));
        assert!(cache.get("h").is_none());
    }

    #[test]
    fn fresh_entry_appears_after_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FactCache::filesystem(dir.path(), Duration::from_secs(1)).unwrap();
        cache.update("h", &facts());
        std::thread::sleep(Duration::from_millis(1500));
        assert!(cache.get("h").is_none());

        cache.update("h", &facts());
        assert!(cache.get("h").is_some());
    }
}
