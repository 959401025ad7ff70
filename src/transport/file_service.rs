//! Controller-side file service: lets remote contexts pull files that the
//! operator explicitly registered, plus virtual entries compiled into the
//! tool (the remote environment requirements manifest).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Chunk size of `FileData` replies.
pub const CHUNK_SIZE: usize = 128 * 1024;

#[derive(Default)]
pub struct FileService {
    prefixes: Mutex<Vec<PathBuf>>,
    virtuals: Mutex<HashMap<String, Vec<u8>>>,
}

impl FileService {
    pub fn new() -> Self {
        FileService::default()
    }

    /// Allow remotes to fetch anything under `prefix`.
    pub fn register_prefix(&self, prefix: impl Into<PathBuf>) {
        let prefix: PathBuf = prefix.into();
        debug!("file service prefix registered: {}", prefix.display());
        self.prefixes.lock().push(prefix);
    }

    /// Serve `bytes` for the exact logical path `name`.
    pub fn register_virtual(&self, name: impl Into<String>, bytes: Vec<u8>) {
        self.virtuals.lock().insert(name.into(), bytes);
    }

    /// Resolve a remote request. Only virtual entries and files under a
    /// registered prefix are served; everything else is refused.
    pub fn fetch(&self, path: &str) -> Result<Vec<u8>, String> {
        if let Some(bytes) = self.virtuals.lock().get(path) {
            return Ok(bytes.clone());
        }

        let requested = Path::new(path);
        for prefix in self.prefixes.lock().iter() {
            let candidate = if requested.is_absolute() {
                requested.to_owned()
            } else {
                prefix.join(requested)
            };
            let Ok(resolved) = candidate.canonicalize() else {
                continue;
            };
            let Ok(prefix) = prefix.canonicalize() else {
                continue;
            };
            if resolved.starts_with(&prefix) {
                return std::fs::read(&resolved)
                    .map_err(|e| format!("cannot read {}: {e}", resolved.display()));
            }
        }

        Err(format!("path {path} is not registered with the file service"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_entries_win() {
        let service = FileService::new();
        service.register_virtual("remoteenv/requirements.txt", b"# frog\n".to_vec());
        assert_eq!(
            service.fetch("remoteenv/requirements.txt").unwrap(),
            b"# frog\n"
        );
    }

    #[test]
    fn unregistered_paths_are_refused() {
        let service = FileService::new();
        assert!(service.fetch("/etc/passwd").is_err());
    }

    #[test]
    fn prefix_fetch_stays_inside_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("artifact"), b"data").unwrap();
        let service = FileService::new();
        service.register_prefix(dir.path());

        assert_eq!(service.fetch("artifact").unwrap(), b"data");
        assert!(service.fetch("../artifact").is_err());
    }
}
