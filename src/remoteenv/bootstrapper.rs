//! The bootstrap protocol, executed inside the base remote context.
//!
//! Creation is idempotent: the environment is re-used when it already holds
//! an install matching the current manifest and agent digests, so a second
//! bootstrap on the same remote returns the same interpreter path without
//! re-installing anything.

use std::path::{Path, PathBuf};
use std::process::Command;

use sha2::{Digest, Sha256};

use crate::errors::BootstrapError;

use super::Settings;

/// Logical file-service path of the requirements manifest.
pub const REQUIREMENTS_PATH: &str = "remoteenv/requirements.txt";

/// Name of the environment's interpreter under `<dir>/bin`.
pub const INTERPRETER_NAME: &str = "frog-agent";

const DIGEST_MARKER: &str = ".install-digest";

/// Access to the controller's file service, however the caller reaches it.
pub trait FetchFile {
    fn fetch_file(&self, path: &str) -> Result<Vec<u8>, String>;
}

impl<F: Fn(&str) -> Result<Vec<u8>, String>> FetchFile for F {
    fn fetch_file(&self, path: &str) -> Result<Vec<u8>, String> {
        self(path)
    }
}

pub struct Bootstrapper<'a> {
    pub fetch: &'a dyn FetchFile,
    /// Executable installed as the environment's interpreter.
    pub agent_source: PathBuf,
    /// Run the installed interpreter's self-check after installing.
    pub verify: bool,
}

impl Bootstrapper<'_> {
    /// Provision the environment described by `settings` and return the
    /// interpreter path.
    pub fn bootstrap(&self, settings: &Settings) -> Result<PathBuf, BootstrapError> {
        let dir = &settings.directory;
        if settings.clean && dir.exists() {
            info!("clean bootstrap requested, removing {}", dir.display());
            std::fs::remove_dir_all(dir)
                .map_err(|e| BootstrapError::new(format!("cannot clean {}: {e}", dir.display())))?;
        }

        for sub in ["bin", "share"] {
            std::fs::create_dir_all(dir.join(sub)).map_err(|e| {
                BootstrapError::new(format!("cannot create {}: {e}", dir.display()))
            })?;
        }

        let manifest = self
            .fetch
            .fetch_file(REQUIREMENTS_PATH)
            .map_err(|e| BootstrapError::new(format!("cannot fetch requirements: {e}")))?;
        write_file(&dir.join("requirements.txt"), &manifest)?;

        let interpreter = dir.join("bin").join(INTERPRETER_NAME);
        let digest = self.install_digest(&manifest)?;
        if interpreter.is_file() && stored_digest(dir).as_deref() == Some(digest.as_str()) {
            debug!("environment at {} is current, re-using it", dir.display());
            return Ok(interpreter);
        }

        self.install(dir, &manifest, &interpreter)?;
        write_file(&dir.join(DIGEST_MARKER), digest.as_bytes())?;

        Ok(interpreter)
    }

    fn install(
        &self,
        dir: &Path,
        manifest: &[u8],
        interpreter: &Path,
    ) -> Result<(), BootstrapError> {
        info!("installing environment at {}", dir.display());

        // Stage and rename so an interpreter that is currently running on
        // this host is replaced, not written over. The staging name is
        // per-process: two controllers may bootstrap the same host at once.
        let staging = dir
            .join("bin")
            .join(format!(".frog-agent.{}.tmp", std::process::id()));
        std::fs::copy(&self.agent_source, &staging).map_err(|e| {
            BootstrapError::new(format!(
                "cannot install agent from {}: {e}",
                self.agent_source.display()
            ))
        })?;
        set_executable(&staging)?;
        std::fs::rename(&staging, interpreter)
            .map_err(|e| BootstrapError::new(format!("cannot place interpreter: {e}")))?;

        for artifact in manifest_entries(manifest) {
            let bytes = self
                .fetch
                .fetch_file(&artifact)
                .map_err(|e| BootstrapError::new(format!("cannot fetch {artifact}: {e}")))?;
            let name = Path::new(&artifact)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| artifact.clone());
            write_file(&dir.join("share").join(name), &bytes)?;
        }

        if self.verify {
            let output = Command::new(interpreter)
                .arg("check")
                .arg("--env")
                .arg(dir)
                .output()
                .map_err(|e| {
                    BootstrapError::new(format!("cannot run environment self-check: {e}"))
                })?;
            if !output.status.success() {
                return Err(BootstrapError::new(format!(
                    "environment self-check exited with {}",
                    output.status
                ))
                .with_output(&output.stdout, &output.stderr));
            }
        }

        Ok(())
    }

    /// Digest over the manifest and the agent binary: either changing
    /// forces a re-install.
    fn install_digest(&self, manifest: &[u8]) -> Result<String, BootstrapError> {
        let agent = std::fs::read(&self.agent_source).map_err(|e| {
            BootstrapError::new(format!(
                "cannot read agent binary {}: {e}",
                self.agent_source.display()
            ))
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&agent);
        hasher.update(manifest);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Artifact lines of the manifest: anything that is not blank or a comment.
fn manifest_entries(manifest: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(manifest)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

fn stored_digest(dir: &Path) -> Option<String> {
    std::fs::read_to_string(dir.join(DIGEST_MARKER))
        .ok()
        .map(|s| s.trim().to_owned())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), BootstrapError> {
    std::fs::write(path, bytes)
        .map_err(|e| BootstrapError::new(format!("cannot write {}: {e}", path.display())))
}

#[cfg(target_family = "unix")]
fn set_executable(path: &Path) -> Result<(), BootstrapError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| BootstrapError::new(format!("cannot chmod {}: {e}", path.display())))
}

#[cfg(not(target_family = "unix"))]
fn set_executable(_path: &Path) -> Result<(), BootstrapError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(manifest: &'static [u8]) -> impl Fn(&str) -> Result<Vec<u8>, String> {
        move |path: &str| match path {
            REQUIREMENTS_PATH => Ok(manifest.to_vec()),
            "extras/motd.txt" => Ok(b"hello".to_vec()),
            other => Err(format!("unknown path {other}")),
        }
    }

    fn agent_stub(dir: &Path) -> PathBuf {
        let path = dir.join("fake-agent");
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        path
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let fetch = fetcher(b"# no artifacts\n");
        let bootstrapper = Bootstrapper {
            fetch: &fetch,
            agent_source: agent_stub(tmp.path()),
            verify: false,
        };
        let settings = Settings::new(tmp.path().join("env"), false);

        let first = bootstrapper.bootstrap(&settings).unwrap();
        // Poison the installed interpreter; a second bootstrap must re-use
        // the environment rather than re-install.
        std::fs::write(&first, b"sentinel").unwrap();
        let second = bootstrapper.bootstrap(&settings).unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), b"sentinel");
    }

    #[test]
    fn changed_agent_forces_reinstall() {
        let tmp = tempfile::tempdir().unwrap();
        let fetch = fetcher(b"");
        let agent = agent_stub(tmp.path());
        let settings = Settings::new(tmp.path().join("env"), false);

        let bootstrapper = Bootstrapper { fetch: &fetch, agent_source: agent.clone(), verify: false };
        let interpreter = bootstrapper.bootstrap(&settings).unwrap();

        std::fs::write(&agent, b"#!/bin/sh\nexit 1\n").unwrap();
        bootstrapper.bootstrap(&settings).unwrap();
        assert_eq!(
            std::fs::read(&interpreter).unwrap(),
            b"#!/bin/sh\nexit 1\n"
        );
    }

    #[test]
    fn clean_recreates_the_environment() {
        let tmp = tempfile::tempdir().unwrap();
        let fetch = fetcher(b"");
        let bootstrapper = Bootstrapper {
            fetch: &fetch,
            agent_source: agent_stub(tmp.path()),
            verify: false,
        };

        let dir = tmp.path().join("env");
        bootstrapper.bootstrap(&Settings::new(&dir, false)).unwrap();
        std::fs::write(dir.join("share").join("stale"), b"old").unwrap();

        bootstrapper.bootstrap(&Settings::new(&dir, true)).unwrap();
        assert!(!dir.join("share").join("stale").exists());
    }

    #[test]
    fn manifest_artifacts_are_fetched() {
        let tmp = tempfile::tempdir().unwrap();
        let fetch = fetcher(b"# extras\nextras/motd.txt\n");
        let bootstrapper = Bootstrapper {
            fetch: &fetch,
            agent_source: agent_stub(tmp.path()),
            verify: false,
        };

        let dir = tmp.path().join("env");
        bootstrapper.bootstrap(&Settings::new(&dir, false)).unwrap();
        assert_eq!(std::fs::read(dir.join("share/motd.txt")).unwrap(), b"hello");
    }

    #[test]
    fn failed_self_check_captures_output() {
        let tmp = tempfile::tempdir().unwrap();
        let fetch = fetcher(b"");
        let agent = tmp.path().join("fake-agent");
        std::fs::write(&agent, b"#!/bin/sh\necho broken-stdout\necho broken-stderr >&2\nexit 3\n")
            .unwrap();
        set_executable(&agent).unwrap();

        let bootstrapper = Bootstrapper { fetch: &fetch, agent_source: agent, verify: true };
        let err = bootstrapper
            .bootstrap(&Settings::new(tmp.path().join("env"), false))
            .unwrap_err();
        assert!(err.stdout.contains("broken-stdout"));
        assert!(err.stderr.contains("broken-stderr"));
    }
}
