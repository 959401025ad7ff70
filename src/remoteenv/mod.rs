//! Provisioning of the isolated execution environment on a remote host.

mod bootstrapper;

pub use bootstrapper::{Bootstrapper, FetchFile, INTERPRETER_NAME, REQUIREMENTS_PATH};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DIRECTORY: &str = "/opt/frog-env";

/// Where and how the remote environment is provisioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Target directory of the environment.
    pub directory: PathBuf,
    /// Remove and recreate the environment instead of re-using it.
    pub clean: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            clean: false,
        }
    }
}

impl Settings {
    pub fn new(directory: impl Into<PathBuf>, clean: bool) -> Self {
        Settings { directory: directory.into(), clean }
    }
}
