//! Runtime settings, loaded from YAML.
//!
//! ```yaml
//! escrow_file_name: EncryptedRoot.plist.wipekey
//! resource_extension: .efires
//! keep_user_type: 0x10000001
//! timing:
//!   key_down_ms: 20
//!   key_up_ms: 20
//!   first_scan_ignore_ms: 3000
//! ```
//!
//! Every field is optional.

use crate::plist::USER_TYPE_DISK;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ESCROW_FILE_NAME: &str = "EncryptedRoot.plist.wipekey";
pub const RESOURCE_EXTENSION: &str = ".efires";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Suffix identifying the escrow file on the recovery volume.
    pub escrow_file_name: String,
    /// Extension of boot loader resources replaced from the unlock volume.
    pub resource_extension: String,
    /// `UserType` of the CryptoUsers entry that survives the rewrite.
    pub keep_user_type: u32,
    pub timing: Timing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            escrow_file_name: ESCROW_FILE_NAME.to_owned(),
            resource_extension: RESOURCE_EXTENSION.to_owned(),
            keep_user_type: USER_TYPE_DISK,
            timing: Timing::default(),
        }
    }
}

/// Key event cadence of the scripted keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timing {
    pub key_down_ms: u64,
    pub key_up_ms: u64,
    /// Scans before this much time has passed see no keys at all.
    pub first_scan_ignore_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            key_down_ms: 20,
            key_up_ms: 20,
            first_scan_ignore_ms: 3000,
        }
    }
}

impl Timing {
    pub fn key_down(&self) -> Duration {
        Duration::from_millis(self.key_down_ms)
    }

    pub fn key_up(&self) -> Duration {
        Duration::from_millis(self.key_up_ms)
    }

    pub fn first_scan_ignore(&self) -> Duration {
        Duration::from_millis(self.first_scan_ignore_ms)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
