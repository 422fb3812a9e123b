//! Options for every collection operation, loadable from JSON.

use std::{fs, path::Path, path::PathBuf};

use grove_frame::ShrinkOptions;
use grove_merge::MergeOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{collection::InfoOptions, sanity::SanityOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

/// Missing sections and fields take their defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroveConfig {
    pub merge: MergeOptions,
    pub shrink: ShrinkOptions,
    pub sanity: SanityOptions,
    pub info: InfoOptions,
}

impl GroveConfig {
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
