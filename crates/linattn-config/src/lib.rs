pub mod error;
pub mod raw;
pub mod validated;

use std::{fs, path::Path};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub use error::{ConfigError, Result};

pub fn load_toml<P: AsRef<Path>, T: DeserializeOwned + 'static>(path: P) -> Result<T> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    parse_toml(&content).map_err(|err| match err {
        ConfigError::Toml { source, .. } => ConfigError::Toml {
            path: path.display().to_string(),
            source,
        },
        other => other,
    })
}

pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|source| ConfigError::Toml {
        path: "<inline>".to_string(),
        source,
    })
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WyModeOptions {
    /// Beta scales only the erase term, the write is always the raw value.
    #[default]
    Erase,
    /// Classic gated delta rule, beta scales the write as well.
    Gated,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointOptions {
    /// Keep chunk snapshots from the forward pass for the backward pass.
    Retain,
    /// Drop the snapshots and rebuild them during backward.
    #[default]
    Recompute,
}
