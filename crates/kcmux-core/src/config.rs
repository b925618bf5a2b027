//! Configuration for multiplexor handles.
//!
//! [`Config`] carries no options yet. It exists so that options can be
//! added without changing the signature of [`Multiplexor::open`], and so
//! hosts can embed a `kcm` section in their own settings files today.
//!
//! [`Multiplexor::open`]: crate::Multiplexor::open

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Options for a multiplexor handle. Currently empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct Config {}

impl Config {
    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }
}
