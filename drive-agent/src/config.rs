// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing the agent's configuration file

use camino::{Utf8Path, Utf8PathBuf};
use drive_reconciler::{ControllerConfig, ReconcilerConfig};
use dropshot::ConfigLogging;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the drive agent
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Identity of this node. Drives whose `owner_node` differs are left
    /// alone. Defaults to the host name.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Agent-wide logging configuration.
    pub log: ConfigLogging,
    pub store: StoreConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct StoreConfig {
    /// Path of the JSON ledger holding drive records.
    pub ledger: Utf8PathBuf,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\"")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\"")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}
