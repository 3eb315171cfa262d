// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunables for the reconciler and the controller that drives it.

use camino::Utf8PathBuf;
use drive_common::backoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parent directory of the mountpoints picked for requests that don't name
/// one.
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt/direct-csi";

/// Number of drives reconciled concurrently by default.
pub const DEFAULT_WORKERS: usize = 40;

/// How long a single request's `force` flag stays in effect.
///
/// A request may ask for both a format and a mount. Whether a single `force`
/// covers only the destructive format, or the request as a whole, has not
/// been settled, so both readings are available.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForceScope {
    /// `force` is cleared when the mount completes, so it covers the whole
    /// request.
    #[default]
    Request,
    /// `force` is also cleared when the format completes.
    FormatOnly,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Parent directory for default mountpoints.
    pub mount_root: Utf8PathBuf,
    pub force_scope: ForceScope,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            mount_root: DEFAULT_MOUNT_ROOT.into(),
            force_scope: ForceScope::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Maximum number of drives reconciled at once.
    pub workers: usize,
    /// How often to ask the store to pick up external changes. Zero
    /// disables resyncing.
    pub resync_interval_secs: u64,
    /// Delay before the first redelivery of a failed reconciliation.
    pub backoff_initial_ms: u64,
    /// Upper bound on the delay between redeliveries.
    pub backoff_max_secs: u64,
}

impl ControllerConfig {
    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0)
            .then(|| Duration::from_secs(self.resync_interval_secs))
    }

    pub fn redelivery_policy(&self) -> backoff::ExponentialBackoff {
        backoff::redelivery_policy(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_secs(self.backoff_max_secs),
        )
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            resync_interval_secs: 30,
            backoff_initial_ms: backoff::DEFAULT_INITIAL_INTERVAL.as_millis()
                as u64,
            backoff_max_secs: backoff::DEFAULT_MAX_INTERVAL.as_secs(),
        }
    }
}
