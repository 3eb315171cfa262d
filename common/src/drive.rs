// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drive records and the requests operators attach to them.

use crate::Generation;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Lifecycle status of a drive, as recorded in the store.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum DriveStatus {
    /// Formatted by this system and not yet handed to a workload.
    New,
    /// Serving a workload. Never formatted or mounted by the reconciler.
    Online,
    /// Known to the node but currently unusable.
    Offline,
    /// Discovered without any filesystem. Records that predate the status
    /// field read as this.
    #[default]
    Unformatted,
}

impl fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriveStatus::New => "new",
            DriveStatus::Online => "online",
            DriveStatus::Offline => "offline",
            DriveStatus::Unformatted => "unformatted",
        };
        write!(f, "{s}")
    }
}

/// A pending request to format and/or mount a drive.
///
/// Each field is cleared by the same store update that records the success
/// of the corresponding action, so a field that is still set is still
/// pending.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RequestedFormat {
    /// Filesystem type to format the drive with.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub filesystem: Option<String>,

    /// Where to mount the drive. When unset, the reconciler picks a
    /// location derived from the drive's name.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub mountpoint: Option<Utf8PathBuf>,

    /// Options to pass to the mount.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_options: Vec<String>,

    /// Authorizes destructive actions (formatting over an existing
    /// filesystem, unmounting a mounted drive to format it) for this
    /// request only.
    #[serde(default)]
    pub force: bool,
}

impl RequestedFormat {
    /// Returns true if a format or a mount is still pending.
    pub fn is_pending(&self) -> bool {
        self.filesystem.is_some() || self.mountpoint.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == RequestedFormat::default()
    }
}

/// The record describing one physical device on a node.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Drive {
    /// Unique name of the drive.
    pub name: String,

    /// Bumped by the store on every accepted write.
    #[serde(default)]
    pub generation: Generation,

    /// The node this drive is attached to.
    pub owner_node: String,

    /// Whether this system may manage the drive.
    #[serde(default)]
    pub claimed: bool,

    /// Device path on the owning node.
    pub path: Utf8PathBuf,

    /// Filesystem currently on the drive, if any.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub filesystem: Option<String>,

    /// Where the drive is currently mounted, if anywhere.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub mountpoint: Option<Utf8PathBuf>,

    /// Options the current mount was made with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_options: Vec<String>,

    /// Bytes available to unprivileged users, as of the last mount.
    #[serde(default)]
    pub free_capacity: u64,

    #[serde(default)]
    pub status: DriveStatus,

    #[serde(default, skip_serializing_if = "RequestedFormat::is_empty")]
    pub requested_format: RequestedFormat,

    /// Time of the last accepted write, maintained by the store.
    #[serde(default = "Utc::now")]
    pub time_updated: DateTime<Utc>,
}

impl Drive {
    /// Returns a freshly discovered, unclaimed, unformatted drive.
    pub fn new(
        name: impl Into<String>,
        owner_node: impl Into<String>,
        path: impl Into<Utf8PathBuf>,
    ) -> Drive {
        Drive {
            name: name.into(),
            generation: Generation::new(),
            owner_node: owner_node.into(),
            claimed: false,
            path: path.into(),
            filesystem: None,
            mountpoint: None,
            mount_options: Vec::new(),
            free_capacity: 0,
            status: DriveStatus::default(),
            requested_format: RequestedFormat::default(),
            time_updated: Utc::now(),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mountpoint.is_some()
    }

    pub fn is_online(&self) -> bool {
        self.status == DriveStatus::Online
    }

    /// The mountpoint used when a request does not name one.
    pub fn default_mountpoint(&self, mount_root: &Utf8Path) -> Utf8PathBuf {
        mount_root.join(&self.name)
    }

    /// Returns true if `other` differs from `self` only in the fields the
    /// store maintains (generation and update time).
    pub fn same_contents(&self, other: &Drive) -> bool {
        let mut normalized = other.clone();
        normalized.generation = self.generation;
        normalized.time_updated = self.time_updated;
        *self == normalized
    }
}

// Older records spell "unset" as an empty string.
fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: From<String>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()).map(T::from))
}
