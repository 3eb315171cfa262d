// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the store holding drive records.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use drive_common::drive::Drive;
use drive_common::Generation;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A change to a drive record, as delivered to watchers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriveNotification {
    Added(Drive),
    Updated { old: Drive, new: Drive },
    Deleted(Drive),
}

impl DriveNotification {
    /// Name of the drive this notification is about.
    pub fn drive_name(&self) -> &str {
        match self {
            DriveNotification::Added(drive)
            | DriveNotification::Deleted(drive) => &drive.name,
            DriveNotification::Updated { new, .. } => &new.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DriveNotification::Added(_) => "added",
            DriveNotification::Updated { .. } => "updated",
            DriveNotification::Deleted(_) => "deleted",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Drive {name:?} not found")]
    NotFound { name: String },

    #[error("Drive {name:?} already exists")]
    AlreadyExists { name: String },

    #[error(
        "Conflicting update to drive {name:?}: \
         expected generation {expected}, found {found}"
    )]
    Conflict { name: String, expected: Generation, found: Generation },

    #[error("Failed to access drive ledger {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("Failed to parse drive ledger {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },

    #[error("Failed to serialize drive ledger")]
    Serialize(#[source] serde_json::Error),
}

impl StoreError {
    /// Returns true if the write lost a race with another writer and should
    /// be retried against a fresh read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// A store of drive records with optimistic concurrency control.
///
/// Every accepted write bumps the record's [`Generation`]. Writers name the
/// generation they last observed, and lose if the record has moved on.
#[async_trait]
pub trait DriveStore: Send + Sync {
    /// Returns the current version of the named drive.
    async fn get(&self, name: &str) -> Result<Drive, StoreError>;

    /// Returns the current version of every drive.
    async fn list(&self) -> Result<Vec<Drive>, StoreError>;

    /// Creates a record for a newly discovered drive.
    async fn insert(&self, drive: Drive) -> Result<Drive, StoreError>;

    /// Replaces the record named by `drive.name`, provided its generation is
    /// still `expected`.
    ///
    /// Returns the record as stored. An update that changes nothing is
    /// accepted without bumping the generation or notifying watchers.
    async fn update(
        &self,
        drive: Drive,
        expected: Generation,
    ) -> Result<Drive, StoreError>;

    /// Subscribes to changes made after this call.
    fn watch(&self) -> broadcast::Receiver<DriveNotification>;

    /// Picks up changes made to the store's backing data by other parties,
    /// notifying watchers of each.
    async fn resync(&self) -> Result<(), StoreError>;
}

pub type BoxedDriveStore = Arc<dyn DriveStore>;
