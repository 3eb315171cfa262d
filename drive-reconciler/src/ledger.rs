// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`DriveStore`] kept in memory and mirrored to a JSON ledger on disk.

use crate::store::{DriveNotification, DriveStore, StoreError};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use drive_common::drive::Drive;
use drive_common::Generation;
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

// Notifications beyond this many unread cause receivers to lag.
const NOTIFICATION_CAPACITY: usize = 1024;

#[derive(Debug, Default, Deserialize, Serialize)]
struct LedgerContents {
    drives: Vec<Drive>,
}

pub struct LedgeredDriveStore {
    log: Logger,
    path: Option<Utf8PathBuf>,
    drives: Mutex<BTreeMap<String, Drive>>,
    notify_tx: broadcast::Sender<DriveNotification>,
}

impl LedgeredDriveStore {
    /// Opens the ledger at `path`, starting empty if it does not exist yet.
    pub async fn open(
        log: &Logger,
        path: &Utf8Path,
    ) -> Result<Arc<Self>, StoreError> {
        let log = log.new(o!("component" => "LedgeredDriveStore"));
        let drives = read_ledger(path).await?.unwrap_or_default();
        info!(
            log, "Opened drive ledger";
            "path" => %path,
            "drives" => drives.len(),
        );
        Ok(Self::with_drives(log, Some(path.to_owned()), drives))
    }

    /// Returns a store that is never persisted.
    pub fn in_memory(log: &Logger) -> Arc<Self> {
        let log = log.new(o!("component" => "LedgeredDriveStore"));
        Self::with_drives(log, None, BTreeMap::new())
    }

    fn with_drives(
        log: Logger,
        path: Option<Utf8PathBuf>,
        drives: BTreeMap<String, Drive>,
    ) -> Arc<Self> {
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Arc::new(Self { log, path, drives: Mutex::new(drives), notify_tx })
    }

    pub fn as_drive_store(self: Arc<Self>) -> crate::store::BoxedDriveStore {
        self
    }

    /// Writes `drives` to the ledger, if there is one.
    ///
    /// Callers hold the lock on `self.drives` and only commit the change to
    /// memory once this returns successfully.
    async fn persist(
        &self,
        drives: &BTreeMap<String, Drive>,
    ) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents =
            LedgerContents { drives: drives.values().cloned().collect() };
        let bytes = serde_json::to_vec_pretty(&contents)
            .map_err(StoreError::Serialize)?;

        let tmp_path = path.with_extension("json.tmp");
        let io_err =
            |path: &Utf8Path, err| StoreError::Io { path: path.to_owned(), err };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_err(parent, err))?;
        }
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|err| io_err(&tmp_path, err))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|err| io_err(path, err))?;
        Ok(())
    }

    fn notify(&self, notification: DriveNotification) {
        debug!(
            self.log, "Drive record changed";
            "drive" => notification.drive_name(),
            "kind" => notification.kind(),
        );
        // No receivers is not an error; the controller may not be running
        // yet.
        let _ = self.notify_tx.send(notification);
    }
}

async fn read_ledger(
    path: &Utf8Path,
) -> Result<Option<BTreeMap<String, Drive>>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(None)
        }
        Err(err) => {
            return Err(StoreError::Io { path: path.to_owned(), err });
        }
    };
    let contents: LedgerContents = serde_json::from_slice(&bytes)
        .map_err(|err| StoreError::Parse { path: path.to_owned(), err })?;
    Ok(Some(
        contents
            .drives
            .into_iter()
            .map(|drive| (drive.name.clone(), drive))
            .collect(),
    ))
}

#[async_trait]
impl DriveStore for LedgeredDriveStore {
    async fn get(&self, name: &str) -> Result<Drive, StoreError> {
        self.drives
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { name: name.to_string() })
    }

    async fn list(&self) -> Result<Vec<Drive>, StoreError> {
        Ok(self.drives.lock().await.values().cloned().collect())
    }

    async fn insert(&self, mut drive: Drive) -> Result<Drive, StoreError> {
        let mut drives = self.drives.lock().await;
        if drives.contains_key(&drive.name) {
            return Err(StoreError::AlreadyExists { name: drive.name });
        }
        drive.generation = Generation::new();
        drive.time_updated = Utc::now();

        let mut next = drives.clone();
        next.insert(drive.name.clone(), drive.clone());
        self.persist(&next).await?;
        *drives = next;

        self.notify(DriveNotification::Added(drive.clone()));
        Ok(drive)
    }

    async fn update(
        &self,
        mut drive: Drive,
        expected: Generation,
    ) -> Result<Drive, StoreError> {
        let mut drives = self.drives.lock().await;
        let Some(current) = drives.get(&drive.name) else {
            return Err(StoreError::NotFound { name: drive.name });
        };
        if current.generation != expected {
            return Err(StoreError::Conflict {
                name: drive.name,
                expected,
                found: current.generation,
            });
        }
        if current.same_contents(&drive) {
            return Ok(current.clone());
        }

        let old = current.clone();
        drive.generation = old.generation.next();
        drive.time_updated = Utc::now();

        let mut next = drives.clone();
        next.insert(drive.name.clone(), drive.clone());
        self.persist(&next).await?;
        *drives = next;

        self.notify(DriveNotification::Updated { old, new: drive.clone() });
        Ok(drive)
    }

    fn watch(&self) -> broadcast::Receiver<DriveNotification> {
        self.notify_tx.subscribe()
    }

    async fn resync(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut drives = self.drives.lock().await;
        let Some(on_disk) = read_ledger(path).await? else {
            warn!(self.log, "Drive ledger is missing; keeping memory copy");
            return Ok(());
        };

        let mut notifications = Vec::new();
        let mut next = BTreeMap::new();
        for (name, mut drive) in on_disk {
            match drives.get(&name) {
                None => {
                    notifications.push(DriveNotification::Added(drive.clone()));
                }
                Some(old) if old.same_contents(&drive) => {
                    drive = old.clone();
                }
                Some(old) => {
                    drive.generation = old.generation.next();
                    drive.time_updated = Utc::now();
                    notifications.push(DriveNotification::Updated {
                        old: old.clone(),
                        new: drive.clone(),
                    });
                }
            }
            next.insert(name, drive);
        }
        for (name, old) in drives.iter() {
            if !next.contains_key(name) {
                notifications.push(DriveNotification::Deleted(old.clone()));
            }
        }
        if notifications.is_empty() {
            return Ok(());
        }

        // Record the bumped generations so that later reads of the ledger
        // agree with what watchers were told.
        self.persist(&next).await?;
        *drives = next;
        info!(
            self.log, "Picked up external changes to drive ledger";
            "changes" => notifications.len(),
        );
        for notification in notifications {
            self.notify(notification);
        }
        Ok(())
    }
}
