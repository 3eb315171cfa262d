// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Converges one drive toward its requested format and mount.

use crate::config::{ForceScope, ReconcilerConfig};
use crate::store::{BoxedDriveStore, StoreError};
use camino::{Utf8Path, Utf8PathBuf};
use drive_common::drive::{Drive, DriveStatus};
use drive_common::Generation;
use host_utils::device::BoxedDeviceOps;
use host_utils::{DeviceError, FilesystemStats};
use slog::{debug, error, info, o, warn, Logger};

/// Why a notification led to no action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The drive is attached to another node.
    NotOwned,
    /// The drive is not under management.
    Unclaimed,
    /// The drive has no pending format or mount.
    NothingRequested,
    /// The drive is serving a workload.
    Online,
    /// Discovery and removal are handled elsewhere.
    AddedOrDeleted,
}

/// A request refused because carrying it out would destroy data the
/// requester did not explicitly give up.
///
/// Nothing is changed. The requester has to resubmit with `force` set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// Formatting was requested for a mounted drive.
    MountedWithoutForce,
    /// Formatting was requested for a drive that already has a filesystem.
    FilesystemExists,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    Rejected(Rejection),
    Reconciled {
        /// Whether the drive was formatted.
        formatted: bool,
        /// Where the drive was mounted, if it was.
        mounted_at: Option<Utf8PathBuf>,
        /// Generation of the last record written.
        generation: Generation,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Failed to resolve mountpoint {mountpoint} of drive {drive:?}")]
    ResolveMountpoint {
        drive: String,
        mountpoint: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("Failed to unmount drive {drive:?}")]
    Unmount {
        drive: String,
        #[source]
        err: DeviceError,
    },

    #[error("Failed to format drive {drive:?}")]
    Format {
        drive: String,
        #[source]
        err: DeviceError,
    },

    #[error("Failed to mount drive {drive:?}")]
    Mount {
        drive: String,
        #[source]
        err: DeviceError,
    },

    #[error("Failed to read capacity of drive {drive:?}")]
    Stat {
        drive: String,
        #[source]
        err: DeviceError,
    },

    #[error(
        "Free capacity of drive {drive:?} does not fit in 64 bits \
         ({} blocks of {} bytes)",
        .stats.available_blocks,
        .stats.block_size
    )]
    CapacityOverflow { drive: String, stats: FilesystemStats },

    #[error("Failed to record {step} of drive {drive:?}")]
    Persist {
        drive: String,
        step: &'static str,
        #[source]
        err: StoreError,
    },
}

impl ReconcileError {
    /// Returns true if the drive changed underneath the reconciler.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Persist { err, .. } if err.is_conflict())
    }
}

/// Applies a drive's `requested_format` to the physical device.
///
/// Every physical step is followed by a conditional store update recording
/// its result, before the next step starts. If anything fails partway, the
/// store describes the device as it is, and redelivering the (fresh) record
/// picks up where the failed attempt stopped. Nothing is retried here.
pub struct DriveReconciler {
    log: Logger,
    config: ReconcilerConfig,
    store: BoxedDriveStore,
    device: BoxedDeviceOps,
}

impl DriveReconciler {
    pub fn new(
        log: &Logger,
        config: ReconcilerConfig,
        store: BoxedDriveStore,
        device: BoxedDeviceOps,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "DriveReconciler")),
            config,
            store,
            device,
        }
    }

    pub async fn reconcile(
        &self,
        drive: &Drive,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let log = self.log.new(o!("drive" => drive.name.clone()));

        if drive.is_online() {
            warn!(log, "drive is in use; not touching it");
            return Ok(ReconcileOutcome::Skipped(SkipReason::Online));
        }

        let force = drive.requested_format.force;
        let mut current = drive.clone();
        let mut formatted = false;

        if let Some(filesystem) = drive.requested_format.filesystem.as_deref() {
            if let Some(mountpoint) = current.mountpoint.clone() {
                if !force {
                    error!(
                        log, "refusing to format mounted drive without force";
                        "mountpoint" => %mountpoint,
                    );
                    return Ok(ReconcileOutcome::Rejected(
                        Rejection::MountedWithoutForce,
                    ));
                }
                let target = resolve_mountpoint(&mountpoint).map_err(|err| {
                    ReconcileError::ResolveMountpoint {
                        drive: drive.name.clone(),
                        mountpoint: mountpoint.clone(),
                        err,
                    }
                })?;
                self.device.unmount_if_mounted(&target).await.map_err(
                    |err| ReconcileError::Unmount {
                        drive: drive.name.clone(),
                        err,
                    },
                )?;

                let mut next = current.clone();
                next.mountpoint = None;
                current = self.persist(&log, next, "unmount").await?;
            }

            if let Some(existing) = &current.filesystem {
                if !force {
                    error!(
                        log, "refusing to format over existing filesystem \
                              without force";
                        "existing" => existing,
                        "requested" => filesystem,
                    );
                    return Ok(ReconcileOutcome::Rejected(
                        Rejection::FilesystemExists,
                    ));
                }
            }

            self.device
                .format(&current.path, filesystem, force)
                .await
                .map_err(|err| ReconcileError::Format {
                    drive: drive.name.clone(),
                    err,
                })?;

            let mut next = current.clone();
            next.filesystem = Some(filesystem.to_string());
            next.status = DriveStatus::New;
            next.requested_format.filesystem = None;
            next.mountpoint = None;
            next.mount_options.clear();
            if self.config.force_scope == ForceScope::FormatOnly {
                next.requested_format.force = false;
            }
            current = self.persist(&log, next, "format").await?;
            formatted = true;
        }

        let mut mounted_at = None;
        if current.mountpoint.is_none() {
            let target =
                current.requested_format.mountpoint.clone().unwrap_or_else(
                    || current.default_mountpoint(&self.config.mount_root),
                );
            let options = current.requested_format.mount_options.clone();

            self.device
                .mount(
                    &current.path,
                    &target,
                    current.filesystem.as_deref(),
                    &options,
                )
                .await
                .map_err(|err| ReconcileError::Mount {
                    drive: drive.name.clone(),
                    err,
                })?;
            let stats =
                self.device.stat_filesystem(&target).await.map_err(|err| {
                    ReconcileError::Stat { drive: drive.name.clone(), err }
                })?;
            let free_capacity = stats.available_bytes().ok_or_else(|| {
                ReconcileError::CapacityOverflow {
                    drive: drive.name.clone(),
                    stats,
                }
            })?;

            let mut next = current.clone();
            next.requested_format.force = false;
            next.mountpoint = Some(target.clone());
            next.requested_format.mountpoint = None;
            next.requested_format.mount_options.clear();
            next.mount_options = options;
            next.free_capacity = free_capacity;
            current = self.persist(&log, next, "mount").await?;
            mounted_at = Some(target);
        } else if let Some(requested) = &current.requested_format.mountpoint {
            // Moving a mounted drive is not supported; the request stays
            // pending until the drive is unmounted some other way.
            debug!(
                log, "drive already mounted; ignoring requested mountpoint";
                "mountpoint" => ?current.mountpoint,
                "requested" => %requested,
            );
        }

        Ok(ReconcileOutcome::Reconciled {
            formatted,
            mounted_at,
            generation: current.generation,
        })
    }

    /// Writes `next`, provided the stored record is still at the generation
    /// `next` was derived from, and returns the record as stored.
    async fn persist(
        &self,
        log: &Logger,
        next: Drive,
        step: &'static str,
    ) -> Result<Drive, ReconcileError> {
        let name = next.name.clone();
        let expected = next.generation;
        let stored = self.store.update(next, expected).await.map_err(
            |err| ReconcileError::Persist { drive: name, step, err },
        )?;
        info!(
            log, "recorded drive state";
            "step" => step,
            "generation" => %stored.generation,
        );
        Ok(stored)
    }
}

// Relative mountpoints are taken relative to the working directory.
fn resolve_mountpoint(mountpoint: &Utf8Path) -> std::io::Result<Utf8PathBuf> {
    let absolute = std::path::absolute(mountpoint)?;
    Utf8PathBuf::try_from(absolute).map_err(|err| err.into_io_error())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ledger::LedgeredDriveStore;
    use crate::store::{DriveNotification, DriveStore};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use drive_test_utils::dev::{test_setup_log, LogContext};
    use host_utils::device::DeviceOps;
    use host_utils::fakes::device::{DeviceCall, DeviceOp, FakeDevice};
    use std::sync::{Arc, Mutex};

    const MOUNT_ROOT: &str = "/mnt/direct-csi";

    struct Harness {
        logctx: LogContext,
        store: Arc<LedgeredDriveStore>,
        device: Arc<FakeDevice>,
        reconciler: DriveReconciler,
    }

    impl Harness {
        fn new(name: &str) -> Self {
            Self::with_config(name, ReconcilerConfig::default())
        }

        fn with_config(name: &str, config: ReconcilerConfig) -> Self {
            let logctx = test_setup_log(name);
            let store = LedgeredDriveStore::in_memory(&logctx.log);
            let device = FakeDevice::new();
            let reconciler = DriveReconciler::new(
                &logctx.log,
                config,
                store.clone().as_drive_store(),
                device.clone().as_device_ops(),
            );
            Self { logctx, store, device, reconciler }
        }

        async fn insert(&self, drive: Drive) -> Drive {
            self.store.insert(drive).await.unwrap()
        }

        async fn get(&self, name: &str) -> Drive {
            self.store.get(name).await.unwrap()
        }

        fn cleanup_successful(self) {
            self.logctx.cleanup_successful();
        }
    }

    fn claimed_drive(name: &str) -> Drive {
        let mut drive = Drive::new(name, "node-1", format!("/dev/{name}"));
        drive.claimed = true;
        drive
    }

    fn mounted_drive(name: &str, mountpoint: &str, force: bool) -> Drive {
        let mut drive = claimed_drive(name);
        drive.filesystem = Some("xfs".to_string());
        drive.status = DriveStatus::New;
        drive.mountpoint = Some(mountpoint.into());
        drive.mount_options = vec!["noatime".to_string()];
        drive.requested_format.filesystem = Some("ext4".to_string());
        drive.requested_format.force = force;
        drive
    }

    #[tokio::test]
    async fn formats_and_mounts_new_drive() {
        let h = Harness::new("formats_and_mounts_new_drive");
        let mut drive = claimed_drive("d1");
        drive.requested_format.filesystem = Some("xfs".to_string());
        let drive = h.insert(drive).await;

        let outcome = h.reconciler.reconcile(&drive).await.unwrap();
        let target = Utf8PathBuf::from(MOUNT_ROOT).join("d1");
        assert_eq!(
            outcome,
            ReconcileOutcome::Reconciled {
                formatted: true,
                mounted_at: Some(target.clone()),
                generation: drive.generation.next().next(),
            }
        );
        assert_eq!(
            h.device.calls(),
            vec![
                DeviceCall::Format {
                    device: "/dev/d1".into(),
                    filesystem: "xfs".to_string(),
                    force: false,
                },
                DeviceCall::Mount {
                    device: "/dev/d1".into(),
                    target: target.clone(),
                    filesystem: Some("xfs".to_string()),
                    options: vec![],
                },
                DeviceCall::StatFilesystem { target: target.clone() },
            ]
        );

        let stored = h.get("d1").await;
        assert_eq!(stored.filesystem.as_deref(), Some("xfs"));
        assert_eq!(stored.status, DriveStatus::New);
        assert_eq!(stored.mountpoint, Some(target));
        assert_eq!(stored.free_capacity, 4096 * 1024);
        assert!(stored.requested_format.is_empty());

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn mounted_drive_requires_force() {
        let h = Harness::new("mounted_drive_requires_force");
        let drive = h.insert(mounted_drive("d2", "/data", false)).await;

        let outcome = h.reconciler.reconcile(&drive).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Rejected(Rejection::MountedWithoutForce)
        );
        assert!(h.device.calls().is_empty());
        assert_eq!(h.get("d2").await, drive);

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn existing_filesystem_requires_force() {
        let h = Harness::new("existing_filesystem_requires_force");
        let mut drive = claimed_drive("d2");
        drive.filesystem = Some("xfs".to_string());
        drive.requested_format.filesystem = Some("ext4".to_string());
        let drive = h.insert(drive).await;

        let outcome = h.reconciler.reconcile(&drive).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Rejected(Rejection::FilesystemExists)
        );
        assert!(h.device.calls().is_empty());
        assert_eq!(h.get("d2").await, drive);

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn forced_format_unmounts_first() {
        let h = Harness::new("forced_format_unmounts_first");
        let drive = h.insert(mounted_drive("d3", "/data", true)).await;
        let mut rx = h.store.watch();

        h.reconciler.reconcile(&drive).await.unwrap();
        let target = Utf8PathBuf::from(MOUNT_ROOT).join("d3");
        assert_eq!(
            h.device.calls(),
            vec![
                DeviceCall::UnmountIfMounted { target: "/data".into() },
                DeviceCall::Format {
                    device: "/dev/d3".into(),
                    filesystem: "ext4".to_string(),
                    force: true,
                },
                DeviceCall::Mount {
                    device: "/dev/d3".into(),
                    target: target.clone(),
                    filesystem: Some("ext4".to_string()),
                    options: vec![],
                },
                DeviceCall::StatFilesystem { target: target.clone() },
            ]
        );

        // One checkpoint per physical step, in order.
        let mut updates = Vec::new();
        while let Ok(DriveNotification::Updated { new, .. }) = rx.try_recv() {
            updates.push(new);
        }
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].mountpoint, None);
        assert_eq!(updates[0].filesystem.as_deref(), Some("xfs"));
        assert_eq!(updates[1].filesystem.as_deref(), Some("ext4"));
        assert_eq!(updates[1].mount_options, Vec::<String>::new());
        assert!(updates[1].requested_format.force);
        assert_eq!(updates[2].mountpoint, Some(target));
        assert!(updates[2].requested_format.is_empty());

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn online_drive_is_left_alone() {
        let h = Harness::new("online_drive_is_left_alone");
        let mut drive = mounted_drive("d4", "/data", true);
        drive.status = DriveStatus::Online;
        let drive = h.insert(drive).await;

        let outcome = h.reconciler.reconcile(&drive).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::Online));
        assert!(h.device.calls().is_empty());
        assert_eq!(h.get("d4").await, drive);

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn mount_only_request_uses_requested_options() {
        let h = Harness::new("mount_only_request_uses_requested_options");
        let mut drive = claimed_drive("d6");
        drive.filesystem = Some("xfs".to_string());
        drive.requested_format.mountpoint = Some("/data/custom".into());
        drive.requested_format.mount_options =
            vec!["noatime".to_string(), "nodev".to_string()];
        let drive = h.insert(drive).await;

        let outcome = h.reconciler.reconcile(&drive).await.unwrap();
        assert_matches!(
            outcome,
            ReconcileOutcome::Reconciled { formatted: false, mounted_at, .. }
                if mounted_at.as_deref() == Some(Utf8Path::new("/data/custom"))
        );
        assert_eq!(
            h.device.calls()[0],
            DeviceCall::Mount {
                device: "/dev/d6".into(),
                target: "/data/custom".into(),
                filesystem: Some("xfs".to_string()),
                options: vec!["noatime".to_string(), "nodev".to_string()],
            }
        );
        let stored = h.get("d6").await;
        assert_eq!(stored.mount_options, vec!["noatime", "nodev"]);
        assert!(stored.requested_format.is_empty());

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn relative_mountpoint_is_resolved() {
        let h = Harness::new("relative_mountpoint_is_resolved");
        let drive = h.insert(mounted_drive("d7", "data", true)).await;

        h.reconciler.reconcile(&drive).await.unwrap();
        let cwd = std::env::current_dir().unwrap();
        let expected = Utf8PathBuf::try_from(cwd).unwrap().join("data");
        assert_eq!(
            h.device.calls()[0],
            DeviceCall::UnmountIfMounted { target: expected }
        );

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn conflict_stops_reconciliation() {
        let h = Harness::new("conflict_stops_reconciliation");
        let stale = h.insert(mounted_drive("d3", "/data", true)).await;

        // Someone else writes the record after our snapshot was taken.
        let mut newer = stale.clone();
        newer.free_capacity = 1;
        h.store.update(newer, stale.generation).await.unwrap();

        let err = h.reconciler.reconcile(&stale).await.unwrap_err();
        assert!(err.is_conflict(), "unexpected error: {err}");
        assert_matches!(err, ReconcileError::Persist { step: "unmount", .. });
        assert_eq!(
            h.device.calls(),
            vec![DeviceCall::UnmountIfMounted { target: "/data".into() }]
        );

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn failed_format_resumes_from_checkpoint() {
        let h = Harness::new("failed_format_resumes_from_checkpoint");
        let drive = h.insert(mounted_drive("d3", "/data", true)).await;

        h.device.set_failing(DeviceOp::Format, true);
        let err = h.reconciler.reconcile(&drive).await.unwrap_err();
        assert_matches!(err, ReconcileError::Format { .. });
        assert!(!err.is_conflict());

        let checkpoint = h.get("d3").await;
        assert_eq!(checkpoint.mountpoint, None);
        assert_eq!(checkpoint.filesystem.as_deref(), Some("xfs"));
        assert_eq!(checkpoint.requested_format, drive.requested_format);

        h.device.set_failing(DeviceOp::Format, false);
        h.device.clear_calls();
        let outcome = h.reconciler.reconcile(&checkpoint).await.unwrap();
        assert_matches!(
            outcome,
            ReconcileOutcome::Reconciled { formatted: true, .. }
        );
        let calls = h.device.calls();
        assert_eq!(calls.len(), 3);
        assert_matches!(calls[0], DeviceCall::Format { force: true, .. });
        assert!(!calls
            .iter()
            .any(|c| matches!(c, DeviceCall::UnmountIfMounted { .. })));

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn capacity_is_exact() {
        let h = Harness::new("capacity_is_exact");
        h.device.set_stats(FilesystemStats {
            block_size: 512,
            available_blocks: 123_456_789_011,
        });
        let mut drive = claimed_drive("d1");
        drive.requested_format.filesystem = Some("xfs".to_string());
        let drive = h.insert(drive).await;

        h.reconciler.reconcile(&drive).await.unwrap();
        assert_eq!(h.get("d1").await.free_capacity, 512 * 123_456_789_011);

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn capacity_overflow_is_an_error() {
        let h = Harness::new("capacity_overflow_is_an_error");
        h.device.set_stats(FilesystemStats {
            block_size: u64::MAX,
            available_blocks: 2,
        });
        let mut drive = claimed_drive("d1");
        drive.requested_format.filesystem = Some("xfs".to_string());
        let drive = h.insert(drive).await;

        let err = h.reconciler.reconcile(&drive).await.unwrap_err();
        assert_matches!(err, ReconcileError::CapacityOverflow { .. });

        // The format checkpoint stands.
        let stored = h.get("d1").await;
        assert_eq!(stored.filesystem.as_deref(), Some("xfs"));
        assert_eq!(stored.mountpoint, None);
        assert_eq!(stored.free_capacity, 0);

        h.cleanup_successful();
    }

    #[tokio::test]
    async fn force_scope_controls_format_checkpoint() {
        for (scope, force_after_format) in
            [(ForceScope::Request, true), (ForceScope::FormatOnly, false)]
        {
            let h = Harness::with_config(
                "force_scope_controls_format_checkpoint",
                ReconcilerConfig { force_scope: scope, ..Default::default() },
            );
            let drive = h.insert(mounted_drive("d3", "/data", true)).await;

            h.device.set_failing(DeviceOp::Mount, true);
            let err = h.reconciler.reconcile(&drive).await.unwrap_err();
            assert_matches!(err, ReconcileError::Mount { .. });

            let stored = h.get("d3").await;
            assert_eq!(stored.filesystem.as_deref(), Some("ext4"));
            assert_eq!(
                stored.requested_format.force, force_after_format,
                "force scope {scope:?}"
            );
            h.cleanup_successful();
        }
    }

    /// Records, at each format, whether the store already knew the drive
    /// was unmounted.
    struct OrderCheckingDevice {
        inner: Arc<FakeDevice>,
        store: Arc<LedgeredDriveStore>,
        mountpoints_at_format: Mutex<Vec<Option<Utf8PathBuf>>>,
    }

    #[async_trait]
    impl DeviceOps for OrderCheckingDevice {
        async fn format(
            &self,
            device: &Utf8Path,
            filesystem: &str,
            force: bool,
        ) -> Result<(), DeviceError> {
            let drive = self
                .store
                .list()
                .await
                .unwrap()
                .into_iter()
                .find(|d| d.path == device)
                .unwrap();
            self.mountpoints_at_format.lock().unwrap().push(drive.mountpoint);
            self.inner.format(device, filesystem, force).await
        }

        async fn mount(
            &self,
            device: &Utf8Path,
            target: &Utf8Path,
            filesystem: Option<&str>,
            options: &[String],
        ) -> Result<(), DeviceError> {
            self.inner.mount(device, target, filesystem, options).await
        }

        async fn unmount_if_mounted(
            &self,
            target: &Utf8Path,
        ) -> Result<(), DeviceError> {
            self.inner.unmount_if_mounted(target).await
        }

        async fn stat_filesystem(
            &self,
            target: &Utf8Path,
        ) -> Result<FilesystemStats, DeviceError> {
            self.inner.stat_filesystem(target).await
        }
    }

    #[tokio::test]
    async fn unmount_is_recorded_before_format() {
        let logctx = test_setup_log("unmount_is_recorded_before_format");
        let store = LedgeredDriveStore::in_memory(&logctx.log);
        let device = Arc::new(OrderCheckingDevice {
            inner: FakeDevice::new(),
            store: store.clone(),
            mountpoints_at_format: Mutex::new(Vec::new()),
        });
        let reconciler = DriveReconciler::new(
            &logctx.log,
            ReconcilerConfig::default(),
            store.clone().as_drive_store(),
            device.clone(),
        );

        let drive =
            store.insert(mounted_drive("d3", "/data", true)).await.unwrap();
        reconciler.reconcile(&drive).await.unwrap();
        assert_eq!(*device.mountpoints_at_format.lock().unwrap(), vec![None]);

        logctx.cleanup_successful();
    }
}
