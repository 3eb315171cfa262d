// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical operations on drives: format, mount, unmount and statistics.

use crate::executor::BoxedExecutor;
use crate::mounts;
use crate::{ExecutionError, MOUNT, PROC_MOUNTS, UMOUNT};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{info, Logger};
use std::ffi::CString;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Unsupported filesystem type {0:?}")]
    UnsupportedFilesystem(String),

    #[error("Failed to format {device} as {filesystem}")]
    Format {
        device: Utf8PathBuf,
        filesystem: String,
        #[source]
        err: ExecutionError,
    },

    #[error("Failed to create mountpoint {target}")]
    CreateMountpoint {
        target: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("Failed to mount {device} at {target}")]
    Mount {
        device: Utf8PathBuf,
        target: Utf8PathBuf,
        #[source]
        err: ExecutionError,
    },

    #[error("Failed to read mount table {path}")]
    MountTable {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("Failed to unmount {target}")]
    Unmount {
        target: Utf8PathBuf,
        #[source]
        err: ExecutionError,
    },

    #[error("Failed to read filesystem statistics at {target}")]
    Stat {
        target: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Filesystem usage reported by `statvfs(3)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilesystemStats {
    /// Size of the blocks counted by `available_blocks`, in bytes.
    pub block_size: u64,
    /// Blocks available to unprivileged users.
    pub available_blocks: u64,
}

impl FilesystemStats {
    /// Available space in bytes, or `None` if it does not fit in a `u64`.
    pub fn available_bytes(&self) -> Option<u64> {
        self.block_size.checked_mul(self.available_blocks)
    }
}

/// The operations the reconciler performs on physical devices.
///
/// - In production, this is [HostDevice].
/// - Under test, [crate::fakes::device::FakeDevice] records calls instead.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    /// Creates a filesystem of type `filesystem` on `device`.
    ///
    /// Unless `force` is set, the underlying tool refuses to overwrite an
    /// existing filesystem.
    async fn format(
        &self,
        device: &Utf8Path,
        filesystem: &str,
        force: bool,
    ) -> Result<(), DeviceError>;

    /// Mounts `device` at `target`, creating `target` if needed.
    ///
    /// If `filesystem` is `None` the kernel probes the filesystem type.
    async fn mount(
        &self,
        device: &Utf8Path,
        target: &Utf8Path,
        filesystem: Option<&str>,
        options: &[String],
    ) -> Result<(), DeviceError>;

    /// Unmounts whatever is mounted at `target`. Succeeds without doing
    /// anything if nothing is.
    async fn unmount_if_mounted(
        &self,
        target: &Utf8Path,
    ) -> Result<(), DeviceError>;

    /// Reports usage of the filesystem mounted at `target`.
    async fn stat_filesystem(
        &self,
        target: &Utf8Path,
    ) -> Result<FilesystemStats, DeviceError>;
}

pub type BoxedDeviceOps = Arc<dyn DeviceOps>;

/// [DeviceOps] implemented with the host's `mkfs`, `mount` and `umount`
/// commands.
pub struct HostDevice {
    log: Logger,
    executor: BoxedExecutor,
    mount_table: Utf8PathBuf,
}

impl HostDevice {
    pub fn new(log: &Logger, executor: BoxedExecutor) -> Arc<Self> {
        Self::with_mount_table(log, executor, PROC_MOUNTS.into())
    }

    /// Like [HostDevice::new], but reads mounts from `mount_table` rather
    /// than [PROC_MOUNTS].
    pub fn with_mount_table(
        log: &Logger,
        executor: BoxedExecutor,
        mount_table: Utf8PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            log: log.new(slog::o!("component" => "HostDevice")),
            executor,
            mount_table,
        })
    }

    pub fn as_device_ops(self: Arc<Self>) -> BoxedDeviceOps {
        self
    }
}

// Returns the program and arguments to format `device` as `filesystem`.
fn mkfs_command(
    device: &Utf8Path,
    filesystem: &str,
    force: bool,
) -> Result<(String, Vec<String>), DeviceError> {
    let valid = !filesystem.is_empty()
        && filesystem.chars().all(|c| c.is_ascii_alphanumeric());
    if !valid {
        return Err(DeviceError::UnsupportedFilesystem(filesystem.to_string()));
    }
    let program = format!("/sbin/mkfs.{filesystem}");
    let mut args = Vec::new();
    match filesystem {
        "xfs" => {
            if force {
                args.push("-f".to_string());
            }
        }
        "ext2" | "ext3" | "ext4" => {
            args.push("-q".to_string());
            if force {
                args.push("-F".to_string());
            }
        }
        _ => {}
    }
    args.push(device.to_string());
    Ok((program, args))
}

#[async_trait]
impl DeviceOps for HostDevice {
    async fn format(
        &self,
        device: &Utf8Path,
        filesystem: &str,
        force: bool,
    ) -> Result<(), DeviceError> {
        let (program, args) = mkfs_command(device, filesystem, force)?;
        info!(
            self.log, "formatting device";
            "device" => %device,
            "filesystem" => filesystem,
            "force" => force,
        );
        let mut command = tokio::process::Command::new(program);
        command.args(&args);
        self.executor.execute_async(&mut command).await.map_err(|err| {
            DeviceError::Format {
                device: device.to_owned(),
                filesystem: filesystem.to_string(),
                err,
            }
        })?;
        Ok(())
    }

    async fn mount(
        &self,
        device: &Utf8Path,
        target: &Utf8Path,
        filesystem: Option<&str>,
        options: &[String],
    ) -> Result<(), DeviceError> {
        tokio::fs::create_dir_all(target).await.map_err(|err| {
            DeviceError::CreateMountpoint { target: target.to_owned(), err }
        })?;

        let mut command = tokio::process::Command::new(MOUNT);
        if let Some(filesystem) = filesystem {
            command.args(["-t", filesystem]);
        }
        if !options.is_empty() {
            command.args(["-o", &options.join(",")]);
        }
        command.args([device.as_str(), target.as_str()]);

        info!(
            self.log, "mounting device";
            "device" => %device,
            "target" => %target,
        );
        self.executor.execute_async(&mut command).await.map_err(|err| {
            DeviceError::Mount {
                device: device.to_owned(),
                target: target.to_owned(),
                err,
            }
        })?;
        Ok(())
    }

    async fn unmount_if_mounted(
        &self,
        target: &Utf8Path,
    ) -> Result<(), DeviceError> {
        let entries =
            mounts::read_mount_table(&self.mount_table).await.map_err(
                |err| DeviceError::MountTable {
                    path: self.mount_table.clone(),
                    err,
                },
            )?;
        if !mounts::is_mount_point(&entries, target) {
            info!(self.log, "not mounted, skipping unmount"; "target" => %target);
            return Ok(());
        }

        info!(self.log, "unmounting"; "target" => %target);
        let mut command = tokio::process::Command::new(UMOUNT);
        command.arg(target.as_str());
        self.executor.execute_async(&mut command).await.map_err(|err| {
            DeviceError::Unmount { target: target.to_owned(), err }
        })?;
        Ok(())
    }

    async fn stat_filesystem(
        &self,
        target: &Utf8Path,
    ) -> Result<FilesystemStats, DeviceError> {
        statvfs(target)
            .map_err(|err| DeviceError::Stat { target: target.to_owned(), err })
    }
}

fn statvfs(path: &Utf8Path) -> Result<FilesystemStats, std::io::Error> {
    let c_path = CString::new(path.as_str()).map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, err)
    })?;
    let mut buf = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `c_path` is NUL-terminated and `buf` is a valid destination
    // for a `struct statvfs`.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), buf.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: statvfs returned 0, so it filled in `buf`.
    let buf = unsafe { buf.assume_init() };
    // The widths of these fields vary by platform.
    #[allow(clippy::useless_conversion)]
    let stats = FilesystemStats {
        block_size: u64::from(buf.f_frsize),
        available_blocks: u64::from(buf.f_bavail),
    };
    Ok(stats)
}
