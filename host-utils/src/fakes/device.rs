// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::device::{BoxedDeviceOps, DeviceError, DeviceOps, FilesystemStats};
use crate::executor::failure_output;
use crate::output_to_exec_error;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// A call made to a [FakeDevice].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCall {
    Format {
        device: Utf8PathBuf,
        filesystem: String,
        force: bool,
    },
    Mount {
        device: Utf8PathBuf,
        target: Utf8PathBuf,
        filesystem: Option<String>,
        options: Vec<String>,
    },
    UnmountIfMounted {
        target: Utf8PathBuf,
    },
    StatFilesystem {
        target: Utf8PathBuf,
    },
}

/// Selects which [DeviceOps] method a [FakeDevice] should fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceOp {
    Format,
    Mount,
    Unmount,
    Stat,
}

/// A fake implementation of [crate::device::HostDevice].
///
/// Every call is recorded, whether or not it succeeds. Operations succeed
/// unless marked failing with [FakeDevice::set_failing].
pub struct FakeDevice {
    calls: Mutex<Vec<DeviceCall>>,
    failing: Mutex<BTreeSet<DeviceOp>>,
    stats: Mutex<FilesystemStats>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(BTreeSet::new()),
            stats: Mutex::new(FilesystemStats {
                block_size: 4096,
                available_blocks: 1024,
            }),
        })
    }

    pub fn as_device_ops(self: Arc<Self>) -> BoxedDeviceOps {
        self
    }

    /// Returns every call made so far, in order.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Makes every later call to `op` fail (or succeed again).
    pub fn set_failing(&self, op: DeviceOp, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(op);
        } else {
            set.remove(&op);
        }
    }

    /// Sets the statistics reported by `stat_filesystem`.
    pub fn set_stats(&self, stats: FilesystemStats) {
        *self.stats.lock().unwrap() = stats;
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn is_failing(&self, op: DeviceOp) -> bool {
        self.failing.lock().unwrap().contains(&op)
    }
}

fn injected(command: &str) -> crate::ExecutionError {
    output_to_exec_error(command.to_string(), &failure_output("injected"))
}

#[async_trait]
impl DeviceOps for FakeDevice {
    async fn format(
        &self,
        device: &Utf8Path,
        filesystem: &str,
        force: bool,
    ) -> Result<(), DeviceError> {
        self.record(DeviceCall::Format {
            device: device.to_owned(),
            filesystem: filesystem.to_string(),
            force,
        });
        if self.is_failing(DeviceOp::Format) {
            return Err(DeviceError::Format {
                device: device.to_owned(),
                filesystem: filesystem.to_string(),
                err: injected("mkfs"),
            });
        }
        Ok(())
    }

    async fn mount(
        &self,
        device: &Utf8Path,
        target: &Utf8Path,
        filesystem: Option<&str>,
        options: &[String],
    ) -> Result<(), DeviceError> {
        self.record(DeviceCall::Mount {
            device: device.to_owned(),
            target: target.to_owned(),
            filesystem: filesystem.map(str::to_string),
            options: options.to_vec(),
        });
        if self.is_failing(DeviceOp::Mount) {
            return Err(DeviceError::Mount {
                device: device.to_owned(),
                target: target.to_owned(),
                err: injected("mount"),
            });
        }
        Ok(())
    }

    async fn unmount_if_mounted(
        &self,
        target: &Utf8Path,
    ) -> Result<(), DeviceError> {
        self.record(DeviceCall::UnmountIfMounted { target: target.to_owned() });
        if self.is_failing(DeviceOp::Unmount) {
            return Err(DeviceError::Unmount {
                target: target.to_owned(),
                err: injected("umount"),
            });
        }
        Ok(())
    }

    async fn stat_filesystem(
        &self,
        target: &Utf8Path,
    ) -> Result<FilesystemStats, DeviceError> {
        self.record(DeviceCall::StatFilesystem { target: target.to_owned() });
        if self.is_failing(DeviceOp::Stat) {
            return Err(DeviceError::Stat {
                target: target.to_owned(),
                err: std::io::Error::other("injected"),
            });
        }
        Ok(*self.stats.lock().unwrap())
    }
}
