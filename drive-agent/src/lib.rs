// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-node agent that formats and mounts drives on request.
//!
//! The agent watches the drive ledger and hands every change to a drive
//! owned by this node to the reconciler, which runs `mkfs`, `mount` and
//! `umount` on the host as the drive's `requested_format` demands.

mod config;

pub use config::{Config, LoadError, StoreConfig};

use anyhow::{anyhow, Context};
use drive_common::FileKv;
use drive_reconciler::{
    DriveController, DriveListener, DriveReconciler, LedgeredDriveStore,
};
use host_utils::{HostDevice, HostExecutor};
use slog::{info, o, Logger};
use std::future::Future;
use std::sync::Arc;

/// Determines the identity this node's drives are recorded under.
pub fn resolve_node_id(config: &Config) -> anyhow::Result<String> {
    if let Some(node_id) = &config.node_id {
        return Ok(node_id.clone());
    }
    let hostname = gethostname::gethostname();
    let node_id = hostname.into_string().map_err(|hostname| {
        anyhow!("host name {hostname:?} is not valid UTF-8")
    })?;
    if node_id.is_empty() {
        return Err(anyhow!("host name is empty; set node_id in the config"));
    }
    Ok(node_id)
}

/// Builds the root logger described by `config`.
pub fn build_logger(config: &Config) -> anyhow::Result<Logger> {
    let log = config
        .log
        .to_logger("drive-agent")
        .map_err(|message| anyhow!("initializing logger: {message}"))?;
    Ok(log.new(o!(FileKv)))
}

/// Runs the agent until `shutdown` completes.
pub async fn run_agent<F>(
    config: Config,
    log: &Logger,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let node_id = resolve_node_id(&config)?;
    let log = log.new(o!("node_id" => node_id.clone()));
    info!(
        log, "starting drive agent";
        "ledger" => %config.store.ledger,
        "mount_root" => %config.reconciler.mount_root,
        "force_scope" => ?config.reconciler.force_scope,
    );

    let store = LedgeredDriveStore::open(&log, &config.store.ledger)
        .await
        .with_context(|| {
            format!("opening drive ledger {}", config.store.ledger)
        })?
        .as_drive_store();
    let executor = HostExecutor::new(log.clone()).as_executor();
    let device = HostDevice::new(&log, executor).as_device_ops();

    let reconciler =
        DriveReconciler::new(&log, config.reconciler, store.clone(), device);
    let listener = Arc::new(DriveListener::new(&log, node_id, reconciler));
    DriveController::new(&log, config.controller, store, listener)
        .run(shutdown)
        .await;

    info!(log, "drive agent stopped");
    Ok(())
}
