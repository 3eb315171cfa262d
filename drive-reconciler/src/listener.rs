// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routes store notifications to the reconciler.

use crate::reconciler::{
    DriveReconciler, ReconcileError, ReconcileOutcome, SkipReason,
};
use crate::store::DriveNotification;
use async_trait::async_trait;
use drive_common::drive::Drive;
use slog::{debug, o, Logger};

/// Reacts to each kind of [`DriveNotification`].
///
/// An error asks the caller to deliver the drive again later.
#[async_trait]
pub trait DriveEventHandler: Send + Sync {
    async fn on_add(
        &self,
        drive: &Drive,
    ) -> Result<ReconcileOutcome, ReconcileError>;

    async fn on_update(
        &self,
        old: &Drive,
        new: &Drive,
    ) -> Result<ReconcileOutcome, ReconcileError>;

    async fn on_delete(
        &self,
        drive: &Drive,
    ) -> Result<ReconcileOutcome, ReconcileError>;
}

/// Invokes the method of `handler` matching the kind of `notification`.
pub async fn dispatch(
    handler: &dyn DriveEventHandler,
    notification: &DriveNotification,
) -> Result<ReconcileOutcome, ReconcileError> {
    match notification {
        DriveNotification::Added(drive) => handler.on_add(drive).await,
        DriveNotification::Updated { old, new } => {
            handler.on_update(old, new).await
        }
        DriveNotification::Deleted(drive) => handler.on_delete(drive).await,
    }
}

/// Passes updates to drives this node should act on to a
/// [`DriveReconciler`].
pub struct DriveListener {
    log: Logger,
    node_id: String,
    reconciler: DriveReconciler,
}

impl DriveListener {
    pub fn new(
        log: &Logger,
        node_id: impl Into<String>,
        reconciler: DriveReconciler,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            log: log.new(o!(
                "component" => "DriveListener",
                "node_id" => node_id.clone(),
            )),
            node_id,
            reconciler,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // Checked in this order, so that drives of other nodes are never
    // inspected further.
    fn filter(&self, drive: &Drive) -> Option<SkipReason> {
        if drive.owner_node != self.node_id {
            Some(SkipReason::NotOwned)
        } else if !drive.claimed {
            Some(SkipReason::Unclaimed)
        } else if !drive.requested_format.is_pending() {
            Some(SkipReason::NothingRequested)
        } else {
            None
        }
    }
}

#[async_trait]
impl DriveEventHandler for DriveListener {
    async fn on_add(
        &self,
        _drive: &Drive,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        Ok(ReconcileOutcome::Skipped(SkipReason::AddedOrDeleted))
    }

    async fn on_update(
        &self,
        _old: &Drive,
        new: &Drive,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if let Some(reason) = self.filter(new) {
            debug!(
                self.log, "ignoring drive update";
                "drive" => &new.name,
                "reason" => ?reason,
            );
            return Ok(ReconcileOutcome::Skipped(reason));
        }
        self.reconciler.reconcile(new).await
    }

    async fn on_delete(
        &self,
        _drive: &Drive,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        Ok(ReconcileOutcome::Skipped(SkipReason::AddedOrDeleted))
    }
}
