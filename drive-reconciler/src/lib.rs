// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of drive records against the physical drives on this node.
//!
//! The pieces, from the inside out:
//!
//! * [`reconciler::DriveReconciler`] decides which device operations a drive
//!   needs (unmount, format, mount, capacity probe) and interleaves them with
//!   conditional store updates, so that every physical step is recorded
//!   before the next one starts.
//! * [`listener::DriveListener`] receives store notifications and filters
//!   out drives that belong to other nodes, are unclaimed, or have nothing
//!   requested.
//! * [`controller::DriveController`] delivers notifications to the listener,
//!   one at a time per drive, and redelivers failed work with backoff.
//! * [`store::DriveStore`] is the interface to the record store, and
//!   [`ledger::LedgeredDriveStore`] an implementation backed by a JSON file.

pub mod config;
pub mod controller;
pub mod ledger;
pub mod listener;
pub mod reconciler;
pub mod store;

pub use config::{ControllerConfig, ForceScope, ReconcilerConfig};
pub use controller::DriveController;
pub use ledger::LedgeredDriveStore;
pub use listener::{DriveEventHandler, DriveListener};
pub use reconciler::{
    DriveReconciler, ReconcileError, ReconcileOutcome, Rejection, SkipReason,
};
pub use store::{BoxedDriveStore, DriveNotification, DriveStore, StoreError};
