// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for redelivering work with exponential backoff.

use std::time::Duration;

pub use ::backoff::backoff::Backoff;
pub use ::backoff::ExponentialBackoff;

/// Default delay before the first redelivery of a failed reconciliation.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(250);

/// Default upper bound on the delay between redeliveries.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Return a backoff policy for redelivering a failed reconciliation.
///
/// The policy never gives up: a drive whose reconciliation keeps failing is
/// retried at `max_interval` forever, since the operator may fix the device
/// at any point.
pub fn redelivery_policy(
    initial_interval: Duration,
    max_interval: Duration,
) -> ExponentialBackoff {
    let current_interval = initial_interval;
    ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Return the redelivery policy with the default intervals.
pub fn default_redelivery_policy() -> ExponentialBackoff {
    redelivery_policy(DEFAULT_INITIAL_INTERVAL, DEFAULT_MAX_INTERVAL)
}
