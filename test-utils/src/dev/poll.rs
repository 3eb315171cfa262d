// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for waiting until a condition becomes true.

use std::future::Future;
use std::time::Duration;
use std::time::Instant;

/// Result of one check of a condition in [`wait_for_condition`].
#[derive(Debug, thiserror::Error)]
pub enum CondCheckError<E> {
    /// The condition is not yet satisfied; keep polling.
    #[error("poll condition not yet ready")]
    NotYet,
    /// The condition can never be satisfied; stop polling.
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(#[source] E),
}

/// Poll `cond` every `poll_interval` until it returns a value, fails
/// permanently, or `poll_max` has elapsed.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let start = Instant::now();
    loop {
        let duration = start.elapsed();
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => (),
        }
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }
        tokio::time::sleep(*poll_interval).await;
    }
}
