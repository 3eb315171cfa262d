// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Delivers drive notifications to a handler, one at a time per drive.
//!
//! Notifications for different drives are handled concurrently, up to
//! [`ControllerConfig::workers`] at once. While a drive's handler runs,
//! further notifications for it are held back, and only the newest is
//! delivered once the handler returns. An update whose record the store has
//! since replaced is dropped rather than delivered. A handler error
//! schedules a redelivery of the drive's current record after an
//! exponential backoff.

use crate::config::ControllerConfig;
use crate::listener::{dispatch, DriveEventHandler};
use crate::reconciler::{ReconcileError, ReconcileOutcome};
use crate::store::{BoxedDriveStore, DriveNotification, StoreError};
use drive_common::backoff::{Backoff, ExponentialBackoff};
use drive_common::Generation;
use slog::{debug, error, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};

#[derive(Debug, thiserror::Error)]
enum DeliveryError {
    #[error("Failed to read current version of drive")]
    Reread(#[source] StoreError),
    #[error("Drive handler did not complete")]
    Worker(#[source] JoinError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

#[derive(Debug)]
enum Delivered {
    Handled(ReconcileOutcome),
    /// The drive left the store before it could be delivered.
    Vanished,
    /// The store already holds a newer version than the notification
    /// described, and that version has its own notification.
    Superseded { notified: Generation, current: Generation },
}

enum Delivery {
    Notification(DriveNotification),
    /// Deliver whatever the store currently holds for the drive.
    Redeliver,
}

#[derive(Default)]
struct DriveQueue {
    in_flight: bool,
    pending: Option<Delivery>,
    /// Present while the drive is failing.
    backoff: Option<ExponentialBackoff>,
    /// Token of the redelivery timer that is still wanted, if any.
    retry: Option<u64>,
}

impl DriveQueue {
    fn is_idle(&self) -> bool {
        !self.in_flight
            && self.pending.is_none()
            && self.backoff.is_none()
            && self.retry.is_none()
    }
}

type DeliveryResult = Result<Delivered, DeliveryError>;

pub struct DriveController {
    log: Logger,
    config: ControllerConfig,
    store: BoxedDriveStore,
    handler: Arc<dyn DriveEventHandler>,
}

impl DriveController {
    pub fn new(
        log: &Logger,
        config: ControllerConfig,
        store: BoxedDriveStore,
        handler: Arc<dyn DriveEventHandler>,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "DriveController")),
            config,
            store,
            handler,
        }
    }

    /// Runs until `shutdown` completes or the store stops sending
    /// notifications, then waits for in-flight handlers to finish.
    ///
    /// Every drive already in the store is delivered once at startup, as an
    /// update from itself to itself.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut notifications = self.store.watch();
        let mut resync = self.config.resync_interval().map(|period| {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + period,
                period,
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let mut state = DispatchState {
            log: self.log.clone(),
            store: self.store.clone(),
            handler: self.handler.clone(),
            config: self.config.clone(),
            permits: Arc::new(Semaphore::new(self.config.workers.max(1))),
            queues: BTreeMap::new(),
            workers: JoinSet::new(),
            timers: JoinSet::new(),
            next_token: 0,
        };
        info!(
            self.log, "starting drive controller";
            "workers" => self.config.workers,
            "resync_interval" => ?self.config.resync_interval(),
        );
        state.enqueue_all().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(self.log, "shutdown requested");
                    break;
                }
                notification = notifications.recv() => match notification {
                    Ok(notification) => state.enqueue(
                        notification.drive_name().to_string(),
                        Delivery::Notification(notification),
                    ),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(
                            self.log,
                            "missed drive notifications; relisting";
                            "missed" => missed,
                        );
                        state.enqueue_all().await;
                    }
                    Err(RecvError::Closed) => {
                        info!(self.log, "drive store closed notifications");
                        break;
                    }
                },
                Some(joined) = state.workers.join_next(),
                    if !state.workers.is_empty() =>
                {
                    match joined {
                        Ok((name, result)) => state.delivered(name, result),
                        Err(err) => {
                            error!(
                                self.log, "drive worker failed";
                                "error" => %err,
                            );
                        }
                    }
                }
                Some(Ok((name, token))) = state.timers.join_next(),
                    if !state.timers.is_empty() =>
                {
                    state.retry_fired(name, token);
                }
                () = next_tick(&mut resync) => {
                    if let Err(err) = self.store.resync().await {
                        warn!(
                            self.log, "failed to resync drive store";
                            "error" => InlineErrorChain::new(&err),
                        );
                    }
                }
            }
        }

        let in_flight = state.workers.len();
        if in_flight > 0 {
            info!(
                self.log, "waiting for in-flight drives";
                "count" => in_flight,
            );
        }
        while let Some(joined) = state.workers.join_next().await {
            if let Ok((name, result)) = joined {
                log_result(&state.log, &name, &result);
            }
        }
        info!(self.log, "drive controller stopped");
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_result(log: &Logger, name: &str, result: &DeliveryResult) {
    match result {
        Ok(Delivered::Handled(outcome)) => {
            debug!(log, "delivered"; "drive" => name, "outcome" => ?outcome);
        }
        Ok(Delivered::Vanished) => {
            debug!(log, "drive vanished before delivery"; "drive" => name);
        }
        Ok(Delivered::Superseded { notified, current }) => {
            debug!(
                log, "dropped stale notification";
                "drive" => name,
                "notified" => %notified,
                "current" => %current,
            );
        }
        Err(err) => {
            warn!(
                log, "delivery failed";
                "drive" => name,
                "error" => InlineErrorChain::new(err),
            );
        }
    }
}

struct DispatchState {
    log: Logger,
    store: BoxedDriveStore,
    handler: Arc<dyn DriveEventHandler>,
    config: ControllerConfig,
    permits: Arc<Semaphore>,
    queues: BTreeMap<String, DriveQueue>,
    workers: JoinSet<(String, DeliveryResult)>,
    timers: JoinSet<(String, u64)>,
    next_token: u64,
}

impl DispatchState {
    /// Queues every drive in the store as an update to itself.
    async fn enqueue_all(&mut self) {
        match self.store.list().await {
            Ok(drives) => {
                for drive in drives {
                    let name = drive.name.clone();
                    let notification = DriveNotification::Updated {
                        old: drive.clone(),
                        new: drive,
                    };
                    self.enqueue(name, Delivery::Notification(notification));
                }
            }
            Err(err) => {
                // Failing drives get redelivered anyway; the rest have to
                // wait for their next change or for the store to close.
                error!(
                    self.log, "failed to list drives";
                    "error" => InlineErrorChain::new(&err),
                );
            }
        }
    }

    fn enqueue(&mut self, name: String, delivery: Delivery) {
        let queue = self.queues.entry(name.clone()).or_default();
        if matches!(delivery, Delivery::Notification(_)) {
            // Newer than anything a pending redelivery would read.
            queue.retry = None;
            queue.pending = Some(delivery);
        } else if queue.pending.is_none() {
            queue.pending = Some(delivery);
        }
        self.start(&name);
    }

    fn start(&mut self, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        if queue.in_flight {
            return;
        }
        let Some(delivery) = queue.pending.take() else {
            return;
        };
        queue.in_flight = true;

        let name = name.to_string();
        let store = self.store.clone();
        let handler = self.handler.clone();
        let permits = self.permits.clone();
        self.workers.spawn(async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await.ok();
            // A panicking handler must still hand the drive back to its
            // queue, so it runs in a task of its own.
            let handler_task = tokio::spawn({
                let name = name.clone();
                async move { deliver(&name, delivery, &store, &*handler).await }
            });
            let result = handler_task
                .await
                .unwrap_or_else(|err| Err(DeliveryError::Worker(err)));
            (name, result)
        });
    }

    fn delivered(&mut self, name: String, result: DeliveryResult) {
        log_result(&self.log, &name, &result);
        let Some(queue) = self.queues.get_mut(&name) else {
            return;
        };
        queue.in_flight = false;

        match result {
            Ok(_) => queue.backoff = None,
            Err(_) if queue.pending.is_some() => {
                // The next delivery is already waiting.
            }
            Err(_) => {
                let backoff = queue
                    .backoff
                    .get_or_insert_with(|| self.config.redelivery_policy());
                let delay = backoff.next_backoff().unwrap_or_else(|| {
                    Duration::from_secs(self.config.backoff_max_secs)
                });
                let token = self.next_token;
                self.next_token += 1;
                queue.retry = Some(token);
                warn!(
                    self.log, "scheduling redelivery";
                    "drive" => &name,
                    "delay" => ?delay,
                );
                let timer_name = name.clone();
                self.timers.spawn(async move {
                    tokio::time::sleep(delay).await;
                    (timer_name, token)
                });
            }
        }

        if queue.pending.is_some() {
            self.start(&name);
        } else if queue.is_idle() {
            self.queues.remove(&name);
        }
    }

    fn retry_fired(&mut self, name: String, token: u64) {
        let Some(queue) = self.queues.get_mut(&name) else {
            return;
        };
        if queue.retry != Some(token) {
            return;
        }
        queue.retry = None;
        self.enqueue(name, Delivery::Redeliver);
    }
}

async fn deliver(
    name: &str,
    delivery: Delivery,
    store: &BoxedDriveStore,
    handler: &dyn DriveEventHandler,
) -> DeliveryResult {
    let notification = match delivery {
        // Updates written while an earlier delivery ran, including the
        // handler's own checkpoints, may be behind the store by now.
        Delivery::Notification(DriveNotification::Updated { old, new }) => {
            match store.get(name).await {
                Ok(current) if current.generation != new.generation => {
                    return Ok(Delivered::Superseded {
                        notified: new.generation,
                        current: current.generation,
                    });
                }
                Ok(_) => DriveNotification::Updated { old, new },
                Err(StoreError::NotFound { .. }) => {
                    return Ok(Delivered::Vanished)
                }
                Err(err) => return Err(DeliveryError::Reread(err)),
            }
        }
        Delivery::Notification(notification) => notification,
        Delivery::Redeliver => match store.get(name).await {
            Ok(drive) => {
                DriveNotification::Updated { old: drive.clone(), new: drive }
            }
            Err(StoreError::NotFound { .. }) => return Ok(Delivered::Vanished),
            Err(err) => return Err(DeliveryError::Reread(err)),
        },
    };
    Ok(Delivered::Handled(dispatch(handler, &notification).await?))
}
