//! Background tasks driving a tree watcher
//!
//! - intake: receives source events, tags and queues notifications (or
//!   applies them directly in immediate mode)
//! - drain: wakes on a fixed interval and applies the coalesced batch
//!
//! Both exit when the shutdown signal flips, dropping their output senders
//! so the streams end once the watcher itself lets go of its own.

use crate::config::DispatchMode;
use crate::debounce::{immediate_event, ArrivalTag, Debouncer};
use crate::error::{Result, WatcherError};
use crate::event::{Event, RawNotification, RawOp, Transaction};
use crate::handler::{Applied, State};
use crate::source::{NotificationSource, SourceEvent};
use parking_lot::Mutex;
use shadow_core::{Checksum, SourcePath};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

/// State shared between the watcher handle and its tasks
pub(crate) struct Shared<S> {
    pub state: Mutex<State<S>>,
    /// Parent of the watched root; relative paths are taken against it
    pub base: SourcePath,
    pub checksum: Arc<dyn Checksum>,
    pub debouncer: Debouncer,
    pub mode: DispatchMode,
    /// Serializes drain-and-publish so batches reach the stream in order
    pub drain_gate: tokio::sync::Mutex<()>,
}

impl<S: NotificationSource> Shared<S> {
    pub fn apply(&self, event: Event) -> Result<Applied> {
        let mut state = self.state.lock();
        state.apply(&self.base, self.checksum.as_ref(), event)
    }

    /// Take the pending queue and apply it as one batch
    ///
    /// The state lock is held across the drain so no other mutation can
    /// slip between taking the queue and applying it.
    pub fn drain(&self) -> Vec<Result<Applied>> {
        let mut state = self.state.lock();
        let events = self.debouncer.drain();
        debug!(events = events.len(), "applying drained batch");
        events
            .into_iter()
            .map(|event| state.apply(&self.base, self.checksum.as_ref(), event))
            .collect()
    }

    /// Queue a notification, or apply it at once in immediate mode
    fn intake(&self, raw: RawNotification) -> Option<Result<Applied>> {
        match self.mode {
            DispatchMode::Debounced => {
                let tag = self.arrival_tag(&raw);
                self.debouncer.append(raw, tag);
                None
            }
            DispatchMode::Immediate => immediate_event(&raw).map(|event| self.apply(event)),
        }
    }

    /// What the tree knows about the notification's subject right now
    pub fn arrival_tag(&self, raw: &RawNotification) -> ArrivalTag {
        let known = raw.path.exclude_prefix(&self.base).ok().and_then(|relative| {
            let state = self.state.lock();
            state
                .tree
                .search(&relative)
                .map(|node| (node.meta.checksum.clone(), node.is_dir()))
        });

        match raw.op {
            RawOp::Create => {
                let is_dir = raw.path.is_dir();
                let checksum = if is_dir {
                    String::new()
                } else {
                    // Gone again already; the queued create will fail or cancel
                    self.checksum.checksum(&raw.path).unwrap_or_default()
                };
                ArrivalTag {
                    checksum,
                    is_dir,
                    in_tree: known.is_some(),
                }
            }
            _ => match known {
                Some((checksum, is_dir)) => ArrivalTag {
                    checksum,
                    is_dir,
                    in_tree: true,
                },
                None => ArrivalTag::default(),
            },
        }
    }
}

/// Senders for the two output streams
#[derive(Clone)]
pub(crate) struct Outputs {
    events: mpsc::Sender<Transaction>,
    errors: mpsc::Sender<WatcherError>,
    timeout: Duration,
}

impl Outputs {
    pub fn new(
        events: mpsc::Sender<Transaction>,
        errors: mpsc::Sender<WatcherError>,
        timeout: Duration,
    ) -> Self {
        Self {
            events,
            errors,
            timeout,
        }
    }

    pub async fn publish(&self, result: Result<Applied>) {
        match result {
            Ok(applied) => {
                self.transaction(applied.transaction).await;
                for e in applied.side_errors {
                    self.error(e).await;
                }
            }
            Err(e) => self.error(e).await,
        }
    }

    async fn transaction(&self, transaction: Transaction) {
        match self.events.send_timeout(transaction, self.timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(dropped)) => {
                let what = format!("{} transaction for {}", dropped.kind, dropped.path);
                warn!("Events stream stalled, dropped {}", what);
                self.offer_error(WatcherError::OutputStalled(what));
            }
            Err(SendTimeoutError::Closed(dropped)) => {
                debug!("Events stream closed, dropped {} for {}", dropped.kind, dropped.path);
            }
        }
    }

    pub async fn error(&self, error: WatcherError) {
        match self.errors.send_timeout(error, self.timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(dropped)) => {
                warn!("Errors stream stalled, dropped: {}", dropped);
            }
            Err(SendTimeoutError::Closed(dropped)) => {
                debug!("Errors stream closed, dropped: {}", dropped);
            }
        }
    }

    /// Report an error without waiting for room on the stream
    pub fn offer_error(&self, error: WatcherError) {
        match self.errors.try_send(error) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => warn!("Errors stream full, dropped: {}", dropped),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

pub(crate) async fn run_intake<S: NotificationSource>(
    shared: Arc<Shared<S>>,
    mut notifications: mpsc::UnboundedReceiver<SourceEvent>,
    outputs: Outputs,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = notifications.recv() => match event {
                Some(event) => event,
                None => {
                    debug!("Notification source ended");
                    break;
                }
            },
        };

        match event {
            SourceEvent::Notification(raw) => {
                let task_shared = Arc::clone(&shared);
                // Tagging reads file contents
                match tokio::task::spawn_blocking(move || task_shared.intake(raw)).await {
                    Ok(Some(result)) => outputs.publish(result).await,
                    Ok(None) => {}
                    Err(e) => error!("Intake task failed: {}", e),
                }
            }
            SourceEvent::Unhandled { kind, path } => {
                let path = path.map(|p| p.display().to_string()).unwrap_or_default();
                outputs
                    .error(WatcherError::UnhandledEventKind { kind, path })
                    .await;
            }
            SourceEvent::Error(message) => outputs.error(WatcherError::Source(message)).await,
        }
    }
    debug!("Intake task stopped");
}

pub(crate) async fn run_drain<S: NotificationSource>(
    shared: Arc<Shared<S>>,
    outputs: Outputs,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    timer.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {}
        }
        drain_and_publish(&shared, &outputs).await;
    }
    debug!("Drain task stopped");
}

/// One drain step; returns the number of events applied or rejected
pub(crate) async fn drain_and_publish<S: NotificationSource>(
    shared: &Arc<Shared<S>>,
    outputs: &Outputs,
) -> usize {
    let _gate = shared.drain_gate.lock().await;
    if shared.debouncer.pending_count() == 0 {
        return 0;
    }

    let task_shared = Arc::clone(shared);
    let results = match tokio::task::spawn_blocking(move || task_shared.drain()).await {
        Ok(results) => results,
        Err(e) => {
            error!("Drain task failed: {}", e);
            return 0;
        }
    };

    let count = results.len();
    for result in results {
        outputs.publish(result).await;
    }
    count
}
