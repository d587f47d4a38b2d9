//! Central work processor for the duty pipeline.
//!
//! The processor does not define the available work items itself; stages
//! submit [`WorkItem`]s through the [`Senders`] handed out at spawn time. Work
//! is drained from priority-ranked queues and launched according to its kind.
//! Queues other than `permitless` require a permit, handed out up to
//! [`Config::max_workers`], which bounds the number of concurrent tasks and
//! prioritizes duty-critical work when the node is saturated.

mod metrics;

use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

const QUEUE_CAPACITY: usize = 1000;

/// Configuration for a processor. Provided to [`spawn`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The maximum amount of concurrent permit-holding workers. Items sent via
    /// the `permitless` queue do not count towards this limit. Defaults to the
    /// number of logical CPUs.
    pub max_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Sender {
    tx: mpsc::Sender<WorkItem>,
}

impl Sender {
    /// Convenience method creating an async [`WorkItem`] and sending it.
    pub fn send_async<F: Future<Output = ()> + Send + 'static>(
        &self,
        future: F,
        name: &'static str,
    ) -> Result<(), TrySendError<WorkItem>> {
        self.send_work_item(WorkItem {
            func: WorkKind::Async(Box::pin(future)),
            expiry: None,
            name,
        })
    }

    /// Convenience method creating a blocking [`WorkItem`] and sending it.
    pub fn send_blocking<F: FnOnce() + Send + 'static>(
        &self,
        func: F,
        name: &'static str,
    ) -> Result<(), TrySendError<WorkItem>> {
        self.send_work_item(WorkItem {
            func: WorkKind::Blocking(Box::new(func)),
            expiry: None,
            name,
        })
    }

    /// Convenience method creating an immediate [`WorkItem`] and sending it.
    pub fn send_immediate<F: FnOnce(DropOnFinish) + Send + 'static>(
        &self,
        func: F,
        name: &'static str,
    ) -> Result<(), TrySendError<WorkItem>> {
        self.send_work_item(WorkItem {
            func: WorkKind::Immediate(Box::new(func)),
            expiry: None,
            name,
        })
    }

    /// Sends a [`WorkItem`] into the queue, non-blocking, returning an error
    /// if the queue is full. Handles metrics and logging.
    pub fn send_work_item(&self, item: WorkItem) -> Result<(), TrySendError<WorkItem>> {
        let name = item.name;
        let result = self.tx.try_send(item);
        if let Err(err) = &result {
            metrics::SEND_ERRORS.with_label_values(&[name]).inc();
            match err {
                TrySendError::Full(_) => warn!(task = name, "Processor queue full"),
                TrySendError::Closed(_) => error!("Processor queue closed unexpectedly"),
            }
        } else {
            metrics::WORK_EVENTS_SUBMITTED.with_label_values(&[name]).inc();
            metrics::QUEUE_LENGTH.with_label_values(&[name]).inc();
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bag of available senders for the duty pipeline.
#[derive(Clone, Debug)]
pub struct Senders {
    /// Catch-all queue for tasks that are either very quick or behave well as
    /// plain Tokio tasks. Launched immediately, no permit required.
    pub permitless: Sender,
    /// Per-duty critical path: consensus rendezvous, partial-signature
    /// handling, aggregation.
    pub urgent_duty: Sender,
    /// Beacon-node round trips: duty resolution, data fetching, broadcasts.
    pub beacon_io: Sender,
}

struct Receivers {
    permitless_rx: mpsc::Receiver<WorkItem>,
    urgent_duty_rx: mpsc::Receiver<WorkItem>,
    beacon_io_rx: mpsc::Receiver<WorkItem>,
}

pub type AsyncFn = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type BlockingFn = Box<dyn FnOnce() + Send>;
pub type ImmediateFn = Box<dyn FnOnce(DropOnFinish) + Send>;

enum WorkKind {
    Async(AsyncFn),
    Blocking(BlockingFn),
    Immediate(ImmediateFn),
}

impl Debug for WorkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkKind::Async(_) => f.write_str("Async"),
            WorkKind::Blocking(_) => f.write_str("Blocking"),
            WorkKind::Immediate(_) => f.write_str("Immediate"),
        }
    }
}

#[derive(Debug)]
pub struct WorkItem {
    func: WorkKind,
    expiry: Option<Instant>,
    name: &'static str,
}

impl WorkItem {
    /// Create an async work task. Will be spawned on the Tokio runtime.
    pub fn new_async<F: Future<Output = ()> + Send + 'static>(name: &'static str, func: F) -> Self {
        Self {
            name,
            expiry: None,
            func: WorkKind::Async(Box::pin(func)),
        }
    }

    /// Create a blocking work task. Will run via `spawn_blocking`.
    pub fn new_blocking<F: FnOnce() + Send + 'static>(name: &'static str, func: F) -> Self {
        Self {
            name,
            expiry: None,
            func: WorkKind::Blocking(Box::new(func)),
        }
    }

    /// Create an immediate work task. Runs inline on the processor loop and
    /// must *never* block. The [`DropOnFinish`] should be dropped when the
    /// triggered work is done, including work handed onwards to another
    /// process, for proper permit accounting.
    pub fn new_immediate<F: FnOnce(DropOnFinish) + Send + 'static>(
        name: &'static str,
        func: F,
    ) -> Self {
        Self {
            name,
            expiry: None,
            func: WorkKind::Immediate(Box::new(func)),
        }
    }

    /// If the processor retrieves the work item after `expiry`, it is dropped
    /// instead of run.
    pub fn with_expiry(mut self, expiry: Instant) -> Self {
        self.expiry = Some(expiry);
        self
    }
}

/// Refunds the permit and updates metrics on drop.
#[derive(Debug)]
pub struct DropOnFinish {
    permit: Option<OwnedSemaphorePermit>,
    _work_timer: Option<prometheus::HistogramTimer>,
}

impl Drop for DropOnFinish {
    fn drop(&mut self) {
        metrics::WORKERS_ACTIVE.dec();
        let _ = self.permit.take();
    }
}

/// Create a new processor and spawn it. Returns the queue senders. The
/// processor drains until `shutdown` is cancelled or every sender is dropped.
pub fn spawn(config: Config, shutdown: CancellationToken) -> Senders {
    let (permitless_tx, permitless_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (urgent_duty_tx, urgent_duty_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (beacon_io_tx, beacon_io_rx) = mpsc::channel(QUEUE_CAPACITY);

    let senders = Senders {
        permitless: Sender { tx: permitless_tx },
        urgent_duty: Sender { tx: urgent_duty_tx },
        beacon_io: Sender { tx: beacon_io_tx },
    };
    let receivers = Receivers {
        permitless_rx,
        urgent_duty_rx,
        beacon_io_rx,
    };

    tokio::spawn(processor(config, receivers, shutdown));
    senders
}

async fn processor(config: Config, mut receivers: Receivers, shutdown: CancellationToken) {
    let semaphore = Arc::new(Semaphore::new(config.max_workers));

    loop {
        // Try to get the next work event. work_item is None only when the
        // queues are closed or shutdown fired. Permit is None for items
        // received from the permitless queue.
        let (permit, work_item) = select! {
            biased;
            _ = shutdown.cancelled() => (None, None),
            Some(w) = receivers.permitless_rx.recv() => (None, Some(w)),
            Ok(permit) = semaphore.clone().acquire_owned() => {
                select! {
                    biased;
                    Some(w) = receivers.urgent_duty_rx.recv() => (Some(permit), Some(w)),
                    Some(w) = receivers.beacon_io_rx.recv() => (Some(permit), Some(w)),

                    // We hold a permit, so prefer the permit queues, but a
                    // permitless event must still get through.
                    Some(w) = receivers.permitless_rx.recv() => (None, Some(w)),
                    else => (None, None),
                }
            }
            else => (None, None),
        };
        let Some(work_item) = work_item else {
            if !shutdown.is_cancelled() {
                error!("Processor queues closed unexpectedly");
            }
            break;
        };
        metrics::QUEUE_LENGTH.with_label_values(&[work_item.name]).dec();
        if let Some(expiry) = work_item.expiry {
            if expiry < Instant::now() {
                warn!(task = work_item.name, "Processor skipped expired work");
                metrics::WORK_EVENTS_EXPIRED
                    .with_label_values(&[work_item.name])
                    .inc();
                continue;
            }
        }

        metrics::WORKERS_ACTIVE.inc();
        metrics::WORK_EVENTS_STARTED
            .with_label_values(&[work_item.name])
            .inc();
        let drop_on_finish = DropOnFinish {
            permit,
            _work_timer: Some(
                metrics::WORKER_TIME
                    .with_label_values(&[work_item.name])
                    .start_timer(),
            ),
        };

        match work_item.func {
            WorkKind::Async(async_fn) => {
                tokio::spawn(async move {
                    async_fn.await;
                    drop(drop_on_finish);
                });
            }
            WorkKind::Blocking(blocking_fn) => {
                tokio::task::spawn_blocking(move || {
                    blocking_fn();
                    drop(drop_on_finish);
                });
            }
            WorkKind::Immediate(immediate_fn) => immediate_fn(drop_on_finish),
        }
    }
}
