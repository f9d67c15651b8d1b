//! Bounded transfer pool
//!
//! Transfers may be added before or after [`TransferScheduler::start`].
//! [`TransferScheduler::wait`] closes submission explicitly and then waits
//! for every transfer ever added, so a late `add` racing with `start` can
//! never be missed. Failures are collected rather than short-circuited.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{Transfer, TransferOutcome};
use crate::app::client::PortalClient;
use crate::constants::transfers;
use crate::errors::{TransferError, TransferResult};

/// Summary of a transfer that failed for real (aborts are not failures)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub url: String,
    pub attempts: u32,
    pub message: String,
}

/// Completion handle for one queued transfer
#[derive(Debug)]
pub struct TransferHandle {
    url: String,
    rx: oneshot::Receiver<TransferResult<TransferOutcome>>,
}

impl TransferHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Waits for the transfer's result
    pub async fn wait(self) -> TransferResult<TransferOutcome> {
        self.rx.await.unwrap_or(Err(TransferError::WorkerLost))
    }
}

struct Job {
    transfer: Transfer,
    done: oneshot::Sender<TransferResult<TransferOutcome>>,
}

/// Lifecycle of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Accepting work, not yet running it
    Created,
    /// Accepting and running work
    Running,
    /// Submission closed
    Closed,
}

struct Shared {
    client: PortalClient,
    max_retries: u32,
    failures: Mutex<Vec<TransferFailure>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Pool of at most `pool_size` concurrently running transfers
pub struct TransferScheduler {
    shared: Arc<Shared>,
    pool_size: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    state: Mutex<SchedulerState>,
}

impl std::fmt::Debug for TransferScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferScheduler")
            .field("pool_size", &self.pool_size)
            .field("max_retries", &self.shared.max_retries)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TransferScheduler {
    /// Creates a scheduler; a `pool_size` of zero is treated as one
    pub fn new(client: PortalClient, pool_size: usize, max_retries: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                client,
                max_retries,
                failures: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }),
            pool_size: pool_size.max(1),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            dispatcher: tokio::sync::Mutex::new(None),
            state: Mutex::new(SchedulerState::Created),
        }
    }

    /// Scheduler with the default pool size and retry count
    pub fn with_defaults(client: PortalClient) -> Self {
        Self::new(client, transfers::DEFAULT_POOL_SIZE, transfers::MAX_RETRIES)
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.state)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Transfers running right now
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Highest number of transfers that ever ran at once
    pub fn peak_concurrency(&self) -> usize {
        self.shared.peak.load(Ordering::Acquire)
    }

    /// Transfers that have finished, whatever the outcome
    pub fn completed(&self) -> usize {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Queues a transfer
    ///
    /// # Errors
    ///
    /// Returns `TransferError::SchedulerClosed` once `wait` has been called
    pub fn add(&self, transfer: Transfer) -> TransferResult<TransferHandle> {
        let (done, rx) = oneshot::channel();
        let url = transfer.url().to_string();

        let sender = lock(&self.sender);
        let tx = sender.as_ref().ok_or(TransferError::SchedulerClosed)?;
        tx.send(Job { transfer, done })
            .map_err(|_| TransferError::SchedulerClosed)?;

        debug!("Queued {}", url);
        Ok(TransferHandle { url, rx })
    }

    /// Starts dispatching queued and future transfers; idempotent
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return;
        }
        let Some(rx) = lock(&self.receiver).take() else {
            return;
        };

        {
            let mut state = lock(&self.state);
            if *state == SchedulerState::Created {
                *state = SchedulerState::Running;
            }
        }

        info!("Starting transfer pool with {} workers", self.pool_size);
        let shared = Arc::clone(&self.shared);
        let pool_size = self.pool_size;
        *dispatcher = Some(tokio::spawn(dispatch(shared, rx, pool_size)));
    }

    /// Closes submission and waits for every added transfer to finish
    ///
    /// Returns the collected failures. Starts the pool if needed.
    pub async fn wait(&self) -> Vec<TransferFailure> {
        self.start().await;

        // Dropping the only sender lets the dispatcher drain and stop
        lock(&self.sender).take();
        *lock(&self.state) = SchedulerState::Closed;

        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Transfer dispatcher ended abnormally: {}", e);
            }
        }

        let failures = lock(&self.shared.failures).clone();
        info!(
            "Transfer pool finished: {} completed, {} failed",
            self.completed(),
            failures.len()
        );
        failures
    }
}

async fn dispatch(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Job>, pool_size: usize) {
    let permits = Arc::new(Semaphore::new(pool_size));
    let mut workers = JoinSet::new();

    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let shared = Arc::clone(&shared);
        workers.spawn(async move {
            run_job(&shared, job).await;
            drop(permit);
        });
    }

    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            warn!("Transfer worker panicked: {}", e);
        }
    }
}

async fn run_job(shared: &Shared, job: Job) {
    let running = shared.active.fetch_add(1, Ordering::AcqRel) + 1;
    shared.peak.fetch_max(running, Ordering::AcqRel);

    let url = job.transfer.url().to_string();
    let result = job
        .transfer
        .run(&shared.client, shared.max_retries)
        .await;

    shared.active.fetch_sub(1, Ordering::AcqRel);
    shared.completed.fetch_add(1, Ordering::AcqRel);

    match &result {
        Ok(_) => {}
        Err(e) if e.is_abort() => debug!("Transfer skipped: {}", e),
        Err(e) => {
            warn!("Transfer of {} failed: {}", url, e);
            let attempts = match e {
                TransferError::RetriesExhausted { attempts, .. } => *attempts,
                _ => 1,
            };
            lock(&shared.failures).push(TransferFailure {
                url,
                attempts,
                message: e.to_string(),
            });
        }
    }

    // The caller may have dropped its handle
    let _ = job.done.send(result);
}
