//! Debounced ingress in front of the worker pool.
//!
//! Events enter through a bounded channel ([`SchedulerHandle::schedule`]) and
//! are persisted on the scheduler loop via [`Pool::queue`]. Each successfully
//! queued event (re)arms a debounce timer; when the timer expires without a
//! further event the loop calls [`Pool::dispatch`].
//!
//! ```text
//!            event                    timer expires
//!   Idle ──────────────► Armed(t) ───────────────────► Fired ──► dispatch ──► Idle
//!                         │    ▲
//!                         └────┘ event: t = now + debounce
//! ```

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::pool::{Pool, PoolError, QueueError};

/// Capacity of the ingress buffer.
pub const INGRESS_CAPACITY: usize = 100;

/// Errors returned to callers of [`SchedulerHandle::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("caller cancelled")]
    Cancelled,

    #[error("scheduler closed")]
    Closed,
}

/// Why the scheduler loop stopped early.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("queue: {0}")]
    Queue(QueueError),

    #[error("dispatch: {0}")]
    Dispatch(PoolError),
}

/// Error from [`Scheduler::run`]: the loop error and the pool's wait error,
/// whichever occurred.
#[derive(Debug, Error)]
#[error("scheduler stopped with errors (run: {}, wait: {})", display_opt(.run), display_opt(.wait))]
pub struct SchedulerError {
    pub run: Option<RunError>,
    pub wait: Option<PoolError>,
}

fn display_opt<E: std::fmt::Display>(e: &Option<E>) -> String {
    match e {
        Some(e) => e.to_string(),
        None => "none".to_string(),
    }
}

struct Event {
    channel: String,
    payload: Vec<u8>,
}

/// Sends events to a running [`Scheduler`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Event>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("channel", &self.channel)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl SchedulerHandle {
    /// Buffers an event for the scheduler loop.
    ///
    /// Waits for buffer space when the ingress is full. Returns once the
    /// event is buffered, not once it is persisted.
    pub async fn schedule(
        &self,
        token: &CancellationToken,
        channel: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), ScheduleError> {
        if token.is_cancelled() {
            return Err(ScheduleError::Cancelled);
        }

        let event = Event {
            channel: channel.into(),
            payload: payload.into(),
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ScheduleError::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| ScheduleError::Closed),
        }
    }
}

/// Debounce timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebounceState {
    Idle,
    Armed(Instant),
    Fired,
}

impl DebounceState {
    fn deadline(self) -> Option<Instant> {
        match self {
            DebounceState::Armed(deadline) => Some(deadline),
            DebounceState::Idle | DebounceState::Fired => None,
        }
    }
}

/// Owns the ingress receiver and the pool.
pub struct Scheduler {
    pool: Pool,
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
}

impl Scheduler {
    /// The scheduler stops when the pool's token is cancelled.
    pub fn new(pool: Pool) -> Self {
        let (tx, rx) = mpsc::channel(INGRESS_CAPACITY);
        Scheduler { pool, tx, rx }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Runs the loop until the pool's token is cancelled or a fatal error
    /// occurs, then cancels the pool and waits for its workers.
    #[instrument(skip_all, fields(debounce_ms = debounce.as_millis() as u64))]
    pub async fn run(self, debounce: Duration) -> Result<(), SchedulerError> {
        let Scheduler { pool, tx, mut rx } = self;
        // Only handles keep the ingress open.
        drop(tx);

        let token = pool.token().clone();
        let mut state = DebounceState::Idle;
        let mut ingress_closed = false;

        info!("scheduler started");

        let run = loop {
            let deadline = state.deadline();

            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!("scheduler cancelled");
                    break None;
                }

                event = rx.recv(), if !ingress_closed => {
                    let Some(event) = event else {
                        debug!("ingress closed");
                        ingress_closed = true;
                        continue;
                    };

                    match pool.queue(&event.channel, &event.payload).await {
                        Ok(_) => {
                            state = DebounceState::Armed(Instant::now() + debounce);
                        }
                        Err(e) if e.is_per_event() => {
                            debug!(channel = %event.channel, error = %e, "event dropped");
                        }
                        Err(e) => break Some(RunError::Queue(e)),
                    }
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    state = DebounceState::Fired;
                    debug!(?state, "debounce expired");

                    match pool.dispatch().await {
                        Ok(()) => {}
                        Err(PoolError::Cancelled) => break None,
                        Err(e) => break Some(RunError::Dispatch(e)),
                    }
                    state = DebounceState::Idle;
                }
            }
        };

        if let Some(e) = &run {
            error!(error = %e, "scheduler loop failed");
        }

        rx.close();
        if !rx.is_empty() {
            warn!(dropped = rx.len(), "discarding buffered events on shutdown");
        }
        pool.cancel();
        let wait = pool.wait().await.err();

        info!("scheduler stopped");
        match (run, wait) {
            (None, None) => Ok(()),
            (run, wait) => Err(SchedulerError { run, wait }),
        }
    }
}
