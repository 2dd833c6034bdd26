//! Process-wide, best-effort log of client errors.
//!
//! Every rejected frame, failed send and recoverable read error is recorded
//! here in addition to being emitted through [`tracing`]. The log is
//! bounded; when full, the oldest entry is discarded. Nothing in the crate
//! reads the log, so draining it is entirely optional.

use crate::ClientError;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        LazyLock,
    },
    time::Duration,
};

/// Maximum number of entries retained by the error log.
pub const ERROR_LOG_CAPACITY: usize = 1024;

/// Interval at which the [`log_errors`] task drains the log.
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// A bounded FIFO of [`ClientError`]s.
#[derive(Debug)]
struct ErrorLog {
    entries: Mutex<VecDeque<ClientError>>,
    capacity: usize,
}

impl ErrorLog {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    fn push(&self, err: ClientError) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(err);
    }

    fn drain(&self) -> Vec<ClientError> {
        self.entries.lock().drain(..).collect()
    }
}

static ERR_LOG: LazyLock<ErrorLog> = LazyLock::new(|| ErrorLog::new(ERROR_LOG_CAPACITY));

static LOGGING: AtomicBool = AtomicBool::new(false);

/// Push an error onto the log.
pub(crate) fn record(err: impl Into<ClientError>) {
    let err = err.into();
    tracing::debug!(%err, "client error");
    ERR_LOG.push(err);
}

/// Take every error currently in the log, oldest first.
pub fn drain_errors() -> Vec<ClientError> {
    ERR_LOG.drain()
}

/// Spawn a task that continuously drains the error log, emitting each entry
/// as a `warn` level [`tracing`] event.
///
/// By default client errors are only emitted at `debug` level. Calling this
/// more than once has no further effect. Returns `true` if this call started
/// the task.
///
/// ## Panics
///
/// This will panic if called outside the context of a Tokio runtime.
pub fn log_errors() -> bool {
    if LOGGING.swap(true, Ordering::AcqRel) {
        return false;
    }

    tokio::spawn(async {
        let mut interval = tokio::time::interval(DRAIN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for err in drain_errors() {
                tracing::warn!(%err, "client error");
            }
        }
    });
    true
}
