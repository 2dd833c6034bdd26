use crate::TaskSet;
use tokio_util::{sync::WaitForCancellationFuture, task::task_tracker::TaskTrackerWaitFuture};

/// The shutdown signal for a listener. When dropped, will cancel all tasks
/// associated with the listener. This includes the accept loop, as well as
/// the read and write tasks of every connection it accepted.
///
/// Sessions of those connections are left in the [`Server`]'s registry as
/// closed sessions, and are reaped after the reconnect timeout.
///
/// The shutdown wraps a [`TaskTracker`] and a [`CancellationToken`], and
/// exposes methods from those APIs. Please see the documentation for those
/// types for more information.
///
/// [`Server`]: crate::Server
/// [`TaskTracker`]: tokio_util::task::TaskTracker
/// [`CancellationToken`]: tokio_util::sync::CancellationToken
#[derive(Debug)]
pub struct ServerShutdown {
    pub(crate) task_set: TaskSet,
}

impl From<TaskSet> for ServerShutdown {
    fn from(task_set: TaskSet) -> Self {
        Self::new(task_set)
    }
}

impl ServerShutdown {
    /// Create a new [`ServerShutdown`] with the given [`TaskSet`].
    pub(crate) const fn new(task_set: TaskSet) -> Self {
        Self { task_set }
    }

    /// Wait for the accept loop to complete. This is a wrapper for
    /// [`TaskTracker::wait`].
    ///
    /// This future will not resolve until both of the following are true:
    /// - [`Self::close`] has been called.
    /// - The accept loop has stopped.
    ///
    /// [`TaskTracker::wait`]: tokio_util::task::TaskTracker::wait
    pub fn wait(&self) -> TaskTrackerWaitFuture<'_> {
        self.task_set.wait()
    }

    /// Close the internal [`TaskTracker`], allowing [`Self::wait`] futures to
    /// resolve once the accept loop is done. This does not cancel anything.
    ///
    /// [`TaskTracker`]: tokio_util::task::TaskTracker
    pub fn close(&self) {
        self.task_set.close();
    }

    /// Check if the internal [`TaskTracker`] has been closed.
    ///
    /// [`TaskTracker`]: tokio_util::task::TaskTracker
    pub fn is_closed(&self) -> bool {
        self.task_set.is_closed()
    }

    /// Issue a cancellation signal to the accept loop and every connection
    /// task spawned from it.
    pub fn cancel(&self) {
        self.task_set.cancel();
    }

    /// Check if the listener has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.task_set.is_cancelled()
    }

    /// Get a future that resolves when the listener has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.task_set.cancelled()
    }

    /// Shutdown the listener, and wait for the accept loop to stop.
    ///
    /// This is equivalent to calling [`Self::cancel`], [`Self::close`] and
    /// then awaiting [`Self::wait`].
    pub async fn shutdown(self) {
        self.task_set.cancel();
        self.close();
        self.wait().await;
    }
}

impl Drop for ServerShutdown {
    fn drop(&mut self) {
        self.task_set.cancel();
    }
}
