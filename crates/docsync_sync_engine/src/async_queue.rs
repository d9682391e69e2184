//! Serialized execution of engine work.
//!
//! Every state transition of the engine runs as a job on one [`AsyncQueue`].
//! Jobs run one at a time in the order they were enqueued, so no two of
//! them ever observe each other half-way. Timers deliver their work as jobs
//! too.

use crate::backoff::ExponentialBackoff;
use crate::config::BackoffConfig;
use crate::error::{SyncError, SyncResult};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

type Job = BoxFuture<'static, ()>;

/// Identifies the purpose of a delayed operation, so tests can fast-forward
/// to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_delays_until`].
    All,
    /// Closing an idle listen stream.
    ListenStreamIdle,
    /// Reconnecting the listen stream.
    ListenStreamConnectionBackoff,
    /// Declaring the listen stream healthy.
    ListenStreamHealthCheck,
    /// Closing an idle write stream.
    WriteStreamIdle,
    /// Reconnecting the write stream.
    WriteStreamConnectionBackoff,
    /// Declaring the write stream healthy.
    WriteStreamHealthCheck,
    /// Deciding the client is offline.
    OnlineStateTimeout,
    /// Retrying a transaction.
    TransactionRetry,
    /// Retrying a failed retryable operation.
    AsyncQueueRetry,
}

struct Delayed {
    timer_id: TimerId,
    deadline: Instant,
    job: Job,
}

struct State {
    restricted: bool,
    shut_down: bool,
    next_delay_id: u64,
    delayed: BTreeMap<u64, Delayed>,
    retry_backoff: ExponentialBackoff,
}

struct Inner {
    sender: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    state: Mutex<State>,
}

/// A FIFO queue of jobs executed by a single worker task.
///
/// Cloning the queue yields another handle to the same worker.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AsyncQueue")
            .field("pending", &self.inner.pending.load(Ordering::SeqCst))
            .field("delayed", &state.delayed.len())
            .field("restricted", &state.restricted)
            .finish()
    }
}

impl AsyncQueue {
    /// Creates a queue and spawns its worker on the current tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
        });
        Self {
            inner: Arc::new(Inner {
                sender,
                pending,
                state: Mutex::new(State {
                    restricted: false,
                    shut_down: false,
                    next_delay_id: 0,
                    delayed: BTreeMap::new(),
                    retry_backoff: ExponentialBackoff::new(
                        BackoffConfig::default(),
                        TimerId::AsyncQueueRetry,
                    ),
                }),
            }),
        }
    }

    fn push(&self, even_while_restricted: bool, job: Job) -> bool {
        {
            let state = self.inner.state.lock();
            if state.shut_down || (state.restricted && !even_while_restricted) {
                return false;
            }
        }
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.inner.sender.send(job).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn push_with_result<F, T>(
        &self,
        even_while_restricted: bool,
        op: F,
    ) -> impl Future<Output = SyncResult<T>> + Send + 'static
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let accepted = self.push(
            even_while_restricted,
            async move {
                let _ = tx.send(op.await);
            }
            .boxed(),
        );
        async move {
            if !accepted {
                return Err(SyncError::Terminated);
            }
            rx.await.map_err(|_| SyncError::Terminated)
        }
    }

    /// Enqueues `op` and returns a future of its output.
    ///
    /// The future fails with [`SyncError::Terminated`] if the queue no
    /// longer accepts work.
    pub fn enqueue<F, T>(&self, op: F) -> impl Future<Output = SyncResult<T>> + Send + 'static
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.push_with_result(false, op)
    }

    /// Enqueues `op` even if the queue is restricted to shutdown work.
    pub fn enqueue_even_while_restricted<F, T>(
        &self,
        op: F,
    ) -> impl Future<Output = SyncResult<T>> + Send + 'static
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.push_with_result(true, op)
    }

    /// Enqueues `op` without waiting for it.
    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.push(false, op.boxed()) {
            debug!("dropping operation enqueued after shutdown");
        }
    }

    /// Runs `op` on the queue after `delay`, unless cancelled first.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, op: F) -> DelayedOperation
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_delay_id;
            state.next_delay_id += 1;
            if !state.shut_down {
                state.delayed.insert(
                    id,
                    Delayed {
                        timer_id,
                        deadline: Instant::now() + delay,
                        job: op.boxed(),
                    },
                );
            }
            id
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.fire(id);
        });
        DelayedOperation {
            id,
            timer_id,
            queue: self.clone(),
        }
    }

    fn fire(&self, id: u64) {
        let job = self.inner.state.lock().delayed.remove(&id).map(|d| d.job);
        if let Some(job) = job {
            self.push(false, job);
        }
    }

    /// Runs `op` until it succeeds, backing off after retryable failures.
    ///
    /// Retries stop at shutdown. A non-retryable failure is logged and the
    /// operation dropped.
    pub fn enqueue_retryable<F>(&self, op: F)
    where
        F: FnMut() -> BoxFuture<'static, SyncResult<()>> + Send + 'static,
    {
        self.enqueue_and_forget(Self::run_retryable(self.clone(), Box::new(op)));
    }

    fn run_retryable(
        queue: AsyncQueue,
        mut op: Box<dyn FnMut() -> BoxFuture<'static, SyncResult<()>> + Send>,
    ) -> BoxFuture<'static, ()> {
        async move {
            match op().await {
                Ok(()) => queue.inner.state.lock().retry_backoff.reset(),
                Err(e) if e.is_retryable() => {
                    let delay = queue.inner.state.lock().retry_backoff.next_delay();
                    warn!(error = %e, ?delay, "retryable operation failed, backing off");
                    let retry = Self::run_retryable(queue.clone(), op);
                    queue.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, retry);
                }
                Err(e) => warn!(error = %e, "retryable operation failed permanently"),
            }
        }
        .boxed()
    }

    /// Stops accepting work except through
    /// [`AsyncQueue::enqueue_even_while_restricted`].
    pub fn enter_restricted_mode(&self) {
        self.inner.state.lock().restricted = true;
    }

    /// Stops accepting work entirely and cancels every timer.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.restricted = true;
        state.shut_down = true;
        state.delayed.clear();
    }

    /// Returns true once the queue is restricted or shut down.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().restricted
    }

    /// Returns true if a timer with `timer_id` is scheduled.
    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .state
            .lock()
            .delayed
            .values()
            .any(|d| timer_id == TimerId::All || d.timer_id == timer_id)
    }

    /// Runs every scheduled timer up to and including the first one with
    /// `last`, in deadline order, then waits for the queue to drain.
    pub async fn run_delays_until(&self, last: TimerId) {
        let jobs = {
            let mut state = self.inner.state.lock();
            let mut order: Vec<(Instant, u64, TimerId)> = state
                .delayed
                .iter()
                .map(|(id, d)| (d.deadline, *id, d.timer_id))
                .collect();
            order.sort();
            let cutoff = if last == TimerId::All {
                Some(order.len())
            } else {
                order.iter().position(|(_, _, t)| *t == last).map(|i| i + 1)
            };
            let ids: Vec<u64> = order
                .into_iter()
                .take(cutoff.unwrap_or(0))
                .map(|(_, id, _)| id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.delayed.remove(&id).map(|d| d.job))
                .collect::<Vec<_>>()
        };
        for job in jobs {
            self.push(true, job);
        }
        self.drain().await;
    }

    /// Waits until every enqueued job, including jobs enqueued by those
    /// jobs, has run.
    pub async fn drain(&self) {
        loop {
            if self.enqueue_even_while_restricted(async {}).await.is_err() {
                return;
            }
            tokio::task::yield_now().await;
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
        }
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a scheduled operation.
#[derive(Clone)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    queue: AsyncQueue,
}

impl std::fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("id", &self.id)
            .field("timer_id", &self.timer_id)
            .finish_non_exhaustive()
    }
}

impl DelayedOperation {
    /// Returns the timer's purpose.
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running. Has no effect once it ran.
    pub fn cancel(&self) {
        self.queue.inner.state.lock().delayed.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn jobs_run_in_fifo_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue_and_forget(async move {
                tokio::task::yield_now().await;
                log.lock().push(i);
            });
        }
        let result = queue.enqueue(async { 42 }).await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn fast_forwarding_runs_timers_in_deadline_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (timer, secs) in [
            (TimerId::WriteStreamIdle, 30),
            (TimerId::ListenStreamIdle, 10),
            (TimerId::OnlineStateTimeout, 20),
        ] {
            let log = Arc::clone(&log);
            queue.enqueue_after_delay(timer, Duration::from_secs(secs), async move {
                log.lock().push(timer);
            });
        }
        queue.run_delays_until(TimerId::OnlineStateTimeout).await;
        assert_eq!(*log.lock(), vec![TimerId::ListenStreamIdle, TimerId::OnlineStateTimeout]);
        assert!(queue.contains_delayed_operation(TimerId::WriteStreamIdle));
    }

    #[tokio::test]
    async fn cancelled_timers_never_run() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let op = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(5), async move {
            flag.store(true, Ordering::SeqCst);
        });
        op.cancel();
        queue.run_delays_until(TimerId::All).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!queue.contains_delayed_operation(TimerId::All));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let queue = AsyncQueue::new();
        queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(1), async {});
        queue.shutdown();
        assert!(queue.is_shutting_down());
        assert!(!queue.contains_delayed_operation(TimerId::All));
        assert!(matches!(queue.enqueue(async {}).await, Err(SyncError::Terminated)));
    }

    #[tokio::test]
    async fn restricted_mode_allows_shutdown_work() {
        let queue = AsyncQueue::new();
        queue.enter_restricted_mode();
        assert!(queue.enqueue(async {}).await.is_err());
        assert_eq!(queue.enqueue_even_while_restricted(async { 1 }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retryable_operations_retry_after_transient_failures() {
        let queue = AsyncQueue::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        queue.enqueue_retryable(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SyncError::transport_retryable("storage busy"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        });
        queue.drain().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(queue.contains_delayed_operation(TimerId::AsyncQueueRetry));

        queue.run_delays_until(TimerId::AsyncQueueRetry).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
