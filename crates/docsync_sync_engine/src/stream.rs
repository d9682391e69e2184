//! Persistent listen and write streams.
//!
//! A [`PersistentStream`] is a state machine owned by the remote store and
//! driven from the async queue. The actual I/O runs in a spawned task that
//! reports back through [`Dispatch`] as [`Signal`]s. Every signal carries
//! the generation of the stream instance that produced it; closing a
//! stream bumps the generation so late signals from the old instance are
//! dropped.
//!
//! An open stream is watched: if the backend sends nothing for
//! [`StreamConfig::health_check_timeout`], the stream is torn down like
//! any other failed stream and reconnects after a backoff.

use crate::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::backoff::ExponentialBackoff;
use crate::config::{BackoffConfig, StreamConfig};
use crate::connection::{Connection, StreamEvent};
use crate::credentials::CredentialsProvider;
use crate::error::SyncError;
use docsync_sync_protocol::{Code, Status, StreamKind, StreamRequest, StreamResponse};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Callback that turns a signal into a job on the async queue.
pub(crate) type Dispatch = Arc<dyn Fn(Signal) + Send + Sync>;

/// Input from I/O tasks and timers to the engine.
#[derive(Debug)]
pub(crate) enum Signal {
    StreamOpened {
        kind: StreamKind,
        generation: u64,
        outgoing: mpsc::UnboundedSender<StreamRequest>,
    },
    StreamMessage {
        kind: StreamKind,
        generation: u64,
        response: StreamResponse,
    },
    StreamClosed {
        kind: StreamKind,
        generation: u64,
        status: Option<Status>,
    },
    IdleTimeout {
        kind: StreamKind,
        generation: u64,
    },
    HealthCheck {
        kind: StreamKind,
        generation: u64,
        watchdog: u64,
    },
    BackoffElapsed {
        kind: StreamKind,
        generation: u64,
    },
    OnlineStateTimeout,
}

/// What a stream needs to reach the outside world.
#[derive(Clone)]
pub(crate) struct RemoteContext {
    pub(crate) queue: AsyncQueue,
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) credentials: Arc<dyn CredentialsProvider>,
    pub(crate) dispatch: Dispatch,
}

impl std::fmt::Debug for RemoteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteContext").field("queue", &self.queue).finish_non_exhaustive()
    }
}

impl RemoteContext {
    /// Returns a future that dispatches `signal` when polled.
    pub(crate) fn deferred(&self, signal: Signal) -> impl std::future::Future<Output = ()> + Send + 'static {
        let dispatch = Arc::clone(&self.dispatch);
        async move { dispatch(signal) }
    }
}

/// Lifecycle of a [`PersistentStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    /// Not started, or stopped cleanly.
    Initial,
    /// Fetching a token and connecting.
    Starting,
    /// Connected.
    Open,
    /// Connected and the backend has answered at least once.
    Healthy,
    /// Failed; the next start backs off first.
    Error,
    /// Waiting to reconnect.
    Backoff,
}

/// One of the two long-lived streams.
#[derive(Debug)]
pub(crate) struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    generation: u64,
    config: StreamConfig,
    backoff: ExponentialBackoff,
    idle_timer: Option<DelayedOperation>,
    health_timer: Option<DelayedOperation>,
    watchdog: u64,
    outgoing: Option<mpsc::UnboundedSender<StreamRequest>>,
    task: Option<JoinHandle<()>>,
}

impl PersistentStream {
    pub(crate) fn new(kind: StreamKind, config: StreamConfig, backoff: BackoffConfig) -> Self {
        let backoff_timer = match kind {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        };
        Self {
            kind,
            state: StreamState::Initial,
            generation: 0,
            config,
            backoff: ExponentialBackoff::new(backoff, backoff_timer),
            idle_timer: None,
            health_timer: None,
            watchdog: 0,
            outgoing: None,
            task: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Connecting, connected or waiting to reconnect.
    pub(crate) fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Starting | StreamState::Backoff | StreamState::Open | StreamState::Healthy
        )
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::Healthy)
    }

    fn idle_timer_id(&self) -> TimerId {
        match self.kind {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn health_timer_id(&self) -> TimerId {
        match self.kind {
            StreamKind::Listen => TimerId::ListenStreamHealthCheck,
            StreamKind::Write => TimerId::WriteStreamHealthCheck,
        }
    }

    /// Starts connecting. A stream in the error state backs off first.
    pub(crate) fn start(&mut self, ctx: &RemoteContext) {
        match self.state {
            StreamState::Error => {
                self.perform_backoff(ctx);
                return;
            }
            StreamState::Initial => {}
            _ => return,
        }
        self.state = StreamState::Starting;
        let kind = self.kind;
        let generation = self.generation;
        let connection = Arc::clone(&ctx.connection);
        let credentials = Arc::clone(&ctx.credentials);
        let dispatch = Arc::clone(&ctx.dispatch);
        debug!(?kind, generation, "opening stream");

        self.task = Some(tokio::spawn(async move {
            let opened = match credentials.get_token(false).await {
                Ok(token) => connection.open_stream(kind, token).await,
                Err(e) => Err(e),
            };
            let mut channel = match opened {
                Ok(channel) => channel,
                Err(e) => {
                    dispatch(Signal::StreamClosed {
                        kind,
                        generation,
                        status: Some(status_of(&e)),
                    });
                    return;
                }
            };
            dispatch(Signal::StreamOpened {
                kind,
                generation,
                outgoing: channel.outgoing.clone(),
            });
            while let Some(event) = channel.incoming.recv().await {
                match event {
                    StreamEvent::Message(response) => dispatch(Signal::StreamMessage {
                        kind,
                        generation,
                        response,
                    }),
                    StreamEvent::Closed(status) => {
                        dispatch(Signal::StreamClosed {
                            kind,
                            generation,
                            status,
                        });
                        return;
                    }
                }
            }
            dispatch(Signal::StreamClosed {
                kind,
                generation,
                status: Some(Status::new(Code::Unavailable, "stream dropped by transport")),
            });
        }));
    }

    fn perform_backoff(&mut self, ctx: &RemoteContext) {
        self.state = StreamState::Backoff;
        let signal = Signal::BackoffElapsed {
            kind: self.kind,
            generation: self.generation,
        };
        self.backoff.backoff_and_run(&ctx.queue, ctx.deferred(signal));
    }

    /// Handles the end of a backoff period.
    pub(crate) fn on_backoff_elapsed(&mut self, ctx: &RemoteContext, generation: u64) {
        if generation != self.generation || self.state != StreamState::Backoff {
            return;
        }
        self.state = StreamState::Initial;
        self.start(ctx);
    }

    /// Handles the transport's confirmation that the stream is open.
    /// Returns false for a stale or unexpected confirmation.
    pub(crate) fn on_opened(
        &mut self,
        ctx: &RemoteContext,
        generation: u64,
        outgoing: mpsc::UnboundedSender<StreamRequest>,
    ) -> bool {
        if generation != self.generation || self.state != StreamState::Starting {
            return false;
        }
        self.state = StreamState::Open;
        self.outgoing = Some(outgoing);
        self.arm_watchdog(ctx);
        true
    }

    fn arm_watchdog(&mut self, ctx: &RemoteContext) {
        if let Some(timer) = self.health_timer.take() {
            timer.cancel();
        }
        self.watchdog += 1;
        let signal = Signal::HealthCheck {
            kind: self.kind,
            generation: self.generation,
            watchdog: self.watchdog,
        };
        self.health_timer = Some(ctx.queue.enqueue_after_delay(
            self.health_timer_id(),
            self.config.health_check_timeout,
            ctx.deferred(signal),
        ));
    }

    /// Returns true if a message of `generation` should be processed.
    /// Every accepted message restarts the watchdog.
    pub(crate) fn on_message(&mut self, ctx: &RemoteContext, generation: u64) -> bool {
        if generation != self.generation || !self.is_open() {
            return false;
        }
        self.state = StreamState::Healthy;
        self.arm_watchdog(ctx);
        true
    }

    /// Tears the stream down if the backend stayed silent for the whole
    /// watchdog period. Returns the status to report as the close reason.
    pub(crate) fn on_health_check(&mut self, ctx: &RemoteContext, generation: u64, watchdog: u64) -> Option<Status> {
        if generation != self.generation || watchdog != self.watchdog || !self.is_open() {
            return None;
        }
        self.health_timer = None;
        warn!(
            kind = ?self.kind,
            timeout = ?self.config.health_check_timeout,
            "no response from the backend, tearing the stream down"
        );
        let status = Status::new(Code::Unavailable, "stream watchdog expired");
        self.close(ctx, StreamState::Error, Some(&status));
        Some(status)
    }

    /// Handles a transport-reported close. Returns true, after moving to the
    /// error state, if the close belongs to the current instance.
    pub(crate) fn on_closed(&mut self, ctx: &RemoteContext, generation: u64, status: Option<&Status>) -> bool {
        if generation != self.generation || !self.is_started() {
            return false;
        }
        let error = status.cloned().unwrap_or_else(|| Status::new(Code::Unavailable, "stream closed"));
        self.close(ctx, StreamState::Error, Some(&error));
        true
    }

    /// Starts the idle timer if the stream is open and has nothing to do.
    pub(crate) fn mark_idle(&mut self, ctx: &RemoteContext) {
        if self.is_open() && self.idle_timer.is_none() {
            let signal = Signal::IdleTimeout {
                kind: self.kind,
                generation: self.generation,
            };
            self.idle_timer = Some(ctx.queue.enqueue_after_delay(
                self.idle_timer_id(),
                self.config.idle_timeout,
                ctx.deferred(signal),
            ));
        }
    }

    /// Closes an idle stream. Returns true if it was closed.
    pub(crate) fn on_idle_timeout(&mut self, ctx: &RemoteContext, generation: u64) -> bool {
        self.idle_timer = None;
        if generation != self.generation || !self.is_open() {
            return false;
        }
        debug!(kind = ?self.kind, "closing idle stream");
        self.close(ctx, StreamState::Initial, None);
        true
    }

    /// Sends a request, cancelling the idle timer.
    pub(crate) fn write(&mut self, request: StreamRequest) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
        match &self.outgoing {
            Some(outgoing) if outgoing.send(request).is_ok() => {}
            _ => warn!(kind = ?self.kind, "dropping request on a closed stream"),
        }
    }

    pub(crate) fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    /// Lets a failed stream reconnect without waiting. Used after a
    /// failure caused by the request rather than the connection.
    pub(crate) fn inhibit_backoff(&mut self) {
        if self.state == StreamState::Error {
            self.state = StreamState::Initial;
            self.backoff.reset();
        }
    }

    /// Closes the stream if it is started. The next start connects
    /// immediately.
    pub(crate) fn stop(&mut self, ctx: &RemoteContext) {
        if self.is_started() {
            self.close(ctx, StreamState::Initial, None);
        }
    }

    fn close(&mut self, ctx: &RemoteContext, final_state: StreamState, error: Option<&Status>) {
        for timer in [self.idle_timer.take(), self.health_timer.take()].into_iter().flatten() {
            timer.cancel();
        }
        self.backoff.cancel();
        self.generation += 1;

        if final_state != StreamState::Error {
            self.backoff.reset();
        } else if let Some(status) = error {
            match status.code {
                Code::ResourceExhausted => {
                    debug!(kind = ?self.kind, "backend is overloaded, backing off for the maximum delay");
                    self.backoff.reset_to_max();
                }
                Code::Unauthenticated => {
                    debug!(kind = ?self.kind, "token rejected, refreshing before reconnecting");
                    ctx.credentials.invalidate_token();
                }
                _ => {}
            }
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outgoing = None;
        self.state = final_state;
    }
}

fn status_of(error: &SyncError) -> Status {
    match error {
        SyncError::Backend(status) => status.clone(),
        other => Status::new(Code::Unavailable, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StreamChannel;
    use crate::credentials::{EmptyCredentialsProvider, StaticCredentialsProvider, Token};
    use crate::error::SyncResult;
    use docsync_core::{DocumentKey, MutableDocument, Mutation};
    use docsync_sync_protocol::WriteResponse;
    use futures::future::{BoxFuture, FutureExt};
    use parking_lot::Mutex;

    /// Connection whose streams never deliver anything.
    struct SilentConnection {
        peers: Mutex<Vec<mpsc::UnboundedSender<StreamEvent>>>,
    }

    impl Connection for SilentConnection {
        fn open_stream(&self, _kind: StreamKind, _token: Option<crate::credentials::Token>) -> BoxFuture<'static, SyncResult<StreamChannel>> {
            let (outgoing, _requests) = mpsc::unbounded_channel();
            let (events, incoming) = mpsc::unbounded_channel();
            self.peers.lock().push(events);
            futures::future::ready(Ok(StreamChannel { outgoing, incoming })).boxed()
        }

        fn commit(&self, _mutations: Vec<Mutation>, _token: Option<crate::credentials::Token>) -> BoxFuture<'static, SyncResult<WriteResponse>> {
            futures::future::ready(Err(SyncError::transport_fatal("unsupported"))).boxed()
        }

        fn batch_get_documents(
            &self,
            _keys: Vec<DocumentKey>,
            _token: Option<crate::credentials::Token>,
        ) -> BoxFuture<'static, SyncResult<Vec<MutableDocument>>> {
            futures::future::ready(Ok(Vec::new())).boxed()
        }
    }

    fn context(signals: Arc<Mutex<Vec<Signal>>>) -> RemoteContext {
        context_with_credentials(signals, Arc::new(EmptyCredentialsProvider))
    }

    fn context_with_credentials(
        signals: Arc<Mutex<Vec<Signal>>>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> RemoteContext {
        RemoteContext {
            queue: AsyncQueue::new(),
            connection: Arc::new(SilentConnection {
                peers: Mutex::new(Vec::new()),
            }),
            credentials,
            dispatch: Arc::new(move |signal| signals.lock().push(signal)),
        }
    }

    fn open(stream: &mut PersistentStream, ctx: &RemoteContext) -> u64 {
        stream.start(ctx);
        let generation = stream.generation();
        let (outgoing, _rx) = mpsc::unbounded_channel();
        assert!(stream.on_opened(ctx, generation, outgoing));
        generation
    }

    fn health_checks(signals: &Mutex<Vec<Signal>>) -> Vec<(u64, u64)> {
        signals
            .lock()
            .iter()
            .filter_map(|s| match s {
                Signal::HealthCheck {
                    generation, watchdog, ..
                } => Some((*generation, *watchdog)),
                _ => None,
            })
            .collect()
    }

    fn stream() -> PersistentStream {
        PersistentStream::new(StreamKind::Listen, StreamConfig::default(), BackoffConfig::no_jitter())
    }

    #[tokio::test]
    async fn stale_open_confirmation_is_ignored() {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(Arc::clone(&signals));
        let mut stream = stream();
        stream.start(&ctx);
        let old_generation = stream.generation();
        stream.stop(&ctx);
        assert_eq!(stream.state(), StreamState::Initial);

        let (outgoing, _rx) = mpsc::unbounded_channel();
        assert!(!stream.on_opened(&ctx, old_generation, outgoing));
        assert_eq!(stream.state(), StreamState::Initial);
    }

    #[tokio::test]
    async fn failure_backs_off_before_reconnecting() {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(Arc::clone(&signals));
        let mut stream = stream();
        stream.start(&ctx);
        let generation = stream.generation();
        let (outgoing, _rx) = mpsc::unbounded_channel();
        assert!(stream.on_opened(&ctx, generation, outgoing));
        assert!(stream.is_open());

        let status = Status::new(Code::Unavailable, "reset");
        assert!(stream.on_closed(&ctx, generation, Some(&status)));
        assert_eq!(stream.state(), StreamState::Error);
        assert!(!stream.on_closed(&ctx, generation, Some(&status)));

        stream.start(&ctx);
        assert_eq!(stream.state(), StreamState::Backoff);
        assert!(ctx.queue.contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
    }

    #[tokio::test]
    async fn idle_timeout_closes_open_stream() {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(Arc::clone(&signals));
        let mut stream = stream();
        stream.start(&ctx);
        let generation = stream.generation();
        let (outgoing, _rx) = mpsc::unbounded_channel();
        stream.on_opened(&ctx, generation, outgoing);
        stream.mark_idle(&ctx);
        assert!(ctx.queue.contains_delayed_operation(TimerId::ListenStreamIdle));

        ctx.queue.run_delays_until(TimerId::ListenStreamIdle).await;
        let fired = signals
            .lock()
            .iter()
            .any(|s| matches!(s, Signal::IdleTimeout { generation: g, .. } if *g == generation));
        assert!(fired);
        assert!(stream.on_idle_timeout(&ctx, generation));
        assert_eq!(stream.state(), StreamState::Initial);
        assert!(!ctx.queue.contains_delayed_operation(TimerId::ListenStreamHealthCheck));
    }

    #[tokio::test]
    async fn silent_stream_is_torn_down_by_the_watchdog() {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(Arc::clone(&signals));
        let mut stream = stream();
        let generation = open(&mut stream, &ctx);
        assert!(ctx.queue.contains_delayed_operation(TimerId::ListenStreamHealthCheck));

        ctx.queue.run_delays_until(TimerId::ListenStreamHealthCheck).await;
        let fired = health_checks(&signals);
        assert_eq!(fired.len(), 1);
        let (fired_generation, watchdog) = fired[0];
        assert_eq!(fired_generation, generation);

        let status = stream.on_health_check(&ctx, generation, watchdog).unwrap();
        assert_eq!(status.code, Code::Unavailable);
        assert!(!stream.is_open());
        assert_eq!(stream.state(), StreamState::Error);
        assert_ne!(stream.generation(), generation);

        stream.start(&ctx);
        assert_eq!(stream.state(), StreamState::Backoff);
        assert!(ctx.queue.contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
    }

    #[tokio::test]
    async fn messages_restart_the_watchdog() {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(Arc::clone(&signals));
        let mut stream = stream();
        let generation = open(&mut stream, &ctx);
        let first_watchdog = stream.watchdog;

        assert!(stream.on_message(&ctx, generation));
        assert_eq!(stream.state(), StreamState::Healthy);
        assert!(!stream.on_message(&ctx, generation + 1));

        // A check armed before the message no longer applies.
        assert_eq!(stream.on_health_check(&ctx, generation, first_watchdog), None);
        assert!(stream.is_open());
        assert!(ctx.queue.contains_delayed_operation(TimerId::ListenStreamHealthCheck));
    }

    #[tokio::test]
    async fn unauthenticated_close_refreshes_the_token_of_a_healthy_stream() {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let credentials = Arc::new(StaticCredentialsProvider::new(Token {
            value: "secret".into(),
            user_id: None,
        }));
        let ctx = context_with_credentials(Arc::clone(&signals), credentials.clone());
        let mut stream = stream();
        let generation = open(&mut stream, &ctx);
        assert!(stream.on_message(&ctx, generation));
        assert_eq!(stream.state(), StreamState::Healthy);

        let status = Status::new(Code::Unauthenticated, "token expired");
        assert!(stream.on_closed(&ctx, generation, Some(&status)));

        credentials.get_token(false).await.unwrap();
        assert_eq!(credentials.refresh_count(), 1);
    }
}
