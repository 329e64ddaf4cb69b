//! The shutdown coordinator.
//!
//! [`Server::listen`] starts the delegate on its own task and then waits for
//! the first of three events:
//!
//! 1. the delegate stops serving on its own (usually a failure),
//! 2. a stop notification arrives from the signal source,
//! 3. the caller's [`Context`] is done.
//!
//! Only a stop notification or a done context leads to a shutdown, and the
//! delegate's `shutdown` is called at most once per `listen`. The shutdown is
//! bounded by the configured timeout and by any deadline the caller's context
//! carries, whichever comes first.

use crate::server::context::deadline_after;
use crate::server::{Context, Delegate, DelegateError, ListenError};
use crate::util::{os_signals, Signal, SignalReceiver};
use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Default shutdown bound; matches the Kubernetes termination grace period.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

type ServeResult = Result<Result<(), DelegateError>, JoinError>;

/// Why a shutdown was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Signal(Signal),
    ContextCancelled,
    ContextDeadline,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Signal(signal) => write!(f, "signal {}", signal),
            StopReason::ContextCancelled => f.write_str("context cancelled"),
            StopReason::ContextDeadline => f.write_str("context deadline reached"),
        }
    }
}

/// Wraps a [`Delegate`] and shuts it down gracefully on a stop signal.
pub struct Server<D> {
    /// The wrapped server; shared with the serve task.
    delegate: Arc<D>,
    /// Stop notifications. `None` until the OS source is created on first use.
    signals: Option<SignalReceiver>,
    /// Upper bound for graceful shutdown.
    timeout: Duration,
}

impl<D: Delegate> Server<D> {
    /// Wrap `delegate`, listening to the default OS termination signals with
    /// the default timeout.
    pub fn new(delegate: D) -> Self {
        Self {
            delegate: Arc::new(delegate),
            signals: None,
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Listen to `signals` instead of OS termination signals.
    pub fn with_shutdown_signal(mut self, signals: SignalReceiver) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Set the upper bound for graceful shutdown.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a signal source is in place (injected, or created by an
    /// earlier `listen`).
    pub fn has_signal_source(&self) -> bool {
        self.signals.is_some()
    }

    /// Serve until a stop signal arrives, then shut down gracefully.
    pub async fn listen(&mut self) -> Result<(), ListenError> {
        self.listen_with(&Context::background()).await
    }

    /// Like [`Server::listen`], but also stops when `ctx` is done.
    ///
    /// A deadline on `ctx` also bounds the shutdown itself: the delegate is
    /// never given more time than the caller granted.
    #[instrument(skip_all, fields(timeout = %humantime::format_duration(self.timeout)))]
    pub async fn listen_with(&mut self, ctx: &Context) -> Result<(), ListenError> {
        let timeout = self.timeout;
        let delegate = Arc::clone(&self.delegate);
        let signals = match self.signals {
            Some(ref mut signals) => signals,
            None => self
                .signals
                .insert(os_signals().map_err(ListenError::Signal)?),
        };

        let mut serve = spawn_serve(delegate.clone()).await;

        let reason = tokio::select! {
            biased;

            result = &mut serve => return serve_finished(result),
            signal = next_signal(signals) => StopReason::Signal(signal),
            _ = ctx.done() => {
                if ctx.is_cancelled() {
                    StopReason::ContextCancelled
                } else {
                    StopReason::ContextDeadline
                }
            }
        };

        let deadline = match ctx.deadline() {
            Some(ctx_deadline) => ctx_deadline.min(deadline_after(timeout)),
            None => deadline_after(timeout),
        };

        info!(reason = %reason, "stop requested, shutting down gracefully");
        shutdown(delegate.as_ref(), serve, deadline, timeout).await
    }
}

/// Start serving on a new task.
///
/// Resolves only after `serve` has been polled once, so its body has run up
/// to its first suspension point before any stop source is looked at.
async fn spawn_serve<D: Delegate>(delegate: Arc<D>) -> JoinHandle<Result<(), DelegateError>> {
    let (started_tx, started_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        let mut serve = delegate.serve();
        let first = poll_fn(|cx| Poll::Ready(serve.as_mut().poll(cx))).await;
        let _ = started_tx.send(());

        match first {
            Poll::Ready(result) => result,
            Poll::Pending => serve.await,
        }
    });

    // Only fails if the task was dropped before running, which the join
    // handle reports anyway.
    let _ = started_rx.await;
    debug!("delegate serving");

    handle
}

/// Wait for the next stop notification.
///
/// A closed source never delivers again, so this stays pending rather than
/// reading the closure as a stop request.
async fn next_signal(signals: &mut SignalReceiver) -> Signal {
    match signals.recv().await {
        Some(signal) => signal,
        None => {
            debug!("shutdown signal source closed");
            std::future::pending().await
        }
    }
}

/// The delegate stopped serving before any stop was requested.
fn serve_finished(result: ServeResult) -> Result<(), ListenError> {
    match result {
        Ok(Ok(())) | Ok(Err(DelegateError::ServerClosed)) => {
            info!("server stopped serving on its own");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "server failed while serving");
            Err(ListenError::Serve(e))
        }
        Err(e) => {
            error!(error = %e, "serve task terminated abnormally");
            Err(ListenError::ServeTask(e))
        }
    }
}

/// Drive the delegate's bounded shutdown.
async fn shutdown<D: Delegate>(
    delegate: &D,
    serve: JoinHandle<Result<(), DelegateError>>,
    deadline: Instant,
    timeout: Duration,
) -> Result<(), ListenError> {
    match timeout_at(deadline, delegate.shutdown(deadline)).await {
        Err(_) => {
            warn!("shutdown did not complete before the deadline");
            return Err(ListenError::DeadlineExceeded { timeout });
        }
        Ok(Err(DelegateError::DeadlineExceeded)) => {
            warn!("delegate could not drain before the deadline");
            return Err(ListenError::DeadlineExceeded { timeout });
        }
        Ok(Err(e)) if !e.is_server_closed() => {
            error!(error = %e, "server failed to shut down");
            return Err(ListenError::Shutdown(e));
        }
        Ok(_) => {}
    }

    if Instant::now() >= deadline {
        warn!("shutdown finished past the deadline");
        return Err(ListenError::DeadlineExceeded { timeout });
    }

    match timeout_at(deadline, serve).await {
        Ok(Ok(Ok(()))) | Ok(Ok(Err(DelegateError::ServerClosed))) => {
            debug!("delegate stopped serving");
        }
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "server reported an error after shutdown");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "serve task terminated abnormally after shutdown");
        }
        Err(_) => {
            warn!("delegate still serving after shutdown; detaching");
        }
    }

    info!("server shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::signal;
    use async_trait::async_trait;
    use tokio::sync::{mpsc, Notify};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Serve,
        Shutdown { deadline: Instant },
    }

    #[derive(Clone, Copy)]
    enum ServeBehavior {
        UntilStopped,
        Return,
        Fail(&'static str),
        Panic,
    }

    #[derive(Clone, Copy)]
    enum StopBehavior {
        Succeed,
        Closed,
        Fail(&'static str),
        Expire,
        Hang,
    }

    /// Records every call and behaves as configured.
    struct SpyServer {
        serve: ServeBehavior,
        stop: StopBehavior,
        calls: mpsc::UnboundedSender<Call>,
        stopped: Notify,
    }

    impl SpyServer {
        fn new(
            serve: ServeBehavior,
            stop: StopBehavior,
        ) -> (Self, mpsc::UnboundedReceiver<Call>) {
            let (calls, rx) = mpsc::unbounded_channel();
            let spy = Self {
                serve,
                stop,
                calls,
                stopped: Notify::new(),
            };
            (spy, rx)
        }
    }

    #[async_trait]
    impl Delegate for SpyServer {
        async fn serve(&self) -> Result<(), DelegateError> {
            let _ = self.calls.send(Call::Serve);
            match self.serve {
                ServeBehavior::UntilStopped => {
                    self.stopped.notified().await;
                    Err(DelegateError::ServerClosed)
                }
                ServeBehavior::Return => Ok(()),
                ServeBehavior::Fail(msg) => Err(DelegateError::other(msg)),
                ServeBehavior::Panic => panic!("serve blew up"),
            }
        }

        async fn shutdown(&self, deadline: Instant) -> Result<(), DelegateError> {
            let _ = self.calls.send(Call::Shutdown { deadline });
            self.stopped.notify_one();
            match self.stop {
                StopBehavior::Succeed => Ok(()),
                StopBehavior::Closed => Err(DelegateError::ServerClosed),
                StopBehavior::Fail(msg) => Err(DelegateError::other(msg)),
                StopBehavior::Expire => Err(DelegateError::DeadlineExceeded),
                StopBehavior::Hang => std::future::pending().await,
            }
        }
    }

    fn spy_server(
        serve: ServeBehavior,
        stop: StopBehavior,
    ) -> (
        Server<SpyServer>,
        signal::SignalSender,
        mpsc::UnboundedReceiver<Call>,
    ) {
        let (spy, calls) = SpyServer::new(serve, stop);
        let (tx, rx) = signal::channel();
        let server = Server::new(spy).with_shutdown_signal(rx);
        (server, tx, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_then_shutdown_on_signal() {
        let (mut server, tx, mut calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Succeed);
        let timeout = server.timeout();

        let handle = tokio::spawn(async move { server.listen().await });

        assert_eq!(calls.recv().await, Some(Call::Serve));

        let signalled_at = Instant::now();
        tx.send(Signal::Interrupt).await.unwrap();

        match calls.recv().await {
            Some(Call::Shutdown { deadline }) => {
                assert_eq!(deadline, signalled_at + timeout);
            }
            other => panic!("expected shutdown, got {:?}", other),
        }

        handle.await.unwrap().unwrap();
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_serve_error_returned_without_shutdown() {
        let (mut server, _tx, mut calls) =
            spy_server(ServeBehavior::Fail("oh no"), StopBehavior::Succeed);

        let err = server.listen().await.unwrap_err();

        assert!(matches!(err, ListenError::Serve(_)));
        assert_eq!(err.delegate_error().unwrap().to_string(), "oh no");
        assert_eq!(calls.recv().await, Some(Call::Serve));
        assert!(calls.try_recv().is_err(), "shutdown must not be called");
    }

    #[tokio::test]
    async fn test_serve_returning_cleanly_is_ok() {
        let (mut server, _tx, mut calls) =
            spy_server(ServeBehavior::Return, StopBehavior::Succeed);

        server.listen().await.unwrap();

        assert_eq!(calls.recv().await, Some(Call::Serve));
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_serve_panic_reported() {
        let (mut server, _tx, _calls) = spy_server(ServeBehavior::Panic, StopBehavior::Succeed);

        let err = server.listen().await.unwrap_err();
        match err {
            ListenError::ServeTask(e) => assert!(e.is_panic()),
            other => panic!("expected serve task error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_error_propagated() {
        let (mut server, tx, _calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Fail("oh no"));

        tx.send(Signal::Terminate).await.unwrap();
        let err = server.listen().await.unwrap_err();

        assert!(matches!(err, ListenError::Shutdown(_)));
        assert_eq!(err.delegate_error().unwrap().to_string(), "oh no");
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_closed_is_success() {
        let (mut server, tx, _calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Closed);

        tx.send(Signal::Hangup).await.unwrap();
        assert!(server.listen().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_shutdown_hits_deadline() {
        let (server, tx, _calls) = spy_server(ServeBehavior::UntilStopped, StopBehavior::Hang);
        let mut server = server.with_timeout(Duration::from_secs(20));

        tx.send(Signal::Quit).await.unwrap();
        let started = Instant::now();
        let err = server.listen().await.unwrap_err();

        assert_eq!(started.elapsed(), Duration::from_secs(20));
        match err {
            ListenError::DeadlineExceeded { timeout } => {
                assert_eq!(timeout, Duration::from_secs(20))
            }
            other => panic!("expected deadline exceeded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delegate_deadline_reported_as_deadline() {
        let (mut server, tx, _calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Expire);

        tx.send(Signal::Interrupt).await.unwrap();
        let err = server.listen().await.unwrap_err();
        assert!(matches!(err, ListenError::DeadlineExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_reports_deadline() {
        let (server, tx, _calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Succeed);
        let mut server = server.with_timeout(Duration::ZERO);

        tx.send(Signal::Interrupt).await.unwrap();
        let err = server.listen().await.unwrap_err();
        assert!(matches!(err, ListenError::DeadlineExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_signal_still_serves_first() {
        let (mut server, tx, mut calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Succeed);

        // Delivered before listen is even called.
        tx.send(Signal::Interrupt).await.unwrap();
        server.listen().await.unwrap();

        assert_eq!(calls.recv().await, Some(Call::Serve));
        assert!(matches!(calls.recv().await, Some(Call::Shutdown { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pending_signal_serves_first_across_workers() {
        for _ in 0..500 {
            let (mut server, tx, mut calls) =
                spy_server(ServeBehavior::UntilStopped, StopBehavior::Succeed);

            tx.send(Signal::Interrupt).await.unwrap();
            tokio::spawn(async move { server.listen().await })
                .await
                .unwrap()
                .unwrap();

            assert_eq!(calls.recv().await, Some(Call::Serve));
            assert!(matches!(calls.recv().await, Some(Call::Shutdown { .. })));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_signals_shut_down_once() {
        let (mut server, tx, mut calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Succeed);

        tx.send(Signal::Interrupt).await.unwrap();
        assert!(tx.try_send(Signal::Terminate).is_err(), "slot holds one");
        server.listen().await.unwrap();

        assert_eq!(calls.recv().await, Some(Call::Serve));
        assert!(matches!(calls.recv().await, Some(Call::Shutdown { .. })));
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_cancel_triggers_shutdown() {
        let (mut server, _tx, mut calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Succeed);
        let ctx = Context::background();
        let listen_ctx = ctx.clone();

        let handle = tokio::spawn(async move { server.listen_with(&listen_ctx).await });
        assert_eq!(calls.recv().await, Some(Call::Serve));

        ctx.cancel();
        assert!(matches!(calls.recv().await, Some(Call::Shutdown { .. })));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline_bounds_shutdown() {
        let (server, _tx, mut calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Succeed);
        let mut server = server.with_timeout(Duration::from_secs(20));
        let ctx = Context::with_timeout(Duration::from_secs(5));
        let ctx_deadline = ctx.deadline().unwrap();

        // No signal ever arrives; the context expiring is the stop condition,
        // and the shutdown gets no time beyond it.
        let err = server.listen_with(&ctx).await.unwrap_err();

        assert!(matches!(err, ListenError::DeadlineExceeded { .. }));
        assert_eq!(calls.recv().await, Some(Call::Serve));
        assert_eq!(
            calls.recv().await,
            Some(Call::Shutdown {
                deadline: ctx_deadline
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline_caps_timeout_on_signal() {
        let (server, tx, mut calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Succeed);
        let mut server = server.with_timeout(Duration::from_secs(20));
        let ctx = Context::with_timeout(Duration::from_secs(5));

        tx.send(Signal::Interrupt).await.unwrap();
        server.listen_with(&ctx).await.unwrap();

        assert_eq!(calls.recv().await, Some(Call::Serve));
        assert_eq!(
            calls.recv().await,
            Some(Call::Shutdown {
                deadline: ctx.deadline().unwrap()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_signal_source_is_not_a_stop() {
        let (mut server, tx, mut calls) =
            spy_server(ServeBehavior::UntilStopped, StopBehavior::Succeed);
        drop(tx);
        let ctx = Context::background();
        let listen_ctx = ctx.clone();

        let handle = tokio::spawn(async move { server.listen_with(&listen_ctx).await });
        assert_eq!(calls.recv().await, Some(Call::Serve));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());
        assert!(calls.try_recv().is_err());

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }
}
