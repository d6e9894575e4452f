//! Pending-call bookkeeping for requests that round-trip through the legacy protocol.
//!
//! Every call that needs a legacy response gets an [`InvocationContext`] keyed by
//! an opaque. The legacy reply (returned from the dispatch future, or written
//! out of band onto the client's virtual channel) is routed back by that opaque
//! to the context's [`ResponseHandler`]. A watchdog completes any context still
//! pending at its deadline with [`ProxyError::Timeout`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use quay_core::{ClientId, InvocationId, LegacyCommand, MessageId, ProxyError};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::translate::ResponseHandler;

/// Call-specific facts captured before dispatch.
#[derive(Clone, Debug, Default)]
pub struct CallMetadata {
    pub client_id: Option<ClientId>,
    /// Message id generated (or taken from the request) before dispatch.
    pub message_id: Option<MessageId>,
}

type Outcome<Resp> = Result<Resp, ProxyError>;

/// One in-flight call. Completed exactly once, then discarded.
pub struct InvocationContext<Req, Resp> {
    id: InvocationId,
    opaque: i32,
    request: Req,
    metadata: CallMetadata,
    created_at: Instant,
    timeout: Duration,
    completion: Mutex<Option<oneshot::Sender<Outcome<Resp>>>>,
}

impl<Req, Resp> InvocationContext<Req, Resp> {
    pub fn id(&self) -> &InvocationId {
        &self.id
    }

    /// Correlation key carried on the legacy request.
    pub fn opaque(&self) -> i32 {
        self.opaque
    }

    pub fn request(&self) -> &Req {
        &self.request
    }

    pub fn metadata(&self) -> &CallMetadata {
        &self.metadata
    }

    pub fn deadline(&self) -> Instant {
        self.created_at + self.timeout
    }

    pub fn is_completed(&self) -> bool {
        self.completion.lock().is_none()
    }

    /// Resolve with a response. Returns false if the context was already completed.
    pub fn complete(&self, response: Resp) -> bool {
        self.settle(Ok(response))
    }

    /// Resolve with a failure. Returns false if the context was already completed.
    pub fn complete_error(&self, error: ProxyError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Outcome<Resp>) -> bool {
        let Some(tx) = self.completion.lock().take() else {
            tracing::warn!(
                invocation_id = %self.id,
                opaque = self.opaque,
                "invocation already completed, dropping second outcome"
            );
            return false;
        };
        if tx.send(outcome).is_err() {
            tracing::debug!(invocation_id = %self.id, "caller stopped waiting before completion");
        }
        true
    }
}

/// The caller's side of an invocation. Resolves to the context's single outcome.
pub struct Pending<Resp> {
    rx: oneshot::Receiver<Outcome<Resp>>,
}

impl<Resp> Future for Pending<Resp> {
    type Output = Outcome<Resp>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ProxyError::Internal("invocation dropped without completion".into()))
            })
        })
    }
}

/// Type-erased view of a context bound to its handler.
trait PendingInvocation: Send + Sync {
    fn invocation_id(&self) -> &InvocationId;
    fn on_response(&self, response: Option<LegacyCommand>);
    fn on_error(&self, error: ProxyError) -> bool;
    fn is_completed(&self) -> bool;
}

struct Bound<Req, Resp, H> {
    ctx: Arc<InvocationContext<Req, Resp>>,
    handler: H,
}

impl<Req, Resp, H> PendingInvocation for Bound<Req, Resp, H>
where
    Req: Send + Sync,
    Resp: Send,
    H: ResponseHandler<Req, Resp>,
{
    fn invocation_id(&self) -> &InvocationId {
        self.ctx.id()
    }

    fn on_response(&self, response: Option<LegacyCommand>) {
        self.handler.handle(response, &self.ctx);
    }

    fn on_error(&self, error: ProxyError) -> bool {
        self.ctx.complete_error(error)
    }

    fn is_completed(&self) -> bool {
        self.ctx.is_completed()
    }
}

struct InFlight {
    invocation: Arc<dyn PendingInvocation>,
    watchdog: Option<AbortHandle>,
}

impl InFlight {
    fn disarm(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.abort();
        }
    }
}

/// Table of in-flight invocations keyed by opaque.
pub struct Correlator {
    inflight: Arc<DashMap<i32, InFlight>>,
    next_opaque: AtomicI32,
    default_timeout: Duration,
}

impl Correlator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_opaque: AtomicI32::new(1),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn next_opaque(&self) -> i32 {
        loop {
            let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
            if opaque != 0 && !self.inflight.contains_key(&opaque) {
                return opaque;
            }
        }
    }

    /// Allocate a pending context and arm its watchdog.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create_context<Req, Resp, H>(
        &self,
        request: Req,
        metadata: CallMetadata,
        handler: H,
        timeout: Option<Duration>,
    ) -> (Arc<InvocationContext<Req, Resp>>, Pending<Resp>)
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
        H: ResponseHandler<Req, Resp> + 'static,
    {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let opaque = self.next_opaque();
        let (tx, rx) = oneshot::channel();
        let ctx = Arc::new(InvocationContext {
            id: InvocationId::new(),
            opaque,
            request,
            metadata,
            created_at: Instant::now(),
            timeout,
            completion: Mutex::new(Some(tx)),
        });

        let invocation: Arc<dyn PendingInvocation> = Arc::new(Bound {
            ctx: Arc::clone(&ctx),
            handler,
        });
        self.inflight.insert(
            opaque,
            InFlight {
                invocation,
                watchdog: None,
            },
        );

        let watchdog = self.arm_watchdog(opaque, timeout);
        match self.inflight.get_mut(&opaque) {
            Some(mut entry) => entry.watchdog = Some(watchdog),
            // Already resolved (or timed out) before the watchdog handle was stored.
            None => watchdog.abort(),
        }

        tracing::trace!(invocation_id = %ctx.id(), opaque, "invocation created");
        (ctx, Pending { rx })
    }

    fn arm_watchdog(&self, opaque: i32, timeout: Duration) -> AbortHandle {
        let inflight = Arc::clone(&self.inflight);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = inflight.remove(&opaque) {
                if entry.invocation.on_error(ProxyError::Timeout(timeout)) {
                    tracing::warn!(
                        invocation_id = %entry.invocation.invocation_id(),
                        opaque,
                        timeout_ms = timeout.as_millis() as u64,
                        "invocation timed out, completed by watchdog"
                    );
                }
            }
        })
        .abort_handle()
    }

    /// Route a legacy response to the invocation waiting on `opaque`.
    ///
    /// `None` means the reply is being delivered out of band: the handler is
    /// told, but the invocation stays in flight for the out-of-band write or the
    /// watchdog. Returns false if nothing is in flight under `opaque`.
    pub fn resolve(&self, opaque: i32, response: Option<LegacyCommand>) -> bool {
        match response {
            Some(command) => {
                let Some((_, entry)) = self.inflight.remove(&opaque) else {
                    tracing::debug!(opaque, "no in-flight invocation for legacy response");
                    return false;
                };
                entry.disarm();
                entry.invocation.on_response(Some(command));
                if !entry.invocation.is_completed() {
                    entry.invocation.on_error(ProxyError::Internal(
                        "response handler left invocation incomplete".into(),
                    ));
                }
                true
            }
            None => {
                let Some(invocation) = self.inflight.get(&opaque).map(|e| Arc::clone(&e.invocation))
                else {
                    return false;
                };
                invocation.on_response(None);
                if invocation.is_completed() {
                    if let Some((_, entry)) = self.inflight.remove(&opaque) {
                        entry.disarm();
                    }
                }
                true
            }
        }
    }

    /// Complete the invocation waiting on `opaque` with a failure.
    pub fn fail(&self, opaque: i32, error: ProxyError) -> bool {
        let Some((_, entry)) = self.inflight.remove(&opaque) else {
            return false;
        };
        entry.disarm();
        entry.invocation.on_error(error)
    }

    pub fn contains(&self, opaque: i32) -> bool {
        self.inflight.contains_key(&opaque)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_core::legacy::response_code;

    /// Completes with the legacy response code.
    struct CodeHandler;

    impl ResponseHandler<String, i32> for CodeHandler {
        fn handle(&self, response: Option<LegacyCommand>, ctx: &InvocationContext<String, i32>) {
            if let Some(command) = response {
                ctx.complete(command.code);
            }
        }
    }

    /// Never completes anything.
    struct SilentHandler;

    impl ResponseHandler<String, i32> for SilentHandler {
        fn handle(&self, _response: Option<LegacyCommand>, _ctx: &InvocationContext<String, i32>) {}
    }

    fn reply(code: i32) -> LegacyCommand {
        LegacyCommand::response(code, None)
    }

    #[tokio::test]
    async fn complete_is_single_assignment() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (ctx, pending) =
            correlator.create_context("req".to_string(), CallMetadata::default(), CodeHandler, None);

        assert!(ctx.complete(1));
        assert!(!ctx.complete(2));
        assert!(!ctx.complete_error(ProxyError::Internal("late".into())));
        assert!(ctx.is_completed());
        assert_eq!(pending.await, Ok(1));
    }

    #[tokio::test]
    async fn resolve_routes_through_handler() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (ctx, pending) =
            correlator.create_context("req".to_string(), CallMetadata::default(), CodeHandler, None);
        assert_eq!(correlator.in_flight(), 1);
        assert_eq!(ctx.request(), "req");

        assert!(correlator.resolve(ctx.opaque(), Some(reply(response_code::SYSTEM_BUSY))));
        assert_eq!(pending.await, Ok(response_code::SYSTEM_BUSY));
        assert_eq!(correlator.in_flight(), 0);
        assert!(!correlator.resolve(ctx.opaque(), Some(reply(0))));
    }

    #[tokio::test]
    async fn absent_response_waits_for_out_of_band_reply() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (ctx, pending) =
            correlator.create_context("req".to_string(), CallMetadata::default(), CodeHandler, None);

        assert!(correlator.resolve(ctx.opaque(), None));
        assert!(!ctx.is_completed());
        assert!(correlator.contains(ctx.opaque()));

        assert!(correlator.resolve(ctx.opaque(), Some(reply(response_code::SUCCESS))));
        assert_eq!(pending.await, Ok(response_code::SUCCESS));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_times_out_unresolved_invocation() {
        let correlator = Correlator::new(Duration::from_secs(3));
        let (ctx, pending) =
            correlator.create_context("req".to_string(), CallMetadata::default(), CodeHandler, None);
        correlator.resolve(ctx.opaque(), None);

        assert_eq!(pending.await, Err(ProxyError::Timeout(Duration::from_secs(3))));
        assert!(ctx.is_completed());
        assert_eq!(correlator.in_flight(), 0);
        assert!(!correlator.resolve(ctx.opaque(), Some(reply(0))));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_is_disarmed_after_completion() {
        let correlator = Correlator::new(Duration::from_secs(1));
        let (ctx, pending) = correlator.create_context(
            "req".to_string(),
            CallMetadata::default(),
            CodeHandler,
            Some(Duration::from_millis(200)),
        );
        correlator.resolve(ctx.opaque(), Some(reply(0)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pending.await, Ok(0));
    }

    #[tokio::test]
    async fn fail_completes_with_error() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (ctx, pending) =
            correlator.create_context("req".to_string(), CallMetadata::default(), CodeHandler, None);
        let err = ProxyError::upstream(1, "broker down");

        assert!(correlator.fail(ctx.opaque(), err.clone()));
        assert!(!correlator.fail(ctx.opaque(), err.clone()));
        assert_eq!(pending.await, Err(err));
    }

    #[tokio::test]
    async fn handler_that_never_completes_is_reported() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (ctx, pending) =
            correlator.create_context("req".to_string(), CallMetadata::default(), SilentHandler, None);
        correlator.resolve(ctx.opaque(), Some(reply(0)));
        assert!(matches!(pending.await, Err(ProxyError::Internal(_))));
    }

    #[tokio::test]
    async fn concurrent_completion_observed_once() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (ctx, pending) =
            correlator.create_context("req".to_string(), CallMetadata::default(), CodeHandler, None);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let ctx = Arc::clone(&ctx);
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    ctx.complete(i)
                } else {
                    ctx.complete_error(ProxyError::Internal(format!("task {i}")))
                }
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(pending.await.is_ok() || ctx.is_completed());
    }

    #[tokio::test]
    async fn opaques_are_unique() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (a, _pa) =
            correlator.create_context("a".to_string(), CallMetadata::default(), CodeHandler, None);
        let (b, _pb) =
            correlator.create_context("b".to_string(), CallMetadata::default(), CodeHandler, None);
        assert_ne!(a.opaque(), b.opaque());
        assert_ne!(a.id(), b.id());
    }
}
