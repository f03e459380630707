//! Transparent stream taps.
//!
//! A tap forwards its input byte-for-byte while capturing chunks for the
//! debug trace, marking time-to-first-token, and firing one-shot
//! finalization when the stream ends, the client goes away, or the watchdog
//! expires. Two taps are chained per streaming dispatch: one on the raw
//! provider body, one on the client-facing body after transformation.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::Stream;
use pin_project::{pin_project, pinned_drop};

use crate::{
    dialect::ByteStream,
    error::GatewayError,
    finalize::{FinalizeTrigger, Finalizer},
    metrics::MetricsCollector,
    request::RequestContext,
    store::DebugLogger,
    usage::UsageLogger,
};

/// Which side of the transformation a tap observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapRole {
    /// The raw upstream body, before transformation.
    Provider,
    /// The client-facing body, after transformation.
    Client,
}

impl TapRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Client => "client",
        }
    }
}

/// Default watchdog budget per tap.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(300);

/// Byte-identical observer over a stream body.
#[pin_project(PinnedDrop)]
pub struct StreamTap {
    #[pin]
    inner: ByteStream,
    role: TapRole,
    context: Arc<RequestContext>,
    debug: Arc<DebugLogger>,
    usage: Arc<UsageLogger>,
    metrics: Arc<MetricsCollector>,
    finalizer: Arc<Finalizer>,
    /// Only the client-side tap finalizes on normal end; the provider tap
    /// drains first and must not close the record before the client capture
    /// is complete.
    finalize_on_end: bool,
    #[pin]
    watchdog: Option<tokio::time::Sleep>,
    first_token_seen: bool,
    done: bool,
}

impl StreamTap {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        inner: ByteStream,
        role: TapRole,
        context: Arc<RequestContext>,
        debug: Arc<DebugLogger>,
        usage: Arc<UsageLogger>,
        metrics: Arc<MetricsCollector>,
        finalizer: Arc<Finalizer>,
        watchdog: Option<Duration>,
    ) -> Self {
        let finalize_on_end = role == TapRole::Client;

        Self {
            inner,
            role,
            context,
            debug,
            usage,
            metrics,
            finalizer,
            finalize_on_end,
            watchdog: watchdog.map(tokio::time::sleep),
            first_token_seen: false,
            done: false,
        }
    }
}

impl Stream for StreamTap {
    type Item = Result<Bytes, GatewayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.done {
            return Poll::Ready(None);
        }

        if let Some(watchdog) = this.watchdog.as_mut().as_pin_mut()
            && watchdog.poll(cx).is_ready()
        {
            log::warn!(
                "Stream watchdog expired for request {id} ({role} tap)",
                id = this.context.id,
                role = this.role.as_str()
            );

            *this.done = true;
            this.finalizer.trigger(FinalizeTrigger::Watchdog);

            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.debug.record_chunk(&this.context.id, *this.role, &chunk);

                if !*this.first_token_seen && chunk.iter().any(|byte| !byte.is_ascii_whitespace()) {
                    *this.first_token_seen = true;

                    if this.context.mark_first_token(*this.role) {
                        if let Some(provider) = &this.context.provider
                            && let Some(elapsed) = this.context.ttft_ms(*this.role)
                        {
                            this.metrics.record_first_token(provider, *this.role, elapsed);
                        }

                        this.usage.mark_first_token(this.context, *this.role);
                    }
                }

                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // A mid-stream failure is fatal for the stream: close the
                // trace now, the client sees the error and the stream ends.
                *this.done = true;
                this.finalizer.trigger(FinalizeTrigger::Complete);

                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                *this.done = true;

                if *this.finalize_on_end {
                    this.finalizer.trigger(FinalizeTrigger::Complete);
                }

                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pinned_drop]
impl PinnedDrop for StreamTap {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();

        // Dropped before the stream finished: the client went away.
        if !*this.done {
            this.finalizer.trigger(FinalizeTrigger::Cancelled);
        }
    }
}
