//! Instrumentation module.
//!
//! Records invocation duration and outcome in a `tracing` span, not a full
//! metrics crate.

use std::task::{Context, Poll};
use std::time::Instant;

use tower::util::BoxService;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::Module;
use crate::dispatch::{HandlerPipeline, Invocation, InvocationFuture, Reply};
use crate::error::ProcessorError;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments invocations with timing via `tracing` spans.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

impl Module for MetricsLayer {
    fn name(&self) -> &str {
        "instrumentation"
    }

    fn wrap(&self, inner: HandlerPipeline) -> HandlerPipeline {
        BoxService::new(self.layer(inner))
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records invocation duration and outcome in tracing spans.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

fn outcome(result: &Result<Reply, ProcessorError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(err) if err.is_functional() => "rejected",
        Err(_) => "error",
    }
}

impl<S> Service<Invocation> for MetricsService<S>
where
    S: Service<Invocation, Response = Reply, Error = ProcessorError> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = ProcessorError;
    type Future = InvocationFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let message_type = invocation.message_type().short_name();
        let handler = invocation.handler();
        let depth = invocation.context().depth();

        let span = info_span!(
            "invocation",
            message = message_type,
            handler = handler,
            depth = depth,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let duration_ms = start.elapsed().as_millis();
                let label = outcome(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_u64 = duration_ms as u64;
                tracing::Span::current().record("duration_ms", duration_u64);
                tracing::Span::current().record("outcome", label);

                tracing::info!(
                    message_type,
                    handler,
                    duration_ms = duration_u64,
                    outcome = label,
                    "invocation complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
