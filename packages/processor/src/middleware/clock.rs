//! Clock module: installs a fixed ambient clock for the inner service and
//! restores the previous one when it completes, fails, or is dropped.

use std::sync::Arc;
use std::task::{Context, Poll};

use conduit_core::{clock, Clock, FixedClock};
use tower::util::BoxService;
use tower::{Layer, Service};

use super::Module;
use crate::dispatch::{HandlerPipeline, Invocation, InvocationFuture, Reply};
use crate::error::ProcessorError;

/// Which clock the module installs.
#[derive(Debug, Clone)]
pub enum ClockSource {
    /// Always this clock.
    Fixed(Arc<dyn Clock>),
    /// The ambient time frozen when the invocation starts, so every read
    /// during one invocation agrees.
    Freeze,
}

#[derive(Debug, Clone)]
pub struct ClockLayer {
    source: ClockSource,
}

impl ClockLayer {
    #[must_use]
    pub fn new(source: ClockSource) -> Self {
        Self { source }
    }

    #[must_use]
    pub fn fixed(clock: Arc<dyn Clock>) -> Self {
        Self::new(ClockSource::Fixed(clock))
    }

    #[must_use]
    pub fn freeze() -> Self {
        Self::new(ClockSource::Freeze)
    }
}

impl<S> Layer<S> for ClockLayer {
    type Service = ClockService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClockService {
            inner,
            source: self.source.clone(),
        }
    }
}

impl Module for ClockLayer {
    fn name(&self) -> &str {
        "clock"
    }

    fn wrap(&self, inner: HandlerPipeline) -> HandlerPipeline {
        BoxService::new(self.layer(inner))
    }
}

pub struct ClockService<S> {
    inner: S,
    source: ClockSource,
}

impl<S> Service<Invocation> for ClockService<S>
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
        let pinned: Arc<dyn Clock> = match &self.source {
            ClockSource::Fixed(fixed) => Arc::clone(fixed),
            ClockSource::Freeze => Arc::new(FixedClock::freeze(clock::current().as_ref())),
        };
        let inner = &mut self.inner;
        let future = clock::sync_scope(Arc::clone(&pinned), || inner.call(invocation));
        Box::pin(clock::scope(pinned, future))
    }
}
