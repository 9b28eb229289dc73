//! Validation module: rejects invalid messages with
//! `ProcessorError::InvalidMessage` before anything inside it runs.

use std::sync::Arc;
use std::task::{Context, Poll};

use conduit_core::ValidationResult;
use tower::util::BoxService;
use tower::{Layer, Service};

use super::Module;
use crate::dispatch::{HandlerPipeline, Invocation, InvocationFuture, Reply};
use crate::error::ProcessorError;
use crate::traits::MessageValidator;

// ---------------------------------------------------------------------------
// ValidationLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ValidationLayer {
    validator: Arc<dyn MessageValidator>,
}

impl ValidationLayer {
    #[must_use]
    pub fn new(validator: Arc<dyn MessageValidator>) -> Self {
        Self { validator }
    }
}

impl<S> Layer<S> for ValidationLayer {
    type Service = ValidationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ValidationService {
            inner,
            validator: Arc::clone(&self.validator),
        }
    }
}

impl Module for ValidationLayer {
    fn name(&self) -> &str {
        "validation"
    }

    fn wrap(&self, inner: HandlerPipeline) -> HandlerPipeline {
        BoxService::new(self.layer(inner))
    }
}

// ---------------------------------------------------------------------------
// ValidationService
// ---------------------------------------------------------------------------

pub struct ValidationService<S> {
    inner: S,
    validator: Arc<dyn MessageValidator>,
}

impl<S> Service<Invocation> for ValidationService<S>
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
        match self.validator.validate(invocation.message().message()) {
            ValidationResult::Valid => Box::pin(self.inner.call(invocation)),
            ValidationResult::Invalid { errors } => {
                let message_type = invocation.message_type().name();
                Box::pin(async move { Err(ProcessorError::InvalidMessage { message_type, errors }) })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
