//! Authorization module: asks the injected `Authorizer` about the caller in
//! the invocation's request context.

use std::sync::Arc;
use std::task::{Context, Poll};

use tower::util::BoxService;
use tower::{Layer, Service};
use tracing::debug;

use super::Module;
use crate::dispatch::{HandlerPipeline, Invocation, InvocationFuture, Reply};
use crate::error::ProcessorError;
use crate::traits::{AuthorizationDecision, Authorizer};

#[derive(Clone)]
pub struct AuthorizationLayer {
    authorizer: Arc<dyn Authorizer>,
}

impl AuthorizationLayer {
    #[must_use]
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }
}

impl<S> Layer<S> for AuthorizationLayer {
    type Service = AuthorizationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthorizationService {
            inner,
            authorizer: Arc::clone(&self.authorizer),
        }
    }
}

impl Module for AuthorizationLayer {
    fn name(&self) -> &str {
        "authorization"
    }

    fn wrap(&self, inner: HandlerPipeline) -> HandlerPipeline {
        BoxService::new(self.layer(inner))
    }
}

pub struct AuthorizationService<S> {
    inner: S,
    authorizer: Arc<dyn Authorizer>,
}

impl<S> Service<Invocation> for AuthorizationService<S>
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
        let decision = self
            .authorizer
            .authorize(invocation.context().request(), invocation.message().message());
        match decision {
            AuthorizationDecision::Allow => Box::pin(self.inner.call(invocation)),
            AuthorizationDecision::Deny { reason } => {
                let message_type = invocation.message_type().name();
                debug!(message_type, %reason, "authorization denied");
                Box::pin(async move { Err(ProcessorError::NotAuthorized { message_type, reason }) })
            }
        }
    }
}
