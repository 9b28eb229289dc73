//! Transaction scope module: opens, joins, or suppresses a transaction around
//! the inner service and commits only when it succeeds. A scope dropped
//! without commit rolls back.

use std::sync::Arc;
use std::task::{Context, Poll};

use conduit_core::MessageKind;
use tower::util::BoxService;
use tower::{Layer, Service};
use tracing::debug;

use super::Module;
use crate::config::{Propagation, TransactionOptions};
use crate::dispatch::{HandlerPipeline, Invocation, InvocationFuture, Reply};
use crate::error::ProcessorError;
use crate::traits::TransactionScopeFactory;

#[derive(Clone)]
pub struct TransactionLayer {
    factory: Arc<dyn TransactionScopeFactory>,
    options: TransactionOptions,
}

impl TransactionLayer {
    #[must_use]
    pub fn new(factory: Arc<dyn TransactionScopeFactory>, options: TransactionOptions) -> Self {
        Self { factory, options }
    }
}

impl<S> Layer<S> for TransactionLayer {
    type Service = TransactionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TransactionService {
            inner,
            factory: Arc::clone(&self.factory),
            options: self.options.clone(),
        }
    }
}

impl Module for TransactionLayer {
    fn name(&self) -> &str {
        "transaction_scope"
    }

    /// Queries never write, so they run without a scope.
    fn applies_to(&self, kind: MessageKind) -> bool {
        kind != MessageKind::Query
    }

    fn wrap(&self, inner: HandlerPipeline) -> HandlerPipeline {
        BoxService::new(self.layer(inner))
    }
}

pub struct TransactionService<S> {
    inner: S,
    factory: Arc<dyn TransactionScopeFactory>,
    options: TransactionOptions,
}

impl<S> Service<Invocation> for TransactionService<S>
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

    fn call(&mut self, mut invocation: Invocation) -> Self::Future {
        let open = match self.options.propagation {
            Propagation::Suppress => false,
            Propagation::Required => !invocation.context().in_transaction(),
            Propagation::RequiresNew => true,
        };

        if !open {
            let joined = self.options.propagation == Propagation::Required;
            invocation.context_mut().set_in_transaction(joined);
            return Box::pin(self.inner.call(invocation));
        }

        let scope = match self.factory.begin(&self.options) {
            Ok(scope) => scope,
            Err(source) => return Box::pin(async move { Err(ProcessorError::Transaction { source }) }),
        };
        debug!(handler = invocation.handler(), isolation = ?self.options.isolation, "transaction opened");
        invocation.context_mut().set_in_transaction(true);
        let future = self.inner.call(invocation);

        Box::pin(async move {
            let reply = future.await?;
            scope
                .commit()
                .await
                .map_err(|source| ProcessorError::Transaction { source })?;
            Ok(reply)
        })
    }
}
