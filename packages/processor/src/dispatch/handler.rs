//! Handler traits and the terminal tower service that invokes them.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use conduit_core::{Message, MessageEnvelope, Query};
use tower::Service;

use super::context::HandlerContext;
use super::invocation::{Invocation, InvocationFuture, Reply};
use crate::error::ProcessorError;

type ErasedFuture = Pin<Box<dyn Future<Output = anyhow::Result<Reply>> + Send>>;

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Handles one command or event type.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: M, ctx: &HandlerContext) -> anyhow::Result<()>;
}

/// Answers one query type.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    async fn execute(&self, query: Q, ctx: &HandlerContext) -> anyhow::Result<Q::Response>;
}

/// Handles messages of any type it is routed to. Used for generic
/// definitions and fallback handlers.
#[async_trait]
pub trait GenericHandler: Send + Sync + 'static {
    async fn handle(&self, message: MessageEnvelope, ctx: &HandlerContext) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Erased adapters
// ---------------------------------------------------------------------------

/// Object-safe view of a resolved handler instance.
pub(crate) trait ErasedHandler: Send + Sync {
    fn invoke(&self, message: MessageEnvelope, ctx: HandlerContext) -> ErasedFuture;
}

fn unexpected_message<M: Message>(envelope: &MessageEnvelope) -> anyhow::Error {
    anyhow::anyhow!(
        "handler for `{}` received `{}`",
        std::any::type_name::<M>(),
        envelope.message_type().name()
    )
}

pub(crate) struct TypedHandler<M, H> {
    handler: Arc<H>,
    _message: PhantomData<fn(M)>,
}

impl<M, H> TypedHandler<M, H> {
    pub(crate) fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            _message: PhantomData,
        }
    }
}

impl<M: Message, H: MessageHandler<M>> ErasedHandler for TypedHandler<M, H> {
    fn invoke(&self, message: MessageEnvelope, ctx: HandlerContext) -> ErasedFuture {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let message = message
                .downcast::<M>()
                .map_err(|envelope| unexpected_message::<M>(&envelope))?;
            handler.handle(message, &ctx).await?;
            Ok(Reply::none())
        })
    }
}

pub(crate) struct TypedQueryHandler<Q, H> {
    handler: Arc<H>,
    _query: PhantomData<fn(Q)>,
}

impl<Q, H> TypedQueryHandler<Q, H> {
    pub(crate) fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            _query: PhantomData,
        }
    }
}

impl<Q: Query, H: QueryHandler<Q>> ErasedHandler for TypedQueryHandler<Q, H> {
    fn invoke(&self, message: MessageEnvelope, ctx: HandlerContext) -> ErasedFuture {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let query = message
                .downcast::<Q>()
                .map_err(|envelope| unexpected_message::<Q>(&envelope))?;
            let response = handler.execute(query, &ctx).await?;
            Ok(Reply::new(response))
        })
    }
}

pub(crate) struct GenericAdapter<H> {
    handler: Arc<H>,
}

impl<H> GenericAdapter<H> {
    pub(crate) fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

impl<H: GenericHandler> ErasedHandler for GenericAdapter<H> {
    fn invoke(&self, message: MessageEnvelope, ctx: HandlerContext) -> ErasedFuture {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            handler.handle(message, &ctx).await?;
            Ok(Reply::none())
        })
    }
}

// ---------------------------------------------------------------------------
// HandlerService
// ---------------------------------------------------------------------------

/// Innermost service of every pipeline: runs the resolved handler with its
/// context installed as the ambient one, racing it against cancellation.
pub struct HandlerService {
    handler: Arc<dyn ErasedHandler>,
}

impl HandlerService {
    pub(crate) fn new(handler: Arc<dyn ErasedHandler>) -> Self {
        Self { handler }
    }
}

impl Service<Invocation> for HandlerService {
    type Response = Reply;
    type Error = ProcessorError;
    type Future = InvocationFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let message_type = invocation.message_type().name();
        let (message, ctx) = invocation.into_parts();
        let cancellation = ctx.cancellation().clone();
        let running = ctx.clone().enter(self.handler.invoke(message, ctx));

        Box::pin(async move {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => Err(ProcessorError::Cancelled),
                result = running => result.map_err(|err| ProcessorError::from_handler(message_type, err)),
            }
        })
    }
}
