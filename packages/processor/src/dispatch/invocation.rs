use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use conduit_core::{MessageEnvelope, MessageKind, MessageType};
use tower::util::BoxService;

use super::context::HandlerContext;
use crate::error::ProcessorError;

/// Future returned by every service in a handler pipeline.
pub type InvocationFuture = Pin<Box<dyn Future<Output = Result<Reply, ProcessorError>> + Send>>;

/// A handler wrapped in its modules, as a boxed tower service.
pub type HandlerPipeline = BoxService<Invocation, Reply, ProcessorError>;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Request flowing through a handler pipeline: one message, one handler.
pub struct Invocation {
    message: MessageEnvelope,
    handler: &'static str,
    pub(crate) context: HandlerContext,
}

impl Invocation {
    #[must_use]
    pub fn new(message: MessageEnvelope, handler: &'static str, context: HandlerContext) -> Self {
        Self {
            message,
            handler,
            context,
        }
    }

    #[must_use]
    pub fn message(&self) -> &MessageEnvelope {
        &self.message
    }

    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Name of the handler this invocation ends in.
    #[must_use]
    pub fn handler(&self) -> &'static str {
        self.handler
    }

    #[must_use]
    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut HandlerContext {
        &mut self.context
    }

    pub(crate) fn into_parts(self) -> (MessageEnvelope, HandlerContext) {
        (self.message, self.context)
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("message", &self.message)
            .field("handler", &self.handler)
            .field("depth", &self.context.depth())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// Result value of a handler: empty for commands and events, the response
/// for queries.
#[derive(Default)]
pub struct Reply(Option<Box<dyn Any + Send>>);

impl Reply {
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    #[must_use]
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// The carried value if it is a `T`.
    #[must_use]
    pub fn into_inner<T: Any>(self) -> Option<T> {
        self.0
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Reply(..)"),
            None => f.write_str("Reply(empty)"),
        }
    }
}
