//! Contexts and a recording terminal service for module and handler tests.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use conduit_core::RequestContext;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tower::Service;

use super::{DispatchOptions, HandlerContext, Invocation, InvocationFuture, MessageProcessor, Reply};
use crate::config::ProcessorConfig;
use crate::error::ProcessorError;
use crate::unit_of_work::CycleMode;

fn processor() -> MessageProcessor {
    let config = ProcessorConfig {
        modules: Vec::new(),
        ..ProcessorConfig::default()
    };
    MessageProcessor::builder(config)
        .build()
        .expect("processor without modules builds")
}

/// Root context of a fresh read-write cycle for an anonymous caller.
pub(crate) fn context() -> HandlerContext {
    context_for(RequestContext::anonymous())
}

pub(crate) fn context_for(request: RequestContext) -> HandlerContext {
    processor().root_context(CycleMode::ReadWrite, DispatchOptions::for_request(request))
}

pub(crate) fn context_with_cancellation(cancellation: CancellationToken) -> HandlerContext {
    processor().root_context(
        CycleMode::ReadWrite,
        DispatchOptions::default().with_cancellation(cancellation),
    )
}

/// Terminal service recording each call. Clones share the record.
#[derive(Clone, Default)]
pub(crate) struct RecordingService {
    in_transaction: Arc<Mutex<Vec<bool>>>,
    fail: bool,
    delay_ms: u64,
}

impl RecordingService {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fails every call with a handler error.
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Replies after sleeping `delay_ms`.
    pub(crate) fn delayed(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.in_transaction.lock().len()
    }

    /// `HandlerContext::in_transaction` as seen by each call.
    pub(crate) fn in_transaction(&self) -> Vec<bool> {
        self.in_transaction.lock().clone()
    }
}

impl Service<Invocation> for RecordingService {
    type Response = Reply;
    type Error = ProcessorError;
    type Future = InvocationFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        self.in_transaction
            .lock()
            .push(invocation.context().in_transaction());
        let message_type = invocation.message_type().name();
        let fail = self.fail;
        let delay_ms = self.delay_ms;
        Box::pin(async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            if fail {
                return Err(ProcessorError::Handler {
                    message_type,
                    source: anyhow::anyhow!("recorded failure"),
                });
            }
            Ok(Reply::none())
        })
    }
}
