use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conduit_core::{Message, MessageEnvelope, Principal, Query, RequestContext};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::processor::{dispatch, query_response, ProcessorInner};
use super::registry::DispatchOrigin;
use crate::error::{ProcessorError, ResolveError};
use crate::lifetime::Resolver;
use crate::unit_of_work::{CycleMode, CycleState, ProcessingCycle, UnitOfWorkParticipant};

tokio::task_local! {
    /// Context of the handler currently executing in this async flow.
    static AMBIENT: HandlerContext;
}

/// What a handler sees of the processing cycle it runs in.
///
/// Cheap to clone. Messages published through it are dispatched depth-first
/// in the same cycle before `publish` returns.
#[derive(Clone)]
pub struct HandlerContext {
    processor: Arc<ProcessorInner>,
    cycle: Arc<ProcessingCycle>,
    request: Arc<RequestContext>,
    cancellation: CancellationToken,
    depth: usize,
    in_transaction: bool,
    read_only: bool,
}

impl HandlerContext {
    pub(crate) fn root(
        processor: Arc<ProcessorInner>,
        cycle: Arc<ProcessingCycle>,
        request: RequestContext,
        cancellation: CancellationToken,
    ) -> Self {
        let read_only = cycle.mode() == CycleMode::ReadOnly;
        Self {
            processor,
            cycle,
            request: Arc::new(request),
            cancellation,
            depth: 0,
            in_transaction: false,
            read_only,
        }
    }

    /// Context for a message dispatched from within this one.
    pub(crate) fn child(&self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    /// This context, restricted to reads: it shares the cycle but never
    /// enlists participants and cannot dispatch commands or events.
    pub(crate) fn into_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Context of the handler running in the current async flow, if any.
    pub(crate) fn ambient() -> Option<Self> {
        AMBIENT.try_with(Clone::clone).ok()
    }

    /// Run `future` with this context as the ambient one.
    pub(crate) fn enter<F: Future>(self, future: F) -> impl Future<Output = F::Output> {
        AMBIENT.scope(self, future)
    }

    pub(crate) fn belongs_to(&self, processor: &Arc<ProcessorInner>) -> bool {
        Arc::ptr_eq(&self.processor, processor)
    }

    pub(crate) fn processor(&self) -> &Arc<ProcessorInner> {
        &self.processor
    }

    pub(crate) fn cycle(&self) -> &Arc<ProcessingCycle> {
        &self.cycle
    }

    /// Resolver bound to this context's cycle. Read-only contexts resolve
    /// without enlisting.
    pub(crate) fn resolver(&self) -> Resolver<'_> {
        let resolver = self.processor.container.resolver(Some(self.cycle.as_ref()));
        if self.read_only {
            resolver.without_enlistment()
        } else {
            resolver
        }
    }

    pub(crate) fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    /// Dispatch `message` within the current cycle.
    ///
    /// # Errors
    ///
    /// Any failure of the nested dispatch, unchanged. Returning it from the
    /// handler with `?` fails the enclosing dispatch with the same error.
    /// A query handler cannot publish: `ReadOnlyDispatch`.
    pub async fn publish<M: Message>(&self, message: M) -> Result<(), ProcessorError> {
        self.publish_envelope(MessageEnvelope::new(message)).await
    }

    /// Type-erased [`publish`](Self::publish).
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_envelope(&self, message: MessageEnvelope) -> Result<(), ProcessorError> {
        dispatch(self.child(), message, DispatchOrigin::Internal)
            .await
            .map(drop)
    }

    /// Run a query within the current cycle. The query sees this cycle's
    /// per-unit-of-work instances but enlists nothing.
    ///
    /// # Errors
    ///
    /// Any failure of the query dispatch.
    pub async fn execute<Q: Query>(&self, query: Q) -> Result<Q::Response, ProcessorError> {
        let reply = dispatch(self.child(), MessageEnvelope::new(query), DispatchOrigin::Internal).await?;
        query_response::<Q>(reply)
    }

    /// Resolve a dependency bound to this cycle.
    ///
    /// # Errors
    ///
    /// See [`Resolver::resolve`](crate::Resolver::resolve).
    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ResolveError> {
        self.resolver().resolve::<T>()
    }

    /// Enlist a participant for this cycle's flush. Returns `false` if it was
    /// already enlisted, the cycle does not accept enlistment, or this
    /// context is answering a query.
    pub fn enlist(&self, participant: Arc<dyn UnitOfWorkParticipant>) -> bool {
        !self.read_only && self.cycle.enlist(participant)
    }

    #[must_use]
    pub fn request(&self) -> &RequestContext {
        &self.request
    }

    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.request.principal.as_ref()
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn cycle_id(&self) -> Uuid {
        self.cycle.id()
    }

    #[must_use]
    pub fn cycle_state(&self) -> CycleState {
        self.cycle.state()
    }

    /// Current time according to the ambient clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        conduit_core::clock::utc_now()
    }

    /// Nesting level: `0` for the message that started the cycle.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether a transaction module has opened or joined a scope around this
    /// invocation.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Whether this context is answering a query.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("cycle_id", &self.cycle.id())
            .field("depth", &self.depth)
            .field("in_transaction", &self.in_transaction)
            .field("read_only", &self.read_only)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}
