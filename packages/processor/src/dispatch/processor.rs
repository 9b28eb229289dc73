//! The message processor: cycle management, handler dispatch, and the
//! builder that wires handlers, dependencies, and modules together.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conduit_core::{Message, MessageEnvelope, MessageKind, MessageType, Query, RequestContext};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, info_span, warn, Instrument};

use super::catalog::{CatalogEntry, HandlerCatalog};
use super::context::HandlerContext;
use super::handler::{
    ErasedHandler, GenericAdapter, GenericHandler, HandlerService, MessageHandler, QueryHandler,
    TypedHandler, TypedQueryHandler,
};
use super::invocation::{Invocation, Reply};
use super::registry::{
    AppliesTo, DispatchOrigin, GenericDefinition, HandlerDescriptor, HandlerKind, HandlerRegistry,
    RegistryBuilder, ResolveHandler,
};
use crate::config::ProcessorConfig;
use crate::error::{ConfigError, ProcessorError};
use crate::lifetime::{Container, ContainerBuilder, Disposable, LifetimeTag, Resolver};
use crate::middleware::{Collaborators, Module, ModulePipeline};
use crate::traits::{
    Authorizer, BusinessRuleFilter, ExceptionFilter, MessageValidator, TransactionScopeFactory,
};
use crate::unit_of_work::{CycleMode, CycleState, FlushCoordinator, ProcessingCycle, UnitOfWorkParticipant};

type DispatchFuture = Pin<Box<dyn Future<Output = Result<Option<Reply>, ProcessorError>> + Send>>;

// ---------------------------------------------------------------------------
// ProcessorInner
// ---------------------------------------------------------------------------

/// State shared by a processor and every context it hands out.
pub(crate) struct ProcessorInner {
    pub(crate) config: ProcessorConfig,
    pub(crate) container: Container,
    pub(crate) registry: HandlerRegistry,
    pub(crate) pipeline: ModulePipeline,
    pub(crate) exception_filter: Arc<dyn ExceptionFilter>,
}

impl ProcessorInner {
    /// Turn handler errors the exception filter recognizes into
    /// `CommandFailed`.
    fn classify(&self, err: ProcessorError) -> ProcessorError {
        match err {
            ProcessorError::Handler {
                message_type,
                source,
            } if self.config.convert_business_rule_violations
                && self.exception_filter.is_expected(&source) =>
            {
                ProcessorError::CommandFailed {
                    message_type,
                    source,
                }
            }
            other => other,
        }
    }
}

/// Dispatch `message` to its handlers within `ctx`'s cycle.
///
/// Returns the reply of the last handler invoked, or `None` for an event
/// nobody handles.
pub(crate) fn dispatch(
    ctx: HandlerContext,
    message: MessageEnvelope,
    origin: DispatchOrigin,
) -> DispatchFuture {
    Box::pin(async move {
        let inner = Arc::clone(ctx.processor());
        if ctx.depth() > inner.config.max_dispatch_depth {
            return Err(ProcessorError::DispatchDepthExceeded { depth: ctx.depth() });
        }

        let message_type = message.message_type();
        let kind = message.kind();
        let ctx = match kind {
            MessageKind::Query => ctx.into_read_only(),
            _ if ctx.is_read_only() => {
                return Err(ProcessorError::ReadOnlyDispatch {
                    message_type: message_type.name(),
                    kind,
                });
            }
            _ => ctx,
        };
        let cycle = Arc::clone(ctx.cycle());

        cycle.transition(CycleState::Resolving);
        let descriptors = inner.registry.handlers_for(&message_type, kind, origin);
        if descriptors.is_empty() {
            if kind == MessageKind::Event {
                debug!(message_type = message_type.short_name(), "no handlers for event");
                return Ok(None);
            }
            return Err(ProcessorError::HandlerNotFound {
                message_type: message_type.name(),
                kind,
            });
        }

        let mut reply = None;
        for descriptor in descriptors {
            if ctx.cancellation().is_cancelled() {
                return Err(ProcessorError::Cancelled);
            }
            cycle.transition(CycleState::Resolving);
            let handler = descriptor.resolve(&ctx.resolver())?;

            cycle.transition(CycleState::Invoking);
            let invocation = Invocation::new(message.copy(), descriptor.handler_name(), ctx.clone());
            let result = inner
                .pipeline
                .build(HandlerService::new(handler), kind)
                .oneshot(invocation)
                .await;
            reply = Some(result.map_err(|err| inner.classify(err))?);
        }
        Ok(reply)
    })
}

/// Extract a query's typed response from a dispatch reply.
pub(crate) fn query_response<Q: Query>(reply: Option<Reply>) -> Result<Q::Response, ProcessorError> {
    reply
        .and_then(Reply::into_inner::<Q::Response>)
        .ok_or_else(|| ProcessorError::UnexpectedReply {
            message_type: type_name::<Q>(),
        })
}

// ---------------------------------------------------------------------------
// DispatchOptions
// ---------------------------------------------------------------------------

/// Per-call inputs for an outermost dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Caller identity and correlation data visible to modules and handlers.
    pub request: RequestContext,
    /// Checked before each handler is resolved and raced against each
    /// handler. Not observed once flushing has started.
    pub cancellation: CancellationToken,
}

impl DispatchOptions {
    #[must_use]
    pub fn for_request(request: RequestContext) -> Self {
        Self {
            request,
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

// ---------------------------------------------------------------------------
// MessageProcessor
// ---------------------------------------------------------------------------

/// Entry point for processing messages.
///
/// Each outermost [`handle`](Self::handle) starts a processing cycle:
/// handlers run, messages they publish are dispatched depth-first in the
/// same cycle, and the enlisted participants are flushed once when
/// everything succeeded. Calling `handle` from inside a handler of the same
/// processor joins the running cycle instead.
#[derive(Clone)]
pub struct MessageProcessor {
    inner: Arc<ProcessorInner>,
}

impl MessageProcessor {
    #[must_use]
    pub fn builder(config: ProcessorConfig) -> ProcessorBuilder {
        ProcessorBuilder::new(config)
    }

    /// Process a command or event with default options.
    ///
    /// # Errors
    ///
    /// See [`handle_with`](Self::handle_with).
    pub async fn handle<M: Message>(&self, message: M) -> Result<(), ProcessorError> {
        self.handle_envelope(MessageEnvelope::new(message), DispatchOptions::default())
            .await
    }

    /// Process a command or event.
    ///
    /// # Errors
    ///
    /// The first handler, module, or flush failure. Nothing is flushed when
    /// any handler fails.
    pub async fn handle_with<M: Message>(
        &self,
        message: M,
        options: DispatchOptions,
    ) -> Result<(), ProcessorError> {
        self.handle_envelope(MessageEnvelope::new(message), options).await
    }

    /// Type-erased [`handle_with`](Self::handle_with). Inside a command or
    /// event handler of this processor, joins that handler's cycle and
    /// ignores `options`. Inside a query handler, starts a cycle of its own.
    ///
    /// # Errors
    ///
    /// See [`handle_with`](Self::handle_with).
    pub async fn handle_envelope(
        &self,
        message: MessageEnvelope,
        options: DispatchOptions,
    ) -> Result<(), ProcessorError> {
        if let Some(ambient) = self.writable_ambient() {
            return dispatch(ambient.child(), message, DispatchOrigin::Internal)
                .await
                .map(drop);
        }
        self.run_cycle(message, options, CycleMode::ReadWrite)
            .await
            .map(drop)
    }

    /// Process a command or event in a new cycle of its own, even when
    /// called from inside a handler.
    ///
    /// # Errors
    ///
    /// See [`handle_with`](Self::handle_with).
    pub async fn handle_isolated<M: Message>(
        &self,
        message: M,
        options: DispatchOptions,
    ) -> Result<(), ProcessorError> {
        self.run_cycle(MessageEnvelope::new(message), options, CycleMode::ReadWrite)
            .await
            .map(drop)
    }

    /// Answer a query with default options.
    ///
    /// # Errors
    ///
    /// See [`execute_with`](Self::execute_with).
    pub async fn execute<Q: Query>(&self, query: Q) -> Result<Q::Response, ProcessorError> {
        self.execute_with(query, DispatchOptions::default()).await
    }

    /// Answer a query in a read-only cycle: participants are not enlisted and
    /// nothing is flushed. Inside a handler of this processor, runs in the
    /// handler's cycle, still without enlisting.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound` without a query handler, otherwise the first module
    /// or handler failure.
    pub async fn execute_with<Q: Query>(
        &self,
        query: Q,
        options: DispatchOptions,
    ) -> Result<Q::Response, ProcessorError> {
        let message = MessageEnvelope::new(query);
        let reply = match HandlerContext::ambient().filter(|ctx| ctx.belongs_to(&self.inner)) {
            Some(ambient) => dispatch(ambient.child(), message, DispatchOrigin::Internal).await?,
            None => self.run_cycle(message, options, CycleMode::ReadOnly).await?,
        };
        query_response::<Q>(reply)
    }

    /// Dispose every constructed singleton, in reverse registration order.
    pub fn shutdown(&self) {
        let disposed = self.inner.container.singleton_count();
        self.inner.container.dispose_singletons();
        info!(singletons = disposed, "message processor shut down");
    }

    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    /// Names of the modules wrapping every handler, outermost first.
    #[must_use]
    pub fn modules(&self) -> Vec<&str> {
        self.inner.pipeline.module_names()
    }

    /// Root context of a fresh cycle, outside any dispatch.
    pub(crate) fn root_context(&self, mode: CycleMode, options: DispatchOptions) -> HandlerContext {
        HandlerContext::root(
            Arc::clone(&self.inner),
            Arc::new(ProcessingCycle::new(mode)),
            options.request,
            options.cancellation,
        )
    }

    fn writable_ambient(&self) -> Option<HandlerContext> {
        HandlerContext::ambient().filter(|ctx| ctx.belongs_to(&self.inner) && !ctx.is_read_only())
    }

    async fn run_cycle(
        &self,
        message: MessageEnvelope,
        options: DispatchOptions,
        mode: CycleMode,
    ) -> Result<Option<Reply>, ProcessorError> {
        let ctx = self.root_context(mode, options);
        let cycle = Arc::clone(ctx.cycle());
        let span = info_span!(
            "cycle",
            cycle_id = %cycle.id(),
            message = message.message_type().short_name(),
        );

        async move {
            let result = match dispatch(ctx, message, DispatchOrigin::External).await {
                Ok(reply) if mode == CycleMode::ReadWrite => flush(&cycle).await.map(|()| reply),
                other => other,
            };
            if let Err(err) = &result {
                warn!(error = %err, category = ?err.category(), "processing cycle failed");
            }
            cycle.end();
            result
        }
        .instrument(span)
        .await
    }
}

async fn flush(cycle: &ProcessingCycle) -> Result<(), ProcessorError> {
    cycle.transition(CycleState::Flushing);
    let participants = cycle.take_enlisted();
    if participants.is_empty() {
        return Ok(());
    }
    let report = FlushCoordinator::new(participants).run().await?;
    debug!(
        flushed = report.flushed,
        skipped = report.skipped,
        groups = report.groups,
        "cycle flushed"
    );
    Ok(())
}

impl fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("registry", &self.inner.registry)
            .field("modules", &self.inner.pipeline.module_names())
            .field("container", &self.inner.container)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ProcessorBuilder
// ---------------------------------------------------------------------------

/// Collects dependencies, handler routes, modules, and collaborators.
///
/// Handlers are container registrations: the `*_handler` methods register
/// the handler type and route a message to it, the `route_*` methods route
/// to a handler type registered earlier.
pub struct ProcessorBuilder {
    config: ProcessorConfig,
    container: ContainerBuilder,
    registry: RegistryBuilder,
    collaborators: Collaborators,
    custom_modules: HashMap<String, Arc<dyn Module>>,
    exception_filter: Arc<dyn ExceptionFilter>,
}

impl ProcessorBuilder {
    #[must_use]
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            container: ContainerBuilder::new(),
            registry: RegistryBuilder::default(),
            collaborators: Collaborators::default(),
            custom_modules: HashMap::new(),
            exception_filter: Arc::new(BusinessRuleFilter),
        }
    }

    /// Direct access to the dependency registrations.
    pub fn container(&mut self) -> &mut ContainerBuilder {
        &mut self.container
    }

    // -- dependencies -------------------------------------------------------

    /// # Errors
    ///
    /// See [`ContainerBuilder::register`].
    pub fn register<T, F>(
        &mut self,
        lifetime: impl Into<LifetimeTag>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        T: std::any::Any + Send + Sync,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.container.register::<T, F>(lifetime, factory)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// See [`ContainerBuilder::register_disposable`].
    pub fn register_disposable<T, F>(
        &mut self,
        lifetime: impl Into<LifetimeTag>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        T: Disposable + std::any::Any,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.container.register_disposable::<T, F>(lifetime, factory)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// See [`ContainerBuilder::register_participant`].
    pub fn register_participant<T, F>(
        &mut self,
        lifetime: impl Into<LifetimeTag>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        T: UnitOfWorkParticipant + std::any::Any,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.container.register_participant::<T, F>(lifetime, factory)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// See [`ContainerBuilder::register_instance`].
    pub fn register_instance<T: std::any::Any + Send + Sync>(
        &mut self,
        instance: Arc<T>,
    ) -> Result<&mut Self, ConfigError> {
        self.container.register_instance(instance)?;
        Ok(self)
    }

    // -- handlers -----------------------------------------------------------

    /// Register `H` and route command `M` to it.
    ///
    /// # Errors
    ///
    /// Registration errors for `H`, `KindMismatch` if `M` is not a command,
    /// `DuplicateCommandHandler` if `M` already has a handler.
    pub fn command_handler<M, H, F>(
        &mut self,
        lifetime: impl Into<LifetimeTag>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        M: Message,
        H: MessageHandler<M>,
        F: Fn(&Resolver<'_>) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        self.container.register::<H, F>(lifetime, factory)?;
        self.route_command::<M, H>()
    }

    /// Register `H` and route event `M` to it for publications during
    /// processing only.
    ///
    /// # Errors
    ///
    /// Registration errors for `H`, `KindMismatch` if `M` is not an event.
    pub fn event_handler<M, H, F>(
        &mut self,
        lifetime: impl Into<LifetimeTag>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        M: Message,
        H: MessageHandler<M>,
        F: Fn(&Resolver<'_>) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        self.container.register::<H, F>(lifetime, factory)?;
        self.route_event::<M, H>()
    }

    /// Like [`event_handler`](Self::event_handler), but also reachable when
    /// the event is handed to the processor from outside.
    ///
    /// # Errors
    ///
    /// See [`event_handler`](Self::event_handler).
    pub fn external_event_handler<M, H, F>(
        &mut self,
        lifetime: impl Into<LifetimeTag>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        M: Message,
        H: MessageHandler<M>,
        F: Fn(&Resolver<'_>) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        self.container.register::<H, F>(lifetime, factory)?;
        self.route_external_event::<M, H>()
    }

    /// Register `H` and route query `Q` to it.
    ///
    /// # Errors
    ///
    /// Registration errors for `H`, `KindMismatch` if `Q` is not a query,
    /// `DuplicateQueryHandler` if `Q` already has a handler.
    pub fn query_handler<Q, H, F>(
        &mut self,
        lifetime: impl Into<LifetimeTag>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        Q: Query,
        H: QueryHandler<Q>,
        F: Fn(&Resolver<'_>) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        self.container.register::<H, F>(lifetime, factory)?;
        self.route_query::<Q, H>()
    }

    /// Route command `M` to the registered handler type `H`.
    ///
    /// # Errors
    ///
    /// `UnregisteredHandler` if `H` is not registered, otherwise see
    /// [`command_handler`](Self::command_handler).
    pub fn route_command<M: Message, H: MessageHandler<M>>(&mut self) -> Result<&mut Self, ConfigError> {
        expect_kind::<M>(MessageKind::Command)?;
        self.route_typed::<M, H>(HandlerKind::External)
    }

    /// # Errors
    ///
    /// See [`route_command`](Self::route_command).
    pub fn route_event<M: Message, H: MessageHandler<M>>(&mut self) -> Result<&mut Self, ConfigError> {
        expect_kind::<M>(MessageKind::Event)?;
        self.route_typed::<M, H>(HandlerKind::Internal)
    }

    /// # Errors
    ///
    /// See [`route_command`](Self::route_command).
    pub fn route_external_event<M: Message, H: MessageHandler<M>>(
        &mut self,
    ) -> Result<&mut Self, ConfigError> {
        expect_kind::<M>(MessageKind::Event)?;
        self.route_typed::<M, H>(HandlerKind::External)
    }

    /// # Errors
    ///
    /// See [`route_command`](Self::route_command).
    pub fn route_query<Q: Query, H: QueryHandler<Q>>(&mut self) -> Result<&mut Self, ConfigError> {
        expect_kind::<Q>(MessageKind::Query)?;
        let resolve: ResolveHandler = Arc::new(|resolver: &Resolver<'_>| {
            let handler = resolver.resolve::<H>()?;
            Ok(Arc::new(TypedQueryHandler::<Q, H>::new(handler)) as Arc<dyn ErasedHandler>)
        });
        self.route::<Q, H>(HandlerKind::External, resolve)
    }

    /// Route every declared message of `kind` that `applies_to` accepts to
    /// the registered handler type `H`. Command definitions are reachable
    /// from outside; event definitions only from publications.
    ///
    /// # Errors
    ///
    /// `UnregisteredHandler` if `H` is not registered, `KindMismatch` for
    /// [`MessageKind::Query`], which needs an exact handler.
    pub fn generic_handler<H, A>(&mut self, kind: MessageKind, applies_to: A) -> Result<&mut Self, ConfigError>
    where
        H: GenericHandler,
        A: Fn(&MessageType) -> bool + Send + Sync + 'static,
    {
        let handler_kind = generic_handler_kind::<H>(kind)?;
        let lifetime = self.registered_lifetime::<H>()?;
        let applies_to: AppliesTo = Arc::new(applies_to);
        self.registry.add_generic(GenericDefinition {
            kind,
            handler_name: type_name::<H>(),
            handler_kind,
            lifetime,
            applies_to,
            resolve: generic_resolver::<H>(),
        });
        Ok(self)
    }

    /// Route every message of `kind` that nothing else handles to the
    /// registered handler type `H`.
    ///
    /// # Errors
    ///
    /// See [`generic_handler`](Self::generic_handler).
    pub fn fallback_handler<H: GenericHandler>(&mut self, kind: MessageKind) -> Result<&mut Self, ConfigError> {
        let handler_kind = generic_handler_kind::<H>(kind)?;
        let lifetime = self.registered_lifetime::<H>()?;
        self.registry.add_fallback(HandlerDescriptor::new(
            None,
            kind,
            type_name::<H>(),
            handler_kind,
            lifetime,
            generic_resolver::<H>(),
        ));
        Ok(self)
    }

    /// Make `M` known to generic definitions without routing it.
    pub fn declare_message<M: Message>(&mut self) -> &mut Self {
        self.registry.declare(MessageType::of::<M>(), M::KIND);
        self
    }

    /// Apply every catalog entry `filter` accepts, in catalog order.
    ///
    /// # Errors
    ///
    /// The first failing entry's registration error.
    pub fn install<P>(&mut self, catalog: &HandlerCatalog, filter: P) -> Result<&mut Self, ConfigError>
    where
        P: Fn(&CatalogEntry) -> bool,
    {
        for entry in catalog.entries().iter().filter(|entry| filter(entry)) {
            entry.install(self)?;
            debug!(
                handler = entry.handler_name(),
                message_type = entry.message_type().short_name(),
                "installed catalog entry"
            );
        }
        Ok(self)
    }

    // -- collaborators ------------------------------------------------------

    /// Validator for the validation module. Defaults to the message's own
    /// `validate`.
    pub fn validator(&mut self, validator: impl MessageValidator + 'static) -> &mut Self {
        self.collaborators.validator = Some(Arc::new(validator));
        self
    }

    /// Authorizer for the authorization module. Required when that module is
    /// configured.
    pub fn authorizer(&mut self, authorizer: impl Authorizer + 'static) -> &mut Self {
        self.collaborators.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Transaction scope factory. Required when the transaction module is
    /// configured.
    pub fn transaction_factory(&mut self, factory: impl TransactionScopeFactory + 'static) -> &mut Self {
        self.collaborators.transaction_factory = Some(Arc::new(factory));
        self
    }

    /// Clock installed by the clock module. Without one, the module freezes
    /// the ambient time at the start of each invocation.
    pub fn clock(&mut self, clock: Arc<dyn conduit_core::Clock>) -> &mut Self {
        self.collaborators.clock = Some(clock);
        self
    }

    pub fn exception_filter(&mut self, filter: impl ExceptionFilter + 'static) -> &mut Self {
        self.exception_filter = Arc::new(filter);
        self
    }

    /// Make a custom module available under its name for `ModuleKind::Custom`.
    ///
    /// # Errors
    ///
    /// `DuplicateModule` if a module with that name was already added.
    pub fn module(&mut self, module: impl Module + 'static) -> Result<&mut Self, ConfigError> {
        let name = module.name().to_string();
        if self.custom_modules.contains_key(&name) {
            return Err(ConfigError::DuplicateModule { name });
        }
        self.custom_modules.insert(name, Arc::new(module));
        Ok(self)
    }

    /// Freeze the configuration and build the processor.
    ///
    /// # Errors
    ///
    /// Invalid configuration, an unknown custom module, or a configured
    /// module without its collaborator.
    pub fn build(self) -> Result<MessageProcessor, ConfigError> {
        self.config.validate()?;
        let pipeline =
            ModulePipeline::from_config(&self.config, &self.collaborators, &self.custom_modules)?;
        let registry = self.registry.build();
        let container = self.container.build();

        info!(
            modules = ?pipeline.module_names(),
            handlers = registry.descriptors().count(),
            "message processor built"
        );

        Ok(MessageProcessor {
            inner: Arc::new(ProcessorInner {
                config: self.config,
                container,
                registry,
                pipeline,
                exception_filter: self.exception_filter,
            }),
        })
    }

    fn route_typed<M: Message, H: MessageHandler<M>>(
        &mut self,
        handler_kind: HandlerKind,
    ) -> Result<&mut Self, ConfigError> {
        let resolve: ResolveHandler = Arc::new(|resolver: &Resolver<'_>| {
            let handler = resolver.resolve::<H>()?;
            Ok(Arc::new(TypedHandler::<M, H>::new(handler)) as Arc<dyn ErasedHandler>)
        });
        self.route::<M, H>(handler_kind, resolve)
    }

    fn route<M: Message, H: 'static>(
        &mut self,
        handler_kind: HandlerKind,
        resolve: ResolveHandler,
    ) -> Result<&mut Self, ConfigError> {
        let lifetime = self.registered_lifetime::<H>()?;
        self.registry.add_exact(HandlerDescriptor::new(
            Some(MessageType::of::<M>()),
            M::KIND,
            type_name::<H>(),
            handler_kind,
            lifetime,
            resolve,
        ))?;
        Ok(self)
    }

    fn registered_lifetime<H: 'static>(&self) -> Result<crate::lifetime::Lifetime, ConfigError> {
        self.container
            .lifetime_of::<H>()
            .ok_or(ConfigError::UnregisteredHandler {
                handler: type_name::<H>(),
            })
    }
}

impl fmt::Debug for ProcessorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorBuilder")
            .field("config", &self.config)
            .field("custom_modules", &self.custom_modules.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn expect_kind<M: Message>(expected: MessageKind) -> Result<(), ConfigError> {
    if M::KIND == expected {
        Ok(())
    } else {
        Err(ConfigError::KindMismatch {
            message_type: type_name::<M>(),
            expected,
            actual: M::KIND,
        })
    }
}

fn generic_handler_kind<H>(kind: MessageKind) -> Result<HandlerKind, ConfigError> {
    match kind {
        MessageKind::Command => Ok(HandlerKind::External),
        MessageKind::Event => Ok(HandlerKind::Internal),
        MessageKind::Query => Err(ConfigError::KindMismatch {
            message_type: type_name::<H>(),
            expected: MessageKind::Command,
            actual: MessageKind::Query,
        }),
    }
}

fn generic_resolver<H: GenericHandler>() -> ResolveHandler {
    Arc::new(|resolver: &Resolver<'_>| {
        let handler = resolver.resolve::<H>()?;
        Ok(Arc::new(GenericAdapter::new(handler)) as Arc<dyn ErasedHandler>)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use conduit_core::{
        clock, impl_message, BusinessRuleViolation, FixedClock, Principal, ValidationErrorTree,
        ValidationResult,
    };
    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::*;
    use crate::config::ModuleKind;
    use crate::error::{ErrorCategory, ResolveError};
    use crate::lifetime::Lifetime;
    use crate::traits::RoleAuthorizer;

    // -- messages -----------------------------------------------------------

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct AddItem {
        cart_id: u64,
        sku: String,
        quantity: u32,
    }

    impl Message for AddItem {
        const KIND: MessageKind = MessageKind::Command;

        fn validate(&self) -> ValidationResult {
            let mut errors = ValidationErrorTree::new();
            if self.quantity == 0 {
                errors.member("quantity").add_error("must be positive");
            }
            ValidationResult::from_tree(errors)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct ItemAdded {
        cart_id: u64,
        sku: String,
    }
    impl_message!(ItemAdded => Event);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct CartTotal {
        cart_id: u64,
    }
    impl_message!(CartTotal => Query<usize>);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Checkout {
        cart_id: u64,
    }
    impl_message!(Checkout => Command);

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct ClearCart;
    impl_message!(ClearCart => Command);

    // -- collaborators ------------------------------------------------------

    /// Ordered record of everything the handlers and participants did.
    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    struct CartRepository {
        label: &'static str,
        journal: Arc<Journal>,
        pending: Mutex<Vec<String>>,
    }

    impl CartRepository {
        fn new(label: &'static str, journal: Arc<Journal>) -> Self {
            Self {
                label,
                journal,
                pending: Mutex::new(Vec::new()),
            }
        }

        fn stage(&self, sku: &str) {
            self.pending.lock().push(sku.to_string());
        }
    }

    #[async_trait]
    impl UnitOfWorkParticipant for CartRepository {
        fn name(&self) -> &str {
            self.label
        }

        fn requires_flush(&self) -> bool {
            !self.pending.lock().is_empty()
        }

        async fn flush(&self) -> anyhow::Result<()> {
            let pending = std::mem::take(&mut *self.pending.lock());
            self.journal.push(format!("flush {} {}", self.label, pending.join(",")));
            Ok(())
        }
    }

    /// Second participant type, for flush ordering.
    struct AuditLog(CartRepository);

    #[async_trait]
    impl UnitOfWorkParticipant for AuditLog {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn requires_flush(&self) -> bool {
            self.0.requires_flush()
        }

        async fn flush(&self) -> anyhow::Result<()> {
            self.0.flush().await
        }
    }

    // -- handlers -----------------------------------------------------------

    struct AddItemHandler {
        repository: Arc<CartRepository>,
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl MessageHandler<AddItem> for AddItemHandler {
        async fn handle(&self, message: AddItem, ctx: &HandlerContext) -> anyhow::Result<()> {
            self.journal.push(format!("handle AddItem {}", message.sku));
            self.repository.stage(&message.sku);
            ctx.publish(ItemAdded {
                cart_id: message.cart_id,
                sku: message.sku,
            })
            .await?;
            self.journal.push("AddItem done");
            Ok(())
        }
    }

    struct ItemAddedHandler {
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl MessageHandler<ItemAdded> for ItemAddedHandler {
        async fn handle(&self, message: ItemAdded, ctx: &HandlerContext) -> anyhow::Result<()> {
            self.journal
                .push(format!("handle ItemAdded {} depth {}", message.sku, ctx.depth()));
            Ok(())
        }
    }

    struct CartTotalHandler {
        repository: Arc<CartRepository>,
    }

    #[async_trait]
    impl QueryHandler<CartTotal> for CartTotalHandler {
        async fn execute(&self, _query: CartTotal, _ctx: &HandlerContext) -> anyhow::Result<usize> {
            self.repository.stage("peeked");
            Ok(self.repository.pending.lock().len())
        }
    }

    fn bare_config() -> ProcessorConfig {
        ProcessorConfig {
            modules: Vec::new(),
            ..ProcessorConfig::default()
        }
    }

    /// Cart processor: `AddItem` stages into a per-unit-of-work repository
    /// and publishes `ItemAdded`.
    fn cart_builder(config: ProcessorConfig, journal: &Arc<Journal>) -> ProcessorBuilder {
        let mut builder = MessageProcessor::builder(config);
        builder.register_instance(Arc::clone(journal)).unwrap();
        builder
            .register_participant::<CartRepository, _>(Lifetime::PerUnitOfWork, |r: &Resolver<'_>| {
                Ok(CartRepository::new("cart", r.resolve::<Journal>()?))
            })
            .unwrap()
            .command_handler::<AddItem, AddItemHandler, _>(Lifetime::PerResolve, |r: &Resolver<'_>| {
                Ok(AddItemHandler {
                    repository: r.resolve()?,
                    journal: r.resolve()?,
                })
            })
            .unwrap()
            .event_handler::<ItemAdded, ItemAddedHandler, _>(Lifetime::Singleton, |r: &Resolver<'_>| {
                Ok(ItemAddedHandler { journal: r.resolve()? })
            })
            .unwrap();
        builder
    }

    fn add_item(sku: &str) -> AddItem {
        AddItem {
            cart_id: 1,
            sku: sku.to_string(),
            quantity: 1,
        }
    }

    // -- scenarios ----------------------------------------------------------

    #[tokio::test]
    async fn command_with_unit_of_work_repository_flushes_once() {
        let journal = Arc::new(Journal::default());
        let processor = cart_builder(bare_config(), &journal).build().unwrap();

        processor.handle(add_item("apple")).await.unwrap();

        let flushes = journal
            .entries()
            .into_iter()
            .filter(|entry| entry.starts_with("flush"))
            .collect::<Vec<_>>();
        assert_eq!(flushes, vec!["flush cart apple"]);
    }

    #[tokio::test]
    async fn invalid_message_never_reaches_handler() {
        let journal = Arc::new(Journal::default());
        let config = ProcessorConfig {
            modules: vec![ModuleKind::Validation],
            ..ProcessorConfig::default()
        };
        let processor = cart_builder(config, &journal).build().unwrap();

        let err = processor
            .handle(AddItem {
                quantity: 0,
                ..add_item("apple")
            })
            .await
            .unwrap_err();

        match err {
            ProcessorError::InvalidMessage { errors, .. } => {
                let flat = errors.flatten();
                assert_eq!(flat.len(), 1);
                assert_eq!(flat[0].0, "quantity");
            }
            other => panic!("expected InvalidMessage, got {other:?}"),
        }
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    async fn published_event_runs_before_handler_continues_and_before_flush() {
        let journal = Arc::new(Journal::default());
        let processor = cart_builder(bare_config(), &journal).build().unwrap();

        processor.handle(add_item("pear")).await.unwrap();

        assert_eq!(
            journal.entries(),
            vec![
                "handle AddItem pear",
                "handle ItemAdded pear depth 1",
                "AddItem done",
                "flush cart pear",
            ]
        );
    }

    #[tokio::test]
    async fn clock_module_pins_time_for_the_handler() {
        struct StampHandler {
            seen: Arc<Mutex<Vec<chrono::DateTime<Utc>>>>,
        }

        #[async_trait]
        impl MessageHandler<Checkout> for StampHandler {
            async fn handle(&self, _message: Checkout, ctx: &HandlerContext) -> anyhow::Result<()> {
                self.seen.lock().push(ctx.now());
                tokio::task::yield_now().await;
                self.seen.lock().push(clock::utc_now());
                Ok(())
            }
        }

        let pinned = Utc.with_ymd_and_hms(2024, 2, 29, 8, 30, 0).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&seen);
        let mut builder = MessageProcessor::builder(ProcessorConfig {
            modules: vec![ModuleKind::Clock],
            ..ProcessorConfig::default()
        });
        builder
            .clock(Arc::new(FixedClock::at(pinned)))
            .command_handler::<Checkout, StampHandler, _>(Lifetime::Singleton, move |_: &Resolver<'_>| {
                Ok(StampHandler {
                    seen: Arc::clone(&shared),
                })
            })
            .unwrap();
        let processor = builder.build().unwrap();

        processor.handle(Checkout { cart_id: 1 }).await.unwrap();

        assert_eq!(*seen.lock(), vec![pinned, pinned]);
        assert_ne!(clock::utc_now(), pinned);
    }

    #[tokio::test]
    async fn ungrouped_participants_flush_in_enlistment_order() {
        struct TwoRepositories {
            first: Arc<AuditLog>,
            second: Arc<CartRepository>,
        }

        #[async_trait]
        impl MessageHandler<Checkout> for TwoRepositories {
            async fn handle(&self, _message: Checkout, _ctx: &HandlerContext) -> anyhow::Result<()> {
                self.first.0.stage("audit");
                self.second.stage("order");
                Ok(())
            }
        }

        let journal = Arc::new(Journal::default());
        let mut builder = MessageProcessor::builder(bare_config());
        builder
            .register_instance(Arc::clone(&journal))
            .unwrap()
            .register_participant::<AuditLog, _>(Lifetime::PerUnitOfWork, |r: &Resolver<'_>| {
                Ok(AuditLog(CartRepository::new("r1", r.resolve()?)))
            })
            .unwrap()
            .register_participant::<CartRepository, _>(Lifetime::PerUnitOfWork, |r: &Resolver<'_>| {
                Ok(CartRepository::new("r2", r.resolve()?))
            })
            .unwrap()
            .command_handler::<Checkout, TwoRepositories, _>(Lifetime::PerResolve, |r: &Resolver<'_>| {
                Ok(TwoRepositories {
                    first: r.resolve()?,
                    second: r.resolve()?,
                })
            })
            .unwrap();
        let processor = builder.build().unwrap();

        processor.handle(Checkout { cart_id: 9 }).await.unwrap();

        assert_eq!(journal.entries(), vec!["flush r1 audit", "flush r2 order"]);
    }

    // -- routing ------------------------------------------------------------

    #[tokio::test]
    async fn command_without_handler_is_not_found() {
        let journal = Arc::new(Journal::default());
        let processor = cart_builder(bare_config(), &journal).build().unwrap();

        let err = processor.handle(Checkout { cart_id: 1 }).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::HandlerNotFound {
                kind: MessageKind::Command,
                ..
            }
        ));
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[tokio::test]
    async fn event_without_handler_completes() {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        struct CartAbandoned;
        impl_message!(CartAbandoned => Event);

        let journal = Arc::new(Journal::default());
        let processor = cart_builder(bare_config(), &journal).build().unwrap();

        processor.handle(CartAbandoned).await.unwrap();
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    async fn internal_event_handlers_are_invisible_from_outside() {
        struct Notifier {
            journal: Arc<Journal>,
        }

        #[async_trait]
        impl MessageHandler<ItemAdded> for Notifier {
            async fn handle(&self, message: ItemAdded, _ctx: &HandlerContext) -> anyhow::Result<()> {
                self.journal.push(format!("notify {}", message.sku));
                Ok(())
            }
        }

        let journal = Arc::new(Journal::default());
        let mut builder = cart_builder(bare_config(), &journal);
        builder
            .external_event_handler::<ItemAdded, Notifier, _>(Lifetime::Singleton, |r: &Resolver<'_>| {
                Ok(Notifier { journal: r.resolve()? })
            })
            .unwrap();
        let processor = builder.build().unwrap();

        processor
            .handle(ItemAdded {
                cart_id: 1,
                sku: "kiwi".into(),
            })
            .await
            .unwrap();
        assert_eq!(journal.entries(), vec!["notify kiwi"]);

        processor.handle(add_item("plum")).await.unwrap();
        assert_eq!(
            journal.entries()[1..4],
            ["handle AddItem plum", "handle ItemAdded plum depth 1", "notify plum"]
        );
    }

    #[tokio::test]
    async fn generic_and_fallback_handlers() {
        struct Tracer {
            journal: Arc<Journal>,
        }

        #[async_trait]
        impl GenericHandler for Tracer {
            async fn handle(&self, message: MessageEnvelope, _ctx: &HandlerContext) -> anyhow::Result<()> {
                self.journal.push(format!("trace {}", message.message_type().short_name()));
                Ok(())
            }
        }

        struct Unrouted {
            journal: Arc<Journal>,
        }

        #[async_trait]
        impl GenericHandler for Unrouted {
            async fn handle(&self, message: MessageEnvelope, _ctx: &HandlerContext) -> anyhow::Result<()> {
                self.journal.push(format!("unrouted {}", message.message_type().short_name()));
                Ok(())
            }
        }

        let journal = Arc::new(Journal::default());
        let mut builder = cart_builder(bare_config(), &journal);
        builder
            .register::<Tracer, _>(Lifetime::Singleton, |r: &Resolver<'_>| {
                Ok(Tracer { journal: r.resolve()? })
            })
            .unwrap()
            .register::<Unrouted, _>(Lifetime::Singleton, |r: &Resolver<'_>| {
                Ok(Unrouted { journal: r.resolve()? })
            })
            .unwrap()
            .declare_message::<ClearCart>()
            .generic_handler::<Tracer, _>(MessageKind::Event, |_: &MessageType| true)
            .unwrap()
            .fallback_handler::<Unrouted>(MessageKind::Command)
            .unwrap();
        let processor = builder.build().unwrap();

        processor.handle(add_item("fig")).await.unwrap();
        processor.handle(ClearCart).await.unwrap();

        assert_eq!(
            journal.entries(),
            vec![
                "handle AddItem fig",
                "handle ItemAdded fig depth 1",
                "trace ItemAdded",
                "AddItem done",
                "flush cart fig",
                "unrouted ClearCart",
            ]
        );
    }

    #[tokio::test]
    async fn recursive_publication_is_bounded() {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        struct Echoed(u32);
        impl_message!(Echoed => Event);

        struct Echo;

        #[async_trait]
        impl MessageHandler<Echoed> for Echo {
            async fn handle(&self, message: Echoed, ctx: &HandlerContext) -> anyhow::Result<()> {
                ctx.publish(Echoed(message.0 + 1)).await?;
                Ok(())
            }
        }

        let mut builder = MessageProcessor::builder(ProcessorConfig {
            max_dispatch_depth: 3,
            ..bare_config()
        });
        builder
            .external_event_handler::<Echoed, Echo, _>(Lifetime::Singleton, |_: &Resolver<'_>| Ok(Echo))
            .unwrap();
        let processor = builder.build().unwrap();

        let err = processor.handle(Echoed(0)).await.unwrap_err();
        assert!(matches!(err, ProcessorError::DispatchDepthExceeded { depth: 4 }));
    }

    // -- lifetimes ----------------------------------------------------------

    type Observed = (Uuid, Arc<CartRepository>, Arc<Journal>);

    struct Probe {
        seen: Arc<Mutex<Vec<Observed>>>,
    }

    #[async_trait]
    impl MessageHandler<Checkout> for Probe {
        async fn handle(&self, _message: Checkout, ctx: &HandlerContext) -> anyhow::Result<()> {
            let first = ctx.resolve::<CartRepository>()?;
            let again = ctx.resolve::<CartRepository>()?;
            anyhow::ensure!(Arc::ptr_eq(&first, &again), "unit-of-work instance not reused");
            let singleton = ctx.resolve::<Journal>()?;
            self.seen.lock().push((ctx.cycle_id(), first, singleton));
            Ok(())
        }
    }

    #[tokio::test]
    async fn unit_of_work_instances_are_per_cycle_and_singletons_shared() {
        let journal = Arc::new(Journal::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&seen);
        let mut builder = cart_builder(bare_config(), &journal);
        builder
            .command_handler::<Checkout, Probe, _>(Lifetime::PerResolve, move |_: &Resolver<'_>| {
                Ok(Probe {
                    seen: Arc::clone(&shared),
                })
            })
            .unwrap();
        let processor = builder.build().unwrap();

        processor.handle(Checkout { cart_id: 1 }).await.unwrap();
        processor.handle(Checkout { cart_id: 1 }).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].0, seen[1].0);
        assert!(!Arc::ptr_eq(&seen[0].1, &seen[1].1));
        assert!(Arc::ptr_eq(&seen[0].2, &seen[1].2));
        assert!(Arc::ptr_eq(&seen[0].2, &journal));
    }

    #[tokio::test]
    async fn shutdown_disposes_singletons() {
        struct Pool(Arc<AtomicBool>);

        impl Disposable for Pool {
            fn dispose(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        struct UsesPool(Arc<Pool>);

        #[async_trait]
        impl MessageHandler<Checkout> for UsesPool {
            async fn handle(&self, _message: Checkout, _ctx: &HandlerContext) -> anyhow::Result<()> {
                anyhow::ensure!(!self.0 .0.load(Ordering::SeqCst), "pool already disposed");
                Ok(())
            }
        }

        let disposed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disposed);
        let mut builder = MessageProcessor::builder(bare_config());
        builder
            .register_disposable::<Pool, _>(Lifetime::Singleton, move |_: &Resolver<'_>| {
                Ok(Pool(Arc::clone(&flag)))
            })
            .unwrap()
            .command_handler::<Checkout, UsesPool, _>(Lifetime::PerResolve, |r: &Resolver<'_>| {
                Ok(UsesPool(r.resolve()?))
            })
            .unwrap();
        let processor = builder.build().unwrap();

        processor.handle(Checkout { cart_id: 1 }).await.unwrap();
        assert!(!disposed.load(Ordering::SeqCst));

        processor.shutdown();
        assert!(disposed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unit_of_work_dependency_of_singleton_is_rejected() {
        struct Cached(#[allow(dead_code)] Arc<CartRepository>);

        struct UsesCached(#[allow(dead_code)] Arc<Cached>);

        #[async_trait]
        impl MessageHandler<Checkout> for UsesCached {
            async fn handle(&self, _message: Checkout, _ctx: &HandlerContext) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let journal = Arc::new(Journal::default());
        let mut builder = cart_builder(bare_config(), &journal);
        builder
            .register::<Cached, _>(Lifetime::Singleton, |r: &Resolver<'_>| Ok(Cached(r.resolve()?)))
            .unwrap()
            .command_handler::<Checkout, UsesCached, _>(Lifetime::PerResolve, |r: &Resolver<'_>| {
                Ok(UsesCached(r.resolve()?))
            })
            .unwrap();
        let processor = builder.build().unwrap();

        let err = processor.handle(Checkout { cart_id: 1 }).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::Resolve(ResolveError::CaptiveDependency { .. })
        ));
    }

    // -- queries ------------------------------------------------------------

    #[tokio::test]
    async fn query_runs_read_only() {
        let journal = Arc::new(Journal::default());
        let mut builder = cart_builder(bare_config(), &journal);
        builder
            .query_handler::<CartTotal, CartTotalHandler, _>(Lifetime::PerResolve, |r: &Resolver<'_>| {
                Ok(CartTotalHandler {
                    repository: r.resolve()?,
                })
            })
            .unwrap();
        let processor = builder.build().unwrap();

        let total = processor.execute(CartTotal { cart_id: 1 }).await.unwrap();
        assert_eq!(total, 1);
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    async fn query_from_handler_shares_the_cycle_without_enlisting() {
        struct TotalChecker {
            journal: Arc<Journal>,
        }

        #[async_trait]
        impl MessageHandler<Checkout> for TotalChecker {
            async fn handle(&self, message: Checkout, ctx: &HandlerContext) -> anyhow::Result<()> {
                let repository = ctx.resolve::<CartRepository>()?;
                repository.stage("sock");
                let total = ctx.execute(CartTotal { cart_id: message.cart_id }).await?;
                self.journal.push(format!("total {total}"));
                Ok(())
            }
        }

        /// Reads the cart and writes to an audit log nobody else resolves.
        struct AuditedTotal {
            cart: Arc<CartRepository>,
            audit: Arc<AuditLog>,
            journal: Arc<Journal>,
        }

        #[async_trait]
        impl QueryHandler<CartTotal> for AuditedTotal {
            async fn execute(&self, _query: CartTotal, ctx: &HandlerContext) -> anyhow::Result<usize> {
                self.audit.0.stage("peeked");
                let enlisted = ctx.enlist(Arc::clone(&self.audit) as Arc<dyn UnitOfWorkParticipant>);
                self.journal
                    .push(format!("read only {} enlisted {enlisted}", ctx.is_read_only()));
                Ok(self.cart.pending.lock().len())
            }
        }

        let journal = Arc::new(Journal::default());
        let mut builder = cart_builder(bare_config(), &journal);
        builder
            .register_participant::<AuditLog, _>(Lifetime::PerUnitOfWork, |r: &Resolver<'_>| {
                Ok(AuditLog(CartRepository::new("audit", r.resolve()?)))
            })
            .unwrap()
            .query_handler::<CartTotal, AuditedTotal, _>(Lifetime::PerResolve, |r: &Resolver<'_>| {
                Ok(AuditedTotal {
                    cart: r.resolve()?,
                    audit: r.resolve()?,
                    journal: r.resolve()?,
                })
            })
            .unwrap()
            .command_handler::<Checkout, TotalChecker, _>(Lifetime::PerResolve, |r: &Resolver<'_>| {
                Ok(TotalChecker { journal: r.resolve()? })
            })
            .unwrap();
        let processor = builder.build().unwrap();

        processor.handle(Checkout { cart_id: 3 }).await.unwrap();
        assert_eq!(
            journal.entries(),
            vec!["read only true enlisted false", "total 1", "flush cart sock"]
        );
    }

    struct PublishingTotal;

    #[async_trait]
    impl QueryHandler<CartTotal> for PublishingTotal {
        async fn execute(&self, _query: CartTotal, ctx: &HandlerContext) -> anyhow::Result<usize> {
            ctx.publish(add_item("pear")).await?;
            Ok(0)
        }
    }

    #[tokio::test]
    async fn query_handler_cannot_publish_commands() {
        struct TotalChecker;

        #[async_trait]
        impl MessageHandler<Checkout> for TotalChecker {
            async fn handle(&self, message: Checkout, ctx: &HandlerContext) -> anyhow::Result<()> {
                ctx.resolve::<CartRepository>()?.stage("sock");
                ctx.execute(CartTotal { cart_id: message.cart_id }).await?;
                Ok(())
            }
        }

        let journal = Arc::new(Journal::default());
        let mut builder = cart_builder(bare_config(), &journal);
        builder
            .query_handler::<CartTotal, PublishingTotal, _>(Lifetime::Singleton, |_: &Resolver<'_>| {
                Ok(PublishingTotal)
            })
            .unwrap()
            .command_handler::<Checkout, TotalChecker, _>(Lifetime::Singleton, |_: &Resolver<'_>| {
                Ok(TotalChecker)
            })
            .unwrap();
        let processor = builder.build().unwrap();

        let err = processor.execute(CartTotal { cart_id: 1 }).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::ReadOnlyDispatch {
                message_type,
                kind: MessageKind::Command,
            } if message_type.ends_with("AddItem")
        ));

        let err = processor.handle(Checkout { cart_id: 1 }).await.unwrap_err();
        assert!(matches!(err, ProcessorError::ReadOnlyDispatch { .. }));
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    async fn query_without_handler_is_not_found() {
        let journal = Arc::new(Journal::default());
        let processor = cart_builder(bare_config(), &journal).build().unwrap();
        let err = processor.execute(CartTotal { cart_id: 1 }).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::HandlerNotFound {
                kind: MessageKind::Query,
                ..
            }
        ));
    }

    // -- failures -----------------------------------------------------------

    struct Rejecting {
        repository: Arc<CartRepository>,
        business_rule: bool,
    }

    #[async_trait]
    impl MessageHandler<Checkout> for Rejecting {
        async fn handle(&self, _message: Checkout, _ctx: &HandlerContext) -> anyhow::Result<()> {
            self.repository.stage("never");
            if self.business_rule {
                return Err(BusinessRuleViolation::new("cart.empty", "cart has no items").into());
            }
            anyhow::bail!("payment gateway unreachable")
        }
    }

    fn rejecting(config: ProcessorConfig, journal: &Arc<Journal>, business_rule: bool) -> MessageProcessor {
        let mut builder = cart_builder(config, journal);
        builder
            .command_handler::<Checkout, Rejecting, _>(Lifetime::PerResolve, move |r: &Resolver<'_>| {
                Ok(Rejecting {
                    repository: r.resolve()?,
                    business_rule,
                })
            })
            .unwrap();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn business_rule_violation_becomes_command_failed() {
        let journal = Arc::new(Journal::default());
        let err = rejecting(bare_config(), &journal, true)
            .handle(Checkout { cart_id: 1 })
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessorError::CommandFailed { .. }));
        assert!(err.is_functional());
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    async fn conversion_can_be_switched_off() {
        let journal = Arc::new(Journal::default());
        let config = ProcessorConfig {
            convert_business_rule_violations: false,
            ..bare_config()
        };
        let err = rejecting(config, &journal, true)
            .handle(Checkout { cart_id: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Handler { .. }));
    }

    #[tokio::test]
    async fn handler_failure_flushes_nothing() {
        let journal = Arc::new(Journal::default());
        let err = rejecting(bare_config(), &journal, false)
            .handle(Checkout { cart_id: 1 })
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessorError::Handler { .. }));
        assert_eq!(err.category(), ErrorCategory::Defect);
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    async fn failure_in_published_event_fails_the_command() {
        struct Exploding;

        #[async_trait]
        impl MessageHandler<ItemAdded> for Exploding {
            async fn handle(&self, _message: ItemAdded, _ctx: &HandlerContext) -> anyhow::Result<()> {
                Err(BusinessRuleViolation::new("stock", "out of stock").into())
            }
        }

        let journal = Arc::new(Journal::default());
        let mut builder = cart_builder(bare_config(), &journal);
        builder
            .event_handler::<ItemAdded, Exploding, _>(Lifetime::Singleton, |_: &Resolver<'_>| Ok(Exploding))
            .unwrap();
        let processor = builder.build().unwrap();

        let err = processor.handle(add_item("melon")).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::CommandFailed {
                message_type,
                ..
            } if message_type.ends_with("ItemAdded")
        ));
        assert!(!journal.entries().iter().any(|entry| entry.starts_with("flush")));
        assert!(!journal.entries().contains(&"AddItem done".to_string()));
    }

    #[tokio::test]
    async fn cancelled_before_dispatch_invokes_nothing() {
        let journal = Arc::new(Journal::default());
        let processor = cart_builder(bare_config(), &journal).build().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = processor
            .handle_with(add_item("lime"), DispatchOptions::default().with_cancellation(token))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessorError::Cancelled));
        assert!(journal.entries().is_empty());
    }

    // -- flushing -----------------------------------------------------------

    struct FailingLedger;

    #[async_trait]
    impl UnitOfWorkParticipant for FailingLedger {
        fn requires_flush(&self) -> bool {
            true
        }

        async fn flush(&self) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    /// Cancels the dispatch token from inside its own flush.
    struct CancellingLedger {
        token: CancellationToken,
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl UnitOfWorkParticipant for CancellingLedger {
        fn requires_flush(&self) -> bool {
            true
        }

        async fn flush(&self) -> anyhow::Result<()> {
            self.token.cancel();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.journal.push("flush ledger");
            Ok(())
        }
    }

    #[tokio::test]
    async fn flush_failure_reaches_the_caller() {
        struct Posting;

        #[async_trait]
        impl MessageHandler<Checkout> for Posting {
            async fn handle(&self, _message: Checkout, ctx: &HandlerContext) -> anyhow::Result<()> {
                ctx.resolve::<FailingLedger>()?;
                Ok(())
            }
        }

        let mut builder = MessageProcessor::builder(bare_config());
        builder
            .register_participant::<FailingLedger, _>(Lifetime::PerUnitOfWork, |_: &Resolver<'_>| {
                Ok(FailingLedger)
            })
            .unwrap()
            .command_handler::<Checkout, Posting, _>(Lifetime::Singleton, |_: &Resolver<'_>| Ok(Posting))
            .unwrap();
        let processor = builder.build().unwrap();

        let err = processor.handle(Checkout { cart_id: 2 }).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Flush);
        let ProcessorError::Flush(failure) = err else {
            panic!("expected a flush failure");
        };
        assert!(failure.participant.ends_with("FailingLedger"));
        assert_eq!(failure.source.to_string(), "disk full");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_observed_once_flushing_starts() {
        struct Posting;

        #[async_trait]
        impl MessageHandler<Checkout> for Posting {
            async fn handle(&self, _message: Checkout, ctx: &HandlerContext) -> anyhow::Result<()> {
                ctx.resolve::<CancellingLedger>()?;
                ctx.resolve::<CartRepository>()?.stage("kiwi");
                Ok(())
            }
        }

        let journal = Arc::new(Journal::default());
        let token = CancellationToken::new();
        let ledger_token = token.clone();
        let mut builder = cart_builder(bare_config(), &journal);
        builder
            .register_participant::<CancellingLedger, _>(
                Lifetime::PerUnitOfWork,
                move |r: &Resolver<'_>| {
                    Ok(CancellingLedger {
                        token: ledger_token.clone(),
                        journal: r.resolve()?,
                    })
                },
            )
            .unwrap()
            .command_handler::<Checkout, Posting, _>(Lifetime::Singleton, |_: &Resolver<'_>| Ok(Posting))
            .unwrap();
        let processor = builder.build().unwrap();

        processor
            .handle_with(
                Checkout { cart_id: 4 },
                DispatchOptions::default().with_cancellation(token.clone()),
            )
            .await
            .unwrap();

        assert!(token.is_cancelled());
        assert_eq!(journal.entries(), vec!["flush ledger", "flush cart kiwi"]);
    }

    #[tokio::test]
    async fn authorization_uses_request_context() {
        let journal = Arc::new(Journal::default());
        let mut builder = cart_builder(
            ProcessorConfig {
                modules: vec![ModuleKind::Authorization],
                ..ProcessorConfig::default()
            },
            &journal,
        );
        builder.authorizer(RoleAuthorizer::new().require::<AddItem>("shopper"));
        let processor = builder.build().unwrap();

        let err = processor.handle(add_item("date")).await.unwrap_err();
        assert!(matches!(err, ProcessorError::NotAuthorized { .. }));

        let shopper = RequestContext::for_principal(Principal::new("sam", ["shopper"]));
        processor
            .handle_with(add_item("date"), DispatchOptions::for_request(shopper))
            .await
            .unwrap();
        assert_eq!(journal.entries().last().map(String::as_str), Some("flush cart date"));
    }

    // -- re-entry -----------------------------------------------------------

    struct Reentrant {
        processor: Arc<Mutex<Option<MessageProcessor>>>,
        isolated: bool,
    }

    #[async_trait]
    impl MessageHandler<Checkout> for Reentrant {
        async fn handle(&self, message: Checkout, ctx: &HandlerContext) -> anyhow::Result<()> {
            let processor = self
                .processor
                .lock()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("processor not wired"))?;
            let item = AddItem {
                cart_id: message.cart_id,
                sku: "nested".into(),
                quantity: 1,
            };
            if self.isolated {
                processor.handle_isolated(item, DispatchOptions::default()).await?;
            } else {
                processor.handle(item).await?;
            }
            ctx.resolve::<CartRepository>()?.stage("outer");
            Ok(())
        }
    }

    fn reentrant(journal: &Arc<Journal>, isolated: bool) -> MessageProcessor {
        let slot = Arc::new(Mutex::new(None));
        let shared = Arc::clone(&slot);
        let mut builder = cart_builder(bare_config(), journal);
        builder
            .command_handler::<Checkout, Reentrant, _>(Lifetime::PerResolve, move |_: &Resolver<'_>| {
                Ok(Reentrant {
                    processor: Arc::clone(&shared),
                    isolated,
                })
            })
            .unwrap();
        let processor = builder.build().unwrap();
        *slot.lock() = Some(processor.clone());
        processor
    }

    #[tokio::test]
    async fn handle_inside_handler_joins_the_running_cycle() {
        let journal = Arc::new(Journal::default());
        let processor = reentrant(&journal, false);

        processor.handle(Checkout { cart_id: 5 }).await.unwrap();

        let flushes: Vec<_> = journal
            .entries()
            .into_iter()
            .filter(|entry| entry.starts_with("flush"))
            .collect();
        assert_eq!(flushes, vec!["flush cart nested,outer"]);
    }

    #[tokio::test]
    async fn handle_isolated_inside_handler_runs_its_own_cycle() {
        let journal = Arc::new(Journal::default());
        let processor = reentrant(&journal, true);

        processor.handle(Checkout { cart_id: 5 }).await.unwrap();

        let flushes: Vec<_> = journal
            .entries()
            .into_iter()
            .filter(|entry| entry.starts_with("flush"))
            .collect();
        assert_eq!(flushes, vec!["flush cart nested", "flush cart outer"]);
    }

    // -- registration -------------------------------------------------------

    #[test]
    fn second_command_handler_is_rejected() {
        struct Other;

        #[async_trait]
        impl MessageHandler<AddItem> for Other {
            async fn handle(&self, _message: AddItem, _ctx: &HandlerContext) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let journal = Arc::new(Journal::default());
        let mut builder = cart_builder(bare_config(), &journal);
        let err = builder
            .command_handler::<AddItem, Other, _>(Lifetime::Singleton, |_: &Resolver<'_>| Ok(Other))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCommandHandler { .. }));
    }

    #[test]
    fn routing_by_the_wrong_kind_is_rejected() {
        let journal = Arc::new(Journal::default());
        let mut builder = cart_builder(bare_config(), &journal);
        let err = builder.route_command::<ItemAdded, ItemAddedHandler>().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::KindMismatch {
                expected: MessageKind::Command,
                actual: MessageKind::Event,
                ..
            }
        ));
    }

    #[test]
    fn routing_to_an_unregistered_handler_is_rejected() {
        struct Missing;

        #[async_trait]
        impl MessageHandler<Checkout> for Missing {
            async fn handle(&self, _message: Checkout, _ctx: &HandlerContext) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let mut builder = MessageProcessor::builder(bare_config());
        let err = builder.route_command::<Checkout, Missing>().unwrap_err();
        assert!(matches!(err, ConfigError::UnregisteredHandler { .. }));
    }

    #[test]
    fn invalid_lifetime_tag_is_rejected() {
        let mut builder = MessageProcessor::builder(bare_config());
        let err = builder
            .command_handler::<AddItem, AddItemHandler, _>(7u8, |r: &Resolver<'_>| {
                Ok(AddItemHandler {
                    repository: r.resolve()?,
                    journal: r.resolve()?,
                })
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLifetime { .. }));
    }

    #[test]
    fn generic_query_definitions_are_rejected() {
        struct AnyQuery;

        #[async_trait]
        impl GenericHandler for AnyQuery {
            async fn handle(&self, _message: MessageEnvelope, _ctx: &HandlerContext) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let mut builder = MessageProcessor::builder(bare_config());
        builder
            .register::<AnyQuery, _>(Lifetime::Singleton, |_: &Resolver<'_>| Ok(AnyQuery))
            .unwrap();
        let err = builder.fallback_handler::<AnyQuery>(MessageKind::Query).unwrap_err();
        assert!(matches!(err, ConfigError::KindMismatch { .. }));
    }

    #[test]
    fn missing_collaborator_fails_build() {
        let err = MessageProcessor::builder(ProcessorConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingCollaborator {
                module: "authorization",
                ..
            }
        ));
    }

    #[test]
    fn duplicate_custom_module_is_rejected() {
        struct Noop;

        impl Module for Noop {
            fn name(&self) -> &str {
                "noop"
            }

            fn wrap(&self, inner: crate::dispatch::HandlerPipeline) -> crate::dispatch::HandlerPipeline {
                inner
            }
        }

        let mut builder = MessageProcessor::builder(bare_config());
        builder.module(Noop).unwrap();
        assert!(matches!(
            builder.module(Noop),
            Err(ConfigError::DuplicateModule { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_messages_use_separate_cycles() {
        let journal = Arc::new(Journal::default());
        let processor = cart_builder(bare_config(), &journal).build().unwrap();

        let (a, b) = tokio::join!(processor.handle(add_item("a")), processor.handle(add_item("b")));
        a.unwrap();
        b.unwrap();

        let mut flushes: Vec<_> = journal
            .entries()
            .into_iter()
            .filter(|entry| entry.starts_with("flush"))
            .collect();
        flushes.sort();
        assert_eq!(flushes, vec!["flush cart a", "flush cart b"]);
    }
}
