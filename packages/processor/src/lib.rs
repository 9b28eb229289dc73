//! Conduit Processor — message dispatch with a module pipeline, dependency
//! lifetimes, and unit-of-work flushing.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifetime;
pub mod middleware;
pub mod telemetry;
pub mod traits;
pub mod unit_of_work;

pub use config::{IsolationLevel, ModuleKind, ProcessorConfig, Propagation, TransactionOptions};
pub use dispatch::{
    CatalogEntry, DispatchOptions, DispatchOrigin, GenericHandler, HandlerCatalog, HandlerContext,
    HandlerKind, HandlerRegistry, MessageHandler, MessageProcessor, ProcessorBuilder, QueryHandler,
    Reply,
};
pub use error::{
    ConfigError, ErrorCategory, FlushError, ProcessorError, ResolveError, UnitOfWorkError,
};
pub use lifetime::{Container, ContainerBuilder, Disposable, Lifetime, LifetimeTag, Resolver};
pub use middleware::Module;
pub use telemetry::{init_tracing, TelemetryConfig};
pub use traits::{
    AuthorizationDecision, Authorizer, BusinessRuleFilter, ExceptionFilter, MessageValidator,
    RoleAuthorizer, SelfValidator, TransactionScope, TransactionScopeFactory,
};
pub use unit_of_work::{FlushReport, ProcessingCycle, UnitOfWorkParticipant};
