//! Cross-cutting modules wrapped around every handler invocation.
//!
//! Each built-in module is a tower [`Layer`](tower::Layer) over the handler
//! pipeline and either calls the inner service once or fails without
//! calling it.
//!
//! - [`authorization`]: rejects callers the injected `Authorizer` denies
//! - [`validation`]: rejects invalid messages before the handler runs
//! - [`clock`]: pins the ambient clock for the invocation
//! - [`transaction`]: opens, joins, or suppresses a transaction scope
//! - [`timeout`]: fails invocations running past `handler_timeout_ms`
//! - [`metrics`]: records duration and outcome in a `tracing` span
//! - [`pipeline`]: composes the configured modules

pub mod authorization;
pub mod clock;
pub mod metrics;
pub mod pipeline;
pub mod timeout;
pub mod transaction;
pub mod validation;

use conduit_core::MessageKind;

use crate::dispatch::HandlerPipeline;

pub use authorization::AuthorizationLayer;
pub use clock::{ClockLayer, ClockSource};
pub use metrics::MetricsLayer;
pub use pipeline::{Collaborators, ModulePipeline};
pub use timeout::TimeoutLayer;
pub use transaction::TransactionLayer;
pub use validation::ValidationLayer;

/// One cross-cutting behavior in a handler pipeline.
///
/// Built-in modules implement this through their tower layer; applications
/// implement it directly and register the module by name.
pub trait Module: Send + Sync {
    /// Name used in configuration and logs.
    fn name(&self) -> &str;

    /// Whether this module wraps invocations of `kind`.
    fn applies_to(&self, _kind: MessageKind) -> bool {
        true
    }

    /// Wrap `inner` in this module.
    fn wrap(&self, inner: HandlerPipeline) -> HandlerPipeline;
}
