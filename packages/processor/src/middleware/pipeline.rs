//! Pipeline composition: resolves the configured module order into module
//! instances and wraps handler services in them.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_core::{Clock, MessageKind};
use tower::util::BoxService;
use tower::Service;

use super::{
    AuthorizationLayer, ClockLayer, MetricsLayer, Module, TimeoutLayer, TransactionLayer,
    ValidationLayer,
};
use crate::config::{ModuleKind, ProcessorConfig};
use crate::dispatch::{HandlerPipeline, Invocation, Reply};
use crate::error::{ConfigError, ProcessorError};
use crate::traits::{Authorizer, MessageValidator, SelfValidator, TransactionScopeFactory};

/// Services the built-in modules delegate to.
///
/// A missing validator falls back to [`SelfValidator`] and a missing clock
/// freezes the ambient time per invocation. The authorizer and transaction
/// factory have no fallback.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub validator: Option<Arc<dyn MessageValidator>>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub transaction_factory: Option<Arc<dyn TransactionScopeFactory>>,
    pub clock: Option<Arc<dyn Clock>>,
}

/// Ordered modules wrapped around every handler, outermost first.
#[derive(Clone, Default)]
pub struct ModulePipeline {
    modules: Vec<Arc<dyn Module>>,
}

impl ModulePipeline {
    #[must_use]
    pub fn new(modules: Vec<Arc<dyn Module>>) -> Self {
        Self { modules }
    }

    /// Instantiate the modules listed in `config`, in the listed order.
    ///
    /// # Errors
    ///
    /// `ConfigError::MissingCollaborator` when a listed module needs a
    /// collaborator that was not supplied, `ConfigError::UnknownModule` when
    /// a custom module name is not in `custom`.
    pub fn from_config(
        config: &ProcessorConfig,
        collaborators: &Collaborators,
        custom: &HashMap<String, Arc<dyn Module>>,
    ) -> Result<Self, ConfigError> {
        let mut modules: Vec<Arc<dyn Module>> = Vec::with_capacity(config.modules.len());
        for kind in &config.modules {
            let module: Arc<dyn Module> = match kind {
                ModuleKind::Authorization => {
                    let authorizer = collaborators.authorizer.clone().ok_or(
                        ConfigError::MissingCollaborator {
                            module: "authorization",
                            collaborator: "authorizer",
                        },
                    )?;
                    Arc::new(AuthorizationLayer::new(authorizer))
                }
                ModuleKind::Validation => {
                    let validator = collaborators
                        .validator
                        .clone()
                        .unwrap_or_else(|| Arc::new(SelfValidator));
                    Arc::new(ValidationLayer::new(validator))
                }
                ModuleKind::Clock => match &collaborators.clock {
                    Some(clock) => Arc::new(ClockLayer::fixed(Arc::clone(clock))),
                    None => Arc::new(ClockLayer::freeze()),
                },
                ModuleKind::TransactionScope => {
                    let factory = collaborators.transaction_factory.clone().ok_or(
                        ConfigError::MissingCollaborator {
                            module: "transaction_scope",
                            collaborator: "transaction scope factory",
                        },
                    )?;
                    Arc::new(TransactionLayer::new(factory, config.transaction.clone()))
                }
                ModuleKind::Timeout => {
                    let timeout_ms =
                        config
                            .handler_timeout_ms
                            .ok_or(ConfigError::MissingCollaborator {
                                module: "timeout",
                                collaborator: "handler_timeout_ms",
                            })?;
                    Arc::new(TimeoutLayer::new(timeout_ms))
                }
                ModuleKind::Instrumentation => Arc::new(MetricsLayer),
                ModuleKind::Custom(name) => {
                    custom
                        .get(name)
                        .cloned()
                        .ok_or_else(|| ConfigError::UnknownModule { name: name.clone() })?
                }
            };
            modules.push(module);
        }
        Ok(Self { modules })
    }

    /// Wrap `handler` in every module that applies to `kind`. The first
    /// configured module ends up outermost.
    pub fn build<S>(&self, handler: S, kind: MessageKind) -> HandlerPipeline
    where
        S: Service<Invocation, Response = Reply, Error = ProcessorError> + Send + 'static,
        S::Future: Send + 'static,
    {
        self.modules
            .iter()
            .rev()
            .filter(|module| module.applies_to(kind))
            .fold(BoxService::new(handler), |inner, module| module.wrap(inner))
    }

    /// Names of the configured modules, outermost first.
    #[must_use]
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|module| module.name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
