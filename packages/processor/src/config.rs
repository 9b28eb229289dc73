use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A cross-cutting module, as listed in [`ProcessorConfig::modules`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Authorization,
    Validation,
    Clock,
    TransactionScope,
    Timeout,
    Instrumentation,
    /// Application module registered on the builder under this name.
    Custom(String),
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authorization => f.write_str("authorization"),
            Self::Validation => f.write_str("validation"),
            Self::Clock => f.write_str("clock"),
            Self::TransactionScope => f.write_str("transaction_scope"),
            Self::Timeout => f.write_str("timeout"),
            Self::Instrumentation => f.write_str("instrumentation"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Isolation level requested from the transaction manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// How the transaction module relates to an enclosing transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    /// Join the enclosing transaction; open one if there is none.
    #[default]
    Required,
    /// Always open a new transaction.
    RequiresNew,
    /// Run without a transaction.
    Suppress,
}

/// Options passed to [`TransactionScopeFactory::begin`](crate::TransactionScopeFactory::begin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub timeout_ms: u64,
    pub propagation: Propagation,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            timeout_ms: 30_000,
            propagation: Propagation::Required,
        }
    }
}

/// Processor configuration. Immutable once the processor is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Modules wrapping every handler, outermost first.
    pub modules: Vec<ModuleKind>,
    /// Per-invocation timeout used by [`ModuleKind::Timeout`].
    pub handler_timeout_ms: Option<u64>,
    pub transaction: TransactionOptions,
    /// Convert handler errors recognized by the exception filter into
    /// `ProcessorError::CommandFailed`.
    pub convert_business_rule_violations: bool,
    /// Maximum nesting of messages published from handlers.
    pub max_dispatch_depth: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            modules: vec![
                ModuleKind::Authorization,
                ModuleKind::Validation,
                ModuleKind::Clock,
                ModuleKind::TransactionScope,
            ],
            handler_timeout_ms: None,
            transaction: TransactionOptions::default(),
            convert_business_rule_violations: true,
            max_dispatch_depth: 32,
        }
    }
}

impl ProcessorConfig {
    /// Parse and validate a JSON configuration. Missing fields take their
    /// defaults.
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidConfig` for malformed JSON, otherwise whatever
    /// [`validate`](Self::validate) reports.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// `ConfigError::DuplicateModule` if a module is listed twice,
    /// `ConfigError::MissingCollaborator` if the timeout module is listed
    /// without `handler_timeout_ms`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for module in &self.modules {
            if !seen.insert(module) {
                return Err(ConfigError::DuplicateModule {
                    name: module.to_string(),
                });
            }
        }
        if seen.contains(&ModuleKind::Timeout) && self.handler_timeout_ms.is_none() {
            return Err(ConfigError::MissingCollaborator {
                module: "timeout",
                collaborator: "handler_timeout_ms",
            });
        }
        Ok(())
    }
}
