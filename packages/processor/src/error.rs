//! Error taxonomy for registration, resolution, unit of work and dispatch.

use conduit_core::ValidationErrorTree;

/// Registration and configuration failures. Raised while building a
/// processor; fatal and never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid lifetime `{value}` for `{type_name}`")]
    InvalidLifetime { type_name: &'static str, value: String },
    #[error("`{type_name}` is already registered")]
    DuplicateRegistration { type_name: &'static str },
    #[error("command `{message_type}` already handled by `{existing}`, cannot add `{duplicate}`")]
    DuplicateCommandHandler {
        message_type: &'static str,
        existing: &'static str,
        duplicate: &'static str,
    },
    #[error("query `{message_type}` already handled by `{existing}`, cannot add `{duplicate}`")]
    DuplicateQueryHandler {
        message_type: &'static str,
        existing: &'static str,
        duplicate: &'static str,
    },
    #[error("`{message_type}` is declared as a {actual}, expected a {expected}")]
    KindMismatch {
        message_type: &'static str,
        expected: conduit_core::MessageKind,
        actual: conduit_core::MessageKind,
    },
    #[error("handler `{handler}` is routed but not registered in the container")]
    UnregisteredHandler { handler: &'static str },
    #[error("module `{module}` requires a {collaborator}")]
    MissingCollaborator {
        module: &'static str,
        collaborator: &'static str,
    },
    #[error("unknown custom module `{name}`")]
    UnknownModule { name: String },
    #[error("module `{name}` is listed more than once")]
    DuplicateModule { name: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

/// Failures resolving a dependency from the container.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("`{type_name}` is not registered")]
    NotRegistered { type_name: &'static str },
    #[error("`{type_name}` has a per-unit-of-work lifetime but no processing cycle is active")]
    NoActiveCycle { type_name: &'static str },
    #[error("circular dependency: {path}")]
    CircularDependency { path: String },
    #[error("singleton `{singleton}` cannot depend on per-unit-of-work `{dependency}`")]
    CaptiveDependency {
        singleton: &'static str,
        dependency: &'static str,
    },
    #[error("failed to construct `{type_name}`")]
    Construction {
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    UnitOfWork(#[from] UnitOfWorkError),
}

/// Misuse of the unit-of-work cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitOfWorkError {
    #[error("the processing cycle owning this cache has ended")]
    CycleEnded,
    #[error("a live entry for `{key}` already exists in this cycle")]
    DuplicateKey { key: String },
}

/// A participant failed to flush. Remaining flushes were aborted.
#[derive(Debug, thiserror::Error)]
#[error("flushing `{participant}` failed")]
pub struct FlushError {
    pub participant: String,
    pub group: Option<String>,
    #[source]
    pub source: anyhow::Error,
}

/// Coarse classification callers use to map failures (e.g. to status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Authorization,
    BusinessRule,
    Defect,
    Flush,
    Cancelled,
}

/// Errors surfaced by the message processor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    UnitOfWork(#[from] UnitOfWorkError),
    #[error("no handler registered for {kind} `{message_type}`")]
    HandlerNotFound {
        message_type: &'static str,
        kind: conduit_core::MessageKind,
    },
    #[error("`{message_type}` is invalid: {errors}")]
    InvalidMessage {
        message_type: &'static str,
        errors: ValidationErrorTree,
    },
    #[error("not authorized to process `{message_type}`: {reason}")]
    NotAuthorized {
        message_type: &'static str,
        reason: String,
    },
    #[error("command `{message_type}` failed")]
    CommandFailed {
        message_type: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("handler for `{message_type}` failed")]
    Handler {
        message_type: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Flush(#[from] FlushError),
    #[error("transaction scope failed")]
    Transaction {
        #[source]
        source: anyhow::Error,
    },
    #[error("`{message_type}` timed out after {timeout_ms}ms")]
    Timeout {
        message_type: &'static str,
        timeout_ms: u64,
    },
    #[error("processing was cancelled")]
    Cancelled,
    #[error("dispatch depth {depth} exceeds the configured maximum")]
    DispatchDepthExceeded { depth: usize },
    #[error("{kind} `{message_type}` cannot be dispatched while answering a query")]
    ReadOnlyDispatch {
        message_type: &'static str,
        kind: conduit_core::MessageKind,
    },
    #[error("handler for `{message_type}` produced a reply of the wrong type")]
    UnexpectedReply { message_type: &'static str },
}

impl ProcessorError {
    /// Lift a handler's opaque error. Errors that already are a
    /// `ProcessorError` (typically from a nested publish) pass through as-is.
    #[must_use]
    pub fn from_handler(message_type: &'static str, error: anyhow::Error) -> Self {
        match error.downcast::<ProcessorError>() {
            Ok(inner) => inner,
            Err(source) => Self::Handler {
                message_type,
                source,
            },
        }
    }

    /// Classification of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::Resolve(_) | Self::UnitOfWork(_) | Self::HandlerNotFound { .. } => {
                ErrorCategory::Configuration
            }
            Self::InvalidMessage { .. } => ErrorCategory::Validation,
            Self::NotAuthorized { .. } => ErrorCategory::Authorization,
            Self::CommandFailed { .. } => ErrorCategory::BusinessRule,
            Self::Flush(_) => ErrorCategory::Flush,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Handler { .. }
            | Self::Transaction { .. }
            | Self::Timeout { .. }
            | Self::DispatchDepthExceeded { .. }
            | Self::ReadOnlyDispatch { .. }
            | Self::UnexpectedReply { .. } => ErrorCategory::Defect,
        }
    }

    /// Whether the failure is an expected, caller-facing outcome rather than
    /// a defect in the system.
    #[must_use]
    pub fn is_functional(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Validation | ErrorCategory::Authorization | ErrorCategory::BusinessRule
        )
    }
}
