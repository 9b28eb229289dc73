use std::collections::HashMap;

use async_trait::async_trait;
use conduit_core::{AnyMessage, BusinessRuleViolation, Message, MessageType, RequestContext, ValidationResult};

use crate::config::TransactionOptions;

/// Decides whether a message is well-formed before its handler runs.
/// Validation rules are opaque here: only the pass/fail outcome and the
/// error tree matter.
pub trait MessageValidator: Send + Sync {
    fn validate(&self, message: &dyn AnyMessage) -> ValidationResult;
}

/// Defers to each message's own [`Message::validate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfValidator;

impl MessageValidator for SelfValidator {
    fn validate(&self, message: &dyn AnyMessage) -> ValidationResult {
        message.validate()
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision {
    Allow,
    Deny { reason: String },
}

/// Decides whether the caller described by a [`RequestContext`] may have
/// a message processed.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, request: &RequestContext, message: &dyn AnyMessage) -> AuthorizationDecision;
}

/// Requires a role per message type. Message types without a requirement
/// are allowed for everyone, including anonymous callers.
#[derive(Debug, Clone, Default)]
pub struct RoleAuthorizer {
    required: HashMap<MessageType, String>,
}

impl RoleAuthorizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `role` for messages of type `M`.
    #[must_use]
    pub fn require<M: Message>(mut self, role: impl Into<String>) -> Self {
        self.required.insert(MessageType::of::<M>(), role.into());
        self
    }
}

impl Authorizer for RoleAuthorizer {
    fn authorize(&self, request: &RequestContext, message: &dyn AnyMessage) -> AuthorizationDecision {
        let message_type = message.message_type();
        let Some(role) = self.required.get(&message_type) else {
            return AuthorizationDecision::Allow;
        };
        match &request.principal {
            Some(principal) if principal.has_role(role) => AuthorizationDecision::Allow,
            Some(principal) => AuthorizationDecision::Deny {
                reason: format!("principal `{}` lacks role `{role}`", principal.id),
            },
            None => AuthorizationDecision::Deny {
                reason: format!("`{}` requires an authenticated principal", message_type.short_name()),
            },
        }
    }
}

/// An open transaction. Dropping it without [`commit`](Self::commit) rolls
/// it back.
#[async_trait]
pub trait TransactionScope: Send {
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
}

/// Opens transaction scopes for the transaction module.
pub trait TransactionScopeFactory: Send + Sync {
    /// Begin a scope with the given isolation and timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transaction manager cannot open a
    /// scope.
    fn begin(&self, options: &TransactionOptions) -> anyhow::Result<Box<dyn TransactionScope>>;
}

/// Classifies handler errors as expected business outcomes.
pub trait ExceptionFilter: Send + Sync {
    fn is_expected(&self, error: &anyhow::Error) -> bool;
}

/// Treats a [`BusinessRuleViolation`] anywhere in the error chain as
/// expected.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusinessRuleFilter;

impl ExceptionFilter for BusinessRuleFilter {
    fn is_expected(&self, error: &anyhow::Error) -> bool {
        error
            .chain()
            .any(|cause| cause.downcast_ref::<BusinessRuleViolation>().is_some())
    }
}
