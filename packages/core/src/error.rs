//! Domain-level error raised by handler code.

/// A business rule rejected the requested operation.
///
/// Handlers return this (through `anyhow`) for expected, functional failures
/// such as "cart is already checked out". The processor's business-rule
/// filter recognises it anywhere in an error chain and reports the failure as
/// a command execution failure instead of a defect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("business rule `{rule}` violated: {message}")]
pub struct BusinessRuleViolation {
    /// Short identifier of the violated rule.
    pub rule: String,
    /// Human-readable explanation.
    pub message: String,
}

impl BusinessRuleViolation {
    /// Violation of `rule` with the given explanation.
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
        }
    }
}
