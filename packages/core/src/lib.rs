//! Conduit Core — message model, ambient clock, validation results, and request context.

pub mod clock;
pub mod context;
pub mod error;
pub mod message;
pub mod validation;

pub use clock::{Clock, FixedClock, SystemClock};
pub use context::{Principal, RequestContext};
pub use error::BusinessRuleViolation;
pub use message::{AggregateVersion, AnyMessage, Message, MessageEnvelope, MessageKind, MessageType, Query};
pub use validation::{ValidationErrorTree, ValidationResult};
