//! Message model: commands, events and queries as immutable value objects.
//!
//! Concrete messages implement [`Message`]. Dispatch works on the type-erased
//! [`AnyMessage`] view, which every `Message` gets through a blanket impl, and
//! on the owned [`MessageEnvelope`] that carries one across async boundaries.
//!
//! Envelopes have value semantics: cloning one performs a deep copy of the
//! underlying message, and equality and hashing are structural (the runtime
//! type participates in both).

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::validation::ValidationResult;

// ---------------------------------------------------------------------------
// MessageKind / MessageType
// ---------------------------------------------------------------------------

/// Role a message plays in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Intent to change state. Exactly one handler.
    Command,
    /// Fact that something happened. Zero or more handlers.
    Event,
    /// Read request answered by exactly one handler, never enlists changes.
    Query,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Command => "command",
            Self::Event => "event",
            Self::Query => "query",
        };
        f.write_str(label)
    }
}

/// Runtime identity of a message type.
///
/// Equality and hashing use the `TypeId` only; the name is carried for
/// diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    /// Identity of the concrete type `M`.
    #[must_use]
    pub fn of<M: Any>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    /// The underlying `TypeId`.
    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path (`AddItem` for `shop::cart::AddItem`).
    /// Generic arguments are kept as written: `Envelope<shop::Item>`.
    #[must_use]
    pub fn short_name(&self) -> &'static str {
        let base_end = self.name.find('<').unwrap_or(self.name.len());
        let start = self.name[..base_end].rfind("::").map_or(0, |at| at + 2);
        &self.name[start..]
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Aggregate identity and version carried by events that need ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateVersion {
    /// Key of the aggregate the event belongs to.
    pub aggregate_key: String,
    /// Version of the aggregate after the event was applied.
    pub version: u64,
}

// ---------------------------------------------------------------------------
// Message trait
// ---------------------------------------------------------------------------

/// A command, event or query processed by the system.
///
/// Messages are plain values: `Clone` is the deep copy, `PartialEq` + `Hash`
/// give structural identity. Use [`impl_message!`](crate::impl_message) for
/// the common case.
pub trait Message: Clone + fmt::Debug + PartialEq + Eq + Hash + Send + Sync + 'static {
    /// Role of this message type.
    const KIND: MessageKind;

    /// Aggregate key and version for ordered events. `None` by default.
    fn aggregate(&self) -> Option<AggregateVersion> {
        None
    }

    /// Self-validation consulted by the default message validator.
    fn validate(&self) -> ValidationResult {
        ValidationResult::Valid
    }
}

/// A [`Message`] answered with a value on the read path.
pub trait Query: Message {
    /// Value produced by the query handler.
    type Response: Send + 'static;
}

// ---------------------------------------------------------------------------
// AnyMessage (type-erased view)
// ---------------------------------------------------------------------------

/// Object-safe view over any [`Message`].
pub trait AnyMessage: Any + Send + Sync + fmt::Debug {
    /// Runtime type of the concrete message.
    fn message_type(&self) -> MessageType;

    /// Declared kind of the concrete message.
    fn kind(&self) -> MessageKind;

    /// See [`Message::aggregate`].
    fn aggregate(&self) -> Option<AggregateVersion>;

    /// See [`Message::validate`].
    fn validate(&self) -> ValidationResult;

    /// Deep copy into a new allocation.
    fn clone_boxed(&self) -> Box<dyn AnyMessage>;

    /// Borrow as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Convert into `Any` for by-value downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;

    /// Structural equality against another erased message.
    fn dyn_eq(&self, other: &dyn AnyMessage) -> bool;

    /// Feed the structural hash into `state`.
    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<M: Message> AnyMessage for M {
    fn message_type(&self) -> MessageType {
        MessageType::of::<M>()
    }

    fn kind(&self) -> MessageKind {
        M::KIND
    }

    fn aggregate(&self) -> Option<AggregateVersion> {
        Message::aggregate(self)
    }

    fn validate(&self) -> ValidationResult {
        Message::validate(self)
    }

    fn clone_boxed(&self) -> Box<dyn AnyMessage> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn dyn_eq(&self, other: &dyn AnyMessage) -> bool {
        other.as_any().downcast_ref::<M>() == Some(self)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<M>().hash(&mut state);
        self.hash(&mut state);
    }
}

// ---------------------------------------------------------------------------
// MessageEnvelope
// ---------------------------------------------------------------------------

/// Owned, type-erased message travelling through the processor.
pub struct MessageEnvelope {
    inner: Box<dyn AnyMessage>,
}

impl MessageEnvelope {
    /// Wrap a concrete message.
    #[must_use]
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            inner: Box::new(message),
        }
    }

    /// Wrap an already boxed message.
    #[must_use]
    pub fn from_boxed(inner: Box<dyn AnyMessage>) -> Self {
        Self { inner }
    }

    /// Deep copy. Equivalent to `clone()`, spelled out for call sites that
    /// want to make the allocation explicit.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            inner: self.inner.clone_boxed(),
        }
    }

    /// Borrow the erased message.
    #[must_use]
    pub fn message(&self) -> &dyn AnyMessage {
        self.inner.as_ref()
    }

    /// Whether the envelope holds an `M`.
    #[must_use]
    pub fn is<M: Message>(&self) -> bool {
        self.inner.as_any().is::<M>()
    }

    /// Borrow the concrete message if it is an `M`.
    #[must_use]
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.inner.as_any().downcast_ref::<M>()
    }

    /// Unwrap into the concrete message, handing the envelope back on a
    /// type mismatch.
    ///
    /// # Errors
    ///
    /// Returns the unchanged envelope if it does not hold an `M`.
    pub fn downcast<M: Message>(self) -> Result<M, Self> {
        if !self.is::<M>() {
            return Err(self);
        }
        match self.inner.into_any().downcast::<M>() {
            Ok(message) => Ok(*message),
            Err(_) => unreachable!("envelope type checked before downcast"),
        }
    }
}

impl Deref for MessageEnvelope {
    type Target = dyn AnyMessage;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Clone for MessageEnvelope {
    fn clone(&self) -> Self {
        self.copy()
    }
}

impl PartialEq for MessageEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.inner.dyn_eq(other.inner.as_ref())
    }
}

impl Eq for MessageEnvelope {}

impl Hash for MessageEnvelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.dyn_hash(state);
    }
}

impl fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("type", &self.inner.message_type().short_name())
            .field("message", &self.inner)
            .finish()
    }
}

impl<M: Message> From<M> for MessageEnvelope {
    fn from(message: M) -> Self {
        Self::new(message)
    }
}

// ---------------------------------------------------------------------------
// impl_message!
// ---------------------------------------------------------------------------

/// Implement [`Message`] (and [`Query`] for queries) for one or more types.
///
/// ```
/// use conduit_core::impl_message;
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct AddItem { sku: String }
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct ItemAdded { sku: String }
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct CartTotal { cart_id: u64 }
///
/// impl_message!(AddItem => Command);
/// impl_message!(ItemAdded => Event);
/// impl_message!(CartTotal => Query<u64>);
/// ```
#[macro_export]
macro_rules! impl_message {
    ($ty:ty => Command) => {
        impl $crate::Message for $ty {
            const KIND: $crate::MessageKind = $crate::MessageKind::Command;
        }
    };
    ($ty:ty => Event) => {
        impl $crate::Message for $ty {
            const KIND: $crate::MessageKind = $crate::MessageKind::Event;
        }
    };
    ($ty:ty => Query<$response:ty>) => {
        impl $crate::Message for $ty {
            const KIND: $crate::MessageKind = $crate::MessageKind::Query;
        }

        impl $crate::Query for $ty {
            type Response = $response;
        }
    };
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
