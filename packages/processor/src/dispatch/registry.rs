//! Message type to handler routing.
//!
//! Three kinds of registration are matched, in this order:
//! - exact: one message type, one handler type
//! - generic: a definition closed over every declared message type it
//!   applies to, when the registry is built
//! - fallback: any message of a kind (always last)
//!
//! Commands and queries take the first match; events take all of them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use conduit_core::{MessageKind, MessageType};

use super::handler::ErasedHandler;
use crate::error::{ConfigError, ResolveError};
use crate::lifetime::{Lifetime, Resolver};

/// Builds a handler instance from the container.
pub(crate) type ResolveHandler =
    Arc<dyn Fn(&Resolver<'_>) -> Result<Arc<dyn ErasedHandler>, ResolveError> + Send + Sync>;

/// Decides whether a generic definition applies to a declared message type.
pub type AppliesTo = Arc<dyn Fn(&MessageType) -> bool + Send + Sync>;

/// Who may reach a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Reacts to messages published during processing.
    Internal,
    /// Reachable from callers outside the processor as well.
    External,
}

/// Where a dispatch comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOrigin {
    /// An outside caller: only [`HandlerKind::External`] handlers are visible.
    External,
    /// A handler publishing during processing: every handler is visible.
    Internal,
}

/// How a descriptor matched its message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    Exact,
    Generic,
    Fallback,
}

// ---------------------------------------------------------------------------
// HandlerDescriptor
// ---------------------------------------------------------------------------

/// One routable handler.
pub struct HandlerDescriptor {
    message_type: Option<MessageType>,
    kind: MessageKind,
    handler_name: &'static str,
    handler_kind: HandlerKind,
    lifetime: Lifetime,
    matched: MatchKind,
    resolve: ResolveHandler,
}

impl HandlerDescriptor {
    pub(crate) fn new(
        message_type: Option<MessageType>,
        kind: MessageKind,
        handler_name: &'static str,
        handler_kind: HandlerKind,
        lifetime: Lifetime,
        resolve: ResolveHandler,
    ) -> Self {
        Self {
            message_type,
            kind,
            handler_name,
            handler_kind,
            lifetime,
            matched: if message_type.is_some() {
                MatchKind::Exact
            } else {
                MatchKind::Fallback
            },
            resolve,
        }
    }

    /// Message type routed to this handler; `None` for fallbacks.
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        self.message_type
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    #[must_use]
    pub fn handler_kind(&self) -> HandlerKind {
        self.handler_kind
    }

    /// Lifetime of the handler instance.
    #[must_use]
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    #[must_use]
    pub fn matched(&self) -> MatchKind {
        self.matched
    }

    pub(crate) fn resolve(&self, resolver: &Resolver<'_>) -> Result<Arc<dyn ErasedHandler>, ResolveError> {
        (self.resolve)(resolver)
    }

    fn visible_from(&self, origin: DispatchOrigin) -> bool {
        origin == DispatchOrigin::Internal || self.handler_kind == HandlerKind::External
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("message_type", &self.message_type)
            .field("kind", &self.kind)
            .field("handler", &self.handler_name)
            .field("handler_kind", &self.handler_kind)
            .field("lifetime", &self.lifetime)
            .field("matched", &self.matched)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// GenericDefinition
// ---------------------------------------------------------------------------

/// A handler for every declared message type of `kind` that `applies_to`
/// accepts.
pub(crate) struct GenericDefinition {
    pub(crate) kind: MessageKind,
    pub(crate) handler_name: &'static str,
    pub(crate) handler_kind: HandlerKind,
    pub(crate) lifetime: Lifetime,
    pub(crate) applies_to: AppliesTo,
    pub(crate) resolve: ResolveHandler,
}

// ---------------------------------------------------------------------------
// RegistryBuilder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RegistryBuilder {
    exact: HashMap<MessageType, Vec<Arc<HandlerDescriptor>>>,
    declared: Vec<(MessageType, MessageKind)>,
    generic: Vec<GenericDefinition>,
    fallback: Vec<Arc<HandlerDescriptor>>,
}

impl RegistryBuilder {
    /// Record `message_type` as known, so generic definitions close over it.
    pub(crate) fn declare(&mut self, message_type: MessageType, kind: MessageKind) {
        if !self.declared.iter().any(|(known, _)| *known == message_type) {
            self.declared.push((message_type, kind));
        }
    }

    /// Route one message type to a handler.
    pub(crate) fn add_exact(&mut self, descriptor: HandlerDescriptor) -> Result<(), ConfigError> {
        let Some(message_type) = descriptor.message_type else {
            self.add_fallback(descriptor);
            return Ok(());
        };
        let existing = self.exact.entry(message_type).or_default();
        if let Some(first) = existing.first() {
            match descriptor.kind {
                MessageKind::Command => {
                    return Err(ConfigError::DuplicateCommandHandler {
                        message_type: message_type.name(),
                        existing: first.handler_name,
                        duplicate: descriptor.handler_name,
                    })
                }
                MessageKind::Query => {
                    return Err(ConfigError::DuplicateQueryHandler {
                        message_type: message_type.name(),
                        existing: first.handler_name,
                        duplicate: descriptor.handler_name,
                    })
                }
                MessageKind::Event => {}
            }
        }
        let kind = descriptor.kind;
        existing.push(Arc::new(descriptor));
        self.declare(message_type, kind);
        Ok(())
    }

    pub(crate) fn add_generic(&mut self, definition: GenericDefinition) {
        self.generic.push(definition);
    }

    pub(crate) fn add_fallback(&mut self, descriptor: HandlerDescriptor) {
        self.fallback.push(Arc::new(HandlerDescriptor {
            message_type: None,
            matched: MatchKind::Fallback,
            ..descriptor
        }));
    }

    pub(crate) fn build(self) -> HandlerRegistry {
        let mut generic: HashMap<MessageType, Vec<Arc<HandlerDescriptor>>> = HashMap::new();
        for (message_type, kind) in &self.declared {
            for definition in self.generic.iter().filter(|d| d.kind == *kind) {
                if (definition.applies_to)(message_type) {
                    generic.entry(*message_type).or_default().push(Arc::new(HandlerDescriptor {
                        message_type: Some(*message_type),
                        kind: *kind,
                        handler_name: definition.handler_name,
                        handler_kind: definition.handler_kind,
                        lifetime: definition.lifetime,
                        matched: MatchKind::Generic,
                        resolve: Arc::clone(&definition.resolve),
                    }));
                }
            }
        }

        HandlerRegistry {
            exact: self.exact,
            generic,
            fallback: self.fallback,
            declared: self.declared.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Immutable routing table built by the processor builder.
pub struct HandlerRegistry {
    exact: HashMap<MessageType, Vec<Arc<HandlerDescriptor>>>,
    generic: HashMap<MessageType, Vec<Arc<HandlerDescriptor>>>,
    fallback: Vec<Arc<HandlerDescriptor>>,
    declared: HashMap<MessageType, MessageKind>,
}

impl HandlerRegistry {
    /// Handlers to invoke for a message, in invocation order.
    ///
    /// Commands and queries yield at most one handler; events yield every
    /// visible match. An empty result means no handler is registered.
    #[must_use]
    pub fn handlers_for(
        &self,
        message_type: &MessageType,
        kind: MessageKind,
        origin: DispatchOrigin,
    ) -> Vec<Arc<HandlerDescriptor>> {
        let exact = self.exact.get(message_type).into_iter().flatten();
        let generic = self.generic.get(message_type).into_iter().flatten();
        let fallback = self.fallback.iter().filter(|d| d.kind == kind);
        let mut matches = exact
            .chain(generic)
            .chain(fallback)
            .filter(|d| d.visible_from(origin))
            .cloned();

        match kind {
            MessageKind::Event => matches.collect(),
            MessageKind::Command | MessageKind::Query => matches.next().into_iter().collect(),
        }
    }

    /// Kind a message type was declared or routed with.
    #[must_use]
    pub fn declared_kind(&self, message_type: &MessageType) -> Option<MessageKind> {
        self.declared.get(message_type).copied()
    }

    /// Every descriptor, exact first, then generic, then fallback.
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<HandlerDescriptor>> {
        self.exact
            .values()
            .flatten()
            .chain(self.generic.values().flatten())
            .chain(self.fallback.iter())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("exact", &self.exact.values().map(Vec::len).sum::<usize>())
            .field("generic", &self.generic.values().map(Vec::len).sum::<usize>())
            .field("fallback", &self.fallback.len())
            .finish()
    }
}
