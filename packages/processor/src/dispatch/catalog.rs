//! Declarative handler table.
//!
//! A catalog lists handler registrations as data so a host can install all
//! of them, or a filtered subset, on a [`ProcessorBuilder`].

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use conduit_core::{Message, MessageKind, MessageType, Query};

use super::handler::{MessageHandler, QueryHandler};
use super::processor::ProcessorBuilder;
use super::registry::HandlerKind;
use crate::error::ConfigError;
use crate::lifetime::{LifetimeTag, Resolver};

type Installer =
    Box<dyn Fn(&mut ProcessorBuilder, LifetimeTag) -> Result<(), ConfigError> + Send + Sync>;

type SharedFactory<H> = Arc<dyn Fn(&Resolver<'_>) -> anyhow::Result<H> + Send + Sync>;

/// One row of a [`HandlerCatalog`].
pub struct CatalogEntry {
    handler_name: &'static str,
    message_type: MessageType,
    kind: MessageKind,
    handler_kind: HandlerKind,
    lifetime: LifetimeTag,
    installer: Installer,
}

impl CatalogEntry {
    #[must_use]
    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn handler_kind(&self) -> HandlerKind {
        self.handler_kind
    }

    /// Lifetime tag as written in the table. Validated on install.
    #[must_use]
    pub fn lifetime(&self) -> &LifetimeTag {
        &self.lifetime
    }

    pub(crate) fn install(&self, builder: &mut ProcessorBuilder) -> Result<(), ConfigError> {
        (self.installer)(builder, self.lifetime.clone())
    }
}

impl fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("handler", &self.handler_name)
            .field("message_type", &self.message_type)
            .field("kind", &self.kind)
            .field("handler_kind", &self.handler_kind)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

/// Ordered list of handler registrations.
#[derive(Debug, Default)]
pub struct HandlerCatalog {
    entries: Vec<CatalogEntry>,
}

impl HandlerCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command handler row. See [`ProcessorBuilder::command_handler`].
    #[must_use]
    pub fn command<M, H, F>(self, lifetime: impl Into<LifetimeTag>, factory: F) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
        F: Fn(&Resolver<'_>) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory: SharedFactory<H> = Arc::new(factory);
        self.push::<M, H>(lifetime.into(), HandlerKind::External, move |builder, tag| {
            let factory = Arc::clone(&factory);
            builder
                .command_handler::<M, H, _>(tag, move |r: &Resolver<'_>| factory(r))
                .map(drop)
        })
    }

    /// Add an event handler row reachable from publications only.
    #[must_use]
    pub fn event<M, H, F>(self, lifetime: impl Into<LifetimeTag>, factory: F) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
        F: Fn(&Resolver<'_>) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory: SharedFactory<H> = Arc::new(factory);
        self.push::<M, H>(lifetime.into(), HandlerKind::Internal, move |builder, tag| {
            let factory = Arc::clone(&factory);
            builder
                .event_handler::<M, H, _>(tag, move |r: &Resolver<'_>| factory(r))
                .map(drop)
        })
    }

    /// Add an event handler row reachable from outside as well.
    #[must_use]
    pub fn external_event<M, H, F>(self, lifetime: impl Into<LifetimeTag>, factory: F) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
        F: Fn(&Resolver<'_>) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory: SharedFactory<H> = Arc::new(factory);
        self.push::<M, H>(lifetime.into(), HandlerKind::External, move |builder, tag| {
            let factory = Arc::clone(&factory);
            builder
                .external_event_handler::<M, H, _>(tag, move |r: &Resolver<'_>| factory(r))
                .map(drop)
        })
    }

    /// Add a query handler row.
    #[must_use]
    pub fn query<Q, H, F>(self, lifetime: impl Into<LifetimeTag>, factory: F) -> Self
    where
        Q: Query,
        H: QueryHandler<Q>,
        F: Fn(&Resolver<'_>) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory: SharedFactory<H> = Arc::new(factory);
        self.push::<Q, H>(lifetime.into(), HandlerKind::External, move |builder, tag| {
            let factory = Arc::clone(&factory);
            builder
                .query_handler::<Q, H, _>(tag, move |r: &Resolver<'_>| factory(r))
                .map(drop)
        })
    }

    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push<M: Message, H: 'static>(
        mut self,
        lifetime: LifetimeTag,
        handler_kind: HandlerKind,
        installer: impl Fn(&mut ProcessorBuilder, LifetimeTag) -> Result<(), ConfigError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.entries.push(CatalogEntry {
            handler_name: type_name::<H>(),
            message_type: MessageType::of::<M>(),
            kind: M::KIND,
            handler_kind,
            lifetime,
            installer: Box::new(installer),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
