//! Message dispatch: handler traits, routing, the per-invocation request
//! type, and the processor driving processing cycles.

pub mod catalog;
pub mod context;
pub mod handler;
pub mod invocation;
pub mod processor;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use catalog::{CatalogEntry, HandlerCatalog};
pub use context::HandlerContext;
pub use handler::{GenericHandler, HandlerService, MessageHandler, QueryHandler};
pub use invocation::{HandlerPipeline, Invocation, InvocationFuture, Reply};
pub use processor::{DispatchOptions, MessageProcessor, ProcessorBuilder};
pub use registry::{AppliesTo, DispatchOrigin, HandlerDescriptor, HandlerKind, HandlerRegistry, MatchKind};
