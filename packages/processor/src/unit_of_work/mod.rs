//! Unit of work: per-cycle cache, processing cycle, participants, and flush.

pub mod cache;
pub mod cycle;
pub mod flush;
pub mod participant;

pub use cache::{CacheEntry, CacheKey, CachedValue, InvalidateFn, UnitOfWorkCache};
pub use cycle::{CycleMode, CycleState, ProcessingCycle};
pub use flush::{FlushCoordinator, FlushGroup, FlushReport};
pub use participant::UnitOfWorkParticipant;
