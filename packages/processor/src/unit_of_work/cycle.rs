//! Processing cycle: the state shared by one outermost dispatch and every
//! dispatch nested inside it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::cache::UnitOfWorkCache;
use super::participant::UnitOfWorkParticipant;

/// Whether the cycle may accumulate changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Commands and events: participants enlist and are flushed.
    ReadWrite,
    /// Queries: enlistment is ignored, nothing is flushed.
    ReadOnly,
}

/// Phase of a processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Resolving,
    Invoking,
    Flushing,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Invoking => "invoking",
            Self::Flushing => "flushing",
        };
        f.write_str(label)
    }
}

#[derive(Default)]
struct Enlistments {
    ordered: Vec<Arc<dyn UnitOfWorkParticipant>>,
    seen: HashSet<usize>,
}

/// One processing cycle. Owns the unit-of-work cache and the enlisted
/// participants; disposing the cycle disposes the cache.
pub struct ProcessingCycle {
    id: Uuid,
    mode: CycleMode,
    state: Mutex<CycleState>,
    cache: UnitOfWorkCache,
    enlistments: Mutex<Enlistments>,
}

impl ProcessingCycle {
    #[must_use]
    pub fn new(mode: CycleMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            state: Mutex::new(CycleState::Idle),
            cache: UnitOfWorkCache::new(),
            enlistments: Mutex::new(Enlistments::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn mode(&self) -> CycleMode {
        self.mode
    }

    #[must_use]
    pub fn state(&self) -> CycleState {
        *self.state.lock()
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&self, next: CycleState) -> CycleState {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            debug!(cycle_id = %self.id, from = %previous, to = %next, "cycle state");
        }
        previous
    }

    #[must_use]
    pub fn cache(&self) -> &UnitOfWorkCache {
        &self.cache
    }

    /// Enlist `participant` for the end-of-cycle flush.
    ///
    /// Returns `false` when nothing was recorded: the participant is already
    /// enlisted (by pointer identity), the cycle is read-only, or flushing has
    /// begun.
    pub fn enlist(&self, participant: Arc<dyn UnitOfWorkParticipant>) -> bool {
        if self.mode == CycleMode::ReadOnly || self.state() == CycleState::Flushing {
            return false;
        }
        let identity = Arc::as_ptr(&participant).cast::<()>() as usize;
        let mut enlistments = self.enlistments.lock();
        if !enlistments.seen.insert(identity) {
            return false;
        }
        debug!(cycle_id = %self.id, participant = participant.name(), "enlisted");
        enlistments.ordered.push(participant);
        true
    }

    /// Number of distinct enlisted participants.
    #[must_use]
    pub fn enlisted_count(&self) -> usize {
        self.enlistments.lock().ordered.len()
    }

    /// Drain the enlisted participants in enlistment order.
    pub fn take_enlisted(&self) -> Vec<Arc<dyn UnitOfWorkParticipant>> {
        let mut enlistments = self.enlistments.lock();
        enlistments.seen.clear();
        std::mem::take(&mut enlistments.ordered)
    }

    /// End the cycle: drop enlistments, dispose the cache, return to idle.
    pub fn end(&self) {
        drop(self.take_enlisted());
        self.cache.dispose();
        self.transition(CycleState::Idle);
    }
}

impl Drop for ProcessingCycle {
    fn drop(&mut self) {
        self.cache.dispose();
    }
}

impl fmt::Debug for ProcessingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingCycle")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("enlisted", &self.enlisted_count())
            .finish_non_exhaustive()
    }
}
