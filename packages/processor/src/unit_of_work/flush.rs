//! End-of-cycle flush of enlisted participants.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::debug;

use super::participant::UnitOfWorkParticipant;
use crate::error::FlushError;

// ---------------------------------------------------------------------------
// FlushGroup
// ---------------------------------------------------------------------------

/// Participants flushed together, in enlistment order.
pub struct FlushGroup {
    name: Option<String>,
    members: Vec<Arc<dyn UnitOfWorkParticipant>>,
}

impl FlushGroup {
    /// Group name, `None` for an ungrouped participant.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn is_async_capable(&self) -> bool {
        self.members
            .iter()
            .all(|member| member.can_be_flushed_asynchronously())
    }

    async fn flush(&self) -> Result<(usize, usize), FlushError> {
        let mut flushed = 0;
        let mut skipped = 0;
        for member in &self.members {
            if !member.requires_flush() {
                debug!(participant = member.name(), "nothing to flush");
                skipped += 1;
                continue;
            }
            member.flush().await.map_err(|source| FlushError {
                participant: member.name().to_string(),
                group: self.name.clone(),
                source,
            })?;
            flushed += 1;
        }
        Ok((flushed, skipped))
    }
}

// ---------------------------------------------------------------------------
// FlushReport
// ---------------------------------------------------------------------------

/// Outcome of a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Participants whose `flush` ran.
    pub flushed: usize,
    /// Participants that reported nothing to flush.
    pub skipped: usize,
    /// Number of flush groups.
    pub groups: usize,
}

// ---------------------------------------------------------------------------
// FlushCoordinator
// ---------------------------------------------------------------------------

/// Orders and runs the flush of a cycle's enlisted participants.
///
/// Participants sharing a `flush_group` form one group; each ungrouped
/// participant forms its own. Groups are ordered by first enlistment. A run of
/// consecutive groups whose members can all flush asynchronously is flushed
/// concurrently; every other group flushes on its own, in order. The first
/// failure stops the flush: later groups are not started and earlier groups
/// are not rolled back.
pub struct FlushCoordinator {
    groups: Vec<FlushGroup>,
}

impl FlushCoordinator {
    /// Group `participants` (given in enlistment order).
    #[must_use]
    pub fn new(participants: Vec<Arc<dyn UnitOfWorkParticipant>>) -> Self {
        let mut groups: Vec<FlushGroup> = Vec::new();
        for participant in participants {
            let name = participant.flush_group().map(str::to_string);
            let existing = name
                .as_deref()
                .and_then(|name| groups.iter_mut().find(|g| g.name.as_deref() == Some(name)));
            match existing {
                Some(group) => group.members.push(participant),
                None => groups.push(FlushGroup {
                    name,
                    members: vec![participant],
                }),
            }
        }
        Self { groups }
    }

    #[must_use]
    pub fn groups(&self) -> &[FlushGroup] {
        &self.groups
    }

    /// Flush every group.
    ///
    /// # Errors
    ///
    /// Returns the first participant failure as a [`FlushError`].
    pub async fn run(self) -> Result<FlushReport, FlushError> {
        let mut report = FlushReport {
            groups: self.groups.len(),
            ..FlushReport::default()
        };

        let mut index = 0;
        while index < self.groups.len() {
            let end = self.groups[index..]
                .iter()
                .position(|group| !group.is_async_capable())
                .map_or(self.groups.len(), |offset| index + offset);

            let results = if end > index + 1 {
                debug!(groups = end - index, "flushing groups concurrently");
                let batch = join_all(self.groups[index..end].iter().map(FlushGroup::flush)).await;
                index = end;
                batch
            } else {
                let result = self.groups[index].flush().await;
                index += 1;
                vec![result]
            };

            for result in results {
                let (flushed, skipped) = result?;
                report.flushed += flushed;
                report.skipped += skipped;
            }
        }

        Ok(report)
    }
}
