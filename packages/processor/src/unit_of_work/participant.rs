use async_trait::async_trait;

/// A resource accumulating pending changes during a processing cycle,
/// flushed once when the outermost dispatch succeeds.
///
/// Implementations are shared (`Arc`) between the resolver cache and the
/// cycle's enlistment list, so `flush` takes `&self` and any pending state
/// lives behind interior mutability.
#[async_trait]
pub trait UnitOfWorkParticipant: Send + Sync {
    /// Name used in logs and in [`FlushError`](crate::FlushError).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether there is anything to flush. Checked at flush time.
    fn requires_flush(&self) -> bool;

    /// Persist pending changes.
    async fn flush(&self) -> anyhow::Result<()>;

    /// Participants sharing a group flush together, in enlistment order.
    fn flush_group(&self) -> Option<&str> {
        None
    }

    /// Whether this participant may flush concurrently with other groups.
    fn can_be_flushed_asynchronously(&self) -> bool {
        false
    }
}
