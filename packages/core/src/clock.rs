//! Ambient clock context.
//!
//! Code that needs "now" asks [`current()`] instead of reading the system
//! clock directly. The returned clock is the one installed for the current
//! async flow by [`scope`] (or [`sync_scope`]), falling back to
//! [`SystemClock`]. Scopes are backed by tokio task-local storage: they follow
//! the future they wrap across `.await` points and worker threads, and are
//! restored when that future completes, fails or is dropped. Tasks spawned from
//! inside a scope do not inherit it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant in UTC.
    fn utc_now(&self) -> DateTime<Utc>;

    /// Current instant in the host's local time zone.
    fn local_now(&self) -> DateTime<Local> {
        self.utc_now().with_timezone(&Local)
    }

    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.utc_now().timestamp_millis()
    }
}

/// Wall-clock time from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock {
    instant: DateTime<Utc>,
}

impl FixedClock {
    /// Clock that always reports `instant`.
    #[must_use]
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self { instant }
    }

    /// Clock pinned to the current reading of `clock`.
    #[must_use]
    pub fn freeze(clock: &dyn Clock) -> Self {
        Self::at(clock.utc_now())
    }

    /// Copy of this clock moved forward by `by`.
    #[must_use]
    pub fn advanced(&self, by: Duration) -> Self {
        Self::at(self.instant + by)
    }

    /// The pinned instant.
    #[must_use]
    pub fn instant(&self) -> DateTime<Utc> {
        self.instant
    }
}

impl Clock for FixedClock {
    fn utc_now(&self) -> DateTime<Utc> {
        self.instant
    }
}

tokio::task_local! {
    static CURRENT_CLOCK: Arc<dyn Clock>;
}

/// The clock installed for the current async flow, or [`SystemClock`].
#[must_use]
pub fn current() -> Arc<dyn Clock> {
    CURRENT_CLOCK
        .try_with(Arc::clone)
        .unwrap_or_else(|_| Arc::new(SystemClock))
}

/// Shorthand for `current().utc_now()`.
#[must_use]
pub fn utc_now() -> DateTime<Utc> {
    current().utc_now()
}

/// Run `future` with `clock` installed as the ambient clock.
///
/// The previous clock is visible again as soon as the returned future
/// completes or is dropped.
pub fn scope<F: Future>(clock: Arc<dyn Clock>, future: F) -> impl Future<Output = F::Output> {
    CURRENT_CLOCK.scope(clock, future)
}

/// Run the synchronous closure `f` with `clock` installed as the ambient clock.
pub fn sync_scope<R>(clock: Arc<dyn Clock>, f: impl FnOnce() -> R) -> R {
    CURRENT_CLOCK.sync_scope(clock, f)
}
