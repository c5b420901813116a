use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use tokio::time::Instant;

/// Monotonic microsecond clock used for path expiry.
///
/// Each table measures time from its own epoch, so expiry values are only
/// comparable within the table that produced them.
#[derive(Debug, Clone)]
pub enum PathClock {
    Monotonic(Instant),
    /// Driven by hand, for deterministic tests of expiry.
    Manual(Arc<AtomicCell<u64>>),
}

impl Default for PathClock {
    fn default() -> Self {
        PathClock::Monotonic(Instant::now())
    }
}

impl PathClock {
    pub fn manual() -> (Self, ManualClock) {
        let cell = Arc::new(AtomicCell::new(0));
        (PathClock::Manual(cell.clone()), ManualClock(cell))
    }

    pub fn now_us(&self) -> u64 {
        match self {
            PathClock::Monotonic(epoch) => {
                u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
            }
            PathClock::Manual(cell) => cell.load(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManualClock(Arc<AtomicCell<u64>>);

impl ManualClock {
    pub fn advance_us(&self, us: u64) {
        let now = self.0.load();
        self.0.store(now.saturating_add(us));
    }

    pub fn set_us(&self, us: u64) {
        self.0.store(us);
    }
}
