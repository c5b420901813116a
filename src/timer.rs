use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

/// Longest period a timer accepts; larger requests are clamped.
pub const MAX_TIMER_PERIOD: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRepeat {
    Forever,
    Times(u32),
}

/// Periodic timer polled from an extension task's `select!` loop.
///
/// Without `auto_restart` the timer disarms after each trigger until
/// [`Timer::restart`] is called. A closed (or exhausted) timer never fires
/// again.
#[derive(Debug)]
pub struct Timer {
    interval: Interval,
    period: Duration,
    repeat: TimerRepeat,
    fired: u32,
    auto_restart: bool,
    armed: bool,
    closed: bool,
}

impl Timer {
    pub fn new(period: Duration, repeat: TimerRepeat, auto_restart: bool) -> Self {
        let period = period.clamp(Duration::from_micros(1), MAX_TIMER_PERIOD);
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, period, repeat, fired: 0, auto_restart, armed: true, closed: false }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_closed(&self) -> bool {
        self.closed || matches!(self.repeat, TimerRepeat::Times(n) if self.fired >= n)
    }

    pub fn fired(&self) -> u32 {
        self.fired
    }

    /// Resolves on the next trigger; pends forever once disarmed or closed.
    pub async fn tick(&mut self) {
        if self.is_closed() || !self.armed {
            return std::future::pending().await;
        }
        self.interval.tick().await;
        self.fired = self.fired.saturating_add(1);
        if !self.auto_restart {
            self.armed = false;
        }
    }

    pub fn restart(&mut self) {
        if !self.closed {
            self.interval.reset();
            self.armed = true;
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}
