//! Time sources
//!
//! The runtime keeps time in milliseconds on a `u64` tick counter, the same
//! representation RTIC monotonics use, so a BSP can forward its timer
//! queue straight through.

/// Point on the monotonic timeline (millisecond ticks since boot)
pub type Instant = fugit::TimerInstantU64<1000>;

/// Span on the monotonic timeline
pub type Duration = fugit::MillisDurationU64;

/// Monotonic clock with the ability to idle the core
pub trait Monotonic {
    /// Current instant. Never goes backwards within one wake cycle.
    fn now(&self) -> Instant;

    /// Idle until `deadline` or until an interrupt fires, whichever is first.
    ///
    /// `None` means there is no pending deadline: idle until an interrupt.
    /// Returning early is always allowed; the runtime re-checks its queues.
    fn idle_until(&self, deadline: Option<Instant>);
}

/// Calendar clock
pub trait WallClock {
    /// Seconds since 1970-01-01 00:00:00 on the device's local time scale
    fn unix_time(&self) -> i64;
}

impl<T: Monotonic + ?Sized> Monotonic for &T {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn idle_until(&self, deadline: Option<Instant>) {
        (**self).idle_until(deadline)
    }
}

impl<T: WallClock + ?Sized> WallClock for &T {
    fn unix_time(&self) -> i64 {
        (**self).unix_time()
    }
}
