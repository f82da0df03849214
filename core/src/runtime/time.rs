//! Timed suspension points

use alloc::rc::Rc;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use datalogger_hal::time::Instant;

use super::Shared;

/// Future returned by [`Handle::sleep`](super::Handle::sleep) and friends
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    pub(crate) shared: Rc<Shared>,
    pub(crate) deadline: Instant,
    pub(crate) background: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.shared.now() >= self.deadline {
            Poll::Ready(())
        } else {
            self.shared.request_wake_at(self.deadline, self.background);
            Poll::Pending
        }
    }
}

/// Future returned by [`Handle::yield_now`](super::Handle::yield_now)
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    pub(crate) shared: Rc<Shared>,
    pub(crate) yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            Poll::Ready(())
        } else {
            this.yielded = true;
            this.shared.request_yield();
            Poll::Pending
        }
    }
}

/// The supervised future lost its race against the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimedOut;

impl core::fmt::Display for TimedOut {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Operation timed out")
    }
}

impl core::error::Error for TimedOut {}
