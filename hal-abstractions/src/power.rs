//! Low power states

use crate::time::Duration;

/// Deep sleep primitive
///
/// Implementations do not return on hardware; the wake is a reset.
pub trait DeepSleep {
    fn deep_sleep(&mut self, duration: Duration);
}
