//! Tri-state pins

use embedded_hal::digital::{InputPin, OutputPin};

/// A pin that can drive, be read back, and be released to high impedance.
///
/// The modem power key relies on the module's internal pull-up once released,
/// and every pin is floated before deep sleep.
pub trait FlexPin: OutputPin + InputPin {
    /// Stop driving the pin (input, no pull)
    fn set_floating(&mut self) -> Result<(), Self::Error>;
}
