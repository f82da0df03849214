//! Non-bus sensors

/// Tipping-bucket rain gauge backed by a pulse counter
pub trait RainGauge {
    /// Rainfall (mm) accumulated since the previous call. Resets the counter.
    fn take_rainfall(&mut self) -> f32;
}
