//! Modem driver error types

use crate::payload::PayloadError;

/// Faults that abort a modem operation.
///
/// A command that times out or answers `ERROR` is not one of these; the
/// operation reports it as `false` or an empty reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModemError {
    /// UART read or write failed
    Serial,
    /// Power key pin failed
    Pin,
    /// Command does not fit the command buffer
    CommandTooLong,
    /// Module did not confirm a file upload
    FileWrite,
    /// Module never came up; nothing can be sent
    NoResponse,
    /// Payload could not be built
    Payload(PayloadError),
}

impl core::fmt::Display for ModemError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Serial => write!(f, "Serial transport error"),
            Self::Pin => write!(f, "Power key pin error"),
            Self::CommandTooLong => write!(f, "Command too long"),
            Self::FileWrite => write!(f, "File upload not confirmed"),
            Self::NoResponse => write!(f, "Modem not responding"),
            Self::Payload(e) => write!(f, "Payload error: {}", e),
        }
    }
}

impl core::error::Error for ModemError {}

impl From<PayloadError> for ModemError {
    fn from(e: PayloadError) -> Self {
        Self::Payload(e)
    }
}
