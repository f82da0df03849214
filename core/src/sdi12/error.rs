//! SDI-12 driver error types

/// SDI-12 transaction errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sdi12Error {
    /// Sensor rail is off; nothing was sent
    SensorsAsleep,
    /// No usable reply after every attempt
    NoResponse {
        /// Address the command was sent to (`?` for a query)
        address: char,
    },
    /// Replies kept coming from another sensor
    AddressMismatch { expected: char, received: char },
    /// Reply does not follow the SDI-12 format
    Malformed,
    /// Reply CRC does not match its contents
    CrcMismatch,
    /// Command lacks an address or the trailing `!`
    InvalidCommand,
    /// UART read or write failed
    Serial,
    /// Direction, force-out or enable pin failed
    Pin,
}

impl core::fmt::Display for Sdi12Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SensorsAsleep => write!(f, "Sensors are asleep and must not be accessed"),
            Self::NoResponse { address } => write!(f, "No response from sensor {}", address),
            Self::AddressMismatch { expected, received } => write!(
                f,
                "Expected a reply from sensor {}, got one from {}",
                expected, received
            ),
            Self::Malformed => write!(f, "Malformed sensor reply"),
            Self::CrcMismatch => write!(f, "Sensor reply CRC mismatch"),
            Self::InvalidCommand => {
                write!(f, "Command must start with an address and end with !")
            }
            Self::Serial => write!(f, "Serial transport error"),
            Self::Pin => write!(f, "Bus pin error"),
        }
    }
}

impl core::error::Error for Sdi12Error {}
