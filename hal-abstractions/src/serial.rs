//! UART line settings
//!
//! BSPs own UART construction; these describe what each driver expects the
//! line to be configured as.

/// Parity bit setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Asynchronous serial framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineConfig {
    /// Baud rate (bits per second)
    pub baud: u32,
    /// Data bits per character
    pub data_bits: u8,
    /// Parity bit
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: u8,
}

impl LineConfig {
    /// 8 data bits, no parity, 1 stop bit
    pub const fn eight_n_one(baud: u32) -> Self {
        Self {
            baud,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }

    /// 7 data bits, even parity, 1 stop bit
    pub const fn seven_e_one(baud: u32) -> Self {
        Self {
            baud,
            data_bits: 7,
            parity: Parity::Even,
            stop_bits: 1,
        }
    }

    /// Bits on the wire per character, start bit included
    pub const fn bits_per_char(&self) -> u32 {
        let parity = match self.parity {
            Parity::None => 0,
            _ => 1,
        };
        1 + self.data_bits as u32 + parity + self.stop_bits as u32
    }

    /// Time to shift one character out, in microseconds (rounded up)
    pub const fn char_time_us(&self) -> u32 {
        (self.bits_per_char() * 1_000_000).div_ceil(self.baud)
    }
}
