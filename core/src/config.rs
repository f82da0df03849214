//! Sensor configuration as handed over by the configuration provider

use heapless::{String, Vec};

/// Readings a single sensor may report (`aD0!`..`aD9!` carry at most this many)
pub const MAX_READINGS: usize = 9;

/// Sensors on one bus
pub const MAX_SENSORS: usize = 8;

pub type SensorName = String<32>;
pub type ReadingName = String<40>;
pub type Unit = String<8>;

/// Sensor configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Address outside `[A-Za-z0-9]`
    InvalidAddress(char),
    /// Record interval of zero minutes
    ZeroRecordInterval,
    /// Reading index outside 1..=MAX_READINGS
    InvalidReadingIndex(u8),
    /// More readings than a sensor can report
    TooManyReadings,
    /// Name or unit does not fit its buffer
    TextTooLong,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidAddress(c) => write!(f, "Invalid SDI-12 address {:?}", c),
            Self::ZeroRecordInterval => write!(f, "Record interval must be positive"),
            Self::InvalidReadingIndex(i) => write!(f, "Invalid reading index {}", i),
            Self::TooManyReadings => write!(f, "Too many readings"),
            Self::TextTooLong => write!(f, "Text too long"),
        }
    }
}

impl core::error::Error for ConfigError {}

/// SDI-12 sensor address, one of `[A-Za-z0-9]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address(u8);

impl Address {
    pub fn new(c: char) -> Result<Self, ConfigError> {
        if c.is_ascii_alphanumeric() {
            Ok(Self(c as u8))
        } else {
            Err(ConfigError::InvalidAddress(c))
        }
    }

    pub fn as_char(self) -> char {
        self.0 as char
    }
}

impl TryFrom<char> for Address {
    type Error = ConfigError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        Self::new(c)
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

fn text<const N: usize>(s: &str) -> Result<String<N>, ConfigError> {
    let mut out = String::new();
    out.push_str(s).map_err(|_| ConfigError::TextTooLong)?;
    Ok(out)
}

/// One value selected from a sensor's data replies
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingConfig {
    /// Position in the concatenated `aD0!`, `aD1!`, ... values, 1-based
    pub index: u8,
    /// Applied first
    pub multiplier: f32,
    /// Applied after the multiplier
    pub offset: f32,
    pub unit: Unit,
    /// Key in the result map (a result UUID for MonitorMyWatershed)
    pub name: ReadingName,
}

impl ReadingConfig {
    pub fn new(name: &str, index: u8) -> Result<Self, ConfigError> {
        if index == 0 || usize::from(index) > MAX_READINGS {
            return Err(ConfigError::InvalidReadingIndex(index));
        }
        Ok(Self {
            index,
            multiplier: 1.0,
            offset: 0.0,
            unit: Unit::new(),
            name: text(name)?,
        })
    }

    pub fn scaled(mut self, multiplier: f32, offset: f32) -> Self {
        self.multiplier = multiplier;
        self.offset = offset;
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Result<Self, ConfigError> {
        self.unit = text(unit)?;
        Ok(self)
    }

    /// `raw * multiplier + offset`, in that order
    pub fn apply(&self, raw: f32) -> f32 {
        raw * self.multiplier + self.offset
    }
}

/// One sensor on the SDI-12 bus
#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub name: SensorName,
    pub address: Address,
    /// Seconds from rail power-up until the sensor answers
    pub bootup_time: u32,
    /// Minutes between recordings, always positive
    pub record_interval: u32,
    /// Alignment point of the recording grid, same clock as `now`
    pub first_record_at: i64,
    /// Request a CRC with every measurement (`aMC!`)
    pub crc: bool,
    pub enabled: bool,
    pub readings: Vec<ReadingConfig, MAX_READINGS>,
}

impl SensorConfig {
    pub fn new(name: &str, address: char, record_interval: u32) -> Result<Self, ConfigError> {
        let config = Self {
            name: text(name)?,
            address: Address::new(address)?,
            bootup_time: 0,
            record_interval,
            first_record_at: 0,
            crc: false,
            enabled: true,
            readings: Vec::new(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_bootup_time(mut self, seconds: u32) -> Self {
        self.bootup_time = seconds;
        self
    }

    pub fn with_first_record_at(mut self, at: i64) -> Self {
        self.first_record_at = at;
        self
    }

    pub fn with_crc(mut self, crc: bool) -> Self {
        self.crc = crc;
        self
    }

    pub fn with_reading(mut self, reading: ReadingConfig) -> Result<Self, ConfigError> {
        self.readings
            .push(reading)
            .map_err(|_| ConfigError::TooManyReadings)?;
        Ok(self)
    }

    /// Highest reading index the sensor must deliver
    pub fn max_index(&self) -> usize {
        self.readings
            .iter()
            .map(|r| usize::from(r.index))
            .max()
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.record_interval == 0 {
            return Err(ConfigError::ZeroRecordInterval);
        }
        // Fields are public; re-check what `new` checked.
        Address::new(self.address.as_char())?;
        for reading in &self.readings {
            if reading.index == 0 || usize::from(reading.index) > MAX_READINGS {
                return Err(ConfigError::InvalidReadingIndex(reading.index));
            }
        }
        Ok(())
    }
}
