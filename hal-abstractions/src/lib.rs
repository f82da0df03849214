//! Hardware abstraction traits for the environmental data logger
//!
//! This crate defines traits that abstract over hardware differences
//! between boards. BSPs implement these traits; `datalogger-core` consumes
//! them and never touches a peripheral directly.

#![no_std]
#![deny(unsafe_code)]

pub mod pin;
pub mod power;
pub mod sensor;
pub mod serial;
pub mod storage;
pub mod time;

pub use pin::FlexPin;
pub use power::DeepSleep;
pub use sensor::RainGauge;
pub use serial::{LineConfig, Parity};
pub use storage::TransmitQueue;
pub use time::{Duration, Instant, Monotonic, WallClock};
