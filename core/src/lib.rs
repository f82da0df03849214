//! Platform-agnostic core logic for the environmental data logger
//!
//! This crate contains the protocol drivers and scheduling logic that run on
//! every supported board. It has NO hardware dependencies: pins, UARTs and
//! clocks arrive through `embedded-hal`, `embedded-io` and `datalogger-hal`.
//!
//! Everything runs on the cooperative [`runtime`], one wake cycle at a time.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!("Features \"defmt\" and \"log\" are mutually exclusive and cannot be enabled together");

extern crate alloc;

// Must stay first: the logging macros are textually scoped.
mod fmt;

pub mod calendar;
pub mod config;
pub mod cycle;
pub mod modem;
pub mod payload;
pub mod protocol;
pub mod runtime;
pub mod schedule;
pub mod sdi12;

#[cfg(test)]
mod mock;
