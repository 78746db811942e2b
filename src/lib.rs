//! GSM modem daemon
//!
//! Talks AT commands to a GSM modem over a serial port, turns unsolicited
//! notifications into typed events and dispatches them to handlers that
//! answer calls, echo SMS and report GPS status.

pub mod at;
pub mod call;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gps;
pub mod handlers;
pub mod session;
pub mod sms;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
