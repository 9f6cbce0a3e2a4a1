//! Driver, connection state machine and wire protocol for Simblee color
//! peripherals over BLE.
//!
//! The crate turns a callback-driven radio interface into sequential
//! request/response operations with timeouts:
//!
//! - [`driver::Driver`] scans, deduplicates advertisements into stable
//!   device identities and fans out discoveries to searchers.
//! - [`device::Device`] owns one connection's lifecycle and status state
//!   machine.
//! - [`device::DeviceChannel`] frames commands, chunks oversized payloads
//!   and correlates responses pulled from the [`bridge::CallbackBridge`].
//!
//! The radio stack itself sits behind the [`radio`] traits; the
//! [`simulated`] module satisfies the same contract without one.

pub mod ble;
pub mod bridge;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod radio;
pub mod simulated;
pub mod status;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{Settings, Timeouts};
pub use device::{
    await_status, with_connection, Device, DeviceChannel, DeviceIdentifier, DeviceStatus,
};
pub use driver::{DeviceStream, Driver, DriverStatus};
pub use error::{Error, Result};
pub use protocol::{Color, ColorFlash, SimbleeCommands};
