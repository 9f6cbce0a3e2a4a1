//! Abstract radio collaborator contract.
//!
//! The crate does not implement scanning or GATT mechanics itself; it
//! drives a [`RadioAdapter`] and consumes the callbacks it pushes back.
//! Event ordering per connection is part of the contract: the protocol
//! correlates responses by arrival order, not by request id.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Native GATT status code. Zero is success, anything else is a failure
/// reported by the peripheral or the stack.
pub type GattStatus = u8;

pub const GATT_SUCCESS: GattStatus = 0;

/// Link-level connection state reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// One advertisement received while scanning.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Transport address of the advertising peripheral.
    pub address: String,
    /// Raw advertisement payload bytes.
    pub data: Vec<u8>,
    /// Device name parsed out of the payload, when present.
    pub local_name: Option<String>,
}

/// Callback event pushed by the radio layer for one connection.
///
/// Ordering among events from the same connection is FIFO.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    ConnectionState(ConnectionState),
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        characteristic: Uuid,
        status: GattStatus,
    },
    DescriptorWrite {
        descriptor: Uuid,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Sink the driver hands to the radio for advertisement delivery.
pub type AdvertisementSink = mpsc::UnboundedSender<Advertisement>;

/// Sink a device hands to the radio for its connection's callbacks.
pub type RadioEventSink = mpsc::UnboundedSender<RadioEvent>;

/// Scanning and connection entry points of the underlying radio stack.
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Start scanning; advertisements go to `sink` until [`stop_scan`]
    /// is called.
    ///
    /// [`stop_scan`]: RadioAdapter::stop_scan
    async fn start_scan(&self, sink: AdvertisementSink) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Open a connection to `address`. Connection callbacks, including
    /// the initial connected event, are pushed to `events` in order.
    async fn open_connection(
        &self,
        address: &str,
        events: RadioEventSink,
    ) -> Result<Box<dyn GattConnection>>;
}

/// One open native connection handle.
///
/// Requests are acknowledged asynchronously through the event sink given
/// at [`RadioAdapter::open_connection`]; the methods here only report
/// submission failures.
#[async_trait]
pub trait GattConnection: Send + Sync {
    async fn discover_services(&self) -> Result<()>;

    async fn read_characteristic(&self, characteristic: Uuid) -> Result<()>;

    async fn write_characteristic(&self, characteristic: Uuid, value: &[u8]) -> Result<()>;

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Request link disconnection; the radio reports the resulting
    /// disconnected state through the event sink.
    async fn disconnect(&self) -> Result<()>;

    /// Release the native handle. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}
