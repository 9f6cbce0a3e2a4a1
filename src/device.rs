//! Core device contract: identity, status state machine and channels.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::status::Subscription;

/// Opaque, driver-tagged identity for a physical peripheral.
///
/// Compares and hashes by value; used as the found-device registry key
/// and stable across reconnect cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentifier {
    /// Tag of the driver that resolved this identity, e.g. `"BLE"`.
    pub driver: &'static str,
    /// Driver-specific token, e.g. an address or advertised name.
    pub token: String,
}

impl DeviceIdentifier {
    pub fn new(driver: &'static str, token: impl Into<String>) -> Self {
        Self {
            driver,
            token: token.into(),
        }
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.driver, self.token)
    }
}

/// Connection lifecycle states, monotonic per connection attempt but
/// resettable to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Disconnected,
    Connected,
    ServicesDiscovered,
    Ready,
}

/// One discovered peripheral and its connection lifecycle.
#[async_trait]
pub trait Device: Send + Sync {
    fn identifier(&self) -> &DeviceIdentifier;

    /// Subscribe to the status stream; the current status is replayed
    /// first, then live transitions in order.
    fn status(&self) -> Subscription<DeviceStatus>;

    /// Status at this instant, without subscribing.
    fn current_status(&self) -> DeviceStatus;

    /// The device's channel, present only while the device is `Ready`.
    /// `None` selects the default channel.
    fn channel(&self, channel_id: Option<&str>) -> Option<Arc<dyn DeviceChannel>>;

    /// Open the native connection. Idempotent if already connected; the
    /// outcome is observed through the status stream, not returned here.
    async fn connect(&self) -> Result<()>;

    /// Request native disconnection. Idempotent; the resulting
    /// `Disconnected` status is observed asynchronously.
    async fn disconnect(&self) -> Result<()>;

    /// Forcibly release the native connection resource if still held.
    /// Always safe to call, including after errors; release failures are
    /// logged and swallowed.
    async fn clean_up(&self) -> Result<()>;
}

/// Protocol operations on one connection instance.
///
/// A channel is bound to the connection it was created on and becomes
/// invalid once its device leaves `Ready`; operations on a stale channel
/// fail with [`Error::Closed`].
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// Negotiated payload ceiling bounding single-write chunk size.
    fn maximum_packet_size(&self) -> usize;

    /// Send bytes on the write characteristic and block until the radio
    /// acknowledges the write.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Send bytes, await the write ack, then await the next notification
    /// on the read/notify characteristic and return its payload. Two
    /// sequential waits: the peripheral always emits the ack before the
    /// data notification.
    async fn write_with_response(&self, bytes: &[u8]) -> Result<Vec<u8>>;

    /// Issue a native characteristic read and return the payload of the
    /// matching read result.
    async fn read(&self) -> Result<Vec<u8>>;

    /// Raw payloads of unsolicited notifications that are not consumed
    /// as command responses. Unbounded and restartable.
    fn notifications(&self) -> Notifications;
}

/// Lazy stream of raw notification payloads from one channel.
pub struct Notifications {
    rx: broadcast::Receiver<Vec<u8>>,
}

impl Notifications {
    pub(crate) fn new(rx: broadcast::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next notification payload; [`Error::Closed`] once the channel is
    /// invalidated.
    pub async fn next(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Ok(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Closed),
            }
        }
    }
}

/// Wait for `device` to report `status`, bounded by `timeout`.
pub async fn await_status(
    device: &dyn Device,
    status: DeviceStatus,
    timeout: Duration,
) -> Result<()> {
    device.status().await_value(status, timeout).await
}

/// Run `op` against a connected, ready device, guaranteeing `clean_up`
/// on every exit path.
///
/// Connects, waits for `Ready`, hands the default channel to `op`, then
/// disconnects and waits for `Disconnected`. The cleanup pairing with
/// `connect` holds on success, failure and cancellation: if the returned
/// future is dropped mid-flight, `clean_up` still runs on a spawned task.
pub async fn with_connection<T, F, Fut>(
    device: Arc<dyn Device>,
    timeouts: &Timeouts,
    op: F,
) -> Result<T>
where
    F: FnOnce(Arc<dyn DeviceChannel>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut guard = CleanupGuard {
        device: Some(Arc::clone(&device)),
    };

    let result = async {
        device.connect().await?;
        await_status(device.as_ref(), DeviceStatus::Ready, timeouts.connect()).await?;
        let channel = device
            .channel(None)
            .ok_or_else(|| Error::NotFound(format!("channel on {}", device.identifier())))?;
        let value = op(channel).await?;
        device.disconnect().await?;
        await_status(
            device.as_ref(),
            DeviceStatus::Disconnected,
            timeouts.connect(),
        )
        .await?;
        Ok(value)
    }
    .await;

    // Run the cleanup in-line on normal exits; the guard only covers
    // cancellation.
    if let Some(device) = guard.device.take() {
        if let Err(e) = device.clean_up().await {
            warn!(device = %device.identifier(), error = %e, "clean_up failed");
        }
    }
    result
}

struct CleanupGuard {
    device: Option<Arc<dyn Device>>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            debug!(device = %device.identifier(), "cancelled; releasing connection");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = device.clean_up().await;
                });
            }
        }
    }
}
