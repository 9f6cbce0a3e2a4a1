//! Driver contract: discovery and identity resolution.

use std::sync::Arc;

use async_trait::async_trait;

use crate::device::{Device, DeviceIdentifier};
use crate::status::Subscription;

/// Availability of the underlying transport, e.g. the adapter being
/// switched on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Available,
    Unavailable,
}

/// Discovers peripherals and resolves stable device identities.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Lazy, restartable sequence of discovered devices.
    ///
    /// With `include_previously_found`, every device already in the
    /// registry is replayed before newly discovered ones. Scanning starts
    /// when the first search is open and stops when the last one is
    /// dropped.
    async fn search(&self, include_previously_found: bool) -> DeviceStream;

    /// Registry lookup; on a miss, attempts construction via a recognizer
    /// that matches the identifier directly.
    async fn fetch_device(&self, identifier: &DeviceIdentifier) -> Option<Arc<dyn Device>>;

    /// Driver availability stream.
    fn status(&self) -> Subscription<DriverStatus>;
}

/// One subscriber's view of the discovered-device sequence.
///
/// Dropping it detaches the subscriber; the driver stops scanning once no
/// subscriber remains.
pub struct DeviceStream {
    rx: tokio::sync::mpsc::UnboundedReceiver<Arc<dyn Device>>,
    _guard: SearchGuard,
}

impl DeviceStream {
    pub(crate) fn new(
        rx: tokio::sync::mpsc::UnboundedReceiver<Arc<dyn Device>>,
        guard: SearchGuard,
    ) -> Self {
        Self { rx, _guard: guard }
    }

    /// Next discovered (or replayed) device; `None` once the driver is
    /// gone.
    pub async fn next(&mut self) -> Option<Arc<dyn Device>> {
        self.rx.recv().await
    }
}

/// Drop hook that detaches a search subscriber.
pub(crate) struct SearchGuard {
    pub(crate) on_drop: Box<dyn FnOnce() + Send>,
}

impl Drop for SearchGuard {
    fn drop(&mut self) {
        let on_drop = std::mem::replace(&mut self.on_drop, Box::new(|| {}));
        on_drop();
    }
}
