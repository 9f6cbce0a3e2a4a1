//! Per-connection lifecycle and status state machine.
//!
//! `BleDevice` owns the native connection handle and the status subject;
//! device-type specifics (notification setup, channel construction,
//! claiming of unsolicited notifications) hang off [`DeviceHandler`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::CallbackBridge;
use crate::config::Timeouts;
use crate::device::{Device, DeviceChannel, DeviceIdentifier, DeviceStatus};
use crate::error::Result;
use crate::radio::{ConnectionState, GattConnection, RadioAdapter, RadioEvent, GATT_SUCCESS};
use crate::status::{Subject, Subscription};

const NOTIFICATION_CAPACITY: usize = 256;

/// Everything a channel needs from its connection instance.
#[derive(Clone)]
pub struct LinkContext {
    pub link: Arc<dyn GattConnection>,
    pub bridge: Arc<CallbackBridge>,
    pub notify_tx: broadcast::Sender<Vec<u8>>,
    /// Cleared when the connection drops; a channel holding a cleared
    /// flag is stale and must fail.
    pub valid: Arc<AtomicBool>,
    pub timeouts: Timeouts,
}

/// Device-type hook invoked by the connection state machine.
#[async_trait]
pub trait DeviceHandler: Send + Sync + 'static {
    /// One-time setup after service discovery; returns the ready
    /// channel. Runs before `Ready` is emitted.
    async fn make_ready(&self, context: LinkContext) -> Result<Arc<dyn DeviceChannel>>;

    /// Unsolicited characteristic-changed payloads claimed here go to
    /// the channel's notification stream instead of the callback bridge.
    fn claims_notification(&self, characteristic: Uuid, value: &[u8]) -> bool;
}

struct Connection {
    link: Arc<dyn GattConnection>,
    valid: Arc<AtomicBool>,
    // Wakes the connection's event pump so it exits once the connection
    // is released rather than blocking on a dead event stream.
    shutdown: Arc<Notify>,
}

/// A peripheral reachable over the BLE radio.
pub struct BleDevice {
    identifier: DeviceIdentifier,
    address: String,
    radio: Arc<dyn RadioAdapter>,
    timeouts: Timeouts,
    handler: Arc<dyn DeviceHandler>,
    status: Subject<DeviceStatus>,
    connection: Mutex<Option<Connection>>,
    channel_slot: Mutex<Option<Arc<dyn DeviceChannel>>>,
    // Handle to ourselves for spawning the per-connection event pump.
    weak_self: Weak<BleDevice>,
}

impl BleDevice {
    pub fn new(
        identifier: DeviceIdentifier,
        address: String,
        radio: Arc<dyn RadioAdapter>,
        handler: Arc<dyn DeviceHandler>,
        timeouts: Timeouts,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            identifier,
            address,
            radio,
            timeouts,
            handler,
            status: Subject::new(DeviceStatus::Disconnected),
            connection: Mutex::new(None),
            channel_slot: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    fn emit_if_changed(&self, status: DeviceStatus) {
        if self.status.get() != status {
            debug!(device = %self.identifier, ?status, "status");
            self.status.emit(status);
        }
    }

    fn drop_connection(&self) -> Option<Connection> {
        self.channel_slot.lock().unwrap().take();
        let connection = self.connection.lock().unwrap().take();
        if let Some(connection) = &connection {
            connection.valid.store(false, Ordering::SeqCst);
            connection.shutdown.notify_one();
        }
        connection
    }

    /// Event pump for one connection instance. Runs until the radio
    /// reports disconnection or the event stream ends.
    async fn pump_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RadioEvent>,
        link: Arc<dyn GattConnection>,
        bridge: Arc<CallbackBridge>,
        notify_tx: broadcast::Sender<Vec<u8>>,
        valid: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.notified() => break,
            };
            match event {
                RadioEvent::ConnectionState(ConnectionState::Connected) => {
                    self.emit_if_changed(DeviceStatus::Connected);
                    if let Err(e) = link.discover_services().await {
                        warn!(device = %self.identifier, error = %e, "service discovery failed");
                    }
                }
                RadioEvent::ConnectionState(ConnectionState::Disconnected) => {
                    // Only this pump's own connection may be torn down; a
                    // late callback arriving after clean_up must not touch
                    // a newer link.
                    if valid.load(Ordering::SeqCst) {
                        // Mandatory cleanup: a lost connection must
                        // release the native handle or it leaks.
                        if let Some(connection) = self.drop_connection() {
                            let _ = connection.link.close().await;
                        }
                        self.emit_if_changed(DeviceStatus::Disconnected);
                    }
                    break;
                }
                RadioEvent::ServicesDiscovered { status } => {
                    if status != GATT_SUCCESS {
                        warn!(device = %self.identifier, status, "service discovery error status");
                        continue;
                    }
                    self.emit_if_changed(DeviceStatus::ServicesDiscovered);
                    let context = LinkContext {
                        link: Arc::clone(&link),
                        bridge: Arc::clone(&bridge),
                        notify_tx: notify_tx.clone(),
                        valid: Arc::clone(&valid),
                        timeouts: self.timeouts.clone(),
                    };
                    // Setup waits on the bridge for its descriptor ack,
                    // so it cannot run on the routing loop itself.
                    let device = Arc::clone(&self);
                    tokio::spawn(async move {
                        let valid = Arc::clone(&context.valid);
                        match device.handler.make_ready(context).await {
                            Ok(channel) if valid.load(Ordering::SeqCst) => {
                                *device.channel_slot.lock().unwrap() = Some(channel);
                                device.emit_if_changed(DeviceStatus::Ready);
                            }
                            Ok(_) => {
                                debug!(device = %device.identifier, "connection dropped during setup");
                            }
                            Err(e) => {
                                warn!(device = %device.identifier, error = %e, "device setup failed");
                            }
                        }
                    });
                }
                RadioEvent::MtuChanged { mtu, status } => {
                    debug!(device = %self.identifier, mtu, status, "mtu changed");
                }
                RadioEvent::CharacteristicChanged {
                    characteristic,
                    value,
                } if self.handler.claims_notification(characteristic, &value) => {
                    // Out-of-band peripheral push; never mistaken for a
                    // command response.
                    let _ = notify_tx.send(value);
                }
                other => bridge.push(other),
            }
        }
        debug!(device = %self.identifier, "event pump finished");
    }
}

#[async_trait]
impl Device for BleDevice {
    fn identifier(&self) -> &DeviceIdentifier {
        &self.identifier
    }

    fn status(&self) -> Subscription<DeviceStatus> {
        self.status.subscribe()
    }

    fn current_status(&self) -> DeviceStatus {
        self.status.get()
    }

    fn channel(&self, _channel_id: Option<&str>) -> Option<Arc<dyn DeviceChannel>> {
        self.channel_slot.lock().unwrap().clone()
    }

    async fn connect(&self) -> Result<()> {
        if self.connection.lock().unwrap().is_some() {
            return Ok(());
        }
        info!(device = %self.identifier, address = %self.address, "connecting");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link: Arc<dyn GattConnection> =
            Arc::from(self.radio.open_connection(&self.address, events_tx).await?);
        let valid = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());
        let bridge = Arc::new(CallbackBridge::new());
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        {
            let mut connection = self.connection.lock().unwrap();
            // Lost a connect race with another caller; idempotency says
            // the first connection stands.
            if connection.is_some() {
                let link = Arc::clone(&link);
                tokio::spawn(async move {
                    let _ = link.close().await;
                });
                return Ok(());
            }
            *connection = Some(Connection {
                link: Arc::clone(&link),
                valid: Arc::clone(&valid),
                shutdown: Arc::clone(&shutdown),
            });
        }

        // The pump owns this connection's event stream for its lifetime.
        if let Some(device) = self.weak_self.upgrade() {
            tokio::spawn(device.pump_events(events_rx, link, bridge, notify_tx, valid, shutdown));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let link = self
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| Arc::clone(&c.link));
        if let Some(link) = link {
            info!(device = %self.identifier, "disconnecting");
            link.disconnect().await?;
        }
        Ok(())
    }

    async fn clean_up(&self) -> Result<()> {
        if let Some(connection) = self.drop_connection() {
            debug!(device = %self.identifier, "releasing native connection");
            if let Err(e) = connection.link.close().await {
                // Cleanup must stay unconditionally attemptable.
                warn!(device = %self.identifier, error = %e, "error releasing connection");
            }
            self.emit_if_changed(DeviceStatus::Disconnected);
        }
        Ok(())
    }
}
