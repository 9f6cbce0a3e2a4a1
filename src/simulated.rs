//! Simulated driver and peripheral.
//!
//! Satisfies the same `Driver`/`Device`/`DeviceChannel` contract as the
//! BLE implementation with no radio underneath; used by the demo binary
//! and anywhere a real peripheral is unavailable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::device::{Device, DeviceChannel, DeviceIdentifier, DeviceStatus, Notifications};
use crate::driver::{DeviceStream, Driver, DriverStatus, SearchGuard};
use crate::error::{Error, Result};
use crate::protocol::{
    Color, COMMAND_FLASH_COLOR_HEADER, COMMAND_FLASH_COLOR_WRITE_DATA, COMMAND_READ_COLOR,
    COMMAND_SET_COLOR, FLASH_ENTRY_LEN, NOTIFICATION_COLOR_CHANGE,
    NOTIFICATION_READ_COLOR_RESULT,
};
use crate::status::{Subject, Subscription};

/// Driver tag carried by simulated identifiers.
pub const DRIVER_SIMULATED: &str = "SIM";

/// Simulated peripheral response latency.
const LATENCY: Duration = Duration::from_millis(100);

/// Recognizer/constructor for one simulated device type.
pub trait SimulatedDeviceFactory: Send + Sync {
    fn matches_identifier(&self, identifier: &DeviceIdentifier) -> bool;
    fn build(&self, identifier: DeviceIdentifier) -> Arc<dyn Device>;
}

struct SimulatedState {
    by_identifier: HashMap<DeviceIdentifier, Arc<dyn Device>>,
    factories: Vec<Arc<dyn SimulatedDeviceFactory>>,
    searchers: HashMap<u64, mpsc::UnboundedSender<Arc<dyn Device>>>,
    next_searcher_id: u64,
}

/// In-process driver; devices appear when fetched or injected, never by
/// scanning.
pub struct SimulatedDriver {
    state: Arc<Mutex<SimulatedState>>,
    status: Subject<DriverStatus>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatedState {
                by_identifier: HashMap::new(),
                factories: Vec::new(),
                searchers: HashMap::new(),
                next_searcher_id: 0,
            })),
            status: Subject::new(DriverStatus::Available),
        }
    }

    pub fn register_factory(&self, factory: Arc<dyn SimulatedDeviceFactory>) {
        self.state.lock().unwrap().factories.push(factory);
    }

    /// Inject a device as if it had been discovered.
    pub fn add_device(&self, device: Arc<dyn Device>) {
        let mut state = self.state.lock().unwrap();
        state
            .by_identifier
            .insert(device.identifier().clone(), Arc::clone(&device));
        state
            .searchers
            .retain(|_, tx| tx.send(Arc::clone(&device)).is_ok());
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for SimulatedDriver {
    async fn search(&self, include_previously_found: bool) -> DeviceStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock().unwrap();
            if include_previously_found {
                for device in state.by_identifier.values() {
                    let _ = tx.send(Arc::clone(device));
                }
            }
            let id = state.next_searcher_id;
            state.next_searcher_id += 1;
            state.searchers.insert(id, tx);
            id
        };

        let state = Arc::clone(&self.state);
        DeviceStream::new(
            rx,
            SearchGuard {
                on_drop: Box::new(move || {
                    state.lock().unwrap().searchers.remove(&id);
                }),
            },
        )
    }

    async fn fetch_device(&self, identifier: &DeviceIdentifier) -> Option<Arc<dyn Device>> {
        let mut state = self.state.lock().unwrap();
        if let Some(device) = state.by_identifier.get(identifier) {
            return Some(Arc::clone(device));
        }
        let factory = state
            .factories
            .iter()
            .find(|f| f.matches_identifier(identifier))
            .cloned()?;
        let device = factory.build(identifier.clone());
        state
            .by_identifier
            .insert(identifier.clone(), Arc::clone(&device));
        Some(device)
    }

    fn status(&self) -> Subscription<DriverStatus> {
        self.status.subscribe()
    }
}

/// Factory for [`SimulatedSimbleeDevice`].
pub struct SimulatedSimbleeDeviceFactory;

impl SimulatedDeviceFactory for SimulatedSimbleeDeviceFactory {
    fn matches_identifier(&self, identifier: &DeviceIdentifier) -> bool {
        identifier.driver == DRIVER_SIMULATED && identifier.token == "SIMBLEE"
    }

    fn build(&self, identifier: DeviceIdentifier) -> Arc<dyn Device> {
        Arc::new(SimulatedSimbleeDevice::new(identifier))
    }
}

/// Simulated Simblee: connecting walks the full status sequence, the
/// channel answers color commands after a small latency.
pub struct SimulatedSimbleeDevice {
    identifier: DeviceIdentifier,
    status: Subject<DeviceStatus>,
    channel: Arc<SimulatedSimbleeChannel>,
}

impl SimulatedSimbleeDevice {
    pub fn new(identifier: DeviceIdentifier) -> Self {
        Self {
            identifier,
            status: Subject::new(DeviceStatus::Disconnected),
            channel: Arc::new(SimulatedSimbleeChannel::new()),
        }
    }
}

#[async_trait]
impl Device for SimulatedSimbleeDevice {
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
        if self.status.get() == DeviceStatus::Ready {
            Some(Arc::clone(&self.channel) as Arc<dyn DeviceChannel>)
        } else {
            None
        }
    }

    async fn connect(&self) -> Result<()> {
        if self.status.get() == DeviceStatus::Disconnected {
            self.channel.live.store(true, Ordering::SeqCst);
            self.status.emit(DeviceStatus::Connected);
            self.status.emit(DeviceStatus::ServicesDiscovered);
            self.status.emit(DeviceStatus::Ready);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.status.get() != DeviceStatus::Disconnected {
            self.channel.live.store(false, Ordering::SeqCst);
            self.status.emit(DeviceStatus::Disconnected);
        }
        Ok(())
    }

    async fn clean_up(&self) -> Result<()> {
        // Nothing native to release, but a retained channel handle must
        // not keep answering.
        self.channel.live.store(false, Ordering::SeqCst);
        if self.status.get() != DeviceStatus::Disconnected {
            self.status.emit(DeviceStatus::Disconnected);
        }
        Ok(())
    }
}

struct ChannelState {
    color: [u8; 3],
    flash_declared_len: u32,
    flash_buffer: Vec<u8>,
    flash_blocks: u8,
}

/// Channel of a simulated Simblee.
pub struct SimulatedSimbleeChannel {
    state: Arc<Mutex<ChannelState>>,
    notify_tx: broadcast::Sender<Vec<u8>>,
    // Set while the owning device is connected; a handle retained past
    // disconnect fails like a real stale channel.
    live: AtomicBool,
}

impl SimulatedSimbleeChannel {
    fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                color: [0, 0, 0],
                flash_declared_len: 0,
                flash_buffer: Vec::new(),
                flash_blocks: 0,
            })),
            notify_tx,
            live: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.live.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    fn set_color(&self, color: [u8; 3]) {
        self.state.lock().unwrap().color = color;
        let _ = self.notify_tx.send(vec![
            NOTIFICATION_COLOR_CHANGE,
            color[0],
            color[1],
            color[2],
        ]);
    }

    /// Play the uploaded flash sequence back as color changes.
    fn start_playback(&self) {
        let entries: Vec<(Color, Duration)> = {
            let state = self.state.lock().unwrap();
            state
                .flash_buffer
                .chunks_exact(FLASH_ENTRY_LEN)
                .map(|entry| {
                    let millis = u64::from_le_bytes(entry[3..11].try_into().unwrap());
                    (
                        Color::rgb(entry[0], entry[1], entry[2]),
                        Duration::from_millis(millis),
                    )
                })
                .collect()
        };
        let state = Arc::clone(&self.state);
        let notify_tx = self.notify_tx.clone();
        tokio::spawn(async move {
            for (color, duration) in entries {
                {
                    let mut state = state.lock().unwrap();
                    state.color = [color.red, color.green, color.blue];
                }
                let _ = notify_tx.send(vec![
                    NOTIFICATION_COLOR_CHANGE,
                    color.red,
                    color.green,
                    color.blue,
                ]);
                tokio::time::sleep(duration).await;
            }
            debug!("flash playback finished");
        });
    }

    fn respond(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match bytes.first().copied() {
            Some(COMMAND_SET_COLOR) if bytes.len() == 4 => {
                self.set_color([bytes[1], bytes[2], bytes[3]]);
                let color = self.state.lock().unwrap().color;
                Ok(vec![
                    NOTIFICATION_COLOR_CHANGE,
                    color[0],
                    color[1],
                    color[2],
                ])
            }
            Some(COMMAND_READ_COLOR) if bytes.len() == 1 => {
                let color = self.state.lock().unwrap().color;
                Ok(vec![
                    NOTIFICATION_READ_COLOR_RESULT,
                    color[0],
                    color[1],
                    color[2],
                ])
            }
            Some(COMMAND_FLASH_COLOR_HEADER) if bytes.len() == 5 => {
                let mut state = self.state.lock().unwrap();
                state.flash_declared_len =
                    u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
                state.flash_buffer.clear();
                state.flash_blocks = 0;
                Ok(vec![COMMAND_FLASH_COLOR_HEADER])
            }
            Some(COMMAND_FLASH_COLOR_WRITE_DATA) if bytes.len() >= 3 => {
                let complete = {
                    let mut state = self.state.lock().unwrap();
                    if bytes[1] != state.flash_blocks {
                        return Err(Error::Protocol(format!(
                            "block {} out of order, expected {}",
                            bytes[1], state.flash_blocks
                        )));
                    }
                    state.flash_buffer.extend_from_slice(&bytes[3..]);
                    state.flash_blocks += 1;
                    state.flash_buffer.len() as u32 >= state.flash_declared_len
                };
                if complete {
                    self.start_playback();
                }
                Ok(vec![COMMAND_FLASH_COLOR_WRITE_DATA, bytes[1]])
            }
            _ => Err(Error::Protocol(format!(
                "simulated peripheral rejected command: {bytes:02X?}"
            ))),
        }
    }
}

#[async_trait]
impl DeviceChannel for SimulatedSimbleeChannel {
    fn maximum_packet_size(&self) -> usize {
        crate::ble::simblee::MAX_PACKET_SIZE
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_live()?;
        tokio::time::sleep(LATENCY).await;
        self.respond(bytes).map(|_| ())
    }

    async fn write_with_response(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.ensure_live()?;
        tokio::time::sleep(LATENCY).await;
        self.respond(bytes)
    }

    async fn read(&self) -> Result<Vec<u8>> {
        self.ensure_live()?;
        tokio::time::sleep(LATENCY).await;
        let color = self.state.lock().unwrap().color;
        Ok(vec![
            NOTIFICATION_READ_COLOR_RESULT,
            color[0],
            color[1],
            color[2],
        ])
    }

    fn notifications(&self) -> Notifications {
        Notifications::new(self.notify_tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::await_status;
    use crate::protocol::{ColorFlash, SimbleeCommands};

    fn simblee_identifier() -> DeviceIdentifier {
        DeviceIdentifier::new(DRIVER_SIMULATED, "SIMBLEE")
    }

    fn driver_with_factory() -> SimulatedDriver {
        let driver = SimulatedDriver::new();
        driver.register_factory(Arc::new(SimulatedSimbleeDeviceFactory));
        driver
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_connect_and_exchange_colors() {
        let driver = driver_with_factory();
        let device = driver.fetch_device(&simblee_identifier()).await.unwrap();

        device.connect().await.unwrap();
        await_status(device.as_ref(), DeviceStatus::Ready, Duration::from_secs(1))
            .await
            .unwrap();

        let channel = device.channel(None).unwrap();
        let color = Color::rgb(1, 2, 3);
        channel.set_color(color).await.unwrap();
        assert_eq!(channel.read_color().await.unwrap(), color);

        device.disconnect().await.unwrap();
        assert_eq!(device.current_status(), DeviceStatus::Disconnected);
        assert!(device.channel(None).is_none());
        device.clean_up().await.unwrap();
    }

    #[tokio::test]
    async fn search_replays_known_devices() {
        let driver = driver_with_factory();
        let device = driver.fetch_device(&simblee_identifier()).await.unwrap();

        let mut stream = driver.search(true).await;
        let found = stream.next().await.unwrap();
        assert!(Arc::ptr_eq(&device, &found));
    }

    #[tokio::test(start_paused = true)]
    async fn flash_upload_reassembles_and_plays_back() {
        let driver = driver_with_factory();
        let device = driver.fetch_device(&simblee_identifier()).await.unwrap();
        device.connect().await.unwrap();
        let channel = device.channel(None).unwrap();

        let mut changes = channel.color_changes();
        let flashes = vec![
            ColorFlash::new(Color::rgb(10, 0, 0), Duration::from_millis(50)),
            ColorFlash::new(Color::rgb(0, 10, 0), Duration::from_millis(50)),
        ];
        channel.flash_colors(&flashes).await.unwrap();

        assert_eq!(changes.next().await.unwrap(), Color::rgb(10, 0, 0));
        assert_eq!(changes.next().await.unwrap(), Color::rgb(0, 10, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn retained_channel_fails_closed_after_disconnect() {
        let driver = driver_with_factory();
        let device = driver.fetch_device(&simblee_identifier()).await.unwrap();
        device.connect().await.unwrap();
        let channel = device.channel(None).unwrap();

        device.disconnect().await.unwrap();
        assert!(matches!(
            channel.set_color(Color::rgb(1, 2, 3)).await,
            Err(Error::Closed)
        ));

        // Reconnecting revives the device's channel as usual.
        device.connect().await.unwrap();
        let channel = device.channel(None).unwrap();
        channel.set_color(Color::rgb(1, 2, 3)).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_identifier_is_not_fetched() {
        let driver = driver_with_factory();
        let identifier = DeviceIdentifier::new(DRIVER_SIMULATED, "OTHER");
        assert!(driver.fetch_device(&identifier).await.is_none());
    }
}
