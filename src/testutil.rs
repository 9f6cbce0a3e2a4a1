//! Scripted radio collaborator for driver and device tests.
//!
//! `MockRadio` plays the role of the native stack with one emulated
//! Simblee peripheral behind it: connection requests succeed, service
//! discovery completes, and writes on the command characteristic are
//! answered per the wire protocol.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::ble::simblee::{CLIENT_CHARACTERISTIC_CONFIG_UUID, READ_NOTIFY_UUID, WRITE_UUID};
use crate::error::{Error, Result};
use crate::protocol::{
    COMMAND_FLASH_COLOR_HEADER, COMMAND_FLASH_COLOR_WRITE_DATA, COMMAND_READ_COLOR,
    COMMAND_SET_COLOR, NOTIFICATION_COLOR_CHANGE, NOTIFICATION_READ_COLOR_RESULT,
};
use crate::radio::{
    Advertisement, AdvertisementSink, ConnectionState, GattConnection, RadioAdapter,
    RadioEvent, RadioEventSink, GATT_SUCCESS,
};

#[derive(Default)]
struct PeripheralState {
    color: [u8; 3],
    flash_declared_len: u32,
    flash_buffer: Vec<u8>,
    flash_blocks: u32,
}

struct MockState {
    silent: bool,
    scan_sink: Mutex<Option<AdvertisementSink>>,
    scan_starts: AtomicU32,
    scan_stops: AtomicU32,
    fail_next_scan_start: AtomicBool,
    opened: AtomicU32,
    closed: AtomicU32,
    event_sinks: Mutex<Vec<RadioEventSink>>,
    peripheral: Mutex<PeripheralState>,
}

/// Radio collaborator double with one emulated Simblee behind it.
pub struct MockRadio {
    state: Arc<MockState>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::with_silence(false)
    }

    /// A radio that opens connections but never reports any callback;
    /// used to exercise timeout paths.
    pub fn silent() -> Self {
        Self::with_silence(true)
    }

    fn with_silence(silent: bool) -> Self {
        Self {
            state: Arc::new(MockState {
                silent,
                scan_sink: Mutex::new(None),
                scan_starts: AtomicU32::new(0),
                scan_stops: AtomicU32::new(0),
                fail_next_scan_start: AtomicBool::new(false),
                opened: AtomicU32::new(0),
                closed: AtomicU32::new(0),
                event_sinks: Mutex::new(Vec::new()),
                peripheral: Mutex::new(PeripheralState::default()),
            }),
        }
    }

    /// Deliver one advertisement through the active scan sink.
    pub async fn advertise(&self, advertisement: Advertisement) {
        let sink = self
            .state
            .scan_sink
            .lock()
            .unwrap()
            .clone()
            .expect("advertise() without an active scan");
        sink.send(advertisement).expect("driver dropped scan sink");
        // Let the driver's advertisement pump run.
        tokio::task::yield_now().await;
    }

    pub fn scan_starts(&self) -> u32 {
        self.state.scan_starts.load(Ordering::SeqCst)
    }

    pub fn scan_stops(&self) -> u32 {
        self.state.scan_stops.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> u32 {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> u32 {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn flash_buffer(&self) -> Vec<u8> {
        self.state.peripheral.lock().unwrap().flash_buffer.clone()
    }

    pub fn flash_declared_len(&self) -> u32 {
        self.state.peripheral.lock().unwrap().flash_declared_len
    }

    pub fn flash_blocks_received(&self) -> u32 {
        self.state.peripheral.lock().unwrap().flash_blocks
    }

    /// Make the next `start_scan` call report a radio failure.
    pub fn fail_next_scan_start(&self) {
        self.state
            .fail_next_scan_start
            .store(true, Ordering::SeqCst);
    }

    /// Deliver an event on the sink of the `index`-th opened connection,
    /// regardless of whether that connection has since been released.
    pub fn emit_on(&self, index: usize, event: RadioEvent) {
        let sink = self.state.event_sinks.lock().unwrap()[index].clone();
        let _ = sink.send(event);
    }

    pub async fn wait_scan_stopped(&self) {
        while self.scan_stops() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_connection_closed(&self) {
        while self.connections_closed() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl RadioAdapter for MockRadio {
    async fn start_scan(&self, sink: AdvertisementSink) -> Result<()> {
        if self.state.fail_next_scan_start.swap(false, Ordering::SeqCst) {
            return Err(Error::Radio("scan start rejected".to_string()));
        }
        *self.state.scan_sink.lock().unwrap() = Some(sink);
        self.state.scan_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state.scan_sink.lock().unwrap().take();
        self.state.scan_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open_connection(
        &self,
        _address: &str,
        events: RadioEventSink,
    ) -> Result<Box<dyn GattConnection>> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        self.state.event_sinks.lock().unwrap().push(events.clone());
        if !self.state.silent {
            let _ = events.send(RadioEvent::ConnectionState(ConnectionState::Connected));
        }
        Ok(Box::new(MockLink {
            state: Arc::clone(&self.state),
            events,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockLink {
    state: Arc<MockState>,
    events: RadioEventSink,
    closed: AtomicBool,
}

impl MockLink {
    fn emit(&self, event: RadioEvent) {
        if !self.state.silent {
            let _ = self.events.send(event);
        }
    }
}

#[async_trait]
impl GattConnection for MockLink {
    async fn discover_services(&self) -> Result<()> {
        self.emit(RadioEvent::ServicesDiscovered {
            status: GATT_SUCCESS,
        });
        Ok(())
    }

    async fn read_characteristic(&self, characteristic: Uuid) -> Result<()> {
        assert_eq!(characteristic, READ_NOTIFY_UUID);
        let color = self.state.peripheral.lock().unwrap().color;
        self.emit(RadioEvent::CharacteristicRead {
            characteristic,
            status: GATT_SUCCESS,
            value: vec![
                NOTIFICATION_READ_COLOR_RESULT,
                color[0],
                color[1],
                color[2],
            ],
        });
        Ok(())
    }

    async fn write_characteristic(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        assert_eq!(characteristic, WRITE_UUID);
        // The ack always precedes any data notification.
        self.emit(RadioEvent::CharacteristicWrite {
            characteristic,
            status: GATT_SUCCESS,
        });

        let response = {
            let mut peripheral = self.state.peripheral.lock().unwrap();
            match value.first().copied() {
                Some(COMMAND_SET_COLOR) if value.len() == 4 => {
                    peripheral.color = [value[1], value[2], value[3]];
                    vec![
                        NOTIFICATION_COLOR_CHANGE,
                        value[1],
                        value[2],
                        value[3],
                    ]
                }
                Some(COMMAND_READ_COLOR) if value.len() == 1 => {
                    let c = peripheral.color;
                    vec![NOTIFICATION_READ_COLOR_RESULT, c[0], c[1], c[2]]
                }
                Some(COMMAND_FLASH_COLOR_HEADER) if value.len() == 5 => {
                    peripheral.flash_declared_len =
                        u32::from_le_bytes([value[1], value[2], value[3], value[4]]);
                    peripheral.flash_buffer.clear();
                    peripheral.flash_blocks = 0;
                    vec![COMMAND_FLASH_COLOR_HEADER]
                }
                Some(COMMAND_FLASH_COLOR_WRITE_DATA) if value.len() >= 3 => {
                    let block_len = value[2] as usize;
                    assert_eq!(value.len(), 3 + block_len, "block length field mismatch");
                    assert_eq!(
                        value[1] as u32, peripheral.flash_blocks,
                        "blocks must arrive in index order"
                    );
                    peripheral.flash_buffer.extend_from_slice(&value[3..]);
                    peripheral.flash_blocks += 1;
                    vec![COMMAND_FLASH_COLOR_WRITE_DATA, value[1]]
                }
                _ => panic!("peripheral received malformed command: {value:02X?}"),
            }
        };
        self.emit(RadioEvent::CharacteristicChanged {
            characteristic: READ_NOTIFY_UUID,
            value: response,
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        _value: &[u8],
    ) -> Result<()> {
        assert_eq!(characteristic, READ_NOTIFY_UUID);
        assert_eq!(descriptor, CLIENT_CHARACTERISTIC_CONFIG_UUID);
        self.emit(RadioEvent::DescriptorWrite {
            descriptor,
            status: GATT_SUCCESS,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.emit(RadioEvent::ConnectionState(ConnectionState::Disconnected));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
