//! BLE driver: scanning, advertisement deduplication and identity
//! resolution.

pub mod device;
pub mod simblee;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Timeouts;
use crate::device::{Device, DeviceIdentifier};
use crate::driver::{DeviceStream, Driver, DriverStatus, SearchGuard};
use crate::radio::{Advertisement, RadioAdapter};
use crate::status::{Subject, Subscription};

/// Driver tag carried by identifiers this driver resolves.
pub const DRIVER_BLE: &str = "BLE";

/// Short-lived deduplication key for one advertising session: transport
/// address plus the raw advertisement payload. Distinct from
/// [`DeviceIdentifier`], which outlives advertisement events and
/// reconnect cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdvertisingKey {
    address: String,
    data: Vec<u8>,
}

impl AdvertisingKey {
    pub fn new(address: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            address: address.into(),
            data: data.into(),
        }
    }
}

/// Recognizer for one device type. Registered recognizers are tried in
/// registration order; the first match wins.
pub trait BleDeviceFactory: Send + Sync {
    /// Does this advertisement belong to the device type?
    fn matches_advertisement(&self, advertisement: &Advertisement) -> bool;

    /// Does a bare identifier (no advertisement) belong to the device
    /// type? Used by [`Driver::fetch_device`].
    fn matches_identifier(&self, identifier: &DeviceIdentifier) -> bool;

    /// Derive the stable identity from a matching advertisement.
    fn identifier_for(&self, advertisement: &Advertisement) -> DeviceIdentifier;

    /// Construct the device for a resolved identity.
    fn build(
        &self,
        radio: Arc<dyn RadioAdapter>,
        address: String,
        identifier: DeviceIdentifier,
        timeouts: Timeouts,
    ) -> Arc<dyn Device>;
}

struct DriverState {
    by_identifier: HashMap<DeviceIdentifier, Arc<dyn Device>>,
    by_advertising_key: HashMap<AdvertisingKey, Arc<dyn Device>>,
    rejected: HashSet<AdvertisingKey>,
    factories: Vec<Arc<dyn BleDeviceFactory>>,
    searchers: HashMap<u64, mpsc::UnboundedSender<Arc<dyn Device>>>,
    next_searcher_id: u64,
    scanning: bool,
}

struct DriverInner {
    radio: Arc<dyn RadioAdapter>,
    timeouts: Timeouts,
    state: Mutex<DriverState>,
    status: Subject<DriverStatus>,
    advertisement_tx: mpsc::UnboundedSender<Advertisement>,
}

/// Driver over an abstract BLE radio.
pub struct BleDriver {
    inner: Arc<DriverInner>,
}

impl BleDriver {
    pub fn new(radio: Arc<dyn RadioAdapter>, timeouts: Timeouts) -> Self {
        let (advertisement_tx, advertisement_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(DriverInner {
            radio,
            timeouts,
            state: Mutex::new(DriverState {
                by_identifier: HashMap::new(),
                by_advertising_key: HashMap::new(),
                rejected: HashSet::new(),
                factories: Vec::new(),
                searchers: HashMap::new(),
                next_searcher_id: 0,
                scanning: false,
            }),
            status: Subject::new(DriverStatus::Available),
            advertisement_tx,
        });

        // Single consumer of raw advertisements; the registry has exactly
        // one writer.
        let pump = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut rx = advertisement_rx;
            while let Some(advertisement) = rx.recv().await {
                pump.process_advertisement(advertisement);
            }
        });

        Self { inner }
    }

    /// Register a recognizer. Order of registration is the match
    /// priority.
    pub fn register_factory(&self, factory: Arc<dyn BleDeviceFactory>) {
        self.inner.state.lock().unwrap().factories.push(factory);
    }
}

impl DriverInner {
    fn process_advertisement(&self, advertisement: Advertisement) {
        let key = AdvertisingKey::new(advertisement.address.clone(), advertisement.data.clone());
        let mut state = self.state.lock().unwrap();

        // Fast negative path for advertisements nothing recognizes.
        if state.rejected.contains(&key) {
            return;
        }

        if let Some(device) = state.by_advertising_key.get(&key).cloned() {
            Self::emit_device(&mut state, device);
            return;
        }

        let matched = state
            .factories
            .iter()
            .find(|f| f.matches_advertisement(&advertisement))
            .cloned();

        let Some(factory) = matched else {
            debug!(address = %advertisement.address, "no recognizer matched; rejecting key");
            state.rejected.insert(key);
            return;
        };

        let identifier = factory.identifier_for(&advertisement);
        let device = match state.by_identifier.get(&identifier).cloned() {
            // Rediscovered, e.g. after a reconnect: bind the new key to
            // the existing device rather than allocating another.
            Some(existing) => {
                state.by_advertising_key.insert(key, Arc::clone(&existing));
                existing
            }
            None => {
                info!(%identifier, address = %advertisement.address, "new device resolved");
                let device = factory.build(
                    Arc::clone(&self.radio),
                    advertisement.address.clone(),
                    identifier.clone(),
                    self.timeouts.clone(),
                );
                state.by_identifier.insert(identifier, Arc::clone(&device));
                state.by_advertising_key.insert(key, Arc::clone(&device));
                device
            }
        };
        Self::emit_device(&mut state, device);
    }

    fn emit_device(state: &mut DriverState, device: Arc<dyn Device>) {
        state
            .searchers
            .retain(|_, tx| tx.send(Arc::clone(&device)).is_ok());
    }

    fn detach_searcher(&self, id: u64) {
        let stop = {
            let mut state = self.state.lock().unwrap();
            state.searchers.remove(&id);
            if state.searchers.is_empty() && state.scanning {
                state.scanning = false;
                true
            } else {
                false
            }
        };
        if stop {
            let radio = Arc::clone(&self.radio);
            tokio::spawn(async move {
                if let Err(e) = radio.stop_scan().await {
                    warn!(error = %e, "failed to stop scanning");
                }
            });
        }
    }
}

#[async_trait]
impl Driver for BleDriver {
    async fn search(&self, include_previously_found: bool) -> DeviceStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, start) = {
            let mut state = self.inner.state.lock().unwrap();
            if include_previously_found {
                // Replay under the lock so live results cannot interleave
                // ahead of the snapshot.
                for device in state.by_identifier.values() {
                    let _ = tx.send(Arc::clone(device));
                }
            }
            let id = state.next_searcher_id;
            state.next_searcher_id += 1;
            state.searchers.insert(id, tx);
            let start = !state.scanning;
            state.scanning = true;
            (id, start)
        };

        if start {
            let sink = self.inner.advertisement_tx.clone();
            if let Err(e) = self.inner.radio.start_scan(sink).await {
                warn!(error = %e, "failed to start scanning");
                self.inner.status.emit(DriverStatus::Unavailable);
                // Not scanning after all; the next search retries.
                self.inner.state.lock().unwrap().scanning = false;
            }
        }

        let inner = Arc::clone(&self.inner);
        DeviceStream::new(
            rx,
            SearchGuard {
                on_drop: Box::new(move || inner.detach_searcher(id)),
            },
        )
    }

    async fn fetch_device(&self, identifier: &DeviceIdentifier) -> Option<Arc<dyn Device>> {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(device) = state.by_identifier.get(identifier) {
            return Some(Arc::clone(device));
        }
        let factory = state
            .factories
            .iter()
            .find(|f| f.matches_identifier(identifier))
            .cloned()?;
        // No advertisement to take the address from; the identifier token
        // is the best handle the caller has.
        let device = factory.build(
            Arc::clone(&self.inner.radio),
            identifier.token.clone(),
            identifier.clone(),
            self.inner.timeouts.clone(),
        );
        state
            .by_identifier
            .insert(identifier.clone(), Arc::clone(&device));
        Some(device)
    }

    fn status(&self) -> Subscription<DriverStatus> {
        self.inner.status.subscribe()
    }
}
