//! Simblee color peripheral: recognizer, device setup and channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::{uuid, Uuid};

use crate::ble::device::{BleDevice, DeviceHandler, LinkContext};
use crate::ble::{BleDeviceFactory, DRIVER_BLE};
use crate::config::Timeouts;
use crate::device::{Device, DeviceChannel, DeviceIdentifier, Notifications};
use crate::error::{Error, Result};
use crate::protocol::NOTIFICATION_COLOR_CHANGE;
use crate::radio::{Advertisement, RadioAdapter, RadioEvent, GATT_SUCCESS};

/// Simblee GATT service.
pub const SERVICE_UUID: Uuid = uuid!("0000fe84-0000-1000-8000-00805f9b34fb");

/// Characteristic carrying peripheral-to-central data: read results and
/// notifications.
pub const READ_NOTIFY_UUID: Uuid = uuid!("2d30c082-f39f-4ce6-923f-3484ea480596");

/// Characteristic the peripheral receives commands on.
pub const WRITE_UUID: Uuid = uuid!("2d30c083-f39f-4ce6-923f-3484ea480596");

/// Standard client characteristic configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    uuid!("00002902-0000-1000-8000-00805f9b34fb");

const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Advertised device name the recognizer matches on.
pub const ADVERTISED_NAME: &str = "SIMBLEE";

/// Negotiated payload ceiling for a single write.
pub const MAX_PACKET_SIZE: usize = 20;

/// Recognizer for Simblee peripherals.
pub struct SimbleeDeviceFactory;

impl BleDeviceFactory for SimbleeDeviceFactory {
    fn matches_advertisement(&self, advertisement: &Advertisement) -> bool {
        advertisement.local_name.as_deref() == Some(ADVERTISED_NAME)
    }

    fn matches_identifier(&self, identifier: &DeviceIdentifier) -> bool {
        identifier.driver == DRIVER_BLE && identifier.token == ADVERTISED_NAME
    }

    fn identifier_for(&self, advertisement: &Advertisement) -> DeviceIdentifier {
        // The advertised name is the stable identity token; the transport
        // address can rotate between sessions.
        DeviceIdentifier::new(
            DRIVER_BLE,
            advertisement.local_name.as_deref().unwrap_or(ADVERTISED_NAME),
        )
    }

    fn build(
        &self,
        radio: Arc<dyn RadioAdapter>,
        address: String,
        identifier: DeviceIdentifier,
        timeouts: Timeouts,
    ) -> Arc<dyn Device> {
        BleDevice::new(identifier, address, radio, Arc::new(SimbleeHandler), timeouts)
    }
}

/// Simblee-specific half of the connection state machine: enables
/// notification delivery once services are discovered, then builds the
/// default channel.
pub struct SimbleeHandler;

#[async_trait]
impl DeviceHandler for SimbleeHandler {
    async fn make_ready(&self, context: LinkContext) -> Result<Arc<dyn DeviceChannel>> {
        context
            .link
            .write_descriptor(
                READ_NOTIFY_UUID,
                CLIENT_CHARACTERISTIC_CONFIG_UUID,
                &ENABLE_NOTIFICATION_VALUE,
            )
            .await?;

        let ack = context
            .bridge
            .poll_where(
                |event| matches!(event, RadioEvent::DescriptorWrite { .. }),
                context.timeouts.descriptor_setup(),
                "descriptor write ack",
            )
            .await?;
        if let RadioEvent::DescriptorWrite { status, .. } = ack {
            if status != GATT_SUCCESS {
                return Err(Error::gatt_status("notification setup", status));
            }
        }
        debug!("notifications enabled");
        Ok(Arc::new(SimbleeChannel { context }))
    }

    fn claims_notification(&self, characteristic: Uuid, value: &[u8]) -> bool {
        characteristic == READ_NOTIFY_UUID
            && value.first() == Some(&NOTIFICATION_COLOR_CHANGE)
    }
}

/// Default channel of a ready Simblee device.
///
/// Operations serialize through an internal lock so at most one native
/// request is outstanding at a time; response correlation relies on it.
pub struct SimbleeChannel {
    context: LinkContext,
}

impl SimbleeChannel {
    fn ensure_live(&self) -> Result<()> {
        if self.context.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Write plus ack wait; callers hold the operation lock.
    async fn write_and_ack(&self, bytes: &[u8]) -> Result<()> {
        self.context
            .link
            .write_characteristic(WRITE_UUID, bytes)
            .await?;
        let event = self
            .context
            .bridge
            .poll(self.context.timeouts.write_ack(), "write ack")
            .await?;
        match event {
            RadioEvent::CharacteristicWrite {
                characteristic,
                status,
            } if characteristic == WRITE_UUID => {
                if status == GATT_SUCCESS {
                    Ok(())
                } else {
                    Err(Error::gatt_status("characteristic write", status))
                }
            }
            other => Err(Error::Protocol(format!(
                "unexpected callback awaiting write ack: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl DeviceChannel for SimbleeChannel {
    fn maximum_packet_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let _op = self.context.bridge.operation_lock().await;
        self.ensure_live()?;
        self.write_and_ack(bytes).await
    }

    async fn write_with_response(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.ensure_live()?;
        let _op = self.context.bridge.operation_lock().await;
        self.ensure_live()?;
        self.write_and_ack(bytes).await?;

        // The peripheral always acks the write before pushing the data
        // notification, hence two sequential waits rather than a race.
        let event = self
            .context
            .bridge
            .poll(self.context.timeouts.response(), "command response")
            .await?;
        match event {
            RadioEvent::CharacteristicChanged {
                characteristic,
                value,
            } if characteristic == READ_NOTIFY_UUID => Ok(value),
            other => Err(Error::Protocol(format!(
                "unexpected callback awaiting response: {other:?}"
            ))),
        }
    }

    async fn read(&self) -> Result<Vec<u8>> {
        self.ensure_live()?;
        let _op = self.context.bridge.operation_lock().await;
        self.ensure_live()?;
        self.context
            .link
            .read_characteristic(READ_NOTIFY_UUID)
            .await?;
        let event = self
            .context
            .bridge
            .poll(self.context.timeouts.write_ack(), "read result")
            .await?;
        match event {
            RadioEvent::CharacteristicRead {
                characteristic,
                status,
                value,
            } if characteristic == READ_NOTIFY_UUID => {
                if status == GATT_SUCCESS {
                    Ok(value)
                } else {
                    Err(Error::gatt_status("characteristic read", status))
                }
            }
            other => Err(Error::Protocol(format!(
                "unexpected callback awaiting read result: {other:?}"
            ))),
        }
    }

    fn notifications(&self) -> Notifications {
        Notifications::new(self.context.notify_tx.subscribe())
    }
}
