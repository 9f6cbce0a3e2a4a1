//! Callback bridge: converts the radio layer's push-style callbacks into
//! pull-style blocking calls.
//!
//! The radio delivers exactly one outstanding operation's result at a
//! time per connection and guarantees callback ordering, so correlating
//! by arrival order is sufficient. That requires the caller to never keep
//! two native requests outstanding on the same channel; the channel's
//! operation lock enforces it.

use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::radio::RadioEvent;

/// FIFO queue of radio events with a blocking poll side.
pub struct CallbackBridge {
    tx: mpsc::UnboundedSender<RadioEvent>,
    rx: Mutex<mpsc::UnboundedReceiver<RadioEvent>>,
    operation: Mutex<()>,
}

impl CallbackBridge {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            operation: Mutex::new(()),
        }
    }

    /// Serializes whole request/response cycles. Held for the duration of
    /// a channel operation so at most one native request is outstanding.
    pub async fn operation_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.operation.lock().await
    }

    /// Enqueue an event from the radio callback context. Never blocks and
    /// preserves arrival order.
    pub fn push(&self, event: RadioEvent) {
        // Receiver lives as long as the bridge, so this cannot fail.
        let _ = self.tx.send(event);
    }

    /// Wait for the next event, bounded by `timeout`.
    pub async fn poll(&self, timeout: Duration, waiting_for: &'static str) -> Result<RadioEvent> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout(waiting_for)),
        }
    }

    /// Wait for the first event satisfying `predicate` within an overall
    /// deadline, discarding events that do not match.
    pub async fn poll_where<P>(
        &self,
        mut predicate: P,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> Result<RadioEvent>
    where
        P: FnMut(&RadioEvent) -> bool + Send,
    {
        let mut rx = self.rx.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(Error::Closed),
                Err(_) => return Err(Error::Timeout(waiting_for)),
            };
            if predicate(&event) {
                return Ok(event);
            }
            tracing::debug!(?event, "discarding non-matching callback");
        }
    }
}

impl Default for CallbackBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{ConnectionState, GATT_SUCCESS};
    use uuid::Uuid;

    #[tokio::test]
    async fn poll_preserves_arrival_order() {
        let bridge = CallbackBridge::new();
        bridge.push(RadioEvent::ServicesDiscovered {
            status: GATT_SUCCESS,
        });
        bridge.push(RadioEvent::ConnectionState(ConnectionState::Disconnected));

        let first = bridge.poll(Duration::from_millis(50), "event").await.unwrap();
        assert!(matches!(first, RadioEvent::ServicesDiscovered { .. }));
        let second = bridge.poll(Duration::from_millis(50), "event").await.unwrap();
        assert!(matches!(
            second,
            RadioEvent::ConnectionState(ConnectionState::Disconnected)
        ));
    }

    #[tokio::test]
    async fn poll_times_out_when_empty() {
        let bridge = CallbackBridge::new();
        let err = bridge
            .poll(Duration::from_millis(20), "write ack")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout("write ack")));
    }

    #[tokio::test]
    async fn poll_where_discards_non_matching_events() {
        let bridge = CallbackBridge::new();
        let characteristic = Uuid::new_v4();
        bridge.push(RadioEvent::MtuChanged {
            mtu: 23,
            status: GATT_SUCCESS,
        });
        bridge.push(RadioEvent::DescriptorWrite {
            descriptor: characteristic,
            status: GATT_SUCCESS,
        });

        let event = bridge
            .poll_where(
                |e| matches!(e, RadioEvent::DescriptorWrite { .. }),
                Duration::from_millis(50),
                "descriptor ack",
            )
            .await
            .unwrap();
        assert!(matches!(event, RadioEvent::DescriptorWrite { .. }));
    }
}
