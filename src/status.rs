//! Broadcast subjects for status fan-out.
//!
//! A [`Subject`] is a single-writer, multi-reader broadcast of a current
//! value: new subscribers observe the value at subscription time first,
//! then every later emission in order. Device and driver status streams
//! are built on this.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::{Error, Result};

const SUBJECT_CAPACITY: usize = 64;

struct Inner<T> {
    // Lock covers both the cached value and the send, so a subscriber
    // created under the lock sees a consistent replay + live sequence.
    current: Mutex<T>,
    tx: broadcast::Sender<T>,
}

/// Single-writer broadcast channel that replays its latest value to new
/// subscribers.
pub struct Subject<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Subject<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = broadcast::channel(SUBJECT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                current: Mutex::new(initial),
                tx,
            }),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.inner.current.lock().unwrap().clone()
    }

    /// Publish a new value to the cache and every live subscriber.
    pub fn emit(&self, value: T) {
        let mut current = self.inner.current.lock().unwrap();
        *current = value.clone();
        // No receivers is fine; the cached value still updates.
        let _ = self.inner.tx.send(value);
    }

    /// Subscribe; the returned stream yields the current value first.
    pub fn subscribe(&self) -> Subscription<T> {
        let current = self.inner.current.lock().unwrap();
        let rx = self.inner.tx.subscribe();
        Subscription {
            replay: Some(current.clone()),
            rx,
        }
    }
}

/// One subscriber's independent cursor over a [`Subject`].
pub struct Subscription<T> {
    replay: Option<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Next value: the replayed current value on first call, live values
    /// afterwards. Fails with [`Error::Closed`] once the subject is gone.
    pub async fn next(&mut self) -> Result<T> {
        if let Some(value) = self.replay.take() {
            return Ok(value);
        }
        loop {
            match self.rx.recv().await {
                Ok(value) => return Ok(value),
                // A slow subscriber only loses history, not liveness.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Closed),
            }
        }
    }

    /// Wait until the subject yields `target`, bounded by `timeout`.
    pub async fn await_value(&mut self, target: T, timeout: Duration) -> Result<()>
    where
        T: PartialEq,
    {
        let wait = async {
            loop {
                if self.next().await? == target {
                    return Ok(());
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout("status transition"))?
    }
}
