//! Long-lived named channels between a page agent and the coordinator.
//!
//! A channel is a pair of [`ChannelEnd`]s. Either side may disconnect at any
//! time; both ends then observe the close, pending receives return `None`,
//! and further posts fail with [`ChannelError::Disconnected`].

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};

use crate::error::ChannelError;
use crate::message::PortMessage;

/// Create a connected pair of channel ends sharing `name`.
#[must_use]
pub fn pair(name: &str) -> (ChannelEnd, ChannelEnd) {
    let (closed_tx, _) = watch::channel(false);
    let closed = Arc::new(closed_tx);
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a = ChannelEnd {
        inner: Arc::new(EndInner {
            name: name.to_string(),
            tx: a_tx,
            rx: Mutex::new(b_rx),
            closed: Arc::clone(&closed),
        }),
    };
    let b = ChannelEnd {
        inner: Arc::new(EndInner {
            name: name.to_string(),
            tx: b_tx,
            rx: Mutex::new(a_rx),
            closed,
        }),
    };
    (a, b)
}

#[derive(Debug)]
struct EndInner {
    name: String,
    tx: mpsc::UnboundedSender<PortMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<PortMessage>>,
    closed: Arc<watch::Sender<bool>>,
}

impl Drop for EndInner {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

/// One side of a channel. Clones share the same endpoint.
#[derive(Debug, Clone)]
pub struct ChannelEnd {
    inner: Arc<EndInner>,
}

impl ChannelEnd {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Send a message to the other side.
    pub fn post(&self, message: PortMessage) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Disconnected);
        }
        self.inner
            .tx
            .send(message)
            .map_err(|_| ChannelError::Disconnected)
    }

    /// Next message from the other side, or `None` once the channel closed.
    pub async fn recv(&self) -> Option<PortMessage> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            message = rx.recv() => message,
            _ = closed.wait_for(|closed| *closed) => None,
        }
    }

    /// Close both directions. Idempotent.
    pub fn disconnect(&self) {
        self.inner.closed.send_replace(true);
    }
}
