//! An in-memory [`Transport`] used by tests and local demos: delivery
//! happens through channels rather than a socket. Not used in production;
//! the only concrete transport this crate ships.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::route::Transport;
use relaynet_core::Id;

/// A shared switchboard: registering an id returns a transport that can
/// send to it and a receiver of everything sent to it.
#[derive(Default)]
pub struct MemNetwork {
    inboxes: Mutex<HashMap<Id, mpsc::UnboundedSender<Bytes>>>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, id: Id) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().expect("inbox lock poisoned").insert(id, tx);
        rx
    }

    pub fn deregister(&self, id: &Id) {
        self.inboxes.lock().expect("inbox lock poisoned").remove(id);
    }

    /// A transport that delivers to `peer_id` over this network.
    pub fn transport(self: &Arc<Self>, peer_id: Id) -> Arc<MemTransport> {
        Arc::new(MemTransport {
            network: self.clone(),
            peer_id,
            drop_probability: 0.0,
            delay: Duration::ZERO,
        })
    }
}

/// A `Transport` that hands bytes straight to a peer's inbox, optionally
/// simulating loss and delay for tests exercising resend/reorder paths.
pub struct MemTransport {
    network: Arc<MemNetwork>,
    peer_id: Id,
    drop_probability: f64,
    delay: Duration,
}

impl MemTransport {
    pub fn with_conditioner(mut self: Arc<Self>, drop_probability: f64, delay: Duration) -> Arc<Self> {
        let transport = Arc::get_mut(&mut self).expect("transport not yet shared");
        transport.drop_probability = drop_probability.clamp(0.0, 1.0);
        transport.delay = delay;
        self
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn send(&self, bytes: Bytes) -> Result<()> {
        if self.drop_probability > 0.0 && rand::thread_rng().gen_bool(self.drop_probability) {
            return Ok(());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let sender = self
            .network
            .inboxes
            .lock()
            .expect("inbox lock poisoned")
            .get(&self.peer_id)
            .cloned();
        match sender {
            Some(sender) => sender.send(bytes).map_err(|_| Error::NoRoute),
            None => Err(Error::NoRoute),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_bytes_to_registered_peer() {
        let network = MemNetwork::new();
        let a = Id::random();
        let b = Id::random();
        let mut b_inbox = network.register(b);
        network.register(a);

        let transport_to_b = network.transport(b);
        transport_to_b.send(Bytes::from_static(b"hello")).await.unwrap();
        let received = b_inbox.recv().await.unwrap();
        assert_eq!(&received[..], b"hello");
    }

    #[tokio::test]
    async fn send_to_unregistered_peer_fails() {
        let network = MemNetwork::new();
        let transport = network.transport(Id::random());
        let err = transport.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, Error::NoRoute));
    }
}
