//! `Client`: the single-provider composition root. Wires a route
//! manager, a contract manager, and the three buffer dispatchers
//! together behind one `send`/`recv`/`ingest` surface.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use relaynet_core::config::ClientSettings;
use relaynet_core::{Id, TransferPath};

use crate::audit::PeerAudit;
use crate::buffers::{ForwardBuffer, ReceiveBuffer, SendBuffer};
use crate::contract::ContractManager;
use crate::error::{Error, Result};
use crate::frame::{message_type, Ack, Pack, TransferFrame};
use crate::route::{MultiRouteSelector, RouteManager, Transport};
use crate::timeout::Timeout;

/// One provider-facing client: one local identity, one set of routes to
/// that provider, and the send/receive/forward sequences multiplexed
/// over them.
pub struct Client {
    local_id: Id,
    route_manager: Arc<RouteManager>,
    contracts: Arc<ContractManager>,
    audit: Arc<PeerAudit>,
    cancel: CancellationToken,
    send_buffer: SendBuffer,
    receive_buffer: ReceiveBuffer,
    forward_buffer: ForwardBuffer,
    inbound: Mutex<mpsc::Receiver<(Id, Bytes)>>,
}

impl Client {
    pub fn new(
        local_id: Id,
        settings: ClientSettings,
        secret: Vec<u8>,
        control_plane: Box<dyn crate::contract::ControlPlane>,
    ) -> Self {
        let route_manager = Arc::new(RouteManager::new());
        let selector = Arc::new(MultiRouteSelector::new(route_manager.clone()));
        let contracts = Arc::new(ContractManager::new(
            settings.contract_manager.clone(),
            secret,
            control_plane,
        ));
        let audit = Arc::new(PeerAudit::new());
        let cancel = CancellationToken::new();
        let (output_tx, output_rx) = mpsc::channel(settings.sequence_buffer_size);

        let send_buffer = SendBuffer::new(
            contracts.clone(),
            selector.clone(),
            settings.send_buffer.clone(),
            audit.clone(),
            cancel.clone(),
            settings.ack_buffer_size,
        );
        let receive_buffer = ReceiveBuffer::new(
            contracts.clone(),
            selector.clone(),
            settings.receive_buffer.clone(),
            audit.clone(),
            cancel.clone(),
            settings.sequence_buffer_size,
            output_tx,
        );
        let forward_buffer = ForwardBuffer::new(
            contracts.clone(),
            selector,
            settings.forward_buffer.clone(),
            audit.clone(),
            cancel.clone(),
            settings.sequence_buffer_size,
        );

        Self {
            local_id,
            route_manager,
            contracts,
            audit,
            cancel,
            send_buffer,
            receive_buffer,
            forward_buffer,
            inbound: Mutex::new(output_rx),
        }
    }

    pub fn local_id(&self) -> Id {
        self.local_id
    }

    pub fn audit(&self) -> Arc<PeerAudit> {
        self.audit.clone()
    }

    pub fn contracts(&self) -> Arc<ContractManager> {
        self.contracts.clone()
    }

    pub async fn add_route(&self, peer_id: Id, transport: Arc<dyn Transport>) {
        self.route_manager.add_route(peer_id, transport).await;
    }

    pub async fn route_count(&self) -> usize {
        self.route_manager.route_count().await
    }

    /// Send application bytes toward `destination_id`, optionally
    /// addressed to a specific `stream_id` (use `CONTROL_ID` for none).
    pub async fn send(
        &self,
        destination_id: Id,
        stream_id: Id,
        bytes: Bytes,
        timeout: Timeout,
    ) -> Result<()> {
        let path = TransferPath::new(self.local_id, destination_id, stream_id);
        self.send_buffer.send(path, bytes, timeout).await
    }

    /// Receive the next delivered application payload, tagged with the
    /// sequence id it arrived on.
    pub async fn recv(&self) -> Option<(Id, Bytes)> {
        self.inbound.lock().await.recv().await
    }

    /// Feed one raw envelope received from a transport into the engine.
    /// Dispatches to receive processing if addressed to this client,
    /// otherwise forwards it toward its destination.
    pub async fn ingest(&self, bytes: &[u8]) -> Result<()> {
        let envelope = TransferFrame::from_bytes(bytes)?;

        if envelope.path.destination_id != self.local_id && !envelope.path.destination_id.is_control() {
            return self
                .forward_buffer
                .dispatch(envelope.path.destination_id, envelope)
                .await;
        }

        match envelope.frame.message_type {
            message_type::PACK => {
                let pack: Pack = envelope.frame.decode()?;
                self.receive_buffer.dispatch(envelope.path, pack).await
            }
            message_type::ACK => {
                let ack: Ack = envelope.frame.decode()?;
                let reverse_path = TransferPath::new(
                    envelope.path.destination_id,
                    envelope.path.source_id,
                    envelope.path.stream_id,
                );
                self.send_buffer.dispatch_ack(reverse_path, ack).await
            }
            _ => {
                self.audit.record_bad_message(envelope.frame.bytes.len() as u64);
                Err(Error::bad_message("unhandled message type at client boundary"))
            }
        }
    }

    /// Tear down every sequence owned by this client.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
