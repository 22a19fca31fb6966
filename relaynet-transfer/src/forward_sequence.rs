//! `ForwardSequence`: copies envelopes through an intermediary toward
//! their next hop without reassembling the application stream they
//! carry.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use relaynet_core::config::ForwardBufferSettings;
use relaynet_core::Id;

use crate::audit::PeerAudit;
use crate::contract::ContractManager;
use crate::error::Result;
use crate::frame::{Contract, Pack, TransferFrame};
use crate::route::MultiRouteSelector;

struct Inner {
    last_activity: Instant,
    closed: bool,
}

/// Relays whatever a [`TransferFrame`] carries to its next hop, copying
/// bytes through rather than reassembling them.
pub struct ForwardSequence {
    id: Id,
    settings: ForwardBufferSettings,
    contracts: Arc<ContractManager>,
    selector: Arc<MultiRouteSelector>,
    audit: Arc<PeerAudit>,
    cancel: CancellationToken,
    inner: Mutex<Inner>,
}

impl ForwardSequence {
    pub fn spawn(
        contracts: Arc<ContractManager>,
        selector: Arc<MultiRouteSelector>,
        settings: ForwardBufferSettings,
        audit: Arc<PeerAudit>,
        cancel: CancellationToken,
        intake_buffer_size: usize,
    ) -> (Arc<Self>, mpsc::Sender<TransferFrame>) {
        let sequence = Arc::new(Self {
            id: Id::random(),
            settings,
            contracts,
            selector,
            audit,
            cancel,
            inner: Mutex::new(Inner {
                last_activity: Instant::now(),
                closed: false,
            }),
        });
        let (intake_tx, intake_rx) = mpsc::channel(intake_buffer_size);
        tokio::spawn(sequence.clone().run(intake_rx));
        (sequence, intake_tx)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    async fn run(self: Arc<Self>, mut intake: mpsc::Receiver<TransferFrame>) {
        loop {
            let idle_at = self.inner.lock().await.last_activity + self.settings.idle_timeout();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = intake.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = self.forward(frame).await {
                                warn!(sequence_id = ?self.id, error = %e, "dropping unforwardable frame");
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(idle_at) => {
                    self.inner.lock().await.closed = true;
                    break;
                }
            }
        }
        trace!(sequence_id = ?self.id, "forward sequence idle, tearing down");
    }

    async fn forward(&self, frame: TransferFrame) -> Result<()> {
        self.inner.lock().await.last_activity = Instant::now();

        if self.settings.verify_forward_messages {
            if let Ok(pack) = frame.frame.decode::<Pack>() {
                if let Some(contract_frame) = &pack.contract_frame {
                    if let Ok(contract) = contract_frame.decode::<Contract>() {
                        if !self.contracts.verify(&contract) {
                            self.audit.record_bad_contract();
                            return Err(crate::error::Error::bad_contract(
                                "forwarded contract failed verification",
                            ));
                        }
                    }
                }
            }
        }

        let bytes = Bytes::from(frame.to_bytes()?);
        let byte_count = bytes.len() as u64;
        self.selector
            .write(bytes, self.settings.write_timeout().into(), &self.cancel)
            .await?;
        self.audit.record_sent(byte_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ControlPlane;
    use crate::frame::{message_type, ApplicationMessage, CreateContract, Frame, ProvideMode, StoredContract};
    use crate::mem_transport::MemNetwork;
    use crate::route::RouteManager;
    use async_trait::async_trait;
    use relaynet_core::config::ContractManagerSettings;
    use relaynet_core::TransferPath;

    struct NeverCalled;

    #[async_trait]
    impl ControlPlane for NeverCalled {
        async fn create_contract(&self, _request: CreateContract) -> Result<Contract> {
            Err(crate::error::Error::contract_plane("not expected"))
        }
    }

    #[tokio::test]
    async fn copies_frame_through_to_the_next_hop() {
        let network = MemNetwork::new();
        let next_hop = Id::random();
        let mut inbox = network.register(next_hop);
        network.register(Id::random());

        let route_manager = Arc::new(RouteManager::new());
        route_manager.add_route(next_hop, network.transport(next_hop)).await;
        let selector = Arc::new(MultiRouteSelector::new(route_manager));
        let contracts = Arc::new(ContractManager::new(
            ContractManagerSettings::default(),
            b"secret".to_vec(),
            Box::new(NeverCalled),
        ));
        let (forward, intake) = ForwardSequence::spawn(
            contracts,
            selector,
            ForwardBufferSettings::default(),
            Arc::new(PeerAudit::new()),
            CancellationToken::new(),
            8,
        );
        let _ = forward.id();

        let path = TransferPath::new(Id::random(), next_hop, relaynet_core::CONTROL_ID);
        let frame = Frame::encode(message_type::APPLICATION, &ApplicationMessage { bytes: b"through".to_vec() }).unwrap();
        intake.send(TransferFrame { path, frame }).await.unwrap();

        let delivered = inbox.recv().await.unwrap();
        let envelope = TransferFrame::from_bytes(&delivered).unwrap();
        let msg: ApplicationMessage = envelope.frame.decode().unwrap();
        assert_eq!(msg.bytes, b"through");
    }
}
