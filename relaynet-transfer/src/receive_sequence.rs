//! `ReceiveSequence`: reorders incoming `Pack`s, verifies their
//! contracts, delivers contiguous application bytes, and acks what it
//! accepts.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relaynet_core::config::ReceiveBufferSettings;
use relaynet_core::{Id, TransferPath};

use crate::audit::PeerAudit;
use crate::contract::ContractManager;
use crate::error::{Error, Result};
use crate::frame::{message_type, Ack, ApplicationMessage, Contract, Frame, Pack, TransferFrame};
use crate::route::MultiRouteSelector;

struct Inner {
    next_expected: u64,
    pending: BTreeMap<u64, Pack>,
    verified_contracts: HashSet<Id>,
    last_activity: Instant,
    gap_opened_at: Option<Instant>,
    closed: bool,
}

/// The receiving half of one ordered application stream.
pub struct ReceiveSequence {
    id: Id,
    contracts: Arc<ContractManager>,
    settings: ReceiveBufferSettings,
    audit: Arc<PeerAudit>,
    selector: Arc<MultiRouteSelector>,
    reverse_path: TransferPath,
    cancel: CancellationToken,
    output: mpsc::Sender<Bytes>,
    inner: Mutex<Inner>,
}

impl ReceiveSequence {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: Id,
        reverse_path: TransferPath,
        contracts: Arc<ContractManager>,
        selector: Arc<MultiRouteSelector>,
        settings: ReceiveBufferSettings,
        audit: Arc<PeerAudit>,
        cancel: CancellationToken,
        output: mpsc::Sender<Bytes>,
        intake_buffer_size: usize,
    ) -> (Arc<Self>, mpsc::Sender<Pack>) {
        let sequence = Arc::new(Self {
            id,
            contracts,
            settings,
            audit,
            selector,
            reverse_path,
            cancel,
            output,
            inner: Mutex::new(Inner {
                next_expected: 0,
                pending: BTreeMap::new(),
                verified_contracts: HashSet::new(),
                last_activity: Instant::now(),
                gap_opened_at: None,
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

    async fn run(self: Arc<Self>, mut intake: mpsc::Receiver<Pack>) {
        loop {
            let wake = {
                let inner = self.inner.lock().await;
                let idle = inner.last_activity + self.settings.idle_timeout();
                match inner.gap_opened_at {
                    Some(opened) => idle.min(opened + self.settings.gap_timeout()),
                    None => idle,
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                pack = intake.recv() => {
                    match pack {
                        Some(pack) => {
                            if let Err(e) = self.handle_pack(pack).await {
                                warn!(sequence_id = ?self.id, error = %e, "receive sequence terminating");
                                self.inner.lock().await.closed = true;
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(wake) => {
                    let mut inner = self.inner.lock().await;
                    let now = Instant::now();
                    let gap_expired = inner
                        .gap_opened_at
                        .is_some_and(|opened| now >= opened + self.settings.gap_timeout());
                    let idle_expired = now >= inner.last_activity + self.settings.idle_timeout();
                    if gap_expired || idle_expired {
                        inner.closed = true;
                        break;
                    }
                }
            }
            if self.inner.lock().await.closed {
                break;
            }
        }
    }

    async fn verify_contract(&self, pack: &Pack) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(frame) = &pack.contract_frame {
            let contract: Contract = frame.decode()?;
            if !self.contracts.verify(&contract) {
                self.audit.record_bad_contract();
                return Err(Error::bad_contract("signature mismatch"));
            }
            inner.verified_contracts.insert(contract.stored.contract_id);
            return Ok(());
        }
        match pack.contract_id {
            Some(id) if inner.verified_contracts.contains(&id) => Ok(()),
            _ if self.settings.allow_legacy_nack && pack.nack => Ok(()),
            _ => {
                self.audit.record_bad_contract();
                Err(Error::bad_contract("missing or unverified contract"))
            }
        }
    }

    async fn handle_pack(&self, pack: Pack) -> Result<()> {
        self.verify_contract(&pack).await?;

        let mut deliveries: Vec<Vec<u8>> = Vec::new();
        // The ack emitted for this pack: cumulative (up through the
        // highest sequence number actually drained this call) for an
        // in-order or already-delivered pack, selective for one that opens
        // or extends a gap.
        let last_delivered_id;
        let selective;
        {
            let mut inner = self.inner.lock().await;
            inner.last_activity = Instant::now();

            if pack.head && pack.sequence_number < inner.next_expected {
                debug!(sequence_id = ?self.id, "sender reset detected, resetting receive state");
                inner.next_expected = 0;
                inner.pending.clear();
            } else if pack.head && pack.sequence_number > inner.next_expected {
                debug!(sequence_id = ?self.id, "sender fast-forwarded head sequence number, advancing");
                inner.next_expected = pack.sequence_number;
                let next_expected = inner.next_expected;
                inner.pending.retain(|seq, _| *seq >= next_expected);
            }

            if pack.sequence_number < inner.next_expected {
                // Retransmission of a pack already delivered and acked.
                self.audit.record_discarded(pack.byte_count());
                last_delivered_id = pack.message_id;
                selective = false;
            } else {
                let buffered_bytes: u64 = inner.pending.values().map(|p| p.byte_count()).sum();
                if buffered_bytes < self.settings.receive_queue_max_byte_count {
                    inner.pending.insert(pack.sequence_number, pack.clone());
                }

                let mut last_drained = pack.message_id;
                let mut drained_any = false;
                while let Some(next) = inner.pending.remove(&inner.next_expected) {
                    for frame in &next.frames {
                        if let Ok(msg) = frame.decode::<ApplicationMessage>() {
                            deliveries.push(msg.bytes);
                        }
                    }
                    last_drained = next.message_id;
                    drained_any = true;
                    inner.next_expected += 1;
                }

                inner.gap_opened_at = if inner.pending.is_empty() {
                    None
                } else {
                    Some(inner.gap_opened_at.unwrap_or_else(Instant::now))
                };

                // In-order: ack cumulatively through whatever was actually
                // drained. Out-of-order (nothing drained, pack buffered
                // under a gap): ack selectively for just this pack.
                selective = !drained_any;
                last_delivered_id = last_drained;
            }
        }

        for bytes in deliveries {
            if self.output.send(Bytes::from(bytes)).await.is_err() {
                return Err(Error::SequenceClosed);
            }
        }

        self.send_ack(last_delivered_id, pack.sequence_id, selective).await;
        Ok(())
    }

    async fn send_ack(&self, message_id: Id, sequence_id: Id, selective: bool) {
        let ack = Ack {
            message_id,
            sequence_id,
            selective,
            tag: None,
        };
        let Ok(frame) = Frame::encode(message_type::ACK, &ack) else {
            return;
        };
        let envelope = TransferFrame {
            path: self.reverse_path,
            frame,
        };
        let Ok(bytes) = envelope.to_bytes() else {
            return;
        };
        let _ = self
            .selector
            .write(Bytes::from(bytes), self.settings.ack_compress_timeout().into(), &self.cancel)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ControlPlane;
    use crate::frame::{CreateContract, ProvideMode, StoredContract};
    use crate::mem_transport::MemNetwork;
    use crate::route::RouteManager;
    use async_trait::async_trait;
    use relaynet_core::config::ContractManagerSettings;

    struct NeverCalled;

    #[async_trait]
    impl ControlPlane for NeverCalled {
        async fn create_contract(&self, _request: CreateContract) -> Result<Contract> {
            Err(Error::contract_plane("not expected to be called"))
        }
    }

    fn test_pack(sequence_number: u64, head: bool, payload: &[u8]) -> Pack {
        Pack {
            message_id: Id::random(),
            sequence_id: Id::random(),
            sequence_number,
            head,
            nack: false,
            frames: vec![Frame::encode(
                message_type::APPLICATION,
                &ApplicationMessage {
                    bytes: payload.to_vec(),
                },
            )
            .unwrap()],
            contract_frame: None,
            contract_id: None,
            tag: None,
        }
    }

    async fn setup() -> (Arc<ReceiveSequence>, mpsc::Sender<Pack>, mpsc::Receiver<Bytes>) {
        let network = MemNetwork::new();
        let peer = Id::random();
        network.register(peer);
        let route_manager = Arc::new(RouteManager::new());
        route_manager.add_route(peer, network.transport(peer)).await;
        let selector = Arc::new(MultiRouteSelector::new(route_manager));
        let contracts = Arc::new(ContractManager::new(
            ContractManagerSettings::default(),
            b"secret".to_vec(),
            Box::new(NeverCalled),
        ));
        let path = TransferPath::new(peer, Id::random(), relaynet_core::CONTROL_ID);
        let (output_tx, output_rx) = mpsc::channel(16);
        let mut settings = ReceiveBufferSettings::default();
        settings.allow_legacy_nack = true;
        let (sequence, intake) = ReceiveSequence::spawn(
            Id::random(),
            path,
            contracts,
            selector,
            settings,
            Arc::new(PeerAudit::new()),
            CancellationToken::new(),
            output_tx,
            16,
        );
        (sequence, intake, output_rx)
    }

    #[tokio::test]
    async fn delivers_in_order_packs_immediately() {
        let (_seq, intake, mut out) = setup().await;
        intake.send(test_pack(0, true, b"a")).await.unwrap();
        intake.send(test_pack(1, false, b"b")).await.unwrap();
        assert_eq!(&out.recv().await.unwrap()[..], b"a");
        assert_eq!(&out.recv().await.unwrap()[..], b"b");
    }

    #[tokio::test]
    async fn buffers_out_of_order_packs_until_gap_fills() {
        let (_seq, intake, mut out) = setup().await;
        intake.send(test_pack(1, false, b"b")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        intake.send(test_pack(0, true, b"a")).await.unwrap();
        assert_eq!(&out.recv().await.unwrap()[..], b"a");
        assert_eq!(&out.recv().await.unwrap()[..], b"b");
    }

    #[tokio::test]
    async fn sender_restart_resets_sequence_numbering() {
        let (_seq, intake, mut out) = setup().await;
        intake.send(test_pack(0, true, b"a")).await.unwrap();
        assert_eq!(&out.recv().await.unwrap()[..], b"a");
        // Sender restarted: a new head arrives renumbered from 0.
        intake.send(test_pack(0, true, b"restarted")).await.unwrap();
        assert_eq!(&out.recv().await.unwrap()[..], b"restarted");
    }
}
