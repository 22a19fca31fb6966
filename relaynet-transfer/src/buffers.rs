//! Dispatchers that create and route work to the right sequence: one
//! `SendSequence` per destination path, one `ReceiveSequence` per inbound
//! `sequence_id`, one `ForwardSequence` per next hop.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use relaynet_core::config::{ForwardBufferSettings, ReceiveBufferSettings, SendBufferSettings};
use relaynet_core::{Id, TransferPath};

use crate::audit::PeerAudit;
use crate::contract::ContractManager;
use crate::error::{Error, Result};
use crate::forward_sequence::ForwardSequence;
use crate::frame::{Ack, Pack, TransferFrame};
use crate::receive_sequence::ReceiveSequence;
use crate::route::MultiRouteSelector;
use crate::send_sequence::SendSequence;
use crate::timeout::Timeout;

/// One `SendSequence` per destination path, created on first write.
pub struct SendBuffer {
    contracts: Arc<ContractManager>,
    selector: Arc<MultiRouteSelector>,
    settings: SendBufferSettings,
    audit: Arc<PeerAudit>,
    cancel: CancellationToken,
    ack_buffer_size: usize,
    sequences: Mutex<HashMap<TransferPath, (Arc<SendSequence>, mpsc::Sender<Ack>)>>,
}

impl SendBuffer {
    pub fn new(
        contracts: Arc<ContractManager>,
        selector: Arc<MultiRouteSelector>,
        settings: SendBufferSettings,
        audit: Arc<PeerAudit>,
        cancel: CancellationToken,
        ack_buffer_size: usize,
    ) -> Self {
        Self {
            contracts,
            selector,
            settings,
            audit,
            cancel,
            ack_buffer_size,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    async fn sequence_for(&self, path: TransferPath) -> (Arc<SendSequence>, mpsc::Sender<Ack>) {
        let mut map = self.sequences.lock().await;
        if let Some(existing) = map.get(&path) {
            return existing.clone();
        }
        let (sequence, ack_tx) = SendSequence::spawn(
            path,
            self.contracts.clone(),
            self.selector.clone(),
            self.settings.clone(),
            self.audit.clone(),
            self.cancel.clone(),
            self.ack_buffer_size,
        );
        map.insert(path, (sequence.clone(), ack_tx.clone()));
        (sequence, ack_tx)
    }

    pub async fn send(&self, path: TransferPath, bytes: Bytes, timeout: Timeout) -> Result<()> {
        let (sequence, _ack_tx) = self.sequence_for(path).await;
        sequence.send(bytes, timeout).await
    }

    pub async fn dispatch_ack(&self, path: TransferPath, ack: Ack) -> Result<()> {
        let ack_tx = {
            let map = self.sequences.lock().await;
            map.get(&path).map(|(_, tx)| tx.clone())
        };
        match ack_tx {
            Some(tx) => tx.send(ack).await.map_err(|_| Error::SequenceClosed),
            None => Err(Error::SequenceClosed),
        }
    }
}

/// One `ReceiveSequence` per inbound `sequence_id`, created on first
/// pack. Delivered application bytes are tagged with the originating
/// sequence id so a `Client` can route them to the right stream.
pub struct ReceiveBuffer {
    contracts: Arc<ContractManager>,
    selector: Arc<MultiRouteSelector>,
    settings: ReceiveBufferSettings,
    audit: Arc<PeerAudit>,
    cancel: CancellationToken,
    intake_buffer_size: usize,
    output: mpsc::Sender<(Id, Bytes)>,
    sequences: Mutex<HashMap<Id, mpsc::Sender<Pack>>>,
}

impl ReceiveBuffer {
    pub fn new(
        contracts: Arc<ContractManager>,
        selector: Arc<MultiRouteSelector>,
        settings: ReceiveBufferSettings,
        audit: Arc<PeerAudit>,
        cancel: CancellationToken,
        intake_buffer_size: usize,
        output: mpsc::Sender<(Id, Bytes)>,
    ) -> Self {
        Self {
            contracts,
            selector,
            settings,
            audit,
            cancel,
            intake_buffer_size,
            output,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(&self, path: TransferPath, pack: Pack) -> Result<()> {
        let mut map = self.sequences.lock().await;
        if !map.contains_key(&pack.sequence_id) {
            let reverse_path = TransferPath::new(path.destination_id, path.source_id, path.stream_id);
            let (output_tx, mut output_rx) = mpsc::channel(self.intake_buffer_size);
            let (_sequence, intake) = ReceiveSequence::spawn(
                pack.sequence_id,
                reverse_path,
                self.contracts.clone(),
                self.selector.clone(),
                self.settings.clone(),
                self.audit.clone(),
                self.cancel.clone(),
                output_tx,
                self.intake_buffer_size,
            );
            let merged = self.output.clone();
            let sequence_id = pack.sequence_id;
            tokio::spawn(async move {
                while let Some(bytes) = output_rx.recv().await {
                    if merged.send((sequence_id, bytes)).await.is_err() {
                        break;
                    }
                }
            });
            map.insert(pack.sequence_id, intake);
        }
        let intake = map.get(&pack.sequence_id).expect("just inserted").clone();
        drop(map);
        intake.send(pack).await.map_err(|_| Error::SequenceClosed)
    }
}

/// One `ForwardSequence` per next hop, created on first frame.
pub struct ForwardBuffer {
    contracts: Arc<ContractManager>,
    selector: Arc<MultiRouteSelector>,
    settings: ForwardBufferSettings,
    audit: Arc<PeerAudit>,
    cancel: CancellationToken,
    intake_buffer_size: usize,
    sequences: Mutex<HashMap<Id, mpsc::Sender<TransferFrame>>>,
}

impl ForwardBuffer {
    pub fn new(
        contracts: Arc<ContractManager>,
        selector: Arc<MultiRouteSelector>,
        settings: ForwardBufferSettings,
        audit: Arc<PeerAudit>,
        cancel: CancellationToken,
        intake_buffer_size: usize,
    ) -> Self {
        Self {
            contracts,
            selector,
            settings,
            audit,
            cancel,
            intake_buffer_size,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(&self, next_hop: Id, frame: TransferFrame) -> Result<()> {
        let mut map = self.sequences.lock().await;
        if !map.contains_key(&next_hop) {
            let (_sequence, intake) = ForwardSequence::spawn(
                self.contracts.clone(),
                self.selector.clone(),
                self.settings.clone(),
                self.audit.clone(),
                self.cancel.clone(),
                self.intake_buffer_size,
            );
            map.insert(next_hop, intake);
        }
        let intake = map.get(&next_hop).expect("just inserted").clone();
        drop(map);
        intake.send(frame).await.map_err(|_| Error::SequenceClosed)
    }
}
