//! `SendSequence`: turns a stream of application writes into acknowledged,
//! contract-paced `Pack`s, retransmitting anything that goes unacked.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use relaynet_core::config::SendBufferSettings;
use relaynet_core::{Id, TransferPath};

use crate::audit::PeerAudit;
use crate::contract::{ContractKey, ContractManager};
use crate::error::{Error, Result};
use crate::frame::{message_type, Ack, ApplicationMessage, Contract, Frame, Pack, TransferFrame};
use crate::route::MultiRouteSelector;
use crate::rtt::RttWindow;
use crate::timeout::Timeout;

struct SendItem {
    sequence_number: u64,
    bytes: Bytes,
    contract_id: Id,
    /// `false` for the zero-payload contract-install pack.
    has_payload: bool,
    contract_frame: Option<Frame>,
    /// Bytes this item holds against the resend-queue backpressure limit.
    charge_bytes: u64,
    first_sent_at: Instant,
    next_resend_interval: std::time::Duration,
    resend_count: u32,
}

#[derive(Default)]
struct Inner {
    items: HashMap<Id, SendItem>,
    resend_heap: BinaryHeap<Reverse<(Instant, Id)>>,
    completions: HashMap<Id, oneshot::Sender<Result<()>>>,
    /// Contracts for which a contract-install pack has already gone out.
    installed_contracts: HashSet<Id>,
    /// The contract `send` is currently drawing from; items charged to any
    /// other contract id have become closeable once fully acked.
    active_contract_id: Option<Id>,
    resend_queue_bytes: u64,
    closed: bool,
}

/// Reliable, ordered, contract-paced delivery of one application stream
/// toward one destination.
pub struct SendSequence {
    id: Id,
    path: TransferPath,
    contracts: Arc<ContractManager>,
    contract_key: ContractKey,
    selector: Arc<MultiRouteSelector>,
    settings: SendBufferSettings,
    rtt: std::sync::Mutex<RttWindow>,
    audit: Arc<PeerAudit>,
    cancel: CancellationToken,
    next_sequence_number: AtomicU64,
    inner: Mutex<Inner>,
    backpressure: Notify,
}

impl SendSequence {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        path: TransferPath,
        contracts: Arc<ContractManager>,
        selector: Arc<MultiRouteSelector>,
        settings: SendBufferSettings,
        audit: Arc<PeerAudit>,
        cancel: CancellationToken,
        ack_buffer_size: usize,
    ) -> (Arc<Self>, mpsc::Sender<Ack>) {
        let sequence = Arc::new(Self {
            id: Id::random(),
            contract_key: ContractKey::new(path.destination_id, path.stream_id),
            path,
            contracts,
            selector,
            settings,
            rtt: std::sync::Mutex::new(RttWindow::new()),
            audit,
            cancel,
            next_sequence_number: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
            backpressure: Notify::new(),
        });
        let (ack_tx, ack_rx) = mpsc::channel(ack_buffer_size);
        tokio::spawn(sequence.clone().run(ack_rx));
        (sequence, ack_tx)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Acquire a contract, frame the bytes as a `Pack`, write it onto a
    /// route, and wait (bounded by `timeout`) for it to be acknowledged.
    /// Blocks (subject to `timeout`) while the resend queue is already at
    /// `resend_queue_max_byte_count`.
    pub async fn send(&self, bytes: Bytes, timeout: Timeout) -> Result<()> {
        if self.inner.lock().await.closed {
            return Err(Error::SequenceClosed);
        }

        let charge_bytes = bytes.len() as u64;
        self.wait_for_resend_queue_room(charge_bytes, timeout).await?;

        let (_charged, contract) = self
            .contracts
            .take(self.contract_key, bytes.len() as u64, timeout)
            .await?;
        let contract_id = contract.stored.contract_id;

        let sequence_number = self.next_sequence_number.fetch_add(1, Ordering::Relaxed);
        let is_head = sequence_number == 0;

        let newly_installed = {
            let mut inner = self.inner.lock().await;
            inner.active_contract_id = Some(contract_id);
            inner.installed_contracts.insert(contract_id)
        };

        if newly_installed && !is_head {
            // The head pack carries its own contract frame below; a
            // contract switch mid-stream gets a dedicated zero-payload
            // install pack so the receiver verifies the new contract
            // before any data charged against it arrives.
            self.send_contract_install_pack(&contract, contract_id, timeout).await?;
        }

        let contract_frame = if is_head || newly_installed {
            Some(Frame::encode(message_type::CONTRACT, &contract)?)
        } else {
            None
        };

        let message_id = Id::random();
        let frame = Frame::encode(message_type::APPLICATION, &ApplicationMessage { bytes: bytes.to_vec() })?;
        let pack = Pack {
            message_id,
            sequence_id: self.id,
            sequence_number,
            head: is_head,
            nack: false,
            frames: vec![frame],
            contract_frame: contract_frame.clone(),
            contract_id: Some(contract_id),
            tag: None,
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            let interval = self.settings.min_resend_interval();
            inner.resend_heap.push(Reverse((Instant::now() + interval, message_id)));
            inner.resend_queue_bytes += charge_bytes;
            inner.items.insert(
                message_id,
                SendItem {
                    sequence_number,
                    bytes,
                    contract_id,
                    has_payload: true,
                    contract_frame,
                    charge_bytes,
                    first_sent_at: Instant::now(),
                    next_resend_interval: interval,
                    resend_count: 0,
                },
            );
            inner.completions.insert(message_id, tx);
        }

        self.write_pack(&pack).await?;
        self.audit.record_sent(pack.byte_count());

        match timeout.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, rx)
                .await
                .map_err(|_| Error::AckTimeout)?
                .map_err(|_| Error::SequenceClosed)?,
            None => rx.await.map_err(|_| Error::SequenceClosed)?,
        }
    }

    /// Blocks until the resend queue has room for `charge_bytes` more, or
    /// `timeout` elapses. The notify future is created before the check so
    /// a completion landing between the check and the wait is never missed.
    async fn wait_for_resend_queue_room(&self, charge_bytes: u64, timeout: Timeout) -> Result<()> {
        loop {
            let notified = self.backpressure.notified();
            {
                let inner = self.inner.lock().await;
                if inner.resend_queue_bytes + charge_bytes <= self.settings.resend_queue_max_byte_count {
                    return Ok(());
                }
            }
            match timeout.deadline() {
                Some(deadline) => tokio::time::timeout_at(deadline, notified)
                    .await
                    .map_err(|_| Error::WriteTimeout)?,
                None => notified.await,
            }
        }
    }

    /// Sends a zero-payload, ack-required pack carrying only the contract
    /// frame, so a contract switch mid-stream is verified by the receiver
    /// before any data charged against it arrives.
    async fn send_contract_install_pack(
        &self,
        contract: &Contract,
        contract_id: Id,
        timeout: Timeout,
    ) -> Result<()> {
        let sequence_number = self.next_sequence_number.fetch_add(1, Ordering::Relaxed);
        let message_id = Id::random();
        let contract_frame = Some(Frame::encode(message_type::CONTRACT, contract)?);
        let pack = Pack {
            message_id,
            sequence_id: self.id,
            sequence_number,
            head: sequence_number == 0,
            nack: false,
            frames: Vec::new(),
            contract_frame: contract_frame.clone(),
            contract_id: Some(contract_id),
            tag: None,
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            let interval = self.settings.min_resend_interval();
            inner.resend_heap.push(Reverse((Instant::now() + interval, message_id)));
            inner.items.insert(
                message_id,
                SendItem {
                    sequence_number,
                    bytes: Bytes::new(),
                    contract_id,
                    has_payload: false,
                    contract_frame,
                    charge_bytes: 0,
                    first_sent_at: Instant::now(),
                    next_resend_interval: interval,
                    resend_count: 0,
                },
            );
            inner.completions.insert(message_id, tx);
        }

        self.write_pack(&pack).await?;
        self.audit.record_sent(pack.byte_count());

        match timeout.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, rx)
                .await
                .map_err(|_| Error::AckTimeout)?
                .map_err(|_| Error::SequenceClosed)?,
            None => rx.await.map_err(|_| Error::SequenceClosed)?,
        }
    }

    async fn write_pack(&self, pack: &Pack) -> Result<()> {
        let frame = Frame::encode(message_type::PACK, pack)?;
        let envelope = TransferFrame {
            path: self.path,
            frame,
        };
        let bytes = Bytes::from(envelope.to_bytes()?);
        self.selector
            .write(bytes, self.settings.write_timeout().into(), &self.cancel)
            .await?;
        Ok(())
    }

    async fn run(self: Arc<Self>, mut ack_rx: mpsc::Receiver<Ack>) {
        loop {
            let wake_at = {
                let inner = self.inner.lock().await;
                inner
                    .resend_heap
                    .peek()
                    .map(|Reverse((at, _))| *at)
                    .unwrap_or_else(|| Instant::now() + self.settings.idle_timeout())
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                ack = ack_rx.recv() => {
                    match ack {
                        Some(ack) => self.apply_ack(ack).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => {
                    if self.process_due_resends().await {
                        break;
                    }
                }
            }
            if self.inner.lock().await.closed {
                break;
            }
        }
        trace!(sequence_id = ?self.id, "send sequence run loop exiting");
    }

    async fn apply_ack(&self, ack: Ack) {
        if ack.selective {
            // A selective ack does not complete delivery: it means this
            // item landed out of order at the receiver. Pull it off the
            // immediate resend schedule and push it out by
            // `selective_ack_timeout` so the cumulative ack (or a real
            // timeout) is what finishes the send.
            let mut inner = self.inner.lock().await;
            if let Some(item) = inner.items.get(&ack.message_id) {
                let mut rtt = self.rtt.lock().expect("rtt lock poisoned");
                rtt.record(item.first_sent_at.elapsed());
                drop(rtt);
                let delay = self.settings.selective_ack_timeout();
                inner.resend_heap.push(Reverse((Instant::now() + delay, ack.message_id)));
            }
            return;
        }

        let closeable = {
            let mut inner = self.inner.lock().await;
            let Some(threshold_item) = inner.items.get(&ack.message_id) else {
                return;
            };
            let threshold = threshold_item.sequence_number;
            let acked: Vec<Id> = inner
                .items
                .iter()
                .filter(|(_, item)| item.sequence_number <= threshold)
                .map(|(id, _)| *id)
                .collect();

            let mut acked_bytes_by_contract: HashMap<Id, u64> = HashMap::new();
            for id in &acked {
                if let Some(item) = inner.items.remove(id) {
                    inner.resend_queue_bytes = inner.resend_queue_bytes.saturating_sub(item.charge_bytes);
                    if item.has_payload {
                        *acked_bytes_by_contract.entry(item.contract_id).or_insert(0) += item.bytes.len() as u64;
                    }
                }
                if let Some(done) = inner.completions.remove(id) {
                    let _ = done.send(Ok(()));
                }
            }

            let mut closeable = Vec::new();
            for (contract_id, acked_bytes) in acked_bytes_by_contract {
                let still_active = inner.active_contract_id == Some(contract_id);
                let still_outstanding = inner.items.values().any(|item| item.contract_id == contract_id);
                if !still_active && !still_outstanding {
                    closeable.push((contract_id, acked_bytes));
                }
            }
            closeable
        };

        self.backpressure.notify_waiters();

        for (contract_id, acked_bytes) in closeable {
            if let Err(e) = self.contracts.close_contract(contract_id, acked_bytes, 0).await {
                warn!(sequence_id = ?self.id, contract_id = ?contract_id, error = %e, "failed to close exhausted contract");
            }
        }
    }

    /// Returns `true` if the sequence should be torn down (an item blew
    /// past `ack_timeout`).
    async fn process_due_resends(&self) -> bool {
        let now = Instant::now();
        let due: Vec<Id> = {
            let mut inner = self.inner.lock().await;
            let mut due = Vec::new();
            while let Some(Reverse((at, id))) = inner.resend_heap.peek().copied() {
                if at > now {
                    break;
                }
                inner.resend_heap.pop();
                if inner.items.contains_key(&id) {
                    due.push(id);
                }
            }
            due
        };

        for message_id in due {
            let timed_out;
            let pack;
            {
                let mut inner = self.inner.lock().await;
                let Some(item) = inner.items.get_mut(&message_id) else {
                    continue;
                };
                timed_out = item.first_sent_at.elapsed() > self.settings.ack_timeout();
                if timed_out {
                    pack = None;
                } else {
                    item.resend_count += 1;
                    let sample = self
                        .rtt
                        .lock()
                        .expect("rtt lock poisoned")
                        .estimate_or(self.settings.min_resend_interval());
                    item.next_resend_interval = self.settings.clamp_rtt(sample * item.resend_count.max(1));
                    let frames = if item.has_payload {
                        match Frame::encode(
                            message_type::APPLICATION,
                            &ApplicationMessage {
                                bytes: item.bytes.to_vec(),
                            },
                        ) {
                            Ok(frame) => vec![frame],
                            Err(_) => continue,
                        }
                    } else {
                        Vec::new()
                    };
                    pack = Some((
                        Pack {
                            message_id,
                            sequence_id: self.id,
                            sequence_number: item.sequence_number,
                            head: item.sequence_number == 0,
                            // A resend of an ack-required item must stay
                            // ack-required: nack packs are fire-and-forget
                            // and are never retransmitted.
                            nack: false,
                            frames,
                            contract_frame: item.contract_frame.clone(),
                            contract_id: Some(item.contract_id),
                            tag: None,
                        },
                        item.next_resend_interval,
                    ));
                }
            }

            if timed_out {
                let mut inner = self.inner.lock().await;
                if let Some(item) = inner.items.remove(&message_id) {
                    inner.resend_queue_bytes = inner.resend_queue_bytes.saturating_sub(item.charge_bytes);
                }
                if let Some(done) = inner.completions.remove(&message_id) {
                    let _ = done.send(Err(Error::AckTimeout));
                }
                drop(inner);
                self.backpressure.notify_waiters();
                warn!(sequence_id = ?self.id, message_id = ?message_id, "ack timeout, giving up on item");
                continue;
            }

            if let Some((pack, interval)) = pack {
                debug!(sequence_id = ?self.id, message_id = ?message_id, "resending unacked pack");
                if self.write_pack(&pack).await.is_ok() {
                    self.audit.record_resent(pack.byte_count());
                }
                let mut inner = self.inner.lock().await;
                inner.resend_heap.push(Reverse((Instant::now() + interval, message_id)));
            }
        }
        false
    }
}
