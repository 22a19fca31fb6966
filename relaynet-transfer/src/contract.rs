//! Contract acquisition and verification: signed byte-count allotments
//! that pace traffic along a `(destination, stream)` key.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use relaynet_core::config::ContractManagerSettings;
use relaynet_core::Id;
use sha2::Sha256;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::frame::{CloseContract, Contract, CreateContract, ProvideMode, StoredContract};
use crate::timeout::Timeout;

type HmacSha256 = Hmac<Sha256>;

/// The key allotments are tracked under: a contract only authorizes
/// traffic to one destination (and, if stream-addressed, one stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContractKey {
    pub destination_id: Id,
    pub stream_id: Id,
}

impl ContractKey {
    pub fn new(destination_id: Id, stream_id: Id) -> Self {
        Self {
            destination_id,
            stream_id,
        }
    }
}

/// Requests a fresh contract from whatever issues them: the local
/// control-plane peer, or a remote one reached over a control route.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_contract(&self, request: CreateContract) -> Result<Contract>;

    /// Retire or checkpoint a contract on the control plane. Control planes
    /// that don't track contract lifecycle beyond issuance can ignore this.
    async fn close_contract(&self, _message: CloseContract) -> Result<()> {
        Ok(())
    }
}

struct Allotment {
    contract: Contract,
    remaining: u64,
}

/// Verifies incoming contracts and tracks locally-held unspent allotments,
/// requesting more from a [`ControlPlane`] when a key runs dry.
pub struct ContractManager {
    secret: Vec<u8>,
    settings: ContractManagerSettings,
    control_plane: Box<dyn ControlPlane>,
    allotments: Mutex<HashMap<ContractKey, VecDeque<Allotment>>>,
    notify: Notify,
}

impl ContractManager {
    pub fn new(
        settings: ContractManagerSettings,
        secret: Vec<u8>,
        control_plane: Box<dyn ControlPlane>,
    ) -> Self {
        Self {
            secret,
            settings,
            control_plane,
            allotments: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Sign a freshly-minted contract (used by the side that is itself
    /// acting as a provider control plane).
    pub fn sign(&self, stored: StoredContract) -> Result<Contract> {
        let mut stored_bytes = Vec::new();
        ciborium::ser::into_writer(&stored, &mut stored_bytes)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::contract_plane(e.to_string()))?;
        mac.update(&stored_bytes);
        let mut signature = [0u8; 32];
        signature.copy_from_slice(&mac.finalize().into_bytes());
        Ok(Contract {
            stored,
            stored_bytes,
            signature,
        })
    }

    /// Verify a contract's signature against the shared secret.
    pub fn verify(&self, contract: &Contract) -> bool {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(&contract.stored_bytes);
        mac.verify_slice(&contract.signature).is_ok()
    }

    fn usable_bytes(&self, contract: &Contract) -> u64 {
        self.settings
            .usable_byte_count(contract.stored.transfer_byte_count)
    }

    /// Charge `want` application bytes against whatever allotment is
    /// currently held for `key`, blocking (subject to `timeout`) to
    /// request a new contract if none is available. A single charge is
    /// never split across two contracts: an allotment too small for
    /// `want` is discarded rather than fragmented. Returns the bytes
    /// charged and the contract they were charged against, so the caller
    /// can attach the contract frame when installing it.
    pub async fn take(&self, key: ContractKey, want: u64, timeout: Timeout) -> Result<(u64, Contract)> {
        let want = self.settings.charge_for(want);
        loop {
            if let Some(hit) = self.try_take(&key, want) {
                return Ok(hit);
            }
            if timeout.is_non_blocking() {
                return Err(Error::ContractUnavailable);
            }
            self.acquire(&key, want, timeout).await?;
        }
    }

    fn try_take(&self, key: &ContractKey, want: u64) -> Option<(u64, Contract)> {
        let mut map = self.allotments.lock().expect("allotment lock poisoned");
        let queue = map.get_mut(key)?;
        while let Some(front) = queue.front_mut() {
            if front.remaining >= want {
                front.remaining -= want;
                let contract = front.contract.clone();
                if front.remaining == 0 {
                    queue.pop_front();
                }
                return Some((want, contract));
            }
            queue.pop_front();
        }
        None
    }

    /// Retire a contract with zero unacked bytes remaining: `acked`/`unacked`
    /// are reported to the control plane for its own bookkeeping.
    pub async fn close_contract(&self, contract_id: Id, acked: u64, unacked: u64) -> Result<()> {
        self.control_plane
            .close_contract(CloseContract {
                contract_id,
                acked,
                unacked,
                checkpoint: false,
            })
            .await
    }

    /// Pause a contract without retiring it, so the same peer can resume
    /// spending against it later (used when a receive sequence shuts down).
    pub async fn checkpoint_contract(&self, contract_id: Id, acked: u64, unacked: u64) -> Result<()> {
        self.control_plane
            .close_contract(CloseContract {
                contract_id,
                acked,
                unacked,
                checkpoint: true,
            })
            .await
    }

    async fn acquire(&self, key: &ContractKey, want: u64, timeout: Timeout) -> Result<()> {
        let request = CreateContract {
            destination_id: key.destination_id,
            stream_id: if key.stream_id == relaynet_core::CONTROL_ID {
                None
            } else {
                Some(key.stream_id)
            },
            transfer_byte_count: self.settings.standard_contract_transfer_byte_count.max(want),
            companion: false,
            used_contract_ids: Vec::new(),
        };
        let fut = self.control_plane.create_contract(request);
        let contract = match timeout.deadline() {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                tokio::time::timeout(remaining, fut)
                    .await
                    .map_err(|_| Error::ContractUnavailable)??
            }
            None => fut.await?,
        };
        if !self.verify(&contract) {
            return Err(Error::bad_contract("signature mismatch"));
        }
        let usable = self.usable_bytes(&contract);
        let mut map = self.allotments.lock().expect("allotment lock poisoned");
        map.entry(*key).or_default().push_back(Allotment {
            contract,
            remaining: usable,
        });
        drop(map);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaynet_core::Id;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct StubControlPlane {
        secret: Vec<u8>,
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl ControlPlane for StubControlPlane {
        async fn create_contract(&self, request: CreateContract) -> Result<Contract> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let stored = StoredContract {
                contract_id: Id::random(),
                transfer_byte_count: request.transfer_byte_count,
                source_id: Id::random(),
                destination_id: request.destination_id,
                stream_id: request.stream_id.unwrap_or(relaynet_core::CONTROL_ID),
                provide_mode: ProvideMode::Network,
            };
            let mut stored_bytes = Vec::new();
            ciborium::ser::into_writer(&stored, &mut stored_bytes)?;
            let mut mac = HmacSha256::new_from_slice(&self.secret).unwrap();
            mac.update(&stored_bytes);
            let mut signature = [0u8; 32];
            signature.copy_from_slice(&mac.finalize().into_bytes());
            Ok(Contract {
                stored,
                stored_bytes,
                signature,
            })
        }
    }

    fn manager(secret: &[u8]) -> (ContractManager, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let plane = StubControlPlane {
            secret: secret.to_vec(),
            calls: calls.clone(),
        };
        (
            ContractManager::new(
                ContractManagerSettings::default(),
                secret.to_vec(),
                Box::new(plane),
            ),
            calls,
        )
    }

    #[tokio::test]
    async fn acquires_a_contract_when_none_held() {
        let (cm, calls) = manager(b"shared-secret");
        let key = ContractKey::new(Id::random(), relaynet_core::CONTROL_ID);
        let (taken, _id) = cm.take(key, 1024, Timeout::from_millis(1_000)).await.unwrap();
        assert_eq!(taken, 1024);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn reuses_allotment_until_exhausted() {
        let (cm, calls) = manager(b"shared-secret");
        let key = ContractKey::new(Id::random(), relaynet_core::CONTROL_ID);
        cm.take(key, 256, Timeout::from_millis(1_000)).await.unwrap();
        cm.take(key, 256, Timeout::from_millis(1_000)).await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn non_blocking_timeout_fails_fast_without_allotment() {
        let (cm, _calls) = manager(b"shared-secret");
        let key = ContractKey::new(Id::random(), relaynet_core::CONTROL_ID);
        let err = cm.take(key, 256, Timeout::NonBlocking).await.unwrap_err();
        assert!(matches!(err, Error::ContractUnavailable));
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let (cm, _calls) = manager(b"shared-secret");
        let stored = StoredContract {
            contract_id: Id::random(),
            transfer_byte_count: 1024,
            source_id: Id::random(),
            destination_id: Id::random(),
            stream_id: relaynet_core::CONTROL_ID,
            provide_mode: ProvideMode::Network,
        };
        let mut contract = cm.sign(stored).unwrap();
        assert!(cm.verify(&contract));
        contract.signature[0] ^= 0xFF;
        assert!(!cm.verify(&contract));
    }

    #[tokio::test]
    async fn concurrent_takers_never_double_spend_an_allotment() {
        let (cm, _calls) = manager(b"shared-secret");
        let cm = Arc::new(cm);
        let key = ContractKey::new(Id::random(), relaynet_core::CONTROL_ID);
        // Seed one allotment sized for exactly four charges of 256 bytes.
        cm.take(key, 256, Timeout::from_millis(1_000)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cm = cm.clone();
            handles.push(tokio::spawn(async move {
                cm.take(key, 256, Timeout::from_millis(1_000)).await
            }));
        }
        let mut total = 0u64;
        for handle in handles {
            let (taken, _) = handle.await.unwrap().unwrap();
            total += taken;
        }
        assert_eq!(total, 4 * 256);
    }
}
