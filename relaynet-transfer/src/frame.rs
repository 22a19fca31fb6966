//! Wire message schema (semantic). Serialization is CBOR via `ciborium`,
//! the tagged length-prefixed codec the teacher crate uses for its own
//! wire types.

use crate::error::{Error, Result};
use relaynet_core::{Id, TransferPath};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Stable enumeration of message types. Unknown codes round-trip as
/// `Unknown` so a receiver can drop them and count a bad message instead
/// of failing to decode the envelope.
pub mod message_type {
    pub const PACK: u16 = 1;
    pub const ACK: u16 = 2;
    pub const CONTRACT: u16 = 3;
    pub const CREATE_CONTRACT: u16 = 4;
    pub const CREATE_CONTRACT_RESULT: u16 = 5;
    pub const CLOSE_CONTRACT: u16 = 6;
    pub const STREAM_OPEN: u16 = 7;
    pub const STREAM_CLOSE: u16 = 8;
    pub const PEER_AUDIT: u16 = 9;
    pub const CONTROL_PING: u16 = 10;
    pub const IP_PING: u16 = 11;
    pub const IP_PACKET_TO_PROVIDER: u16 = 12;
    pub const IP_PACKET_FROM_PROVIDER: u16 = 13;
    pub const APPLICATION: u16 = 100;
}

/// Tagged union `{messageType, bytes}` holding one serialized application
/// or control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub message_type: u16,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn encode<T: Serialize>(message_type: u16, value: &T) -> Result<Self> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(value, &mut bytes)?;
        Ok(Self { message_type, bytes })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        ciborium::de::from_reader(self.bytes.as_slice()).map_err(Error::from)
    }

    pub fn is_known(&self) -> bool {
        matches!(
            self.message_type,
            message_type::PACK
                | message_type::ACK
                | message_type::CONTRACT
                | message_type::CREATE_CONTRACT
                | message_type::CREATE_CONTRACT_RESULT
                | message_type::CLOSE_CONTRACT
                | message_type::STREAM_OPEN
                | message_type::STREAM_CLOSE
                | message_type::PEER_AUDIT
                | message_type::CONTROL_PING
                | message_type::IP_PING
                | message_type::IP_PACKET_TO_PROVIDER
                | message_type::IP_PACKET_FROM_PROVIDER
                | message_type::APPLICATION
        )
    }
}

/// Outermost envelope carried on every route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferFrame {
    pub path: TransferPath,
    pub frame: Frame,
}

impl TransferFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(Error::from)
    }
}

/// A prefix subset of [`TransferFrame`] used for routing-only decoding at
/// intermediaries: decoding ignores the (possibly large) `frame` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredTransferFrame {
    pub path: TransferPath,
}

impl FilteredTransferFrame {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(Error::from)
    }
}

/// Transport envelope for ordered delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    pub message_id: Id,
    pub sequence_id: Id,
    pub sequence_number: u64,
    pub head: bool,
    pub nack: bool,
    pub frames: Vec<Frame>,
    pub contract_frame: Option<Frame>,
    pub contract_id: Option<Id>,
    pub tag: Option<[u8; 8]>,
}

impl Pack {
    pub fn byte_count(&self) -> u64 {
        self.frames.iter().map(|f| f.bytes.len() as u64).sum()
    }
}

/// Acknowledgment for a [`Pack`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub message_id: Id,
    pub sequence_id: Id,
    pub selective: bool,
    pub tag: Option<[u8; 8]>,
}

/// Coarse access level attached to a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvideMode {
    Network,
    Public,
    Friends,
    Stream,
}

/// The signed fields of a contract (what gets HMACed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredContract {
    pub contract_id: Id,
    pub transfer_byte_count: u64,
    pub source_id: Id,
    pub destination_id: Id,
    pub stream_id: Id,
    pub provide_mode: ProvideMode,
}

/// A signed byte-count allotment authorizing transfer along a specific
/// path. Opaque to the application; verified with
/// [`crate::contract::ContractManager::verify`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub stored: StoredContract,
    #[serde(with = "serde_bytes")]
    pub stored_bytes: Vec<u8>,
    pub signature: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContract {
    pub destination_id: Id,
    pub stream_id: Option<Id>,
    pub transfer_byte_count: u64,
    pub companion: bool,
    pub used_contract_ids: Vec<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContractResult {
    pub contract: Option<Contract>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseContract {
    pub contract_id: Id,
    pub acked: u64,
    pub unacked: u64,
    pub checkpoint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOpen {
    pub source_id: Option<Id>,
    pub destination_id: Option<Id>,
    pub stream_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamClose {
    pub stream_id: Id,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerAuditMessage {
    pub bad_contract: u64,
    pub discarded_bytes: u64,
    pub discarded_count: u64,
    pub bad_message_bytes: u64,
    pub bad_message_count: u64,
    pub sent_bytes: u64,
    pub sent_count: u64,
    pub resent_bytes: u64,
    pub resent_count: u64,
    pub abuse: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlPing;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpPing;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpPacketToProvider {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpPacketFromProvider {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub source_id: Id,
}

/// A raw application payload, carried as an opaque frame (the engine does
/// not interpret application bytes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationMessage {
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}
