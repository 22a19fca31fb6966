use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The engine's error taxonomy (kind -> condition -> policy), as laid out
/// in SPEC_FULL.md §7.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed envelope or wrong-length ids. Policy: drop, audit,
    /// continue — never propagated out of a sequence's run loop.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// HMAC verification failure or structural contract invalidity.
    /// Policy: terminate the owning receive sequence and audit.
    #[error("bad contract: {0}")]
    BadContract(String),

    /// Operation attempted against a sequence that has already torn down.
    #[error("sequence closed")]
    SequenceClosed,

    /// No contract could be obtained within the deadline.
    #[error("contract unavailable")]
    ContractUnavailable,

    /// Retransmission exceeded the ack deadline.
    #[error("ack timeout")]
    AckTimeout,

    /// The receiver could not fill the head hole within `GapTimeout`.
    #[error("gap timeout")]
    GapTimeout,

    /// Underlying route write failed to complete within the deadline.
    #[error("write timeout")]
    WriteTimeout,

    /// A blocking operation did not complete within its deadline.
    #[error("timeout")]
    Timeout,

    /// A multi-client channel produced sends but received nothing back.
    #[error("blackhole")]
    Blackhole,

    /// Resend abuse or peer-audit flags tripped.
    #[error("abuse detected")]
    Abuse,

    /// No active route could carry the write.
    #[error("no route available")]
    NoRoute,

    /// Contract acquisition or control-plane RPC failed.
    #[error("contract plane error: {0}")]
    ContractPlane(String),

    #[error("cbor encode: {0}")]
    CborEncode(String),

    #[error("cbor decode: {0}")]
    CborDecode(String),

    #[error(transparent)]
    Core(#[from] relaynet_core::Error),
}

impl Error {
    pub fn bad_message(msg: impl Into<String>) -> Self {
        Self::BadMessage(msg.into())
    }
    pub fn bad_contract(msg: impl Into<String>) -> Self {
        Self::BadContract(msg.into())
    }
    pub fn contract_plane(msg: impl Into<String>) -> Self {
        Self::ContractPlane(msg.into())
    }
}

impl<T> From<ciborium::ser::Error<T>> for Error
where
    T: std::fmt::Display,
{
    fn from(e: ciborium::ser::Error<T>) -> Self {
        Error::CborEncode(e.to_string())
    }
}

impl<T> From<ciborium::de::Error<T>> for Error
where
    T: std::fmt::Display,
{
    fn from(e: ciborium::de::Error<T>) -> Self {
        Error::CborDecode(e.to_string())
    }
}
