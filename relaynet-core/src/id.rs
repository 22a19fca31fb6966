//! Opaque 16-byte identifiers used as routing keys across the engine.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of hops carried by a [`MultiHopId`].
pub const MAX_HOPS: usize = 8;

/// 16-byte opaque identifier. Equality and ordering are lexicographic over
/// the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub [u8; 16]);

/// The reserved destination for control-plane frames (contracts, provide
/// keys, peer audits, pings).
pub const CONTROL_ID: Id = Id([0u8; 16]);

impl Id {
    pub const ZERO: Id = Id([0u8; 16]);

    /// Generate a fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Id(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_control(&self) -> bool {
        *self == CONTROL_ID
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() != 16 {
            return Err(Error::InvalidIdLength(value.len()));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(value);
        Ok(Id(bytes))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::ZERO
    }
}

/// An ordered sequence of up to [`MAX_HOPS`] ids, representing an
/// intermediary path with the last element as the final destination.
/// Immutable once constructed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiHopId(Vec<Id>);

impl MultiHopId {
    pub fn new(hops: Vec<Id>) -> Result<Self> {
        if hops.len() > MAX_HOPS {
            return Err(Error::TooManyHops {
                max: MAX_HOPS,
                got: hops.len(),
            });
        }
        Ok(Self(hops))
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn hops(&self) -> &[Id] {
        &self.0
    }

    /// The final destination in the path, if any hops are present.
    pub fn destination(&self) -> Option<Id> {
        self.0.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for MultiHopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_id_is_zero() {
        assert_eq!(CONTROL_ID, Id([0u8; 16]));
        assert!(CONTROL_ID.is_control());
    }

    #[test]
    fn ids_order_lexicographically() {
        let a = Id([0u8; 16]);
        let mut b_bytes = [0u8; 16];
        b_bytes[15] = 1;
        let b = Id(b_bytes);
        assert!(a < b);
    }

    #[test]
    fn multi_hop_rejects_too_many_hops() {
        let hops: Vec<Id> = (0..9).map(|_| Id::random()).collect();
        assert!(MultiHopId::new(hops).is_err());
    }

    #[test]
    fn multi_hop_destination_is_last_hop() {
        let a = Id::random();
        let b = Id::random();
        let path = MultiHopId::new(vec![a, b]).unwrap();
        assert_eq!(path.destination(), Some(b));
    }

    #[test]
    fn try_from_rejects_wrong_length() {
        let bytes = [0u8; 15];
        assert!(Id::try_from(&bytes[..]).is_err());
    }
}
