//! `TransferPath`: the `(source, destination, stream)` routing key carried
//! on every frame.

use crate::id::{Id, CONTROL_ID};
use serde::{Deserialize, Serialize};

/// `{sourceId, destinationId, streamId}` identifying the direction and
/// stream of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferPath {
    pub source_id: Id,
    pub destination_id: Id,
    pub stream_id: Id,
}

impl TransferPath {
    pub fn new(source_id: Id, destination_id: Id, stream_id: Id) -> Self {
        Self {
            source_id,
            destination_id,
            stream_id,
        }
    }

    /// A "destination mask": only destinationId or streamId set.
    pub fn destination_mask(destination_id: Id, stream_id: Id) -> Self {
        Self {
            source_id: Id::ZERO,
            destination_id,
            stream_id,
        }
    }

    /// A "source mask": only sourceId or streamId set.
    pub fn source_mask(source_id: Id, stream_id: Id) -> Self {
        Self {
            source_id,
            destination_id: Id::ZERO,
            stream_id,
        }
    }

    pub fn control(destination_id: Id) -> Self {
        Self {
            source_id: CONTROL_ID,
            destination_id,
            stream_id: Id::ZERO,
        }
    }

    /// A path is "stream-addressed" iff `streamId != 0`; stream-addressed
    /// paths bypass `destinationId` lookups at intermediaries.
    pub fn is_stream_addressed(&self) -> bool {
        self.stream_id != Id::ZERO
    }

    pub fn is_destination_mask(&self) -> bool {
        self.source_id == Id::ZERO && (self.destination_id != Id::ZERO || self.is_stream_addressed())
    }

    pub fn is_source_mask(&self) -> bool {
        self.destination_id == Id::ZERO && (self.source_id != Id::ZERO || self.is_stream_addressed())
    }

    pub fn is_fully_populated(&self) -> bool {
        self.source_id != Id::ZERO && self.destination_id != Id::ZERO
    }
}
