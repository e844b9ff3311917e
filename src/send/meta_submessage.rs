use crate::wire::guid::Guid;
use crate::wire::submessage::Submessage;
use bytes::Bytes;

/// An outbound sub-message together with the addressing information needed to bundle it:
///  the local entity sending it and the remote entity it is for.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaSubmessage {
    pub src: Guid,
    /// [Guid::UNKNOWN] addresses every remote entity associated with `src`
    pub dst: Guid,
    pub sm: Submessage,
    /// serialized data for DATA / DATA_FRAG
    pub payload: Bytes,
    /// superseded by another sub-message in the same batch
    pub ignore: bool,
}

impl MetaSubmessage {
    pub fn new(src: Guid, dst: Guid, sm: Submessage) -> MetaSubmessage {
        MetaSubmessage {
            src,
            dst,
            sm,
            payload: Bytes::new(),
            ignore: false,
        }
    }

    pub fn with_payload(src: Guid, dst: Guid, sm: Submessage, payload: Bytes) -> MetaSubmessage {
        MetaSubmessage {
            src,
            dst,
            sm,
            payload,
            ignore: false,
        }
    }

    /// the bytes this sub-message occupies in a datagram, without a preceding INFO_DESTINATION
    pub fn serialized_len(&self) -> usize {
        self.sm.serialized_len(self.payload.len())
    }

    /// `true` if the sub-message concerns the entity, i.e. it must be purged when the entity
    ///  goes away
    pub fn involves(&self, id: Guid) -> bool {
        self.src == id || self.dst == id
    }

    /// sent from either of the two entities to the other
    pub fn connects(&self, a: Guid, b: Guid) -> bool {
        (self.src == a && self.dst == b) || (self.src == b && self.dst == a)
    }
}
