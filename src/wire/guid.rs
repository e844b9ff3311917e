use crate::util::buf_ext::BufExt;
use bytes::BufMut;
use std::fmt::{Debug, Display, Formatter};

/// The participant part of a [Guid]: all entities of a participant share their prefix, and the
///  RTPS message header carries the sender's prefix once for all sub-messages in a datagram.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuidPrefix(pub [u8; 12]);
impl GuidPrefix {
    pub const UNKNOWN: GuidPrefix = GuidPrefix([0; 12]);

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<GuidPrefix> {
        Ok(GuidPrefix(buf.read_checked_array()?))
    }
}
impl Debug for GuidPrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 && i % 4 == 0 {
                write!(f, ".")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Identifies an endpoint (reader or writer) inside its participant. The last byte is the entity
///  kind, which is opaque to the reliability layer.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityId(pub [u8; 4]);
impl EntityId {
    pub const UNKNOWN: EntityId = EntityId([0; 4]);

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }

    /// Entity ids are serialized as raw bytes, independent of the sub-message's endianness
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<EntityId> {
        Ok(EntityId(buf.read_checked_array()?))
    }
}
impl Debug for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Globally unique identity of a participant's endpoint. The total order is the lexicographic
///  order of the 16 bytes, which makes it usable as a key in ordered maps.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Guid {
    pub prefix: GuidPrefix,
    pub entity_id: EntityId,
}
impl Guid {
    /// Stands for "any" as a destination, i.e. a sub-message that is not directed at a specific
    ///  remote endpoint
    pub const UNKNOWN: Guid = Guid { prefix: GuidPrefix::UNKNOWN, entity_id: EntityId::UNKNOWN };

    pub fn new(prefix: GuidPrefix, entity_id: EntityId) -> Guid {
        Guid { prefix, entity_id }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}
impl Debug for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({:?})", self.prefix, self.entity_id)
    }
}
impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
