//! RTPS sub-messages as far as the reliability layer needs them: the data carrying DATA and
//!  DATA_FRAG, the reliability protocol's HEARTBEAT, ACKNACK, GAP, NACK_FRAG and HEARTBEAT_FRAG,
//!  and INFO_DESTINATION for addressing. Other kinds are recognized and skipped.
//!
//! Every sub-message starts with a 4 byte header (kind, flags, octetsToNextHeader). The 'E' flag
//!  defines the byte order of everything after the kind and flags - this implementation always
//!  sends little endian, but accepts both.

use crate::util::buf_ext::{BufExt, Endianness};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::guid::{EntityId, GuidPrefix};
use crate::wire::number_set::{FragmentNumberSet, SequenceNumberSet};
use crate::wire::sequence_number::SequenceNumber;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SubmessageKind {
    Pad = 0x01,
    AckNack = 0x06,
    Heartbeat = 0x07,
    Gap = 0x08,
    InfoTimestamp = 0x09,
    InfoSource = 0x0c,
    InfoReplyIp4 = 0x0d,
    InfoDestination = 0x0e,
    InfoReply = 0x0f,
    NackFrag = 0x12,
    HeartbeatFrag = 0x13,
    Data = 0x15,
    DataFrag = 0x16,
}

bitflags! {
    /// Flag bits are interpreted per sub-message kind, so some of them share a value
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct SubmessageFlags: u8 {
        const ENDIANNESS = 0x01;

        // HEARTBEAT, ACKNACK
        const FINAL = 0x02;
        // HEARTBEAT
        const LIVELINESS = 0x04;

        // DATA, DATA_FRAG
        const INLINE_QOS = 0x02;
        // DATA
        const DATA = 0x04;
        const KEY = 0x08;
        // DATA_FRAG
        const KEY_FRAG = 0x04;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SubmessageHeader {
    /// kept raw to allow skipping unknown and vendor specific kinds
    pub kind: u8,
    pub flags: SubmessageFlags,
    pub octets_to_next_header: u16,
}
impl SubmessageHeader {
    pub const SERIALIZED_LEN: usize = 4;

    pub fn kind(&self) -> Option<SubmessageKind> {
        SubmessageKind::try_from(self.kind).ok()
    }

    pub fn endianness(&self) -> Endianness {
        Endianness::from_flag(self.flags.contains(SubmessageFlags::ENDIANNESS))
    }

    /// An octetsToNextHeader of 0 means that the sub-message extends to the end of the
    ///  datagram - except for PAD and INFO_TS where it really means an empty body
    pub fn extends_to_end_of_message(&self) -> bool {
        self.octets_to_next_header == 0
            && !matches!(self.kind(), Some(SubmessageKind::Pad) | Some(SubmessageKind::InfoTimestamp))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_u8(self.flags.bits());
        match Endianness::from_flag(self.flags.contains(SubmessageFlags::ENDIANNESS)) {
            Endianness::Little => buf.put_u16_le(self.octets_to_next_header),
            Endianness::Big => buf.put_u16(self.octets_to_next_header),
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SubmessageHeader> {
        let kind = buf.read_checked_u8()?;
        let flags = SubmessageFlags::from_bits_retain(buf.read_checked_u8()?);
        let octets_to_next_header = buf.read_checked_u16(Endianness::from_flag(flags.contains(SubmessageFlags::ENDIANNESS)))?;
        Ok(SubmessageHeader { kind, flags, octets_to_next_header })
    }
}

/// DATA without the serialized payload, which is handled separately on both the send and the
///  receive path
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataSubmessage {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub writer_sn: SequenceNumber,
    pub key_flag: bool,
    /// inline QoS is never sent, and it is treated as part of the payload on the receive path
    pub inline_qos: bool,
}
impl DataSubmessage {
    /// number of bytes between the octetsToInlineQos field and the inline QoS / payload
    const OCTETS_TO_INLINE_QOS: u16 = 16;
    const FIXED_BODY_LEN: usize = 20;

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(0); // extra flags
        buf.put_u16_le(Self::OCTETS_TO_INLINE_QOS);
        self.reader_id.ser(buf);
        self.writer_id.ser(buf);
        self.writer_sn.ser(buf);
    }

    fn deser(buf: &mut impl Buf, flags: SubmessageFlags, endianness: Endianness) -> anyhow::Result<DataSubmessage> {
        let _extra_flags = buf.read_checked_u16(endianness)?;
        let octets_to_inline_qos = buf.read_checked_u16(endianness)?;
        if octets_to_inline_qos < Self::OCTETS_TO_INLINE_QOS {
            bail!("DATA with octetsToInlineQos {} - corrupt sub-message", octets_to_inline_qos);
        }
        let reader_id = EntityId::deser(buf)?;
        let writer_id = EntityId::deser(buf)?;
        let writer_sn = SequenceNumber::deser(buf, endianness)?;
        buf.skip_checked((octets_to_inline_qos - Self::OCTETS_TO_INLINE_QOS).safe_cast())?;
        Ok(DataSubmessage {
            reader_id,
            writer_id,
            writer_sn,
            key_flag: flags.contains(SubmessageFlags::KEY),
            inline_qos: flags.contains(SubmessageFlags::INLINE_QOS),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataFragSubmessage {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub writer_sn: SequenceNumber,
    /// 1-based
    pub fragment_starting_num: u32,
    pub fragments_in_submessage: u16,
    pub fragment_size: u16,
    pub sample_size: u32,
    pub inline_qos: bool,
}
impl DataFragSubmessage {
    const OCTETS_TO_INLINE_QOS: u16 = 28;
    const FIXED_BODY_LEN: usize = 32;

    /// the total number of fragments of the sample, derived from sample and fragment size
    pub fn total_fragments(&self) -> u32 {
        if self.fragment_size == 0 {
            return 0;
        }
        self.sample_size.div_ceil(self.fragment_size as u32)
    }

    pub fn last_fragment_num(&self) -> u32 {
        self.fragment_starting_num
            .saturating_add(self.fragments_in_submessage as u32)
            .saturating_sub(1)
    }

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(0); // extra flags
        buf.put_u16_le(Self::OCTETS_TO_INLINE_QOS);
        self.reader_id.ser(buf);
        self.writer_id.ser(buf);
        self.writer_sn.ser(buf);
        buf.put_u32_le(self.fragment_starting_num);
        buf.put_u16_le(self.fragments_in_submessage);
        buf.put_u16_le(self.fragment_size);
        buf.put_u32_le(self.sample_size);
    }

    fn deser(buf: &mut impl Buf, flags: SubmessageFlags, endianness: Endianness) -> anyhow::Result<DataFragSubmessage> {
        let _extra_flags = buf.read_checked_u16(endianness)?;
        let octets_to_inline_qos = buf.read_checked_u16(endianness)?;
        if octets_to_inline_qos < Self::OCTETS_TO_INLINE_QOS {
            bail!("DATA_FRAG with octetsToInlineQos {} - corrupt sub-message", octets_to_inline_qos);
        }
        let result = DataFragSubmessage {
            reader_id: EntityId::deser(buf)?,
            writer_id: EntityId::deser(buf)?,
            writer_sn: SequenceNumber::deser(buf, endianness)?,
            fragment_starting_num: buf.read_checked_u32(endianness)?,
            fragments_in_submessage: buf.read_checked_u16(endianness)?,
            fragment_size: buf.read_checked_u16(endianness)?,
            sample_size: buf.read_checked_u32(endianness)?,
            inline_qos: flags.contains(SubmessageFlags::INLINE_QOS),
        };
        buf.skip_checked((octets_to_inline_qos - Self::OCTETS_TO_INLINE_QOS).safe_cast())?;

        if result.fragment_starting_num == 0 || result.fragments_in_submessage == 0 || result.fragment_size == 0 {
            bail!("DATA_FRAG with invalid fragment numbering: {:?}", result);
        }
        if result.last_fragment_num() > result.total_fragments() {
            bail!("DATA_FRAG with fragments beyond the sample size: {:?}", result);
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeartbeatSubmessage {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub first_sn: SequenceNumber,
    pub last_sn: SequenceNumber,
    pub count: i32,
    pub final_flag: bool,
    pub liveliness_flag: bool,
}
impl HeartbeatSubmessage {
    const BODY_LEN: usize = 28;

    /// RTPS allows `last = first - 1` for a writer that has nothing (left) to offer
    pub fn is_valid(&self) -> bool {
        self.first_sn.is_valid() && self.last_sn >= self.first_sn.previous()
    }

    fn ser(&self, buf: &mut impl BufMut) {
        self.reader_id.ser(buf);
        self.writer_id.ser(buf);
        self.first_sn.ser(buf);
        self.last_sn.ser(buf);
        buf.put_i32_le(self.count);
    }

    fn deser(buf: &mut impl Buf, flags: SubmessageFlags, endianness: Endianness) -> anyhow::Result<HeartbeatSubmessage> {
        Ok(HeartbeatSubmessage {
            reader_id: EntityId::deser(buf)?,
            writer_id: EntityId::deser(buf)?,
            first_sn: SequenceNumber::deser(buf, endianness)?,
            last_sn: SequenceNumber::deser(buf, endianness)?,
            count: buf.read_checked_i32(endianness)?,
            final_flag: flags.contains(SubmessageFlags::FINAL),
            liveliness_flag: flags.contains(SubmessageFlags::LIVELINESS),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckNackSubmessage {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    /// The bitmap base acknowledges everything below it, the bits request resends
    pub reader_sn_state: SequenceNumberSet,
    pub count: i32,
    pub final_flag: bool,
}
impl AckNackSubmessage {
    fn body_len(&self) -> usize {
        8 + self.reader_sn_state.serialized_len() + 4
    }

    fn ser(&self, buf: &mut impl BufMut) {
        self.reader_id.ser(buf);
        self.writer_id.ser(buf);
        self.reader_sn_state.ser(buf);
        buf.put_i32_le(self.count);
    }

    fn deser(buf: &mut impl Buf, flags: SubmessageFlags, endianness: Endianness) -> anyhow::Result<AckNackSubmessage> {
        Ok(AckNackSubmessage {
            reader_id: EntityId::deser(buf)?,
            writer_id: EntityId::deser(buf)?,
            reader_sn_state: SequenceNumberSet::deser(buf, endianness)?,
            count: buf.read_checked_i32(endianness)?,
            final_flag: flags.contains(SubmessageFlags::FINAL),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GapSubmessage {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    /// together with the gap list's base, this defines the contiguous range
    ///  `[gap_start, gap_list.bitmap_base - 1]` of irrelevant sequence numbers
    pub gap_start: SequenceNumber,
    pub gap_list: SequenceNumberSet,
}
impl GapSubmessage {
    fn body_len(&self) -> usize {
        8 + SequenceNumber::SERIALIZED_LEN + self.gap_list.serialized_len()
    }

    fn ser(&self, buf: &mut impl BufMut) {
        self.reader_id.ser(buf);
        self.writer_id.ser(buf);
        self.gap_start.ser(buf);
        self.gap_list.ser(buf);
    }

    fn deser(buf: &mut impl Buf, endianness: Endianness) -> anyhow::Result<GapSubmessage> {
        Ok(GapSubmessage {
            reader_id: EntityId::deser(buf)?,
            writer_id: EntityId::deser(buf)?,
            gap_start: SequenceNumber::deser(buf, endianness)?,
            gap_list: SequenceNumberSet::deser(buf, endianness)?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NackFragSubmessage {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub writer_sn: SequenceNumber,
    pub fragment_number_state: FragmentNumberSet,
    pub count: i32,
}
impl NackFragSubmessage {
    fn body_len(&self) -> usize {
        8 + SequenceNumber::SERIALIZED_LEN + self.fragment_number_state.serialized_len() + 4
    }

    fn ser(&self, buf: &mut impl BufMut) {
        self.reader_id.ser(buf);
        self.writer_id.ser(buf);
        self.writer_sn.ser(buf);
        self.fragment_number_state.ser(buf);
        buf.put_i32_le(self.count);
    }

    fn deser(buf: &mut impl Buf, endianness: Endianness) -> anyhow::Result<NackFragSubmessage> {
        Ok(NackFragSubmessage {
            reader_id: EntityId::deser(buf)?,
            writer_id: EntityId::deser(buf)?,
            writer_sn: SequenceNumber::deser(buf, endianness)?,
            fragment_number_state: FragmentNumberSet::deser(buf, endianness)?,
            count: buf.read_checked_i32(endianness)?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeartbeatFragSubmessage {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub writer_sn: SequenceNumber,
    pub last_fragment_num: u32,
    pub count: i32,
}
impl HeartbeatFragSubmessage {
    const BODY_LEN: usize = 24;

    fn ser(&self, buf: &mut impl BufMut) {
        self.reader_id.ser(buf);
        self.writer_id.ser(buf);
        self.writer_sn.ser(buf);
        buf.put_u32_le(self.last_fragment_num);
        buf.put_i32_le(self.count);
    }

    fn deser(buf: &mut impl Buf, endianness: Endianness) -> anyhow::Result<HeartbeatFragSubmessage> {
        Ok(HeartbeatFragSubmessage {
            reader_id: EntityId::deser(buf)?,
            writer_id: EntityId::deser(buf)?,
            writer_sn: SequenceNumber::deser(buf, endianness)?,
            last_fragment_num: buf.read_checked_u32(endianness)?,
            count: buf.read_checked_i32(endianness)?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InfoDestinationSubmessage {
    /// [GuidPrefix::UNKNOWN] resets the destination to "any participant"
    pub guid_prefix: GuidPrefix,
}
impl InfoDestinationSubmessage {
    pub const BODY_LEN: usize = 12;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Submessage {
    Data(DataSubmessage),
    DataFrag(DataFragSubmessage),
    Heartbeat(HeartbeatSubmessage),
    AckNack(AckNackSubmessage),
    Gap(GapSubmessage),
    NackFrag(NackFragSubmessage),
    HeartbeatFrag(HeartbeatFragSubmessage),
    InfoDestination(InfoDestinationSubmessage),
    /// a sub-message that is well-formed, but irrelevant for the reliability layer
    Other { kind: u8 },
}

impl Submessage {
    pub fn kind_id(&self) -> u8 {
        match self {
            Submessage::Data(_) => SubmessageKind::Data.into(),
            Submessage::DataFrag(_) => SubmessageKind::DataFrag.into(),
            Submessage::Heartbeat(_) => SubmessageKind::Heartbeat.into(),
            Submessage::AckNack(_) => SubmessageKind::AckNack.into(),
            Submessage::Gap(_) => SubmessageKind::Gap.into(),
            Submessage::NackFrag(_) => SubmessageKind::NackFrag.into(),
            Submessage::HeartbeatFrag(_) => SubmessageKind::HeartbeatFrag.into(),
            Submessage::InfoDestination(_) => SubmessageKind::InfoDestination.into(),
            Submessage::Other { kind } => *kind,
        }
    }

    /// the counter of the sub-message kinds that have one, i.e. that are subject to stale
    ///  detection on the receiving side
    pub fn count(&self) -> Option<i32> {
        match self {
            Submessage::Heartbeat(hb) => Some(hb.count),
            Submessage::AckNack(an) => Some(an.count),
            Submessage::NackFrag(nf) => Some(nf.count),
            Submessage::HeartbeatFrag(hbf) => Some(hbf.count),
            _ => None,
        }
    }

    pub fn set_count(&mut self, count: i32) {
        match self {
            Submessage::Heartbeat(hb) => hb.count = count,
            Submessage::AckNack(an) => an.count = count,
            Submessage::NackFrag(nf) => nf.count = count,
            Submessage::HeartbeatFrag(hbf) => hbf.count = count,
            _ => {}
        }
    }

    fn flags(&self) -> SubmessageFlags {
        let mut flags = SubmessageFlags::ENDIANNESS;
        match self {
            Submessage::Data(d) => {
                flags |= if d.key_flag { SubmessageFlags::KEY } else { SubmessageFlags::DATA };
            }
            Submessage::Heartbeat(hb) => {
                flags.set(SubmessageFlags::FINAL, hb.final_flag);
                flags.set(SubmessageFlags::LIVELINESS, hb.liveliness_flag);
            }
            Submessage::AckNack(an) => {
                flags.set(SubmessageFlags::FINAL, an.final_flag);
            }
            _ => {}
        }
        flags
    }

    fn body_len(&self) -> usize {
        match self {
            Submessage::Data(_) => DataSubmessage::FIXED_BODY_LEN,
            Submessage::DataFrag(_) => DataFragSubmessage::FIXED_BODY_LEN,
            Submessage::Heartbeat(_) => HeartbeatSubmessage::BODY_LEN,
            Submessage::AckNack(an) => an.body_len(),
            Submessage::Gap(gap) => gap.body_len(),
            Submessage::NackFrag(nf) => nf.body_len(),
            Submessage::HeartbeatFrag(_) => HeartbeatFragSubmessage::BODY_LEN,
            Submessage::InfoDestination(_) => InfoDestinationSubmessage::BODY_LEN,
            Submessage::Other { .. } => 0,
        }
    }

    /// the number of bytes this sub-message occupies in a datagram with a payload of the given
    ///  length, including header and alignment padding
    pub fn serialized_len(&self, payload_len: usize) -> usize {
        SubmessageHeader::SERIALIZED_LEN + self.body_len() + payload_len.next_multiple_of(4)
    }

    /// Writes header, body and payload. The payload is padded to a multiple of 4 bytes to keep
    ///  the next sub-message aligned, so a DATA receiver may see up to 3 trailing zero bytes.
    pub fn ser(&self, payload: &[u8], buf: &mut impl BufMut) {
        let padded_payload_len = payload.len().next_multiple_of(4);
        SubmessageHeader {
            kind: self.kind_id(),
            flags: self.flags(),
            octets_to_next_header: (self.body_len() + padded_payload_len).prechecked_cast(),
        }.ser(buf);

        match self {
            Submessage::Data(d) => d.ser(buf),
            Submessage::DataFrag(df) => df.ser(buf),
            Submessage::Heartbeat(hb) => hb.ser(buf),
            Submessage::AckNack(an) => an.ser(buf),
            Submessage::Gap(gap) => gap.ser(buf),
            Submessage::NackFrag(nf) => nf.ser(buf),
            Submessage::HeartbeatFrag(hbf) => hbf.ser(buf),
            Submessage::InfoDestination(info) => info.guid_prefix.ser(buf),
            Submessage::Other { .. } => {}
        }
        buf.put_slice(payload);
        buf.put_bytes(0, padded_payload_len - payload.len());
    }

    /// Parses a sub-message's body, i.e. everything after the header for control sub-messages,
    ///  and the part before the serialized payload for DATA and DATA_FRAG.
    ///
    /// Failure means that either not enough bytes were available or the sub-message is corrupt -
    ///  the caller distinguishes between the two based on what it knows about available bytes.
    pub fn deser_body(header: &SubmessageHeader, buf: &mut impl Buf) -> anyhow::Result<Submessage> {
        let endianness = header.endianness();
        let flags = header.flags;
        Ok(match header.kind() {
            Some(SubmessageKind::Data) => Submessage::Data(DataSubmessage::deser(buf, flags, endianness)?),
            Some(SubmessageKind::DataFrag) => Submessage::DataFrag(DataFragSubmessage::deser(buf, flags, endianness)?),
            Some(SubmessageKind::Heartbeat) => Submessage::Heartbeat(HeartbeatSubmessage::deser(buf, flags, endianness)?),
            Some(SubmessageKind::AckNack) => Submessage::AckNack(AckNackSubmessage::deser(buf, flags, endianness)?),
            Some(SubmessageKind::Gap) => Submessage::Gap(GapSubmessage::deser(buf, endianness)?),
            Some(SubmessageKind::NackFrag) => Submessage::NackFrag(NackFragSubmessage::deser(buf, endianness)?),
            Some(SubmessageKind::HeartbeatFrag) => Submessage::HeartbeatFrag(HeartbeatFragSubmessage::deser(buf, endianness)?),
            Some(SubmessageKind::InfoDestination) => Submessage::InfoDestination(InfoDestinationSubmessage { guid_prefix: GuidPrefix::deser(buf)? }),
            _ => Submessage::Other { kind: header.kind },
        })
    }

    /// true for the kinds whose bytes after the parsed body are a serialized payload rather
    ///  than padding or unknown extensions
    pub fn has_payload(&self) -> bool {
        matches!(self, Submessage::Data(_) | Submessage::DataFrag(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn entity(n: u8) -> EntityId {
        EntityId([0, 0, n, 0xc2])
    }

    fn sn(n: i64) -> SequenceNumber {
        SequenceNumber::from_raw(n)
    }

    fn round_trip(sm: &Submessage, payload: &[u8]) -> (SubmessageHeader, Submessage, Vec<u8>) {
        let mut buf = Vec::new();
        sm.ser(payload, &mut buf);
        assert_eq!(buf.len(), sm.serialized_len(payload.len()));

        let mut b: &[u8] = &buf;
        let header = SubmessageHeader::deser(&mut b).unwrap();
        assert_eq!(header.octets_to_next_header as usize, buf.len() - SubmessageHeader::SERIALIZED_LEN);
        let parsed = Submessage::deser_body(&header, &mut b).unwrap();
        (header, parsed, b.to_vec())
    }

    #[rstest]
    #[case::heartbeat(Submessage::Heartbeat(HeartbeatSubmessage { reader_id: entity(1), writer_id: entity(2), first_sn: sn(1), last_sn: sn(5), count: 3, final_flag: false, liveliness_flag: true }))]
    #[case::heartbeat_final(Submessage::Heartbeat(HeartbeatSubmessage { reader_id: EntityId::UNKNOWN, writer_id: entity(2), first_sn: sn(1), last_sn: sn(0), count: 1, final_flag: true, liveliness_flag: false }))]
    #[case::acknack(Submessage::AckNack(AckNackSubmessage { reader_id: entity(1), writer_id: entity(2), reader_sn_state: SequenceNumberSet::from_sequence_numbers(sn(3), [sn(3), sn(40)]), count: 7, final_flag: false }))]
    #[case::acknack_empty(Submessage::AckNack(AckNackSubmessage { reader_id: entity(1), writer_id: entity(2), reader_sn_state: SequenceNumberSet::empty(sn(6)), count: 8, final_flag: true }))]
    #[case::gap(Submessage::Gap(GapSubmessage { reader_id: entity(1), writer_id: entity(2), gap_start: sn(4), gap_list: SequenceNumberSet::from_sequence_numbers(sn(7), [sn(8)]) }))]
    #[case::nack_frag(Submessage::NackFrag(NackFragSubmessage { reader_id: entity(1), writer_id: entity(2), writer_sn: sn(9), fragment_number_state: FragmentNumberSet::from_fragment_numbers(2, [2, 5]), count: 1 }))]
    #[case::heartbeat_frag(Submessage::HeartbeatFrag(HeartbeatFragSubmessage { reader_id: entity(1), writer_id: entity(2), writer_sn: sn(9), last_fragment_num: 12, count: 4 }))]
    #[case::info_dst(Submessage::InfoDestination(InfoDestinationSubmessage { guid_prefix: GuidPrefix([3; 12]) }))]
    fn test_control_submessages(#[case] sm: Submessage) {
        let (_, parsed, rest) = round_trip(&sm, &[]);
        assert_eq!(parsed, sm);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_data_with_payload() {
        let sm = Submessage::Data(DataSubmessage { reader_id: EntityId::UNKNOWN, writer_id: entity(2), writer_sn: sn(17), key_flag: false, inline_qos: false });
        let (header, parsed, rest) = round_trip(&sm, b"hello");
        assert_eq!(parsed, sm);
        assert!(header.flags.contains(SubmessageFlags::DATA));
        assert_eq!(rest, b"hello\0\0\0");
    }

    #[test]
    fn test_data_frag() {
        let sm = Submessage::DataFrag(DataFragSubmessage {
            reader_id: EntityId::UNKNOWN,
            writer_id: entity(2),
            writer_sn: sn(3),
            fragment_starting_num: 2,
            fragments_in_submessage: 1,
            fragment_size: 4,
            sample_size: 10,
            inline_qos: false,
        });
        let (_, parsed, rest) = round_trip(&sm, b"efgh");
        assert_eq!(parsed, sm);
        assert_eq!(rest, b"efgh");
        if let Submessage::DataFrag(df) = parsed {
            assert_eq!(df.total_fragments(), 3);
            assert_eq!(df.last_fragment_num(), 2);
        }
    }

    #[test]
    fn test_data_frag_beyond_sample_size_is_corrupt() {
        let sm = Submessage::DataFrag(DataFragSubmessage {
            reader_id: EntityId::UNKNOWN,
            writer_id: entity(2),
            writer_sn: sn(3),
            fragment_starting_num: 4,
            fragments_in_submessage: 1,
            fragment_size: 4,
            sample_size: 10,
            inline_qos: false,
        });
        let mut buf = Vec::new();
        sm.ser(&[0; 4], &mut buf);
        let mut b: &[u8] = &buf;
        let header = SubmessageHeader::deser(&mut b).unwrap();
        assert!(Submessage::deser_body(&header, &mut b).is_err());
    }

    #[test]
    fn test_big_endian_heartbeat() {
        let buf: Vec<u8> = vec![
            0x07, 0x00, 0, 28,
            0, 0, 0, 0,
            0, 0, 2, 0xc2,
            0, 0, 0, 0, 0, 0, 0, 1,
            0, 0, 0, 0, 0, 0, 0, 9,
            0, 0, 0, 5,
        ];
        let mut b: &[u8] = &buf;
        let header = SubmessageHeader::deser(&mut b).unwrap();
        assert_eq!(header.endianness(), Endianness::Big);
        assert_eq!(header.octets_to_next_header, 28);
        let parsed = Submessage::deser_body(&header, &mut b).unwrap();
        assert_eq!(parsed, Submessage::Heartbeat(HeartbeatSubmessage {
            reader_id: EntityId::UNKNOWN,
            writer_id: entity(2),
            first_sn: sn(1),
            last_sn: sn(9),
            count: 5,
            final_flag: false,
            liveliness_flag: false,
        }));
    }

    #[rstest]
    #[case::empty(1, 0, true)]
    #[case::one(1, 1, true)]
    #[case::inverted(5, 3, false)]
    #[case::zero_first(0, 3, false)]
    fn test_heartbeat_validity(#[case] first: i64, #[case] last: i64, #[case] expected: bool) {
        let hb = HeartbeatSubmessage { reader_id: EntityId::UNKNOWN, writer_id: entity(2), first_sn: sn(first), last_sn: sn(last), count: 1, final_flag: false, liveliness_flag: false };
        assert_eq!(hb.is_valid(), expected);
    }

    #[rstest]
    #[case::data(0x15, 0, true)]
    #[case::pad(0x01, 0, false)]
    #[case::info_ts(0x09, 0, false)]
    #[case::non_zero(0x15, 8, false)]
    fn test_extends_to_end_of_message(#[case] kind: u8, #[case] octets: u16, #[case] expected: bool) {
        let header = SubmessageHeader { kind, flags: SubmessageFlags::ENDIANNESS, octets_to_next_header: octets };
        assert_eq!(header.extends_to_end_of_message(), expected);
    }

    #[test]
    fn test_unknown_kind_is_other() {
        let header = SubmessageHeader { kind: 0x80, flags: SubmessageFlags::ENDIANNESS, octets_to_next_header: 4 };
        let mut b: &[u8] = &[1, 2, 3, 4];
        assert_eq!(Submessage::deser_body(&header, &mut b).unwrap(), Submessage::Other { kind: 0x80 });
    }
}
