use crate::receive::reassembly::{FragmentRange, FragmentReassembly};
use crate::receive::receive_strategy::{HeaderParse, SampleHeader, SampleSink, TransportHeader, WireFormat};
use crate::receive::received_sample::{ReceivedSample, SamplePayload};
use crate::util::buf_ext::{BufExt, Endianness};
use crate::util::safe_converter::SafeCast;
use crate::wire::guid::{Guid, GuidPrefix};
use crate::wire::header::RtpsHeader;
use crate::wire::submessage::{DataSubmessage, Submessage, SubmessageHeader};
use anyhow::anyhow;
use bytes::Buf;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Every datagram holds exactly one RTPS message, so the PDU is the rest of the datagram
pub struct RtpsTransportHeader {
    /// `None` if the datagram is too short for a header
    pub header: Option<RtpsHeader>,
    pdu_length: usize,
}
impl TransportHeader for RtpsTransportHeader {
    fn is_valid(&self) -> bool {
        self.header.map(|h| h.is_valid()).unwrap_or(false)
    }

    fn pdu_length(&self) -> usize {
        self.pdu_length
    }
}

#[derive(Debug, Clone)]
pub struct RtpsSampleHeader {
    pub submessage_header: SubmessageHeader,
    pub submessage: Submessage,
    message_length: usize,
}
impl SampleHeader for RtpsSampleHeader {
    fn message_length(&self) -> usize {
        self.message_length
    }

    fn more_fragments(&self) -> bool {
        matches!(self.submessage, Submessage::DataFrag(_))
    }
}

pub struct RtpsWireFormat;

impl RtpsWireFormat {
    /// large enough for every fixed sub-message part including full 256 bit bitmaps
    const MAX_HEADER_SIZE: usize = 128;
}

impl WireFormat for RtpsWireFormat {
    type Outer = RtpsTransportHeader;
    type Inner = RtpsSampleHeader;

    fn max_header_size(&self) -> usize {
        Self::MAX_HEADER_SIZE
    }

    fn parse_outer_header(&self, bytes: &[u8], available: usize) -> HeaderParse<RtpsTransportHeader> {
        if available < RtpsHeader::SERIALIZED_LEN {
            return HeaderParse::Parsed {
                header: RtpsTransportHeader { header: None, pdu_length: available },
                consumed: 0,
            };
        }
        let mut buf = bytes;
        match RtpsHeader::deser(&mut buf) {
            Ok(header) => HeaderParse::Parsed {
                header: RtpsTransportHeader { header: Some(header), pdu_length: available - RtpsHeader::SERIALIZED_LEN },
                consumed: RtpsHeader::SERIALIZED_LEN,
            },
            Err(_) => HeaderParse::Partial,
        }
    }

    fn parse_inner_header(&self, bytes: &[u8], pdu_remaining: usize) -> HeaderParse<RtpsSampleHeader> {
        if pdu_remaining < SubmessageHeader::SERIALIZED_LEN {
            return HeaderParse::Invalid(anyhow!("{} trailing bytes are too short for a sub-message", pdu_remaining));
        }
        let mut buf = bytes;
        let submessage_header = match SubmessageHeader::deser(&mut buf) {
            Ok(h) => h,
            Err(_) => return HeaderParse::Partial,
        };

        let total_len = if submessage_header.extends_to_end_of_message() {
            pdu_remaining
        }
        else {
            let octets_to_next_header: usize = submessage_header.octets_to_next_header.safe_cast();
            SubmessageHeader::SERIALIZED_LEN + octets_to_next_header
        };
        if total_len > pdu_remaining {
            return HeaderParse::Invalid(anyhow!("sub-message length {} exceeds the remaining message length {}", total_len, pdu_remaining));
        }

        let body = &bytes[SubmessageHeader::SERIALIZED_LEN..bytes.len().min(total_len)];
        let mut body_buf = body;
        match Submessage::deser_body(&submessage_header, &mut body_buf) {
            Ok(submessage) => {
                let consumed = SubmessageHeader::SERIALIZED_LEN + body.len() - body_buf.remaining();
                HeaderParse::Parsed {
                    header: RtpsSampleHeader {
                        submessage_header,
                        submessage,
                        message_length: total_len - consumed,
                    },
                    consumed,
                }
            }
            Err(e) => {
                if bytes.len() < total_len && bytes.len() < Self::MAX_HEADER_SIZE {
                    HeaderParse::Partial
                }
                else {
                    HeaderParse::Invalid(e)
                }
            }
        }
    }
}

/// A sub-message as it leaves the receive path, with the addressing information of its RTPS
///  message resolved
#[derive(Debug, Clone)]
pub struct InboundSubmessage {
    pub source_prefix: GuidPrefix,
    pub submessage: Submessage,
    /// the serialized data for DATA (and reassembled DATA_FRAG), empty otherwise
    pub payload: SamplePayload,
    pub from: SocketAddr,
}

const PID_SENTINEL: u16 = 0x0001;

/// the length of an inline QoS parameter list at the start of the payload
fn inline_qos_len(bytes: &[u8], endianness: Endianness) -> anyhow::Result<usize> {
    let mut buf = bytes;
    loop {
        let pid = buf.read_checked_u16(endianness)?;
        let len = buf.read_checked_u16(endianness)?;
        buf.skip_checked(len.safe_cast())?;
        if pid == PID_SENTINEL {
            return Ok(bytes.len() - buf.remaining());
        }
    }
}

/// The owner side of the receive strategy for RTPS: it keeps track of the message-level state
///  (source participant, INFO_DESTINATION), reassembles DATA_FRAG and collects the resulting
///  sub-messages for dispatching.
///
/// Dispatching is left to the caller so that no locks of the reliability state machines are
///  taken on the socket reading path.
pub struct RtpsReceiver {
    local_prefix: GuidPrefix,
    source_prefix: GuidPrefix,
    dest_prefix: GuidPrefix,
    reassembly: Arc<Mutex<FragmentReassembly>>,
    inbound: Vec<InboundSubmessage>,
    relink_requested: bool,
}

impl RtpsReceiver {
    pub fn new(local_prefix: GuidPrefix, reassembly: Arc<Mutex<FragmentReassembly>>) -> RtpsReceiver {
        RtpsReceiver {
            local_prefix,
            source_prefix: GuidPrefix::UNKNOWN,
            dest_prefix: local_prefix,
            reassembly,
            inbound: Vec::new(),
            relink_requested: false,
        }
    }

    pub fn take_inbound(&mut self) -> Vec<InboundSubmessage> {
        std::mem::take(&mut self.inbound)
    }

    pub fn take_relink_requested(&mut self) -> bool {
        std::mem::replace(&mut self.relink_requested, false)
    }

    fn is_for_this_participant(&self) -> bool {
        self.dest_prefix == self.local_prefix || self.dest_prefix.is_unknown()
    }
}

impl SampleSink<RtpsWireFormat> for RtpsReceiver {
    fn check_transport_header(&mut self, header: &RtpsTransportHeader, from: SocketAddr) -> bool {
        let Some(header) = &header.header else {
            return false;
        };
        if header.guid_prefix == self.local_prefix {
            trace!("ignoring own message looped back from {:?}", from);
            return false;
        }
        self.source_prefix = header.guid_prefix;
        self.dest_prefix = self.local_prefix;
        true
    }

    fn check_sample_header(&mut self, header: &RtpsSampleHeader) -> bool {
        if let Submessage::InfoDestination(info) = &header.submessage {
            self.dest_prefix = if info.guid_prefix.is_unknown() { self.local_prefix } else { info.guid_prefix };
            return false;
        }
        if !self.is_for_this_participant() {
            trace!("skipping sub-message for participant {:?}", self.dest_prefix);
            return false;
        }
        !matches!(header.submessage, Submessage::Other { .. })
    }

    fn reassemble(&mut self, sample: ReceivedSample<RtpsSampleHeader>, _transport_header: &RtpsTransportHeader) -> Option<ReceivedSample<RtpsSampleHeader>> {
        let Submessage::DataFrag(data_frag) = &sample.header.submessage else {
            return None;
        };

        let writer = Guid::new(self.source_prefix, data_frag.writer_id);
        let range = FragmentRange { first: data_frag.fragment_starting_num, last: data_frag.last_fragment_num() };

        let mut payload = sample.payload;
        if data_frag.inline_qos && data_frag.fragment_starting_num == 1 {
            match inline_qos_len(&payload.to_bytes(), sample.header.submessage_header.endianness()) {
                Ok(len) => payload.advance(len),
                Err(e) => {
                    debug!("DATA_FRAG with corrupt inline QoS: {} - dropping", e);
                    return None;
                }
            }
        }

        let complete = self.reassembly
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reassemble(
                writer,
                data_frag.writer_sn,
                range,
                data_frag.total_fragments(),
                data_frag.sample_size.safe_cast(),
                payload,
                Instant::now(),
            )?;

        let submessage = Submessage::Data(DataSubmessage {
            reader_id: data_frag.reader_id,
            writer_id: data_frag.writer_id,
            writer_sn: data_frag.writer_sn,
            key_flag: false,
            inline_qos: false,
        });
        Some(ReceivedSample {
            header: RtpsSampleHeader {
                submessage_header: sample.header.submessage_header,
                submessage,
                message_length: complete.len(),
            },
            payload: complete,
        })
    }

    fn deliver_sample(&mut self, sample: ReceivedSample<RtpsSampleHeader>, from: SocketAddr) {
        let mut payload = sample.payload;
        match &sample.header.submessage {
            Submessage::Data(data) if data.inline_qos => {
                match inline_qos_len(&payload.to_bytes(), sample.header.submessage_header.endianness()) {
                    Ok(len) => payload.advance(len),
                    Err(e) => {
                        warn!("DATA {} with corrupt inline QoS: {} - dropping", data.writer_sn, e);
                        return;
                    }
                }
            }
            Submessage::Data(_) => {}
            _ => payload = SamplePayload::new(),
        }

        self.inbound.push(InboundSubmessage {
            source_prefix: self.source_prefix,
            submessage: sample.header.submessage,
            payload,
            from,
        });
    }

    fn relink(&mut self) {
        self.relink_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receive::receive_buffers::tests::ScriptedSource;
    use crate::receive::receive_strategy::ReceiveStrategy;
    use crate::wire::guid::EntityId;
    use crate::wire::number_set::SequenceNumberSet;
    use crate::wire::sequence_number::SequenceNumber;
    use crate::wire::submessage::{AckNackSubmessage, DataFragSubmessage, HeartbeatSubmessage, InfoDestinationSubmessage};
    use bytes::BufMut;
    use std::time::Duration;

    const LOCAL: GuidPrefix = GuidPrefix([1; 12]);
    const REMOTE: GuidPrefix = GuidPrefix([2; 12]);

    fn writer_id() -> EntityId {
        EntityId([0, 0, 1, 2])
    }

    fn message(source: GuidPrefix, submessages: &[(Submessage, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        RtpsHeader::new(source).ser(&mut buf);
        for (sm, payload) in submessages {
            sm.ser(payload, &mut buf);
        }
        buf
    }

    fn data(sn: i64) -> Submessage {
        Submessage::Data(DataSubmessage { reader_id: EntityId::UNKNOWN, writer_id: writer_id(), writer_sn: SequenceNumber::from_raw(sn), key_flag: false, inline_qos: false })
    }

    fn heartbeat() -> Submessage {
        Submessage::Heartbeat(HeartbeatSubmessage {
            reader_id: EntityId::UNKNOWN,
            writer_id: writer_id(),
            first_sn: SequenceNumber::ONE,
            last_sn: SequenceNumber::from_raw(3),
            count: 1,
            final_flag: false,
            liveliness_flag: false,
        })
    }

    fn info_dst(prefix: GuidPrefix) -> Submessage {
        Submessage::InfoDestination(InfoDestinationSubmessage { guid_prefix: prefix })
    }

    fn receive(datagrams: Vec<Vec<u8>>) -> Vec<InboundSubmessage> {
        let reassembly = Arc::new(Mutex::new(FragmentReassembly::new(Duration::from_secs(10))));
        let mut receiver = RtpsReceiver::new(LOCAL, reassembly);
        let mut strategy = ReceiveStrategy::new(RtpsWireFormat, 16, 65536, 4096);
        let mut source = ScriptedSource::new(datagrams);
        while !source.reads.is_empty() {
            strategy.on_bytes_available(&mut source, &mut receiver).unwrap();
        }
        receiver.take_inbound()
    }

    #[test]
    fn test_submessages_of_a_message() {
        let inbound = receive(vec![message(REMOTE, &[(data(1), b"abcd"), (heartbeat(), b"")])]);
        assert_eq!(inbound.len(), 2);
        assert_eq!(inbound[0].source_prefix, REMOTE);
        assert_eq!(inbound[0].submessage, data(1));
        assert_eq!(inbound[0].payload.to_bytes().as_ref(), b"abcd");
        assert_eq!(inbound[1].submessage, heartbeat());
        assert!(inbound[1].payload.is_empty());
    }

    #[test]
    fn test_info_destination() {
        let inbound = receive(vec![message(REMOTE, &[
            (info_dst(GuidPrefix([9; 12])), b""),
            (data(1), b"1111"),
            (info_dst(LOCAL), b""),
            (data(2), b"2222"),
            (info_dst(GuidPrefix::UNKNOWN), b""),
            (data(3), b"3333"),
        ])]);
        let sns: Vec<_> = inbound.iter().map(|i| i.submessage.clone()).collect();
        assert_eq!(sns, vec![data(2), data(3)]);
    }

    #[test]
    fn test_destination_resets_per_message() {
        let inbound = receive(vec![
            message(REMOTE, &[(info_dst(GuidPrefix([9; 12])), b""), (data(1), b"1111")]),
            message(REMOTE, &[(data(2), b"2222")]),
        ]);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].submessage, data(2));
    }

    #[test]
    fn test_own_messages_are_ignored() {
        assert!(receive(vec![message(LOCAL, &[(data(1), b"abcd")])]).is_empty());
    }

    #[test]
    fn test_invalid_header_skips_datagram() {
        let mut bad = message(REMOTE, &[(data(1), b"abcd")]);
        bad[0] = b'X';
        let inbound = receive(vec![bad, vec![1, 2, 3], message(REMOTE, &[(data(2), b"abcd")])]);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].submessage, data(2));
    }

    #[test]
    fn test_truncated_submessage_skips_rest() {
        let mut msg = message(REMOTE, &[(data(1), b"abcd"), (heartbeat(), b"")]);
        msg.truncate(msg.len() - 4);
        let inbound = receive(vec![msg]);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].submessage, data(1));
    }

    #[test]
    fn test_extends_to_end_of_message() {
        let mut msg = Vec::new();
        RtpsHeader::new(REMOTE).ser(&mut msg);
        let mut sm = Vec::new();
        data(4).ser(b"xy", &mut sm);
        sm[2] = 0;
        sm[3] = 0;
        sm.truncate(sm.len() - 2);
        msg.extend(sm);

        let inbound = receive(vec![msg]);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].payload.to_bytes().as_ref(), b"xy");
    }

    #[test]
    fn test_acknack_with_bitmap() {
        let acknack = Submessage::AckNack(AckNackSubmessage {
            reader_id: EntityId([0, 0, 3, 7]),
            writer_id: writer_id(),
            reader_sn_state: SequenceNumberSet::from_sequence_numbers(SequenceNumber::from_raw(3), [SequenceNumber::from_raw(3)]),
            count: 2,
            final_flag: false,
        });
        let inbound = receive(vec![message(REMOTE, &[(acknack.clone(), b"")])]);
        assert_eq!(inbound[0].submessage, acknack);
    }

    fn data_frag(first: u32, sample_size: u32) -> Submessage {
        Submessage::DataFrag(DataFragSubmessage {
            reader_id: EntityId::UNKNOWN,
            writer_id: writer_id(),
            writer_sn: SequenceNumber::from_raw(7),
            fragment_starting_num: first,
            fragments_in_submessage: 1,
            fragment_size: 4,
            sample_size,
            inline_qos: false,
        })
    }

    #[test]
    fn test_data_frag_reassembly() {
        let inbound = receive(vec![
            message(REMOTE, &[(data_frag(3, 10), b"ij")]),
            message(REMOTE, &[(data_frag(1, 10), b"abcd")]),
            message(REMOTE, &[(data_frag(2, 10), b"efgh")]),
        ]);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].submessage, data(7));
        assert_eq!(inbound[0].payload.to_bytes().as_ref(), b"abcdefghij");
    }

    #[test]
    fn test_inline_qos_is_stripped() {
        let sm = Submessage::Data(DataSubmessage { reader_id: EntityId::UNKNOWN, writer_id: writer_id(), writer_sn: SequenceNumber::ONE, key_flag: false, inline_qos: true });
        let mut payload = Vec::new();
        payload.put_u16_le(0x0070);
        payload.put_u16_le(4);
        payload.put_u32_le(0xdead_beef);
        payload.put_u16_le(PID_SENTINEL);
        payload.put_u16_le(0);
        payload.extend_from_slice(b"data");

        let mut msg = Vec::new();
        RtpsHeader::new(REMOTE).ser(&mut msg);
        sm.ser(&payload, &mut msg);
        // ser() does not set the Q flag, inline QoS is never sent
        msg[RtpsHeader::SERIALIZED_LEN + 1] |= 0x02;

        let inbound = receive(vec![msg]);
        assert_eq!(inbound[0].payload.to_bytes().as_ref(), b"data");
    }
}
