use crate::send::meta_submessage::MetaSubmessage;
use crate::wire::guid::{Guid, GuidPrefix};
use crate::wire::header::RtpsHeader;
use crate::wire::submessage::{InfoDestinationSubmessage, Submessage, SubmessageKind};
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

/// Resolves the network addresses for sending from a local entity to a remote entity. This is
///  owned by discovery, which knows the remote participants' locators.
#[cfg_attr(test, automock)]
pub trait AddressResolver: Send + Sync + 'static {
    /// `remote` is [Guid::UNKNOWN] for sub-messages to every remote entity associated with
    ///  `local`
    fn get_addresses(&self, local: Guid, remote: Guid) -> Vec<SocketAddr>;
}

/// A serialized RTPS message and the addresses it goes to
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Bundle {
    pub addresses: Vec<SocketAddr>,
    pub message: Bytes,
}

fn is_deduplicated(sm: &Submessage) -> bool {
    matches!(sm, Submessage::Heartbeat(_) | Submessage::AckNack(_))
}

/// Sorts by (source, destination, kind) and marks all but the highest-count HEARTBEAT and
///  ACKNACK per (source, destination) as `ignore`. Marked entries stay in the list, so applying
///  this repeatedly gives the same result.
pub fn dedup(msgs: &mut [MetaSubmessage]) {
    msgs.sort_by_key(|m| (m.src, m.dst, m.sm.kind_id()));

    let mut start = 0;
    while start < msgs.len() {
        let key = (msgs[start].src, msgs[start].dst, msgs[start].sm.kind_id());
        let end = start + msgs[start..].iter()
            .take_while(|m| (m.src, m.dst, m.sm.kind_id()) == key)
            .count();

        let group = &mut msgs[start..end];
        if is_deduplicated(&group[0].sm) && group.len() > 1 {
            let winner = group.iter()
                .enumerate()
                .filter(|(_, m)| !m.ignore)
                .max_by_key(|(i, m)| (m.sm.count(), usize::MAX - i))
                .map(|(i, _)| i);
            for (i, m) in group.iter_mut().enumerate() {
                if Some(i) != winner && !m.ignore {
                    trace!("superseded {:?} from {:?} to {:?}", SubmessageKind::try_from(m.sm.kind_id()).ok(), m.src, m.dst);
                    m.ignore = true;
                }
            }
        }
        start = end;
    }
}

/// Key for send-time count reassignment: HEARTBEAT counts are per writer, since every reader
///  sees the writer's HEARTBEATs; ACKNACK and NACK_FRAG counts are per (reader, writer).
fn count_key(msg: &MetaSubmessage) -> Option<(Guid, Guid, u8)> {
    match &msg.sm {
        Submessage::Heartbeat(_) | Submessage::HeartbeatFrag(_) => Some((msg.src, Guid::UNKNOWN, msg.sm.kind_id())),
        Submessage::AckNack(_) | Submessage::NackFrag(_) => Some((msg.src, msg.dst, msg.sm.kind_id())),
        _ => None,
    }
}

/// Packs sub-messages into as few RTPS messages as possible. Sub-messages for the same set of
///  addresses share messages, an INFO_DESTINATION precedes sub-messages whenever the
///  destination participant changes, and a message never exceeds the configured size.
pub struct Bundler {
    local_prefix: GuidPrefix,
    max_message_size: usize,
    counts: FxHashMap<(Guid, Guid, u8), i32>,
}

impl Bundler {
    pub fn new(local_prefix: GuidPrefix, max_message_size: usize) -> Bundler {
        Bundler {
            local_prefix,
            max_message_size,
            counts: Default::default(),
        }
    }

    /// Drops the count state of an entity that went away
    pub fn forget(&mut self, id: Guid) {
        self.counts.retain(|(src, dst, _), _| *src != id && *dst != id);
    }

    /// Drops the count state between two entities that were disassociated
    pub fn forget_between(&mut self, a: Guid, b: Guid) {
        self.counts.retain(|(src, dst, _), _| !((*src == a && *dst == b) || (*src == b && *dst == a)));
    }

    fn next_count(&mut self, msg: &MetaSubmessage) -> Option<i32> {
        let key = count_key(msg)?;
        let count = self.counts.entry(key).or_insert(0);
        *count = count.wrapping_add(1);
        Some(*count)
    }

    pub fn bundle(&mut self, mut msgs: Vec<MetaSubmessage>, resolver: &dyn AddressResolver) -> Vec<Bundle> {
        dedup(&mut msgs);

        let mut by_addresses: BTreeMap<Vec<SocketAddr>, Vec<MetaSubmessage>> = BTreeMap::new();
        for msg in msgs.into_iter().filter(|m| !m.ignore) {
            let mut addresses = resolver.get_addresses(msg.src, msg.dst);
            if addresses.is_empty() {
                debug!("no address for sending from {:?} to {:?} - dropping {:?}", msg.src, msg.dst, SubmessageKind::try_from(msg.sm.kind_id()).ok());
                continue;
            }
            addresses.sort();
            addresses.dedup();
            by_addresses.entry(addresses).or_default().push(msg);
        }

        let mut result = Vec::new();
        for (addresses, msgs) in by_addresses {
            for message in self.pack(msgs) {
                result.push(Bundle { addresses: addresses.clone(), message });
            }
        }
        result
    }

    fn pack(&mut self, msgs: Vec<MetaSubmessage>) -> Vec<Bytes> {
        let mut result = Vec::new();
        let mut buf = self.start_message();
        let mut current_dst = GuidPrefix::UNKNOWN;

        for mut msg in msgs {
            let dst_prefix = msg.dst.prefix;
            let info_dst_len = Submessage::InfoDestination(InfoDestinationSubmessage { guid_prefix: dst_prefix }).serialized_len(0);

            let needed = |current_dst: GuidPrefix| {
                let info_dst = if current_dst != dst_prefix { info_dst_len } else { 0 };
                info_dst + msg.serialized_len()
            };

            if buf.len() > RtpsHeader::SERIALIZED_LEN && buf.len() + needed(current_dst) > self.max_message_size {
                result.push(std::mem::replace(&mut buf, self.start_message()).freeze());
                current_dst = GuidPrefix::UNKNOWN;
            }
            if RtpsHeader::SERIALIZED_LEN + needed(current_dst) > self.max_message_size {
                warn!("sub-message from {:?} to {:?} does not fit into a message of {} bytes - sending it anyway", msg.src, msg.dst, self.max_message_size);
            }

            if current_dst != dst_prefix {
                Submessage::InfoDestination(InfoDestinationSubmessage { guid_prefix: dst_prefix }).ser(&[], &mut buf);
                current_dst = dst_prefix;
            }
            if let Some(count) = self.next_count(&msg) {
                msg.sm.set_count(count);
            }
            msg.sm.ser(&msg.payload, &mut buf);
        }

        if buf.len() > RtpsHeader::SERIALIZED_LEN {
            result.push(buf.freeze());
        }
        result
    }

    fn start_message(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.max_message_size);
        RtpsHeader::new(self.local_prefix).ser(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receive::reassembly::FragmentReassembly;
    use crate::receive::receive_buffers::tests::ScriptedSource;
    use crate::receive::receive_strategy::ReceiveStrategy;
    use crate::receive::rtps_receiver::{RtpsReceiver, RtpsWireFormat};
    use crate::wire::guid::EntityId;
    use crate::wire::number_set::SequenceNumberSet;
    use crate::wire::sequence_number::SequenceNumber;
    use crate::wire::submessage::{AckNackSubmessage, DataSubmessage, GapSubmessage, HeartbeatSubmessage, SubmessageHeader};
    use bytes::Buf;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn guid(participant: u8, entity: u8) -> Guid {
        Guid::new(GuidPrefix([participant; 12]), EntityId([0, 0, entity, 2]))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn heartbeat(src: Guid, dst: Guid, count: i32) -> MetaSubmessage {
        MetaSubmessage::new(src, dst, Submessage::Heartbeat(HeartbeatSubmessage {
            reader_id: dst.entity_id,
            writer_id: src.entity_id,
            first_sn: SequenceNumber::ONE,
            last_sn: SequenceNumber::from_raw(count as i64),
            count,
            final_flag: false,
            liveliness_flag: false,
        }))
    }

    fn acknack(src: Guid, dst: Guid, count: i32) -> MetaSubmessage {
        MetaSubmessage::new(src, dst, Submessage::AckNack(AckNackSubmessage {
            reader_id: src.entity_id,
            writer_id: dst.entity_id,
            reader_sn_state: SequenceNumberSet::empty(SequenceNumber::ONE),
            count,
            final_flag: true,
        }))
    }

    fn gap(src: Guid, dst: Guid, start: i64) -> MetaSubmessage {
        MetaSubmessage::new(src, dst, Submessage::Gap(GapSubmessage {
            reader_id: dst.entity_id,
            writer_id: src.entity_id,
            gap_start: SequenceNumber::from_raw(start),
            gap_list: SequenceNumberSet::empty(SequenceNumber::from_raw(start + 1)),
        }))
    }

    fn data(src: Guid, dst: Guid, seq: i64, len: usize) -> MetaSubmessage {
        MetaSubmessage::with_payload(src, dst, Submessage::Data(DataSubmessage {
            reader_id: dst.entity_id,
            writer_id: src.entity_id,
            writer_sn: SequenceNumber::from_raw(seq),
            key_flag: false,
            inline_qos: false,
        }), Bytes::from(vec![seq as u8; len]))
    }

    fn surviving_counts(msgs: &[MetaSubmessage]) -> Vec<i32> {
        msgs.iter()
            .filter(|m| !m.ignore)
            .filter_map(|m| m.sm.count())
            .collect()
    }

    #[test]
    fn test_dedup_keeps_highest_count() {
        let w = guid(1, 1);
        let r = guid(2, 1);
        let mut msgs = vec![heartbeat(w, r, 3), heartbeat(w, r, 5)];

        dedup(&mut msgs);
        assert_eq!(surviving_counts(&msgs), vec![5]);
        assert_eq!(msgs.iter().filter(|m| m.ignore).count(), 1);

        let once = msgs.clone();
        dedup(&mut msgs);
        assert_eq!(msgs, once);
    }

    #[rstest]
    #[case::different_destinations(vec![heartbeat(guid(1, 1), guid(2, 1), 3), heartbeat(guid(1, 1), guid(3, 1), 2)], vec![3, 2])]
    #[case::different_kinds(vec![heartbeat(guid(1, 1), guid(2, 1), 3), acknack(guid(1, 1), guid(2, 1), 1)], vec![3, 1])]
    #[case::acknacks(vec![acknack(guid(2, 1), guid(1, 1), 7), acknack(guid(2, 1), guid(1, 1), 9), acknack(guid(2, 1), guid(1, 1), 8)], vec![9])]
    #[case::equal_counts(vec![heartbeat(guid(1, 1), guid(2, 1), 4), heartbeat(guid(1, 1), guid(2, 1), 4)], vec![4])]
    fn test_dedup(#[case] mut msgs: Vec<MetaSubmessage>, #[case] expected: Vec<i32>) {
        dedup(&mut msgs);
        let mut counts = surviving_counts(&msgs);
        counts.sort();
        let mut expected = expected;
        expected.sort();
        assert_eq!(counts, expected);
    }

    #[test]
    fn test_dedup_leaves_gaps_alone() {
        let w = guid(1, 1);
        let r = guid(2, 1);
        let mut msgs = vec![gap(w, r, 3), gap(w, r, 5)];
        dedup(&mut msgs);
        assert!(msgs.iter().all(|m| !m.ignore));
    }

    fn resolver_by_participant() -> MockAddressResolver {
        let mut resolver = MockAddressResolver::new();
        resolver.expect_get_addresses()
            .returning(|_, remote| {
                if remote.is_unknown() {
                    vec![addr(2), addr(3)]
                }
                else {
                    vec![addr(remote.prefix.0[0] as u16)]
                }
            });
        resolver
    }

    /// (destination prefix, kind, count) of the sub-messages in each bundle
    fn parse(bundles: &[Bundle]) -> Vec<Vec<(GuidPrefix, u8, Option<i32>)>> {
        bundles.iter()
            .map(|bundle| {
                let mut buf = bundle.message.clone();
                RtpsHeader::deser(&mut buf).unwrap();
                let mut dst = GuidPrefix::UNKNOWN;
                let mut result = Vec::new();
                while buf.has_remaining() {
                    let header = SubmessageHeader::deser(&mut buf).unwrap();
                    let mut body = buf.split_to(usize::from(header.octets_to_next_header));
                    match Submessage::deser_body(&header, &mut body).unwrap() {
                        Submessage::InfoDestination(info) => dst = info.guid_prefix,
                        sm => result.push((dst, sm.kind_id(), sm.count())),
                    }
                }
                result
            })
            .collect()
    }

    #[test]
    fn test_groups_by_address_with_info_destination() {
        let w = guid(1, 1);
        let msgs = vec![
            heartbeat(w, guid(2, 1), 1),
            gap(w, guid(2, 2), 4),
            heartbeat(w, guid(3, 1), 1),
            data(w, Guid::UNKNOWN, 1, 8),
        ];

        let mut bundler = Bundler::new(GuidPrefix([1; 12]), 1472);
        let bundles = bundler.bundle(msgs, &resolver_by_participant());
        assert_eq!(bundles.len(), 3);

        let addresses: Vec<_> = bundles.iter().map(|b| b.addresses.clone()).collect();
        assert_eq!(addresses, vec![vec![addr(2)], vec![addr(2), addr(3)], vec![addr(3)]]);

        let parsed = parse(&bundles);
        assert_eq!(parsed[0], vec![
            (GuidPrefix([2; 12]), SubmessageKind::Heartbeat.into(), Some(1)),
            (GuidPrefix([2; 12]), SubmessageKind::Gap.into(), None),
        ]);
        assert_eq!(parsed[1], vec![(GuidPrefix::UNKNOWN, SubmessageKind::Data.into(), None)]);
        assert_eq!(parsed[2], vec![(GuidPrefix([3; 12]), SubmessageKind::Heartbeat.into(), Some(2))]);
    }

    #[test]
    fn test_splits_at_max_message_size() {
        let w = guid(1, 1);
        let r = guid(2, 1);
        let msgs: Vec<_> = (1..=5).map(|seq| data(w, r, seq, 100)).collect();
        let sm_len = msgs[0].serialized_len();

        // header + INFO_DST + two DATA fit, three don't
        let max_message_size = RtpsHeader::SERIALIZED_LEN + 16 + 2 * sm_len + sm_len / 2;
        let mut bundler = Bundler::new(GuidPrefix([1; 12]), max_message_size);
        let bundles = bundler.bundle(msgs, &resolver_by_participant());

        assert_eq!(bundles.len(), 3);
        assert!(bundles.iter().all(|b| b.message.len() <= max_message_size));
        let parsed = parse(&bundles);
        assert_eq!(parsed.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert!(parsed.iter().flatten().all(|(dst, _, _)| *dst == GuidPrefix([2; 12])));
    }

    #[test]
    fn test_counts_are_reassigned_monotonically() {
        let w = guid(1, 1);
        let r = guid(2, 1);
        let mut bundler = Bundler::new(GuidPrefix([1; 12]), 1472);
        let resolver = resolver_by_participant();

        let mut counts = Vec::new();
        for count in [17, 3, 3, 90] {
            let bundles = bundler.bundle(vec![heartbeat(w, r, count), acknack(r, w, count)], &resolver);
            for parsed in parse(&bundles) {
                counts.extend(parsed.into_iter().filter_map(|(_, kind, count)| count.map(|c| (kind, c))));
            }
        }
        let hb: Vec<_> = counts.iter().filter(|(k, _)| *k == u8::from(SubmessageKind::Heartbeat)).map(|(_, c)| *c).collect();
        let an: Vec<_> = counts.iter().filter(|(k, _)| *k == u8::from(SubmessageKind::AckNack)).map(|(_, c)| *c).collect();
        assert_eq!(hb, vec![1, 2, 3, 4]);
        assert_eq!(an, vec![1, 2, 3, 4]);

        bundler.forget(w);
        let bundles = bundler.bundle(vec![heartbeat(w, r, 1)], &resolver);
        assert_eq!(parse(&bundles)[0][0].2, Some(1));
    }

    #[test]
    fn test_forget_between_keeps_other_pairs() {
        let w1 = guid(1, 1);
        let w2 = guid(1, 2);
        let r = guid(2, 1);
        let mut bundler = Bundler::new(GuidPrefix([1; 12]), 1472);
        let resolver = resolver_by_participant();
        bundler.bundle(vec![heartbeat(w1, r, 5)], &resolver);
        bundler.bundle(vec![heartbeat(w2, r, 5)], &resolver);

        bundler.forget_between(r, w1);
        let bundles = bundler.bundle(vec![heartbeat(w1, r, 6)], &resolver);
        assert_eq!(parse(&bundles)[0][0].2, Some(1));
        let bundles = bundler.bundle(vec![heartbeat(w2, r, 6)], &resolver);
        assert_eq!(parse(&bundles)[0][0].2, Some(2));
    }

    #[test]
    fn test_unresolvable_destination_is_dropped() {
        let mut resolver = MockAddressResolver::new();
        resolver.expect_get_addresses().returning(|_, _| Vec::new());
        let mut bundler = Bundler::new(GuidPrefix([1; 12]), 1472);
        assert!(bundler.bundle(vec![heartbeat(guid(1, 1), guid(2, 1), 1)], &resolver).is_empty());
    }

    #[test]
    fn test_payload_survives_bundling() {
        let w = guid(1, 1);
        let r = guid(2, 1);
        let mut bundler = Bundler::new(GuidPrefix([1; 12]), 1472);
        let bundles = bundler.bundle(vec![data(w, r, 7, 5)], &resolver_by_participant());

        let mut receiver = RtpsReceiver::new(GuidPrefix([2; 12]), Arc::new(Mutex::new(FragmentReassembly::new(Duration::from_secs(1)))));
        let mut strategy = ReceiveStrategy::new(RtpsWireFormat, 4, 4096, 256);
        let mut source = ScriptedSource::new(vec![bundles[0].message.to_vec()]);
        strategy.on_bytes_available(&mut source, &mut receiver).unwrap();

        let inbound = receiver.take_inbound();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].source_prefix, GuidPrefix([1; 12]));
        assert_eq!(&inbound[0].payload.to_bytes()[..5], &[7u8; 5]);
    }
}
