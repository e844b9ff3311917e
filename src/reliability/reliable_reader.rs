use crate::disjoint_sequence::{DisjointSequence, SequenceRange};
use crate::receive::reassembly::FragmentReassembly;
use crate::receive::received_sample::SamplePayload;
use crate::reliability::counts::{compare_and_update_counts, DropCounters};
use crate::send::meta_submessage::MetaSubmessage;
use crate::wire::guid::Guid;
use crate::wire::number_set::{SequenceNumberSet, MAX_BITMAP_BITS};
use crate::wire::sequence_number::SequenceNumber;
use crate::wire::submessage::{AckNackSubmessage, GapSubmessage, HeartbeatFragSubmessage, HeartbeatSubmessage, NackFragSubmessage, Submessage};
use std::cmp::min;
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// A sample released to the application, in per-writer sequence order
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeliveredSample {
    pub reader: Guid,
    pub writer: Guid,
    pub seq: SequenceNumber,
    pub payload: SamplePayload,
}

#[derive(Debug, Default)]
pub struct ReaderOutcome {
    pub delivered: Vec<DeliveredSample>,
    /// the first valid HEARTBEAT from a writer was processed
    pub association_complete: Vec<Guid>,
    /// an ACKNACK should be sent after the heartbeat response delay
    pub acknack_needed: bool,
    /// sequence numbers the writer declared unavailable; partially reassembled samples in these
    ///  ranges can be discarded
    pub unavailable: Vec<SequenceRange>,
}

struct WriterInfo {
    recvd: DisjointSequence,
    held: BTreeMap<SequenceNumber, SamplePayload>,
    hb_range: SequenceRange,
    heartbeat_recvd_count: i32,
    hb_frag_recvd_count: i32,
    initial_hb: bool,
    ack_pending: bool,
    /// last fragment number announced per sample by HEARTBEAT_FRAG
    frag_last: BTreeMap<SequenceNumber, u32>,
    acknack_count: i32,
    nackfrag_count: i32,
}

impl WriterInfo {
    fn new() -> WriterInfo {
        WriterInfo {
            recvd: DisjointSequence::new(),
            held: Default::default(),
            hb_range: SequenceRange::new(SequenceNumber::ZERO, SequenceNumber::ZERO),
            heartbeat_recvd_count: 0,
            hb_frag_recvd_count: 0,
            initial_hb: true,
            ack_pending: false,
            frag_last: Default::default(),
            acknack_count: 0,
            nackfrag_count: 0,
        }
    }

    fn should_nack(&self) -> bool {
        if self.recvd.disjoint() && self.recvd.cumulative_ack() < self.hb_range.last {
            return true;
        }
        !self.recvd.is_empty() && self.recvd.high() < self.hb_range.last
    }

    fn nack_durable(&self, durable: bool) -> bool {
        durable && (self.recvd.is_empty() || self.recvd.low() > self.hb_range.first)
    }
}

/// The reliability state machine of a local reader: one record per associated remote writer
///  with the sequence numbers received so far, samples held back until their predecessors
///  arrive, and the writer's last announced range.
///
/// Like the writer, the reader does no I/O. The caller passes the shared fragment reassembly
///  table where fragment state matters.
pub struct ReliableReader {
    id: Guid,
    durable: bool,
    writers: BTreeMap<Guid, WriterInfo>,
    drops: DropCounters,
}

impl ReliableReader {
    pub fn new(id: Guid, durable: bool) -> ReliableReader {
        ReliableReader {
            id,
            durable,
            writers: Default::default(),
            drops: DropCounters::default(),
        }
    }

    pub fn id(&self) -> Guid {
        self.id
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn drops(&self) -> DropCounters {
        self.drops
    }

    pub fn writer_ids(&self) -> Vec<Guid> {
        self.writers.keys().copied().collect()
    }

    pub fn has_writer(&self, writer: Guid) -> bool {
        self.writers.contains_key(&writer)
    }

    /// `true` once a valid HEARTBEAT was received from the writer
    pub fn is_associated(&self, writer: Guid) -> bool {
        self.writers.get(&writer)
            .map(|w| !w.initial_hb)
            .unwrap_or(false)
    }

    pub fn num_held(&self, writer: Guid) -> usize {
        self.writers.get(&writer)
            .map(|w| w.held.len())
            .unwrap_or(0)
    }

    pub fn add_writer(&mut self, writer: Guid) {
        if self.writers.contains_key(&writer) {
            debug!("reader {:?}: writer {:?} is already associated", self.id, writer);
            return;
        }
        debug!("reader {:?}: adding writer {:?}", self.id, writer);
        self.writers.insert(writer, WriterInfo::new());
    }

    /// Samples that are still held are discarded
    pub fn remove_writer(&mut self, writer: Guid) -> bool {
        match self.writers.remove(&writer) {
            Some(info) => {
                if !info.held.is_empty() {
                    debug!("reader {:?}: discarding {} held samples of removed writer {:?}", self.id, info.held.len(), writer);
                }
                true
            }
            None => false,
        }
    }

    pub fn process_data(&mut self, writer: Guid, seq: SequenceNumber, payload: SamplePayload) -> ReaderOutcome {
        let mut outcome = ReaderOutcome::default();
        let durable = self.durable;
        let Some(info) = self.writers.get_mut(&writer) else {
            debug!("reader {:?}: DATA {} from unassociated writer {:?} - ignoring", self.id, seq, writer);
            return outcome;
        };
        info.frag_last.remove(&seq);

        let recvd = &info.recvd;
        if recvd.contains(seq) {
            trace!("reader {:?}: DATA {} from {:?} was already received - dropping", self.id, seq, writer);
            self.drops.duplicate_samples += 1;
            return outcome;
        }

        let withhold = recvd.disjoint()
            || (!recvd.is_empty() && recvd.cumulative_ack() != seq.previous())
            || (durable && !recvd.is_empty() && recvd.low() > SequenceNumber::ONE)
            || (durable && recvd.is_empty() && seq > SequenceNumber::ONE);

        if withhold {
            trace!("reader {:?}: withholding DATA {} from {:?} until its predecessors arrive", self.id, seq, writer);
            info.held.insert(seq, payload);
        }
        else {
            trace!("reader {:?}: delivering DATA {} from {:?}", self.id, seq, writer);
            outcome.delivered.push(DeliveredSample { reader: self.id, writer, seq, payload });
        }
        info.recvd.insert(seq);
        deliver_held(self.id, writer, info, durable, &mut outcome);
        outcome
    }

    pub fn process_heartbeat(&mut self, writer: Guid, heartbeat: &HeartbeatSubmessage, reassembly: &FragmentReassembly) -> ReaderOutcome {
        let mut outcome = ReaderOutcome::default();
        let durable = self.durable;
        let Some(info) = self.writers.get_mut(&writer) else {
            trace!("reader {:?}: HEARTBEAT from unassociated writer {:?} - ignoring", self.id, writer);
            return outcome;
        };

        if !compare_and_update_counts(heartbeat.count, &mut info.heartbeat_recvd_count) {
            trace!("reader {:?}: stale HEARTBEAT #{} from {:?} - dropping", self.id, heartbeat.count, writer);
            self.drops.stale_control += 1;
            return outcome;
        }
        if !heartbeat.is_valid() {
            warn!("reader {:?}: invalid HEARTBEAT [{}, {}] from {:?} - ignoring", self.id, heartbeat.first_sn, heartbeat.last_sn, writer);
            self.drops.invalid_control += 1;
            return outcome;
        }

        let first = heartbeat.first_sn;
        let last = heartbeat.last_sn;
        info.hb_range = SequenceRange::new(first, last);

        if !durable && info.initial_hb {
            // a volatile reader does not care about anything the writer sent before the
            //  association, so the first HEARTBEAT establishes the lowest sequence number to nack
            if info.recvd.is_empty() || info.recvd.low() >= last {
                let baseline_end = if last > SequenceNumber::ONE { last.previous() } else { SequenceNumber::ZERO };
                info.recvd.insert_range(SequenceRange::new(SequenceNumber::ZERO, baseline_end));
            }
            else {
                let low = info.recvd.low();
                info.recvd.insert_range(SequenceRange::new(SequenceNumber::ZERO, low));
            }
        }
        else if !info.recvd.is_empty() {
            // everything below 'first' is gone for good
            let below_first = if first > SequenceNumber::ONE { first.previous() } else { SequenceNumber::ZERO };
            info.recvd.insert_range(SequenceRange::new(SequenceNumber::ZERO, below_first));
        }

        deliver_held(self.id, writer, info, durable, &mut outcome);

        if info.initial_hb {
            debug!("reader {:?}: association with writer {:?} complete", self.id, writer);
            info.initial_hb = false;
            outcome.association_complete.push(writer);
        }

        let needs_reply = !heartbeat.final_flag
            || (!heartbeat.liveliness_flag && (
                info.should_nack()
                    || info.nack_durable(durable)
                    || reassembly.has_frags_in(writer, info.hb_range)));
        if needs_reply {
            info.ack_pending = true;
            outcome.acknack_needed = true;
        }
        outcome
    }

    pub fn process_heartbeat_frag(&mut self, writer: Guid, hb_frag: &HeartbeatFragSubmessage) -> ReaderOutcome {
        let mut outcome = ReaderOutcome::default();
        let Some(info) = self.writers.get_mut(&writer) else {
            trace!("reader {:?}: HEARTBEAT_FRAG from unassociated writer {:?} - ignoring", self.id, writer);
            return outcome;
        };
        if !compare_and_update_counts(hb_frag.count, &mut info.hb_frag_recvd_count) {
            trace!("reader {:?}: stale HEARTBEAT_FRAG #{} from {:?} - dropping", self.id, hb_frag.count, writer);
            self.drops.stale_control += 1;
            return outcome;
        }
        if hb_frag.last_fragment_num == 0 || !hb_frag.writer_sn.is_valid() {
            warn!("reader {:?}: invalid HEARTBEAT_FRAG for {} up to fragment {} from {:?} - ignoring", self.id, hb_frag.writer_sn, hb_frag.last_fragment_num, writer);
            self.drops.invalid_control += 1;
            return outcome;
        }

        // sequence numbers below the heartbeat range count as received, so they must be
        //  checked against the range first
        let seq = hb_frag.writer_sn;
        if !info.hb_range.contains(seq) || !info.recvd.contains(seq) {
            trace!("reader {:?}: writer {:?} announced fragments up to {} for {}", self.id, writer, hb_frag.last_fragment_num, seq);
            info.frag_last.insert(seq, hb_frag.last_fragment_num);
            info.ack_pending = true;
            outcome.acknack_needed = true;
        }
        outcome
    }

    pub fn process_gap(&mut self, writer: Guid, gap: &GapSubmessage) -> ReaderOutcome {
        let mut outcome = ReaderOutcome::default();
        let durable = self.durable;
        let Some(info) = self.writers.get_mut(&writer) else {
            trace!("reader {:?}: GAP from unassociated writer {:?} - ignoring", self.id, writer);
            return outcome;
        };

        let base = gap.gap_list.bitmap_base;
        if !gap.gap_start.is_valid() || !base.is_valid() {
            warn!("reader {:?}: GAP starting at {} with list base {} from {:?} - ignoring", self.id, gap.gap_start, base, writer);
            self.drops.invalid_control += 1;
            return outcome;
        }
        if gap.gap_start < base {
            let range = SequenceRange::new(gap.gap_start, base.previous());
            trace!("reader {:?}: GAP {:?} from {:?}", self.id, range, writer);
            info.recvd.insert_range(range);
            outcome.unavailable.push(range);
        }
        else if gap.gap_start > base {
            warn!("reader {:?}: GAP with inverted range [{}, {}] from {:?} - ignoring the range", self.id, gap.gap_start, base.previous(), writer);
            self.drops.invalid_control += 1;
        }

        info.recvd.insert_bitmap(base, gap.gap_list.num_bits, &gap.gap_list.bitmap);
        outcome.unavailable.extend(gap.gap_list.iter().map(SequenceRange::single));

        for range in &outcome.unavailable {
            let superseded: Vec<SequenceNumber> = info.held.range(range.first..=range.last)
                .map(|(&seq, _)| seq)
                .collect();
            for seq in superseded {
                debug!("reader {:?}: held sample {} from {:?} is covered by a GAP - discarding", self.id, seq, writer);
                info.held.remove(&seq);
            }
            info.frag_last.retain(|&seq, _| !range.contains(seq));
        }

        deliver_held(self.id, writer, info, durable, &mut outcome);
        outcome
    }

    /// Builds ACKNACKs, plus NACK_FRAGs for partially received samples, for all writers that
    ///  either requested a reply or have something missing. Fragments that are held in the
    ///  reassembly table are nacked per fragment and therefore excluded from the ACKNACK bitmap.
    pub fn build_acknacks(&mut self, reassembly: &FragmentReassembly) -> Vec<MetaSubmessage> {
        let mut result = Vec::new();
        let durable = self.durable;

        for (&writer, info) in self.writers.iter_mut() {
            if info.initial_hb && !info.ack_pending {
                continue;
            }
            let nack = info.should_nack() || info.nack_durable(durable);
            if !(info.ack_pending || nack) {
                continue;
            }
            info.ack_pending = false;

            let hb_first = info.hb_range.first;
            let hb_last = info.hb_range.last;

            let base = if info.recvd.is_empty() || (info.nack_durable(durable) && info.recvd.low() > hb_first) {
                hb_first
            }
            else {
                if !durable && info.recvd.low() > SequenceNumber::ONE {
                    // the ack is cumulative, so no lower discontinuity may show up later
                    let low = info.recvd.low();
                    info.recvd.insert_range(SequenceRange::new(SequenceNumber::ZERO, low));
                }
                info.recvd.cumulative_ack().next()
            };

            let window_end = min(hb_last, base + (MAX_BITMAP_BITS as i64 - 1));
            let missing = (base.to_raw()..=window_end.to_raw())
                .map(SequenceNumber::from_raw)
                .filter(|&seq| !info.recvd.contains(seq) && !reassembly.has_frags(writer, seq));
            let reader_sn_state = SequenceNumberSet::from_sequence_numbers(base, missing);
            let final_flag = reader_sn_state.is_empty();

            info.acknack_count = info.acknack_count.wrapping_add(1);
            trace!("reader {:?}: ACKNACK base {} with {} bits to {:?}", self.id, base, reader_sn_state.num_bits, writer);
            result.push(MetaSubmessage::new(self.id, writer, Submessage::AckNack(AckNackSubmessage {
                reader_id: self.id.entity_id,
                writer_id: writer.entity_id,
                reader_sn_state,
                count: info.acknack_count,
                final_flag,
            })));

            for (seq, fragment_number_state) in nack_frags(writer, info, reassembly) {
                info.nackfrag_count = info.nackfrag_count.wrapping_add(1);
                result.push(MetaSubmessage::new(self.id, writer, Submessage::NackFrag(NackFragSubmessage {
                    reader_id: self.id.entity_id,
                    writer_id: writer.entity_id,
                    writer_sn: seq,
                    fragment_number_state,
                    count: info.nackfrag_count,
                })));
            }
        }
        result
    }
}

/// Missing fragments of samples that were partially received, or that a HEARTBEAT_FRAG
///  announced
fn nack_frags(writer: Guid, info: &WriterInfo, reassembly: &FragmentReassembly) -> Vec<(SequenceNumber, crate::wire::number_set::FragmentNumberSet)> {
    let mut candidates: BTreeMap<SequenceNumber, u32> = BTreeMap::new();

    if !info.recvd.is_empty() {
        let upper = std::cmp::max(info.recvd.high(), info.hb_range.last);
        let range = SequenceRange::new(info.recvd.cumulative_ack().next(), upper);
        for seq in reassembly.partial_samples(writer, range) {
            candidates.insert(seq, 0);
        }
    }
    for (&seq, &last_frag) in &info.frag_last {
        if !info.recvd.contains(seq) || !info.hb_range.contains(seq) {
            candidates.insert(seq, last_frag);
        }
    }

    candidates.into_iter()
        .filter(|(seq, _)| !reassembly.is_completed(writer, *seq))
        .filter_map(|(seq, last_frag)| {
            let last_frag = info.frag_last.get(&seq).copied().unwrap_or(last_frag);
            reassembly.get_gaps(writer, seq, last_frag).map(|set| (seq, set))
        })
        .collect()
}

/// Releases held samples up to the cumulative ack, in ascending order
fn deliver_held(reader: Guid, writer: Guid, info: &mut WriterInfo, durable: bool, outcome: &mut ReaderOutcome) {
    if durable && (info.recvd.is_empty() || info.recvd.low() > SequenceNumber::ONE) {
        return;
    }
    let ca = info.recvd.cumulative_ack();
    let still_held = info.held.split_off(&ca.next());
    let releasable = std::mem::replace(&mut info.held, still_held);
    for (seq, payload) in releasable {
        trace!("reader {:?}: delivering held DATA {} from {:?}", reader, seq, writer);
        outcome.delivered.push(DeliveredSample { reader, writer, seq, payload });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtpsUdpConfig;
    use crate::receive::reassembly::FragmentRange;
    use crate::reliability::outbound_sample::tests::RecordingListener;
    use crate::reliability::outbound_sample::OutboundSample;
    use crate::reliability::reliable_writer::ReliableWriter;
    use crate::wire::guid::{EntityId, GuidPrefix};
    use bytes::Bytes;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn sn(n: i64) -> SequenceNumber {
        SequenceNumber::from_raw(n)
    }

    fn writer_id() -> Guid {
        Guid::new(GuidPrefix([1; 12]), EntityId([0, 0, 1, 2]))
    }

    fn reader_id() -> Guid {
        Guid::new(GuidPrefix([2; 12]), EntityId([0, 0, 1, 7]))
    }

    fn reassembly() -> FragmentReassembly {
        FragmentReassembly::new(Duration::from_secs(300))
    }

    fn payload(n: i64) -> SamplePayload {
        SamplePayload::from(Bytes::from(vec![n as u8]))
    }

    fn reader() -> ReliableReader {
        let mut reader = ReliableReader::new(reader_id(), false);
        reader.add_writer(writer_id());
        reader
    }

    fn durable_reader() -> ReliableReader {
        let mut reader = ReliableReader::new(reader_id(), true);
        reader.add_writer(writer_id());
        reader
    }

    fn heartbeat(first: i64, last: i64, count: i32) -> HeartbeatSubmessage {
        HeartbeatSubmessage {
            reader_id: reader_id().entity_id,
            writer_id: writer_id().entity_id,
            first_sn: sn(first),
            last_sn: sn(last),
            count,
            final_flag: false,
            liveliness_flag: false,
        }
    }

    fn gap(start: i64, base: i64, listed: &[i64]) -> GapSubmessage {
        GapSubmessage {
            reader_id: reader_id().entity_id,
            writer_id: writer_id().entity_id,
            gap_start: sn(start),
            gap_list: SequenceNumberSet::from_sequence_numbers(sn(base), listed.iter().map(|&n| sn(n))),
        }
    }

    fn seqs(outcome: &ReaderOutcome) -> Vec<i64> {
        outcome.delivered.iter().map(|d| d.seq.to_raw()).collect()
    }

    fn receive_all(reader: &mut ReliableReader, arrivals: &[i64]) -> Vec<i64> {
        arrivals.iter()
            .flat_map(|&n| seqs(&reader.process_data(writer_id(), sn(n), payload(n))))
            .collect()
    }

    fn acknack_of(msg: &MetaSubmessage) -> &AckNackSubmessage {
        match &msg.sm {
            Submessage::AckNack(an) => an,
            other => panic!("expected ACKNACK, was {:?}", other),
        }
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3], vec![1, 2, 3])]
    #[case::swapped(vec![1, 3, 2], vec![1, 2, 3])]
    #[case::reversed_tail(vec![1, 4, 3, 2], vec![1, 2, 3, 4])]
    #[case::duplicates(vec![1, 1, 3, 3, 2, 2], vec![1, 2, 3])]
    fn test_delivery_order(#[case] arrivals: Vec<i64>, #[case] expected: Vec<i64>) {
        let mut reader = reader();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 1), &reassembly());
        assert_eq!(receive_all(&mut reader, &arrivals), expected);
        assert_eq!(reader.num_held(writer_id()), 0);
    }

    #[test]
    fn test_duplicates_are_counted() {
        let mut reader = reader();
        receive_all(&mut reader, &[1, 1, 1]);
        assert_eq!(reader.drops().duplicate_samples, 2);
    }

    #[test]
    fn test_data_from_unassociated_writer_is_ignored() {
        let mut reader = ReliableReader::new(reader_id(), false);
        assert!(reader.process_data(writer_id(), sn(1), payload(1)).delivered.is_empty());
    }

    #[test]
    fn test_first_heartbeat_completes_association() {
        let mut reader = reader();
        assert!(!reader.is_associated(writer_id()));

        let outcome = reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 1), &reassembly());
        assert_eq!(outcome.association_complete, vec![writer_id()]);
        assert!(outcome.acknack_needed);
        assert!(reader.is_associated(writer_id()));

        let outcome = reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 2), &reassembly());
        assert!(outcome.association_complete.is_empty());
    }

    #[rstest]
    #[case::inverted(3, 1)]
    #[case::zero_first(0, 5)]
    fn test_invalid_heartbeat_is_ignored(#[case] first: i64, #[case] last: i64) {
        let mut reader = reader();
        let outcome = reader.process_heartbeat(writer_id(), &heartbeat(first, last, 1), &reassembly());
        assert!(outcome.association_complete.is_empty());
        assert!(!outcome.acknack_needed);
        assert!(!reader.is_associated(writer_id()));
        assert_eq!(reader.drops().invalid_control, 1);
    }

    #[test]
    fn test_stale_heartbeat_is_dropped() {
        let mut reader = reader();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 7), &reassembly());
        let outcome = reader.process_heartbeat(writer_id(), &heartbeat(1, 5, 7), &reassembly());
        assert!(!outcome.acknack_needed);
        assert_eq!(reader.drops().stale_control, 1);
    }

    #[test]
    fn test_final_heartbeat_without_missing_data_needs_no_acknack() {
        let mut reader = reader();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 1), &reassembly());
        receive_all(&mut reader, &[1, 2]);

        let mut hb = heartbeat(1, 2, 2);
        hb.final_flag = true;
        assert!(!reader.process_heartbeat(writer_id(), &hb, &reassembly()).acknack_needed);

        let mut hb = heartbeat(1, 3, 3);
        hb.final_flag = true;
        assert!(reader.process_heartbeat(writer_id(), &hb, &reassembly()).acknack_needed);

        let mut hb = heartbeat(1, 3, 4);
        hb.final_flag = true;
        hb.liveliness_flag = true;
        assert!(!reader.process_heartbeat(writer_id(), &hb, &reassembly()).acknack_needed);
    }

    #[test]
    fn test_late_joining_volatile_reader_starts_at_last() {
        let mut reader = reader();
        let r = reassembly();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 10, 1), &r);

        let acknacks = reader.build_acknacks(&r);
        assert_eq!(acknacks.len(), 1);
        let an = acknack_of(&acknacks[0]);
        assert_eq!(an.reader_sn_state.bitmap_base, sn(10));
        assert_eq!(an.reader_sn_state.iter().collect::<Vec<_>>(), vec![sn(10)]);
        assert!(!an.final_flag);

        assert_eq!(receive_all(&mut reader, &[10, 11]), vec![10, 11]);
    }

    #[test]
    fn test_heartbeat_releases_samples_below_first() {
        let mut reader = reader();
        let r = reassembly();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 1, 1), &r);
        assert_eq!(receive_all(&mut reader, &[1, 4, 5]), vec![1]);

        let outcome = reader.process_heartbeat(writer_id(), &heartbeat(4, 5, 2), &r);
        assert_eq!(seqs(&outcome), vec![4, 5]);
    }

    #[test]
    fn test_gap_fills_hole() {
        let mut reader = reader();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 1), &reassembly());
        assert_eq!(receive_all(&mut reader, &[1, 4, 6]), vec![1]);

        let outcome = reader.process_gap(writer_id(), &gap(2, 4, &[5]));
        assert_eq!(seqs(&outcome), vec![4, 6]);
        assert_eq!(outcome.unavailable, vec![SequenceRange::new(sn(2), sn(3)), SequenceRange::single(sn(5))]);
    }

    #[test]
    fn test_gap_discards_covered_held_samples() {
        let mut reader = reader();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 1), &reassembly());
        receive_all(&mut reader, &[1, 3, 5]);

        let outcome = reader.process_gap(writer_id(), &gap(2, 5, &[]));
        assert_eq!(seqs(&outcome), vec![5]);
        assert_eq!(reader.num_held(writer_id()), 0);
    }

    #[test]
    fn test_inverted_gap_is_counted() {
        let mut reader = reader();
        reader.process_gap(writer_id(), &gap(5, 3, &[]));
        assert_eq!(reader.drops().invalid_control, 1);
    }

    #[test]
    fn test_durable_reader_waits_for_first_sample() {
        let mut reader = durable_reader();
        let r = reassembly();
        let outcome = reader.process_heartbeat(writer_id(), &heartbeat(1, 3, 1), &r);
        assert!(outcome.acknack_needed);

        let acknacks = reader.build_acknacks(&r);
        let an = acknack_of(&acknacks[0]);
        assert_eq!(an.reader_sn_state.bitmap_base, sn(1));
        assert_eq!(an.reader_sn_state.iter().collect::<Vec<_>>(), vec![sn(1), sn(2), sn(3)]);

        assert!(receive_all(&mut reader, &[2, 3]).is_empty());
        assert_eq!(receive_all(&mut reader, &[1]), vec![1, 2, 3]);
    }

    #[test]
    fn test_nack_excludes_partially_received_samples() {
        let mut reader = reader();
        let mut r = reassembly();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 1), &r);
        reader.build_acknacks(&r);
        receive_all(&mut reader, &[1]);

        let fragment = SamplePayload::from(Bytes::from_static(b"abcd"));
        assert!(r.reassemble(writer_id(), sn(2), FragmentRange { first: 1, last: 1 }, 3, 10, fragment, Instant::now()).is_none());

        reader.process_heartbeat(writer_id(), &heartbeat(1, 3, 2), &r);
        let msgs = reader.build_acknacks(&r);
        assert_eq!(msgs.len(), 2);

        let an = acknack_of(&msgs[0]);
        assert_eq!(an.reader_sn_state.bitmap_base, sn(2));
        assert_eq!(an.reader_sn_state.iter().collect::<Vec<_>>(), vec![sn(3)]);

        match &msgs[1].sm {
            Submessage::NackFrag(nf) => {
                assert_eq!(nf.writer_sn, sn(2));
                assert_eq!(nf.fragment_number_state.iter().collect::<Vec<_>>(), vec![2, 3]);
                assert_eq!(nf.count, 1);
            }
            other => panic!("expected NACK_FRAG, was {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_frag_requests_announced_fragments() {
        let mut reader = reader();
        let r = reassembly();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 1), &r);
        reader.build_acknacks(&r);

        let outcome = reader.process_heartbeat_frag(writer_id(), &heartbeat_frag(1, 2));
        assert!(outcome.acknack_needed);

        let msgs = reader.build_acknacks(&r);
        let frags: Vec<_> = msgs.iter()
            .filter_map(|m| match &m.sm {
                Submessage::NackFrag(nf) => Some((nf.writer_sn.to_raw(), nf.fragment_number_state.iter().collect::<Vec<_>>())),
                _ => None,
            })
            .collect();
        assert_eq!(frags, vec![(1, vec![1, 2])]);
    }

    fn heartbeat_frag(writer_sn: i64, last_fragment_num: u32) -> HeartbeatFragSubmessage {
        HeartbeatFragSubmessage {
            reader_id: reader_id().entity_id,
            writer_id: writer_id().entity_id,
            writer_sn: sn(writer_sn),
            last_fragment_num,
            count: 1,
        }
    }

    #[rstest]
    #[case::few(1, 2, Some((1, 2)))]
    #[case::beyond_bitmap(1, 1000, Some((1, MAX_BITMAP_BITS)))]
    #[case::at_limit(1, u32::MAX, Some((1, MAX_BITMAP_BITS)))]
    #[case::no_fragments(1, 0, None)]
    #[case::zero_sample(0, 2, None)]
    #[case::unknown_sample(SequenceNumber::UNKNOWN.to_raw(), 2, None)]
    fn test_heartbeat_frag_limits(#[case] writer_sn: i64, #[case] last_fragment_num: u32, #[case] expected: Option<(u32, u32)>) {
        let mut reader = reader();
        let r = reassembly();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 1), &r);
        reader.build_acknacks(&r);

        let outcome = reader.process_heartbeat_frag(writer_id(), &heartbeat_frag(writer_sn, last_fragment_num));
        assert_eq!(outcome.acknack_needed, expected.is_some());
        assert_eq!(reader.drops().invalid_control, if expected.is_some() { 0 } else { 1 });

        let nacked: Vec<_> = reader.build_acknacks(&r).iter()
            .filter_map(|m| match &m.sm {
                Submessage::NackFrag(nf) => Some((nf.fragment_number_state.bitmap_base, nf.fragment_number_state.num_bits)),
                _ => None,
            })
            .collect();
        assert_eq!(nacked, expected.into_iter().collect::<Vec<_>>());
    }

    #[rstest]
    #[case::list_at_limit(1, i64::MAX, &[i64::MAX], 0, 0)]
    #[case::start_at_limit(i64::MAX, i64::MAX, &[], 2, 0)]
    #[case::zero_start(0, 3, &[], 2, 1)]
    #[case::unknown_start(SequenceNumber::UNKNOWN.to_raw(), 3, &[], 2, 1)]
    #[case::negative_base(2, -3, &[], 2, 1)]
    fn test_gap_at_sequence_number_limits(#[case] start: i64, #[case] base: i64, #[case] listed: &[i64], #[case] expected_held: usize, #[case] expected_invalid: u64) {
        let mut reader = reader();
        let r = reassembly();
        reader.process_heartbeat(writer_id(), &heartbeat(1, 0, 1), &r);
        assert_eq!(receive_all(&mut reader, &[1, 3, 4]), vec![1]);

        let outcome = reader.process_gap(writer_id(), &gap(start, base, listed));
        assert!(outcome.delivered.is_empty());
        assert_eq!(reader.num_held(writer_id()), expected_held);
        assert_eq!(reader.drops().invalid_control, expected_invalid);

        let acknacks = reader.build_acknacks(&r);
        assert!(acknacks.iter().all(|m| acknack_of(m).reader_sn_state.num_bits <= MAX_BITMAP_BITS));
    }

    #[test]
    fn test_acknack_counts_increase() {
        let mut reader = reader();
        let r = reassembly();
        let mut counts = Vec::new();
        for hb_count in 1..=3 {
            reader.process_heartbeat(writer_id(), &heartbeat(1, 0, hb_count), &r);
            for msg in reader.build_acknacks(&r) {
                counts.push(acknack_of(&msg).count);
            }
        }
        assert_eq!(counts, vec![1, 2, 3]);
    }

    /// Drives a writer and a reader against each other, losing sample 3 on the way
    #[test]
    fn test_lost_sample_is_recovered() {
        let listener = Arc::new(RecordingListener::default());
        let mut writer = ReliableWriter::new(writer_id(), &RtpsUdpConfig::default_ipv4());
        let mut reader = reader();
        let r = reassembly();

        let exchange = |writer: &mut ReliableWriter, reader: &mut ReliableReader, msgs: Vec<MetaSubmessage>| -> Vec<i64> {
            let mut delivered = Vec::new();
            for msg in msgs {
                match msg.sm {
                    Submessage::Data(data) => delivered.extend(seqs(&reader.process_data(writer_id(), data.writer_sn, SamplePayload::from(msg.payload)))),
                    Submessage::Heartbeat(hb) => {
                        let outcome = reader.process_heartbeat(writer_id(), &hb, &r);
                        delivered.extend(seqs(&outcome));
                        if outcome.acknack_needed {
                            for acknack in reader.build_acknacks(&r) {
                                if let Submessage::AckNack(an) = acknack.sm {
                                    writer.process_acknack(reader_id(), &an).notify_listeners();
                                }
                            }
                        }
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            delivered
        };

        let msgs = writer.add_reader(reader_id(), false).notify_listeners();
        assert!(exchange(&mut writer, &mut reader, msgs).is_empty());

        let mut delivered = Vec::new();
        for seq in 1..=5 {
            let sample = OutboundSample::new(writer_id(), sn(seq), Bytes::from(vec![seq as u8]), listener.clone());
            let msgs = writer.write(sample).notify_listeners();
            if seq != 3 {
                delivered.extend(exchange(&mut writer, &mut reader, msgs));
            }
        }
        assert_eq!(delivered, vec![1, 2]);

        let hbs = writer.send_heartbeats().notify_listeners();
        let hb = match &hbs[0].sm {
            Submessage::Heartbeat(hb) => hb.clone(),
            other => panic!("expected HEARTBEAT, was {:?}", other),
        };
        reader.process_heartbeat(writer_id(), &hb, &r);
        let acknacks = reader.build_acknacks(&r);
        let an = acknack_of(&acknacks[0]).clone();
        assert_eq!(an.reader_sn_state.bitmap_base, sn(3));
        assert_eq!(an.reader_sn_state.iter().collect::<Vec<_>>(), vec![sn(3)]);

        let outcome = writer.process_acknack(reader_id(), &an);
        assert!(outcome.schedule_nack_response);
        outcome.notify_listeners();
        let resent = writer.send_nack_responses().notify_listeners();
        delivered.extend(exchange(&mut writer, &mut reader, resent));
        assert_eq!(delivered, vec![1, 2, 3, 4, 5]);

        let hbs = writer.send_heartbeats().notify_listeners();
        delivered.extend(exchange(&mut writer, &mut reader, hbs));
        let acknacks = reader.build_acknacks(&r);
        assert!(acknacks.is_empty());

        let mut hb = heartbeat(1, 5, 100);
        hb.final_flag = false;
        reader.process_heartbeat(writer_id(), &hb, &r);
        let acknacks = reader.build_acknacks(&r);
        let an = acknack_of(&acknacks[0]);
        assert_eq!(an.reader_sn_state.bitmap_base, sn(6));
        assert_eq!(an.reader_sn_state.num_bits, 0);
        assert!(an.final_flag);
    }
}
