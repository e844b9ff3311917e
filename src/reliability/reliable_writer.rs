use crate::config::RtpsUdpConfig;
use crate::disjoint_sequence::{DisjointSequence, SequenceRange};
use crate::reliability::backoff::FibonacciBackoff;
use crate::reliability::counts::{compare_and_update_counts, DropCounters};
use crate::reliability::outbound_sample::OutboundSample;
use crate::reliability::send_buffer::{RemoveResult, SendBuffer};
use crate::send::meta_submessage::MetaSubmessage;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::guid::{EntityId, Guid};
use crate::wire::number_set::SequenceNumberSet;
use crate::wire::sequence_number::SequenceNumber;
use crate::wire::submessage::{AckNackSubmessage, DataFragSubmessage, DataSubmessage, GapSubmessage, HeartbeatSubmessage, NackFragSubmessage, Submessage};
use bytes::Bytes;
use std::cmp::{max, min};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A remote reader as seen by a writer. Every reader is in exactly one state at any time.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReaderState {
    /// no ACKNACK was received yet
    PreAssociation,
    /// the reader acknowledged everything the writer has
    Leading,
    /// the reader has not acknowledged everything yet
    Lagging,
}

struct ReaderInfo {
    id: Guid,
    durable: bool,
    state: ReaderState,
    /// the first sequence number the reader did not acknowledge
    cumulative_ack: SequenceNumber,
    acknack_recvd_count: i32,
    nackfrag_recvd_count: i32,
    requested: DisjointSequence,
    requested_frags: BTreeMap<SequenceNumber, BTreeSet<u32>>,
    /// historic samples replayed for a durable reader, held until the reader acknowledges them
    durable_data: BTreeMap<SequenceNumber, OutboundSample>,
    /// durable replay is in progress - no HEARTBEATs until it is finished
    replaying: bool,
}

impl ReaderInfo {
    fn new(id: Guid, durable: bool) -> ReaderInfo {
        ReaderInfo {
            id,
            durable,
            state: ReaderState::PreAssociation,
            cumulative_ack: SequenceNumber::ONE,
            acknack_recvd_count: 0,
            nackfrag_recvd_count: 0,
            requested: DisjointSequence::new(),
            requested_frags: Default::default(),
            durable_data: Default::default(),
            replaying: durable,
        }
    }

    /// the highest sequence number the reader needs to acknowledge to be up to date
    fn high_water_mark(&self, max_sn: SequenceNumber) -> SequenceNumber {
        match self.durable_data.last_key_value() {
            Some((&dd_last, _)) => max(max_sn, dd_last),
            None => max_sn,
        }
    }

    fn update_state(&mut self, max_sn: SequenceNumber) {
        if self.state == ReaderState::PreAssociation {
            return;
        }
        self.state = if self.cumulative_ack > self.high_water_mark(max_sn) {
            ReaderState::Leading
        }
        else {
            ReaderState::Lagging
        };
    }

    fn needs_heartbeat(&self) -> bool {
        self.state != ReaderState::Leading && !self.replaying
    }
}

/// What the caller needs to do after the writer's state changed. Listener notifications are
///  separate from the state change so that they can be made after releasing the writer's lock.
#[derive(Debug, Default)]
pub struct WriterOutcome {
    pub submessages: Vec<MetaSubmessage>,
    pub delivered: Vec<OutboundSample>,
    pub dropped: Vec<OutboundSample>,
    /// periodic HEARTBEATs should (re)start from the initial interval
    pub restart_heartbeats: bool,
    pub schedule_nack_response: bool,
}

impl WriterOutcome {
    pub fn notify_listeners(self) -> Vec<MetaSubmessage> {
        for sample in self.delivered {
            sample.delivered();
        }
        for sample in self.dropped {
            sample.dropped();
        }
        self.submessages
    }
}

/// The reliability state machine of a local writer: it sends samples, keeps track of what
///  every associated reader acknowledged, announces its samples with HEARTBEATs and answers
///  nacks with resends or GAPs.
///
/// The writer does no I/O and owns no timers, every entry point returns a [WriterOutcome]
///  describing the resulting actions.
pub struct ReliableWriter {
    id: Guid,
    fragment_size: usize,
    max_sn: SequenceNumber,
    send_buffer: SendBuffer,
    readers: BTreeMap<Guid, ReaderInfo>,
    heartbeat_count: i32,
    heartbeat_backoff: FibonacciBackoff,
    drops: DropCounters,
}

impl ReliableWriter {
    pub fn new(id: Guid, config: &RtpsUdpConfig) -> ReliableWriter {
        ReliableWriter {
            id,
            fragment_size: config.fragment_size,
            max_sn: SequenceNumber::ZERO,
            send_buffer: SendBuffer::new(config.retained_sample_depth),
            readers: Default::default(),
            heartbeat_count: 0,
            heartbeat_backoff: FibonacciBackoff::new(config.heartbeat_period, config.max_heartbeat_period),
            drops: DropCounters::default(),
        }
    }

    pub fn id(&self) -> Guid {
        self.id
    }

    pub fn max_sn(&self) -> SequenceNumber {
        self.max_sn
    }

    pub fn drops(&self) -> DropCounters {
        self.drops
    }

    pub fn reader_state(&self, reader: Guid) -> Option<ReaderState> {
        self.readers.get(&reader).map(|r| r.state)
    }

    pub fn reader_ids(&self) -> Vec<Guid> {
        self.readers.keys().copied().collect()
    }

    pub fn has_reader(&self, reader: Guid) -> bool {
        self.readers.contains_key(&reader)
    }

    /// `true` while any reader is not known to have all samples
    pub fn heartbeats_needed(&self) -> bool {
        self.readers.values().any(|r| r.needs_heartbeat())
    }

    pub fn next_heartbeat_interval(&mut self) -> Duration {
        self.heartbeat_backoff.next_interval()
    }

    pub fn reset_heartbeat_backoff(&mut self) {
        self.heartbeat_backoff.reset();
    }

    /// A durable reader gets its first HEARTBEAT only after the historic samples were replayed,
    ///  see [ReliableWriter::end_historic_samples]
    pub fn add_reader(&mut self, reader: Guid, durable: bool) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        if self.readers.contains_key(&reader) {
            debug!("writer {:?}: reader {:?} is already associated", self.id, reader);
            return outcome;
        }

        debug!("writer {:?}: adding {} reader {:?}", self.id, if durable { "durable" } else { "volatile" }, reader);
        self.readers.insert(reader, ReaderInfo::new(reader, durable));
        if !durable {
            outcome.submessages.extend(self.heartbeat(reader));
            outcome.restart_heartbeats = true;
        }
        outcome
    }

    /// Removes a reader. Historic samples that were held for it are dropped, and samples that
    ///  only it had not acknowledged count as delivered.
    pub fn remove_reader(&mut self, reader: Guid) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        let Some(info) = self.readers.remove(&reader) else {
            debug!("writer {:?}: removing unknown reader {:?} - ignoring", self.id, reader);
            return outcome;
        };
        debug!("writer {:?}: removed reader {:?}", self.id, reader);

        outcome.dropped.extend(info.durable_data.into_values());
        outcome.delivered.extend(self.process_acked_by_all());
        outcome
    }

    /// Sends historic samples to a durable reader that just associated. The samples are held
    ///  until the reader acknowledges them.
    pub fn replay_historic(&mut self, reader: Guid, samples: Vec<OutboundSample>) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        let Some(info) = self.readers.get_mut(&reader) else {
            warn!("writer {:?}: historic samples for unknown reader {:?} - dropping", self.id, reader);
            outcome.dropped = samples;
            return outcome;
        };
        if !info.durable {
            warn!("writer {:?}: historic samples for volatile reader {:?} - dropping", self.id, reader);
            outcome.dropped = samples;
            return outcome;
        }

        for sample in samples {
            outcome.submessages.extend(data_submessages(self.id, self.fragment_size, reader, sample.seq, &sample.payload));
            if let Some(replaced) = info.durable_data.insert(sample.seq, sample) {
                outcome.dropped.push(replaced);
            }
        }
        trace!("writer {:?}: replayed {} historic samples for {:?}", self.id, info.durable_data.len(), reader);
        outcome
    }

    pub fn end_historic_samples(&mut self, reader: Guid) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        match self.readers.get_mut(&reader) {
            Some(info) => info.replaying = false,
            None => {
                debug!("writer {:?}: end of historic samples for unknown reader {:?}", self.id, reader);
                return outcome;
            }
        }
        outcome.submessages.extend(self.heartbeat(reader));
        outcome.restart_heartbeats = true;
        outcome
    }

    /// Sends a new sample to all associated readers. Sequence numbers the application skipped
    ///  are announced as GAP first.
    pub fn write(&mut self, sample: OutboundSample) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        if sample.seq <= self.max_sn {
            warn!("writer {:?}: sample {} is not above the highest sequence number {} - dropping", self.id, sample.seq, self.max_sn);
            outcome.dropped.push(sample);
            return outcome;
        }

        if sample.seq > self.max_sn.next() {
            let skipped = SequenceRange::new(self.max_sn.next(), sample.seq.previous());
            outcome.submessages.push(gap_submessage(self.id, Guid::UNKNOWN, skipped));
        }
        self.max_sn = sample.seq;
        outcome.submessages.extend(data_submessages(self.id, self.fragment_size, Guid::UNKNOWN, sample.seq, &sample.payload));

        if self.readers.is_empty() {
            trace!("writer {:?}: no readers for sample {}", self.id, sample.seq);
            outcome.delivered.push(sample);
            return outcome;
        }

        self.send_buffer.insert(sample);
        outcome.restart_heartbeats = self.readers_fall_behind();
        outcome
    }

    /// The application will not write `seq` or anything below it that was not written yet
    pub fn skip_sequence(&mut self, seq: SequenceNumber) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        if seq <= self.max_sn {
            return outcome;
        }
        outcome.submessages.push(gap_submessage(self.id, Guid::UNKNOWN, SequenceRange::new(self.max_sn.next(), seq)));
        self.max_sn = seq;
        outcome.restart_heartbeats = self.readers_fall_behind();
        outcome
    }

    /// returns `true` if a reader was leading before
    fn readers_fall_behind(&mut self) -> bool {
        let mut any_was_leading = false;
        for info in self.readers.values_mut() {
            any_was_leading |= info.state == ReaderState::Leading;
            info.update_state(self.max_sn);
        }
        any_was_leading
    }

    /// The application withdraws a sample. It is kept for resending while some reader still
    ///  needs it.
    pub fn remove_sample(&mut self, seq: SequenceNumber) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        let in_flight = self.readers.values().any(|r| r.cumulative_ack <= seq);
        match self.send_buffer.remove(seq, in_flight) {
            RemoveResult::Released(sample) => outcome.dropped.push(sample),
            RemoveResult::KeptInFlight => debug!("writer {:?}: sample {} is in flight, keeping it until it is acknowledged", self.id, seq),
            RemoveResult::NotFound => trace!("writer {:?}: removing unknown sample {}", self.id, seq),
        }
        outcome
    }

    pub fn remove_all_msgs(&mut self) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        for seq in self.send_buffer.not_acked_seqs() {
            let o = self.remove_sample(seq);
            outcome.dropped.extend(o.dropped);
        }
        outcome
    }

    /// Empties the writer, all samples that were not acknowledged are dropped
    pub fn close(&mut self) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        outcome.dropped.extend(self.send_buffer.clear());
        for info in std::mem::take(&mut self.readers).into_values() {
            outcome.dropped.extend(info.durable_data.into_values());
        }
        outcome
    }

    pub fn process_acknack(&mut self, reader: Guid, acknack: &AckNackSubmessage) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        let max_sn = self.max_sn;

        let Some(info) = self.readers.get_mut(&reader) else {
            debug!("writer {:?}: ACKNACK from unknown reader {:?} - ignoring", self.id, reader);
            return outcome;
        };
        if !compare_and_update_counts(acknack.count, &mut info.acknack_recvd_count) {
            trace!("writer {:?}: stale ACKNACK #{} from {:?} - dropping", self.id, acknack.count, reader);
            self.drops.stale_control += 1;
            return outcome;
        }

        let ack = acknack.reader_sn_state.bitmap_base;

        if let Some((&dd_last, _)) = info.durable_data.last_key_value() {
            if ack > dd_last {
                debug!("writer {:?}: durable reader {:?} acknowledged historic samples", self.id, reader);
                outcome.delivered.extend(std::mem::take(&mut info.durable_data).into_values());
            }
            else {
                let mut answered = false;
                let mut gaps = DisjointSequence::new();
                for seq in acknack.reader_sn_state.iter() {
                    if let Some(sample) = info.durable_data.get(&seq) {
                        trace!("writer {:?}: durable resend of {} to {:?}", self.id, seq, reader);
                        outcome.submessages.extend(data_submessages(self.id, self.fragment_size, reader, seq, &sample.payload));
                        answered = true;
                    }
                    else if seq <= dd_last {
                        gaps.insert(seq);
                    }
                }
                if !gaps.is_empty() {
                    outcome.submessages.extend(gaps.present_sequence_ranges().into_iter()
                        .map(|r| gap_submessage(self.id, reader, r)));
                    answered = true;
                }
                if answered {
                    return outcome;
                }
            }
        }

        if ack.is_valid() {
            if ack < info.cumulative_ack {
                debug!("writer {:?}: reader {:?} acknowledgement regressed from {} to {} - resetting", self.id, reader, info.cumulative_ack, ack);
                info.requested.reset();
                info.requested_frags.clear();
                outcome.restart_heartbeats = true;
            }
            info.cumulative_ack = ack;
        }

        let was_leading = info.state == ReaderState::Leading;
        if info.state == ReaderState::PreAssociation {
            debug!("writer {:?}: reader {:?} associated", self.id, reader);
            info.state = ReaderState::Lagging;
        }
        info.update_state(max_sn);
        if was_leading && info.state != ReaderState::Leading {
            outcome.restart_heartbeats = true;
        }

        if !acknack.final_flag {
            let sn_state = &acknack.reader_sn_state;
            if info.requested.insert_bitmap(sn_state.bitmap_base, sn_state.num_bits, &sn_state.bitmap) {
                outcome.schedule_nack_response = true;
            }
            else if ack == max_sn && self.send_buffer.contains(ack) {
                // a non-final ACKNACK without bits asks for its base if that is the highest
                //  announced sample
                info.requested.insert(ack);
                outcome.schedule_nack_response = true;
            }
        }

        outcome.delivered.extend(self.process_acked_by_all());
        outcome
    }

    pub fn process_nackfrag(&mut self, reader: Guid, nackfrag: &NackFragSubmessage) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        let Some(info) = self.readers.get_mut(&reader) else {
            debug!("writer {:?}: NACK_FRAG from unknown reader {:?} - ignoring", self.id, reader);
            return outcome;
        };
        if !compare_and_update_counts(nackfrag.count, &mut info.nackfrag_recvd_count) {
            trace!("writer {:?}: stale NACK_FRAG #{} from {:?} - dropping", self.id, nackfrag.count, reader);
            self.drops.stale_control += 1;
            return outcome;
        }

        info.requested_frags.entry(nackfrag.writer_sn)
            .or_default()
            .extend(nackfrag.fragment_number_state.iter());
        outcome.schedule_nack_response = true;
        outcome
    }

    /// Answers the nacks collected since the last call: requested samples that are still
    ///  retained are resent to the requesting reader, the others are announced as GAP.
    pub fn send_nack_responses(&mut self) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        for (&reader, info) in self.readers.iter_mut() {
            let requested = std::mem::take(&mut info.requested);
            let requested_frags = std::mem::take(&mut info.requested_frags);

            let mut gaps = DisjointSequence::new();
            for range in requested.present_sequence_ranges() {
                let first = max(range.first, SequenceNumber::ONE);
                let last = min(range.last, self.max_sn);
                for raw in first.to_raw()..=last.to_raw() {
                    let seq = SequenceNumber::from_raw(raw);
                    match self.send_buffer.get(seq) {
                        Some(payload) => {
                            trace!("writer {:?}: resending {} to {:?}", self.id, seq, reader);
                            outcome.submessages.extend(data_submessages(self.id, self.fragment_size, reader, seq, payload));
                        }
                        None => {
                            gaps.insert(seq);
                        }
                    }
                }
            }

            for (seq, frags) in requested_frags {
                match self.send_buffer.get(seq) {
                    Some(payload) => {
                        trace!("writer {:?}: resending fragments {:?} of {} to {:?}", self.id, frags, seq, reader);
                        outcome.submessages.extend(fragment_submessages(self.id, self.fragment_size, reader, seq, payload, frags.into_iter()));
                    }
                    None => {
                        gaps.insert(seq);
                    }
                }
            }

            if !gaps.is_empty() {
                debug!("writer {:?}: requested samples {:?} are not available for {:?} - sending GAP", self.id, gaps, reader);
            }
            outcome.submessages.extend(gaps.present_sequence_ranges().into_iter()
                .map(|r| gap_submessage(self.id, reader, r)));
        }
        outcome
    }

    /// Periodic HEARTBEATs for all readers that are not known to have everything
    pub fn send_heartbeats(&mut self) -> WriterOutcome {
        let mut outcome = WriterOutcome::default();
        let targets: Vec<Guid> = self.readers.values()
            .filter(|r| r.needs_heartbeat())
            .map(|r| r.id)
            .collect();
        for reader in targets {
            outcome.submessages.extend(self.heartbeat(reader));
        }
        outcome
    }

    fn heartbeat(&mut self, reader: Guid) -> Option<MetaSubmessage> {
        let info = self.readers.get(&reader)?;

        let mut first_sn = self.send_buffer.low().unwrap_or(self.max_sn.next());
        let mut last_sn = self.max_sn;
        if let (Some((&dd_first, _)), Some((&dd_last, _))) = (info.durable_data.first_key_value(), info.durable_data.last_key_value()) {
            first_sn = min(first_sn, dd_first);
            last_sn = max(last_sn, dd_last);
        }

        self.heartbeat_count = self.heartbeat_count.wrapping_add(1);
        Some(MetaSubmessage::new(self.id, reader, Submessage::Heartbeat(HeartbeatSubmessage {
            reader_id: reader.entity_id,
            writer_id: self.id.entity_id,
            first_sn,
            last_sn,
            count: self.heartbeat_count,
            final_flag: false,
            liveliness_flag: false,
        })))
    }

    /// Everything below the lowest cumulative ack of all readers is delivered
    fn process_acked_by_all(&mut self) -> Vec<OutboundSample> {
        match self.readers.values().map(|r| r.cumulative_ack).min() {
            Some(min_ack) => self.send_buffer.release_acked(min_ack),
            None => self.send_buffer.release_acked(SequenceNumber::MAX),
        }
    }
}

fn reader_entity(dst: Guid) -> EntityId {
    dst.entity_id
}

fn gap_submessage(writer: Guid, dst: Guid, range: SequenceRange) -> MetaSubmessage {
    MetaSubmessage::new(writer, dst, Submessage::Gap(GapSubmessage {
        reader_id: reader_entity(dst),
        writer_id: writer.entity_id,
        gap_start: range.first,
        gap_list: SequenceNumberSet::empty(range.last.next()),
    }))
}

/// DATA for a payload that fits into a fragment, DATA_FRAG for each fragment otherwise
fn data_submessages(writer: Guid, fragment_size: usize, dst: Guid, seq: SequenceNumber, payload: &Bytes) -> Vec<MetaSubmessage> {
    if payload.len() <= fragment_size {
        return vec![MetaSubmessage::with_payload(writer, dst, Submessage::Data(DataSubmessage {
            reader_id: reader_entity(dst),
            writer_id: writer.entity_id,
            writer_sn: seq,
            key_flag: false,
            inline_qos: false,
        }), payload.clone())];
    }

    let num_fragments: u32 = payload.len().div_ceil(fragment_size).prechecked_cast();
    fragment_submessages(writer, fragment_size, dst, seq, payload, 1..=num_fragments)
}

fn fragment_submessages(writer: Guid, fragment_size: usize, dst: Guid, seq: SequenceNumber, payload: &Bytes, fragments: impl Iterator<Item = u32>) -> Vec<MetaSubmessage> {
    let mut result = Vec::new();
    for fragment in fragments {
        let fragment_index: usize = fragment.saturating_sub(1).safe_cast();
        let start = fragment_index * fragment_size;
        if fragment == 0 || start >= payload.len() {
            debug!("writer {:?}: fragment {} of {} does not exist - ignoring", writer, fragment, seq);
            continue;
        }
        let end = min(start + fragment_size, payload.len());
        result.push(MetaSubmessage::with_payload(writer, dst, Submessage::DataFrag(DataFragSubmessage {
            reader_id: reader_entity(dst),
            writer_id: writer.entity_id,
            writer_sn: seq,
            fragment_starting_num: fragment,
            fragments_in_submessage: 1,
            fragment_size: fragment_size.prechecked_cast(),
            sample_size: payload.len().prechecked_cast(),
            inline_qos: false,
        }), payload.slice(start..end)));
    }
    result
}
