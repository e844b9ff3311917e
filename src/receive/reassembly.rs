use crate::disjoint_sequence::{DisjointSequence, SequenceRange};
use crate::receive::received_sample::SamplePayload;
use crate::wire::guid::Guid;
use crate::wire::number_set::{FragmentNumberSet, MAX_BITMAP_BITS};
use crate::wire::sequence_number::SequenceNumber;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// An inclusive range of 1-based fragment numbers
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentRange {
    pub first: u32,
    pub last: u32,
}

struct FragmentPiece {
    last: u32,
    payload: SamplePayload,
}

struct PartialSample {
    /// keyed by first fragment number; adjacent pieces are coalesced, so a complete sample has
    ///  exactly one piece `[1, total_fragments]`
    pieces: BTreeMap<u32, FragmentPiece>,
    total_fragments: u32,
    sample_size: usize,
    expiration: Instant,
}
impl PartialSample {
    fn overlaps(&self, range: FragmentRange) -> bool {
        if let Some((_, piece)) = self.pieces.range(..=range.first).next_back() {
            if piece.last >= range.first {
                return true;
            }
        }
        self.pieces.range(range.first..=range.last).next().is_some()
    }

    fn insert(&mut self, range: FragmentRange, payload: SamplePayload) {
        let mut first = range.first;
        let mut piece = FragmentPiece { last: range.last, payload };

        let predecessor = self.pieces.range(..first).next_back()
            .filter(|(_, p)| p.last.checked_add(1) == Some(first))
            .map(|(&k, _)| k);
        if let Some(pred_first) = predecessor {
            if let Some(mut pred) = self.pieces.remove(&pred_first) {
                pred.payload.append(piece.payload);
                pred.last = piece.last;
                piece = pred;
                first = pred_first;
            }
        }

        if let Some(succ) = piece.last.checked_add(1).and_then(|next| self.pieces.remove(&next)) {
            piece.payload.append(succ.payload);
            piece.last = succ.last;
        }

        self.pieces.insert(first, piece);
    }

    fn is_complete(&self) -> bool {
        self.pieces.len() == 1
            && self.pieces.first_key_value()
                .map(|(&first, piece)| first == 1 && piece.last >= self.total_fragments)
                .unwrap_or(false)
    }

    /// Lazily walks the holes between received pieces, so the cost depends on what is consumed
    ///  and not on the (peer controlled) number of fragments
    fn missing_fragments(&self, last_fragment: u32) -> impl Iterator<Item = u32> + '_ {
        let end = u64::from(last_fragment) + 1;
        let mut next = 1u64;
        self.pieces.iter()
            .map(|(&first, piece)| (u64::from(first), u64::from(piece.last) + 1))
            .chain(std::iter::once((end, end)))
            .flat_map(move |(piece_first, piece_end)| {
                let hole = next..piece_first.min(end);
                next = next.max(piece_end);
                hole
            })
            .filter_map(|frag| u32::try_from(frag).ok())
    }
}

/// Collects the fragments of samples that were too big for a single message, independent of
///  the order in which they arrive, until a sample is complete.
///
/// Completed sequence numbers are remembered per writer, so that fragments arriving late (e.g.
///  resends that crossed the last fragment on the wire) do not trigger a second delivery.
pub struct FragmentReassembly {
    timeout: Duration,
    partial: BTreeMap<(Guid, SequenceNumber), PartialSample>,
    completed: FxHashMap<Guid, DisjointSequence>,
}

impl FragmentReassembly {
    pub fn new(timeout: Duration) -> FragmentReassembly {
        FragmentReassembly {
            timeout,
            partial: Default::default(),
            completed: Default::default(),
        }
    }

    /// Adds the fragments `range` of a sample, returning the complete payload if this was the
    ///  missing piece
    pub fn reassemble(
        &mut self,
        writer: Guid,
        seq: SequenceNumber,
        range: FragmentRange,
        total_fragments: u32,
        sample_size: usize,
        payload: SamplePayload,
        now: Instant,
    ) -> Option<SamplePayload> {
        if range.first == 0 || range.first > range.last || range.last > total_fragments {
            debug!("fragments {:?} of {} are invalid for total of {} - ignoring", range, seq, total_fragments);
            return None;
        }
        if self.is_completed(writer, seq) {
            trace!("fragments {:?} of already completed sample {} from {:?} - ignoring", range, seq, writer);
            return None;
        }

        let timeout = self.timeout;
        let partial = self.partial.entry((writer, seq))
            .or_insert_with(|| PartialSample {
                pieces: Default::default(),
                total_fragments,
                sample_size,
                expiration: now + timeout,
            });

        if partial.total_fragments != total_fragments || partial.sample_size != sample_size {
            debug!("fragment {:?} of {} from {:?} disagrees with earlier fragments on the sample size - ignoring", range, seq, writer);
            return None;
        }
        if partial.overlaps(range) {
            trace!("fragments {:?} of {} from {:?} overlap received fragments - ignoring", range, seq, writer);
            return None;
        }

        partial.insert(range, payload);
        partial.expiration = now + timeout;
        if !partial.is_complete() {
            return None;
        }

        let complete = self.partial.remove(&(writer, seq))?;
        self.completed.entry(writer).or_default().insert(seq);
        let (_, piece) = complete.pieces.into_iter().next()?;
        let mut payload = piece.payload;
        payload.truncate(complete.sample_size);
        debug!("reassembled sample {} from {:?} ({} bytes)", seq, writer, payload.len());
        Some(payload)
    }

    pub fn is_completed(&self, writer: Guid, seq: SequenceNumber) -> bool {
        self.completed.get(&writer)
            .map(|c| c.contains(seq))
            .unwrap_or(false)
    }

    /// `true` if some, but not all, fragments of the sample were received
    pub fn has_frags(&self, writer: Guid, seq: SequenceNumber) -> bool {
        self.partial.contains_key(&(writer, seq))
    }

    pub fn has_frags_in(&self, writer: Guid, range: SequenceRange) -> bool {
        if range.first > range.last {
            return false;
        }
        self.partial.range((writer, range.first)..=(writer, range.last)).next().is_some()
    }

    /// The sequence numbers in the given range with fragments held
    pub fn partial_samples(&self, writer: Guid, range: SequenceRange) -> Vec<SequenceNumber> {
        if range.first > range.last {
            return Vec::new();
        }
        self.partial.range((writer, range.first)..=(writer, range.last))
            .map(|((_, seq), _)| *seq)
            .collect()
    }

    /// The missing fragments of a sample, starting with the first missing fragment. Without any
    ///  fragments received, `known_last_fragment` (e.g. from a HEARTBEAT_FRAG) defines what is
    ///  missing.
    pub fn get_gaps(&self, writer: Guid, seq: SequenceNumber, known_last_fragment: u32) -> Option<FragmentNumberSet> {
        let mut missing: Box<dyn Iterator<Item = u32> + '_> = match self.partial.get(&(writer, seq)) {
            Some(partial) => Box::new(partial.missing_fragments(partial.total_fragments.max(known_last_fragment))),
            None => Box::new(1..=known_last_fragment),
        };
        let base = missing.next()?;
        Some(FragmentNumberSet::from_fragment_numbers(
            base,
            std::iter::once(base).chain(missing.take_while(move |&frag| frag - base < MAX_BITMAP_BITS)),
        ))
    }

    /// The writer declared the samples in the range irrelevant (GAP), so partially received
    ///  samples can never be completed
    pub fn data_unavailable(&mut self, writer: Guid, range: SequenceRange) {
        if range.first > range.last {
            return;
        }
        let keys: Vec<_> = self.partial.range((writer, range.first)..=(writer, range.last))
            .map(|(&key, _)| key)
            .collect();
        for key in keys {
            debug!("dropping partially received sample {} from {:?}", key.1, writer);
            self.partial.remove(&key);
        }
    }

    /// forget everything about a writer
    pub fn clear_completed(&mut self, writer: Guid) {
        self.completed.remove(&writer);
        self.data_unavailable(writer, SequenceRange::new(SequenceNumber::UNKNOWN, SequenceNumber::MAX));
    }

    /// Discards partially received samples that did not receive a fragment within the timeout,
    ///  returning the number of discarded samples
    pub fn check_expirations(&mut self, now: Instant) -> usize {
        let before = self.partial.len();
        self.partial.retain(|(writer, seq), partial| {
            let keep = partial.expiration > now;
            if !keep {
                debug!("reassembly of sample {} from {:?} timed out", seq, writer);
            }
            keep
        });
        before - self.partial.len()
    }
}
