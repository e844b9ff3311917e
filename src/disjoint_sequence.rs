use crate::wire::number_set::{is_bit_set, SequenceNumberSet, MAX_BITMAP_BITS};
use crate::wire::sequence_number::SequenceNumber;
use std::cmp::{max, min};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

/// An inclusive range of sequence numbers
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SequenceRange {
    pub first: SequenceNumber,
    pub last: SequenceNumber,
}
impl SequenceRange {
    pub fn new(first: SequenceNumber, last: SequenceNumber) -> SequenceRange {
        SequenceRange { first, last }
    }

    pub fn single(sn: SequenceNumber) -> SequenceRange {
        SequenceRange { first: sn, last: sn }
    }

    pub fn contains(&self, sn: SequenceNumber) -> bool {
        self.first <= sn && sn <= self.last
    }
}
impl Debug for SequenceRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}-{}]", self.first, self.last)
    }
}

/// A set of sequence numbers, stored as sorted, non-overlapping and non-adjacent ranges. This
///  is the central data structure of the reliability protocol: readers track what they
///  received (and what was declared irrelevant by GAPs), writers track what readers requested.
///
/// The *cumulative ack* is the end of the first contiguous range, i.e. the point up to which
///  there are no holes. An empty set has no meaningful bounds; `low()`, `high()` and
///  `cumulative_ack()` return [SequenceNumber::UNKNOWN] for it, which is below every valid
///  sequence number.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct DisjointSequence {
    /// first -> last
    ranges: BTreeMap<SequenceNumber, SequenceNumber>,
}

impl Debug for DisjointSequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.present_sequence_ranges())
            .finish()
    }
}

impl DisjointSequence {
    pub fn new() -> DisjointSequence {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn reset(&mut self) {
        self.ranges.clear();
    }

    pub fn low(&self) -> SequenceNumber {
        self.ranges.first_key_value()
            .map(|(&first, _)| first)
            .unwrap_or(SequenceNumber::UNKNOWN)
    }

    pub fn high(&self) -> SequenceNumber {
        self.ranges.last_key_value()
            .map(|(_, &last)| last)
            .unwrap_or(SequenceNumber::UNKNOWN)
    }

    pub fn cumulative_ack(&self) -> SequenceNumber {
        self.ranges.first_key_value()
            .map(|(_, &last)| last)
            .unwrap_or(SequenceNumber::UNKNOWN)
    }

    /// the start of the last contiguous range - everything between the cumulative ack and this
    ///  is 'interesting' for nacks
    pub fn last_ack(&self) -> SequenceNumber {
        self.ranges.last_key_value()
            .map(|(&first, _)| first)
            .unwrap_or(SequenceNumber::UNKNOWN)
    }

    pub fn disjoint(&self) -> bool {
        self.ranges.len() > 1
    }

    pub fn contains(&self, sn: SequenceNumber) -> bool {
        match self.ranges.range(..=sn).next_back() {
            Some((_, &last)) => sn <= last,
            None => false,
        }
    }

    pub fn contains_any(&self, range: SequenceRange) -> bool {
        if range.first > range.last {
            return false;
        }
        if self.contains(range.first) {
            return true;
        }
        self.ranges.range(range.first..=range.last).next().is_some()
    }

    pub fn insert(&mut self, sn: SequenceNumber) -> bool {
        self.insert_range_impl(SequenceRange::single(sn), None)
    }

    /// returns `true` if the set changed
    pub fn insert_range(&mut self, range: SequenceRange) -> bool {
        self.insert_range_impl(range, None)
    }

    /// Same as [DisjointSequence::insert_range], but additionally collects the sub-ranges that
    ///  were not part of the set before
    pub fn insert_range_filled(&mut self, range: SequenceRange, filled: &mut Vec<SequenceRange>) -> bool {
        self.insert_range_impl(range, Some(filled))
    }

    /// Inserts all sequence numbers whose bit is set, with bit `i` standing for `base + i`.
    ///  Returns `true` if anything was inserted.
    pub fn insert_bitmap(&mut self, base: SequenceNumber, num_bits: u32, bitmap: &[u32]) -> bool {
        let mut changed = false;
        let mut run_start: Option<u32> = None;

        for i in 0..=num_bits {
            let is_set = i < num_bits && is_bit_set(bitmap, i);
            match (is_set, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    changed |= self.insert_range(SequenceRange::new(base + start as i64, base + (i - 1) as i64));
                    run_start = None;
                }
                _ => {}
            }
        }
        changed
    }

    pub fn present_sequence_ranges(&self) -> Vec<SequenceRange> {
        self.ranges.iter()
            .map(|(&first, &last)| SequenceRange::new(first, last))
            .collect()
    }

    /// the holes between `low()` and `high()`
    pub fn missing_sequence_ranges(&self) -> Vec<SequenceRange> {
        let mut result = Vec::new();
        let mut prev_last: Option<SequenceNumber> = None;
        for (&first, &last) in &self.ranges {
            if let Some(prev_last) = prev_last {
                result.push(SequenceRange::new(prev_last.next(), first.previous()));
            }
            prev_last = Some(last);
        }
        result
    }

    /// Encodes the set relative to `cumulative_ack() + 1` as a bitmap of at most `max_bits` bits.
    ///
    /// Without `invert`, the bits stand for the present sequence numbers up to `high()`. With
    ///  `invert`, they stand for the missing sequence numbers up to the last hole. A
    ///  non-disjoint set encodes as an empty bitmap either way.
    pub fn to_bitmap(&self, max_bits: u32, invert: bool) -> SequenceNumberSet {
        let max_bits = min(max_bits, MAX_BITMAP_BITS);
        let base = self.cumulative_ack().next();
        if !self.disjoint() {
            return SequenceNumberSet::empty(base);
        }

        let window_end = base + max_bits as i64 - 1;
        let ranges = if invert {
            self.missing_sequence_ranges()
        }
        else {
            self.present_sequence_ranges().into_iter().skip(1).collect()
        };

        SequenceNumberSet::from_sequence_numbers(
            base,
            ranges.into_iter()
                .filter(|r| r.first <= window_end)
                .flat_map(|r| (r.first.to_raw()..=min(r.last, window_end).to_raw()).map(SequenceNumber::from_raw)),
        )
    }

    fn insert_range_impl(&mut self, range: SequenceRange, filled: Option<&mut Vec<SequenceRange>>) -> bool {
        if range.first > range.last {
            return false;
        }

        // at most one range starting before the new range can overlap or touch it
        let search_start = match self.ranges.range(..=range.first).next_back() {
            Some((&first, &last)) if last.next() >= range.first => first,
            _ => range.first,
        };
        let touched: Vec<(SequenceNumber, SequenceNumber)> = self.ranges
            .range(search_start..=range.last.next())
            .map(|(&first, &last)| (first, last))
            .collect();

        let mut newly_filled = Vec::new();
        let mut cursor = range.first;
        for &(first, last) in &touched {
            if first > cursor && cursor <= range.last {
                newly_filled.push(SequenceRange::new(cursor, min(first.previous(), range.last)));
            }
            cursor = max(cursor, last.next());
        }
        if cursor <= range.last {
            newly_filled.push(SequenceRange::new(cursor, range.last));
        }

        if newly_filled.is_empty() {
            return false;
        }

        let mut merged_first = range.first;
        let mut merged_last = range.last;
        for (first, last) in touched {
            self.ranges.remove(&first);
            merged_first = min(merged_first, first);
            merged_last = max(merged_last, last);
        }
        self.ranges.insert(merged_first, merged_last);

        if let Some(filled) = filled {
            filled.extend(newly_filled);
        }
        true
    }
}
