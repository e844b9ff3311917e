use crate::reliability::outbound_sample::OutboundSample;
use crate::wire::sequence_number::SequenceNumber;
use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::{debug, trace};

#[derive(Debug)]
pub enum RemoveResult {
    /// nobody is waiting for the sample, it is handed back for notification
    Released(OutboundSample),
    /// at least one reader did not acknowledge the sample yet, so it stays available
    ///  for resending until it is acknowledged
    KeptInFlight,
    NotFound,
}

/// A writer's samples, both for resending and for acknowledgement bookkeeping.
///
/// Payloads are retained for resending up to a configured depth, older payloads are evicted
///  and requests for them are answered with GAP. Independently of that, every sample is
///  tracked until all readers acknowledged it, so that its listener can be notified.
pub struct SendBuffer {
    depth: usize,
    retained: BTreeMap<SequenceNumber, Bytes>,
    not_acked: BTreeMap<SequenceNumber, OutboundSample>,
}

impl SendBuffer {
    pub fn new(depth: usize) -> SendBuffer {
        SendBuffer {
            depth,
            retained: Default::default(),
            not_acked: Default::default(),
        }
    }

    pub fn insert(&mut self, sample: OutboundSample) {
        self.retained.insert(sample.seq, sample.payload.clone());
        while self.retained.len() > self.depth {
            if let Some((evicted, _)) = self.retained.pop_first() {
                debug!("sample {} of {:?} evicted from the send buffer", evicted, sample.writer);
            }
        }
        self.not_acked.insert(sample.seq, sample);
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    pub fn contains(&self, seq: SequenceNumber) -> bool {
        self.retained.contains_key(&seq)
    }

    pub fn get(&self, seq: SequenceNumber) -> Option<&Bytes> {
        self.retained.get(&seq)
    }

    /// lowest sequence number available for resending
    pub fn low(&self) -> Option<SequenceNumber> {
        self.retained.keys().next().copied()
    }

    pub fn high(&self) -> Option<SequenceNumber> {
        self.retained.keys().next_back().copied()
    }

    pub fn num_not_acked(&self) -> usize {
        self.not_acked.len()
    }

    pub fn not_acked_seqs(&self) -> Vec<SequenceNumber> {
        self.not_acked.keys().copied().collect()
    }

    /// Removes everything below `min_ack`, i.e. what all readers acknowledged, and returns
    ///  the samples for notification
    pub fn release_acked(&mut self, min_ack: SequenceNumber) -> Vec<OutboundSample> {
        let still_pending = self.not_acked.split_off(&min_ack);
        let acked = std::mem::replace(&mut self.not_acked, still_pending);

        let still_retained = self.retained.split_off(&min_ack);
        self.retained = still_retained;

        if !acked.is_empty() {
            trace!("released {} acknowledged samples below {}", acked.len(), min_ack);
        }
        acked.into_values().collect()
    }

    pub fn remove(&mut self, seq: SequenceNumber, in_flight: bool) -> RemoveResult {
        if !self.not_acked.contains_key(&seq) {
            return RemoveResult::NotFound;
        }
        if in_flight {
            return RemoveResult::KeptInFlight;
        }
        self.retained.remove(&seq);
        match self.not_acked.remove(&seq) {
            Some(sample) => RemoveResult::Released(sample),
            None => RemoveResult::NotFound,
        }
    }

    /// Empties the buffer, returning all samples that were not acknowledged
    pub fn clear(&mut self) -> Vec<OutboundSample> {
        self.retained.clear();
        std::mem::take(&mut self.not_acked).into_values().collect()
    }
}
