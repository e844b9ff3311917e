use bytes::{Bytes, BytesMut};

/// A sample's payload as a chain of chunks. Chunks share the receive buffers they were read
///  into, so a payload that straddles buffer boundaries, or is reassembled from fragments, is
///  never copied until somebody asks for contiguous bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SamplePayload {
    chunks: Vec<Bytes>,
}

impl SamplePayload {
    pub fn new() -> SamplePayload {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    pub fn append(&mut self, other: SamplePayload) {
        self.chunks.extend(other.chunks);
    }

    /// Drops everything after the first `len` bytes. Used to strip alignment padding
    pub fn truncate(&mut self, len: usize) {
        let mut remaining = len;
        let mut keep = 0;
        for chunk in self.chunks.iter_mut() {
            if remaining == 0 {
                break;
            }
            if chunk.len() > remaining {
                chunk.truncate(remaining);
            }
            remaining -= chunk.len();
            keep += 1;
        }
        self.chunks.truncate(keep);
    }

    /// Drops the first `len` bytes, e.g. inline QoS in front of the serialized data
    pub fn advance(&mut self, len: usize) {
        let mut remaining = len;
        while remaining > 0 && !self.chunks.is_empty() {
            if self.chunks[0].len() <= remaining {
                remaining -= self.chunks.remove(0).len();
            }
            else {
                let _ = self.chunks[0].split_to(remaining);
                remaining = 0;
            }
        }
    }

    /// contiguous bytes - this copies only if there is more than one chunk
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut result = BytesMut::with_capacity(self.len());
                for chunk in &self.chunks {
                    result.extend_from_slice(chunk);
                }
                result.freeze()
            }
        }
    }
}

impl From<Bytes> for SamplePayload {
    fn from(value: Bytes) -> Self {
        let mut result = SamplePayload::new();
        result.push(value);
        result
    }
}

/// A sample as handed from the reassembly strategy to its owner: a decoded inner (sample) header
///  and the payload bytes that followed it
#[derive(Clone, Debug)]
pub struct ReceivedSample<H> {
    pub header: H,
    pub payload: SamplePayload,
}
