use crate::receive::received_sample::SamplePayload;
use anyhow::bail;
use bytes::BytesMut;
use std::io::IoSliceMut;
use std::net::SocketAddr;

/// This is an abstraction for reading whatever is ready on a socket into a list of buffers,
///  introduced to facilitate replacing the I/O part for testing.
///
/// Implementations must not block: 'nothing ready' is reported as
///  [std::io::ErrorKind::WouldBlock].
pub trait ByteSource {
    fn receive_bytes(&mut self, buffers: &mut [IoSliceMut<'_>]) -> std::io::Result<(usize, SocketAddr)>;
}

/// A small ring of fixed-capacity receive buffers.
///
/// Reads go into the free space at the end of the ring, possibly spanning several buffers.
///  Parsed data is split off the front of the buffers as [bytes::Bytes] that share their
///  allocation, so payloads are never copied. A fully consumed buffer with less free space than
///  the low-water mark is replaced by a fresh allocation, the old one lives on only as long as
///  the payloads that refer to it.
///
/// NB: Unread bytes always occupy the buffers from `read_index` to `write_index` (inclusive,
///      wrapping); all other buffers are empty
pub struct ReceiveBuffers {
    buffers: Vec<BytesMut>,
    buffer_size: usize,
    low_water: usize,
    read_index: usize,
    write_index: usize,
}

impl ReceiveBuffers {
    pub fn new(buffer_count: usize, buffer_size: usize, low_water: usize) -> ReceiveBuffers {
        assert!(buffer_count > 0);
        ReceiveBuffers {
            buffers: (0..buffer_count)
                .map(|_| BytesMut::with_capacity(buffer_size))
                .collect(),
            buffer_size,
            low_water,
            read_index: 0,
            write_index: 0,
        }
    }

    pub fn unread(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    fn free_space(&self, index: usize) -> usize {
        let b = &self.buffers[index];
        b.capacity() - b.len()
    }

    fn reclaim_consumed_buffers(&mut self) {
        for b in self.buffers.iter_mut() {
            if b.is_empty() && b.capacity() < self.low_water {
                *b = BytesMut::with_capacity(self.buffer_size);
            }
        }
    }

    /// the buffers that can take new bytes, in the order they are to be filled
    fn writable_buffers(&self) -> Vec<usize> {
        let n = self.buffers.len();
        let mut result = Vec::new();
        for i in 0..n {
            let index = (self.write_index + i) % n;
            if i > 0 && (index == self.read_index || !self.buffers[index].is_empty()) {
                break;
            }
            if self.free_space(index) >= self.low_water {
                result.push(index);
            }
        }
        result
    }

    /// Reads whatever the source has to offer into free buffer space, returning the number of
    ///  bytes read and the sender's address.
    ///
    /// A source reporting more bytes than the buffer space it was offered means that the
    ///  buffers are corrupt, which is unrecoverable.
    pub fn read_from(&mut self, source: &mut impl ByteSource) -> anyhow::Result<std::io::Result<(usize, SocketAddr)>> {
        self.reclaim_consumed_buffers();
        let was_empty = self.unread() == 0;

        let writable = self.writable_buffers();
        let mut start_lens = Vec::with_capacity(writable.len());
        for &index in &writable {
            let b = &mut self.buffers[index];
            start_lens.push(b.len());
            let capacity = b.capacity();
            b.resize(capacity, 0);
        }
        let offered: usize = writable.iter().zip(&start_lens)
            .map(|(&index, &start)| self.buffers[index].len() - start)
            .sum();

        let result = {
            let mut slots: Vec<(usize, &mut BytesMut)> = self.buffers.iter_mut()
                .enumerate()
                .filter(|(index, _)| writable.contains(index))
                .collect();
            slots.sort_by_key(|(index, _)| writable.iter().position(|w| w == index));
            let mut slices: Vec<IoSliceMut<'_>> = slots.into_iter()
                .zip(&start_lens)
                .map(|((_, b), &start)| IoSliceMut::new(&mut b[start..]))
                .collect();
            source.receive_bytes(&mut slices)
        };

        let mut remaining = match &result {
            Ok((n, _)) => *n,
            Err(_) => 0,
        };
        if remaining > offered {
            for (&index, &start) in writable.iter().zip(&start_lens) {
                self.buffers[index].truncate(start);
            }
            bail!("read {} bytes with only {} bytes of buffer space - receive buffers are corrupt", remaining, offered);
        }

        let mut first_filled = None;
        for (&index, &start) in writable.iter().zip(&start_lens) {
            let b = &mut self.buffers[index];
            let filled = remaining.min(b.len() - start);
            b.truncate(start + filled);
            remaining -= filled;
            if filled > 0 {
                first_filled.get_or_insert(index);
                self.write_index = index;
            }
        }
        if was_empty {
            if let Some(index) = first_filled {
                self.read_index = index;
            }
        }
        Ok(result)
    }

    /// copies up to `max_len` unread bytes without consuming them - this is for parsing headers,
    ///  which may straddle buffer boundaries
    pub fn peek(&self, max_len: usize) -> Vec<u8> {
        let mut result = Vec::with_capacity(max_len);
        let n = self.buffers.len();
        let mut index = self.read_index;
        loop {
            let b = &self.buffers[index];
            let len = b.len().min(max_len - result.len());
            result.extend_from_slice(&b[..len]);
            if result.len() == max_len || index == self.write_index {
                break;
            }
            index = (index + 1) % n;
        }
        result
    }

    /// Splits `len` unread bytes off the front of the ring without copying them. `len` must not
    ///  exceed [ReceiveBuffers::unread].
    pub fn take(&mut self, len: usize) -> SamplePayload {
        let mut result = SamplePayload::new();
        let mut remaining = len;
        while remaining > 0 {
            let b = &mut self.buffers[self.read_index];
            let n = remaining.min(b.len());
            result.push(b.split_to(n).freeze());
            remaining -= n;
            self.advance_read_index_if_consumed();
            if n == 0 {
                assert_eq!(remaining, 0, "this is a bug: taking more bytes than are available");
            }
        }
        self.advance_read_index_if_consumed();
        result
    }

    pub fn consume(&mut self, len: usize) {
        let _ = self.take(len);
    }

    fn advance_read_index_if_consumed(&mut self) {
        if self.buffers[self.read_index].is_empty() && self.read_index != self.write_index {
            self.read_index = (self.read_index + 1) % self.buffers.len();
        }
    }
}
