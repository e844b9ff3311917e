//! Turns the bytes arriving on a socket into discrete samples.
//!
//! Messages have two levels: a transport header ("outer header") followed by one or more sample
//!  headers ("inner headers"), each followed by its payload. The strategy is generic over the
//!  concrete wire format, which is plugged in through [WireFormat], and hands complete samples
//!  to its owner through [SampleSink].
//!
//! It is written for datagram and stream sockets alike: a read may end in the middle of a
//!  header or payload, in which case the parse state is kept until the next read.

use crate::receive::receive_buffers::{ByteSource, ReceiveBuffers};
use crate::receive::received_sample::{ReceivedSample, SamplePayload};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tracing::{debug, error, trace, warn};

pub enum HeaderParse<H> {
    /// more bytes are needed to parse the header
    Partial,
    /// the header can never be parsed - the rest of the PDU is skipped
    Invalid(anyhow::Error),
    Parsed { header: H, consumed: usize },
}

pub trait TransportHeader {
    /// magic and version are as expected
    fn is_valid(&self) -> bool;
    /// the number of bytes in the PDU after this header
    fn pdu_length(&self) -> usize;
    /// marker for the last piece of a transport-level fragmented message
    fn last_fragment(&self) -> bool {
        false
    }
}

pub trait SampleHeader {
    /// the number of payload bytes following the header
    fn message_length(&self) -> usize;
    fn more_fragments(&self) -> bool;
}

/// The wire format specifics the strategy needs
pub trait WireFormat {
    type Outer: TransportHeader;
    type Inner: SampleHeader;

    /// upper bound for the serialized size of both outer and inner headers
    fn max_header_size(&self) -> usize;

    /// `bytes` starts at the beginning of a PDU, `available` is the total number of unread bytes,
    ///  of which `bytes` may be a prefix
    fn parse_outer_header(&self, bytes: &[u8], available: usize) -> HeaderParse<Self::Outer>;

    /// `bytes` holds up to `max_header_size()` bytes of the rest of the PDU
    fn parse_inner_header(&self, bytes: &[u8], pdu_remaining: usize) -> HeaderParse<Self::Inner>;
}

/// The strategy's owner
pub trait SampleSink<W: WireFormat> {
    /// Called for every valid transport header - returning `false` discards the whole PDU,
    ///  e.g. because it is a duplicate or not addressed to this node
    fn check_transport_header(&mut self, _header: &W::Outer, _from: SocketAddr) -> bool {
        true
    }

    /// Called for every sample header - returning `false` discards the sample
    fn check_sample_header(&mut self, _header: &W::Inner) -> bool {
        true
    }

    /// Called for samples that are fragments of a bigger sample. Returns the reassembled sample
    ///  when this fragment completes it.
    fn reassemble(&mut self, sample: ReceivedSample<W::Inner>, _transport_header: &W::Outer) -> Option<ReceivedSample<W::Inner>> {
        warn!("received a fragment, but fragmentation is not supported - dropping {} bytes", sample.payload.len());
        None
    }

    fn deliver_sample(&mut self, sample: ReceivedSample<W::Inner>, from: SocketAddr);

    /// the connection is unusable
    fn relink(&mut self);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReceiveStatus {
    /// keep the socket registered and call again when it is readable
    Continue,
    /// the peer closed the connection
    Closed,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ReceiveStats {
    pub bytes_read: u64,
    pub bad_pdus: u64,
    pub rejected_pdus: u64,
    pub invalid_samples: u64,
    pub delivered_samples: u64,
}

struct SampleInProgress<H> {
    header: H,
    payload: SamplePayload,
    discard: bool,
}

pub struct ReceiveStrategy<W: WireFormat> {
    format: W,
    buffers: ReceiveBuffers,

    /// the header of the PDU currently being processed
    transport_header: Option<W::Outer>,
    /// remaining bytes of the current PDU, including the current sample's remaining payload
    pdu_remaining: usize,
    good_pdu: bool,

    sample: Option<SampleInProgress<W::Inner>>,
    receive_sample_remaining: usize,

    gracefully_disconnected: bool,
    stats: ReceiveStats,
}

impl<W: WireFormat> ReceiveStrategy<W> {
    pub fn new(format: W, buffer_count: usize, buffer_size: usize, buffer_low_water: usize) -> ReceiveStrategy<W> {
        ReceiveStrategy {
            format,
            buffers: ReceiveBuffers::new(buffer_count, buffer_size, buffer_low_water),
            transport_header: None,
            pdu_remaining: 0,
            good_pdu: true,
            sample: None,
            receive_sample_remaining: 0,
            gracefully_disconnected: false,
            stats: Default::default(),
        }
    }

    pub fn stats(&self) -> ReceiveStats {
        self.stats
    }

    pub fn format(&self) -> &W {
        &self.format
    }

    /// After this, a zero byte read is treated as an orderly shutdown rather than a connection
    ///  loss
    pub fn set_gracefully_disconnected(&mut self) {
        self.gracefully_disconnected = true;
    }

    /// Reads what is ready on the source and processes as much of it as possible. Samples are
    ///  passed to the sink as they are completed.
    ///
    /// An `Err` means that the connection is unusable - the sink was asked to relink before
    ///  this returns.
    pub fn on_bytes_available(&mut self, source: &mut impl ByteSource, sink: &mut impl SampleSink<W>) -> anyhow::Result<ReceiveStatus> {
        let read_result = match self.buffers.read_from(source) {
            Ok(r) => r,
            Err(e) => {
                error!("{}", e);
                sink.relink();
                return Err(e);
            }
        };

        let (bytes_read, from) = match read_result {
            Ok(r) => r,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Ok(ReceiveStatus::Continue);
            }
            Err(e) => {
                error!("error reading from socket: {}", e);
                sink.relink();
                return Err(e.into());
            }
        };

        if bytes_read == 0 {
            if self.gracefully_disconnected {
                debug!("zero byte read after graceful disconnect");
            }
            else {
                debug!("zero byte read - connection lost, requesting relink");
                sink.relink();
            }
            return Ok(ReceiveStatus::Closed);
        }

        trace!("read {} bytes from {:?}", bytes_read, from);
        self.stats.bytes_read += bytes_read as u64;

        self.process_buffered(from, sink);
        Ok(ReceiveStatus::Continue)
    }

    fn process_buffered(&mut self, from: SocketAddr, sink: &mut impl SampleSink<W>) {
        loop {
            if self.transport_header.is_none() {
                if self.buffers.unread() == 0 {
                    return;
                }
                if !self.start_pdu(from, sink) {
                    return;
                }
            }

            if !self.good_pdu {
                self.skip_bad_pdu();
                if self.transport_header.is_some() {
                    // the rest of the PDU was not read yet
                    return;
                }
                continue;
            }

            if !self.process_samples(from, sink) {
                return;
            }
        }
    }

    /// returns `false` if the header is incomplete
    fn start_pdu(&mut self, from: SocketAddr, sink: &mut impl SampleSink<W>) -> bool {
        let available = self.buffers.unread();
        let bytes = self.buffers.peek(self.format.max_header_size().min(available));

        match self.format.parse_outer_header(&bytes, available) {
            HeaderParse::Partial => {
                trace!("partial transport header - waiting for more bytes");
                false
            }
            HeaderParse::Invalid(e) => {
                // without a valid length, the only safe recovery is to drop everything buffered
                debug!("unparseable transport header: {} - dropping {} bytes", e, available);
                self.stats.bad_pdus += 1;
                self.buffers.consume(available);
                false
            }
            HeaderParse::Parsed { header, consumed } => {
                self.buffers.consume(consumed);
                self.pdu_remaining = header.pdu_length();
                self.good_pdu = if !header.is_valid() {
                    debug!("invalid transport header from {:?} - skipping PDU of {} bytes", from, self.pdu_remaining);
                    self.stats.bad_pdus += 1;
                    false
                }
                else if !sink.check_transport_header(&header, from) {
                    trace!("PDU from {:?} rejected by owner - skipping {} bytes", from, self.pdu_remaining);
                    self.stats.rejected_pdus += 1;
                    false
                }
                else {
                    true
                };
                self.transport_header = Some(header);
                true
            }
        }
    }

    /// Discards what is buffered of a bad PDU, but not more than its declared length
    fn skip_bad_pdu(&mut self) {
        let n = self.pdu_remaining.min(self.buffers.unread());
        self.buffers.consume(n);
        self.pdu_remaining -= n;

        if self.pdu_remaining == 0 {
            self.end_pdu();
        }
    }

    fn end_pdu(&mut self) {
        self.transport_header = None;
        self.good_pdu = true;
        self.sample = None;
        self.receive_sample_remaining = 0;
    }

    /// returns `true` if the PDU is finished, `false` if more bytes are needed
    fn process_samples(&mut self, from: SocketAddr, sink: &mut impl SampleSink<W>) -> bool {
        while self.pdu_remaining > 0 {
            if self.sample.is_none() {
                let bytes = self.buffers.peek(self.format.max_header_size().min(self.pdu_remaining));
                match self.format.parse_inner_header(&bytes, self.pdu_remaining) {
                    HeaderParse::Partial => {
                        trace!("partial sample header - waiting for more bytes");
                        return false;
                    }
                    HeaderParse::Invalid(e) => {
                        debug!("invalid sample header from {:?}: {} - skipping the rest of the PDU", from, e);
                        self.stats.invalid_samples += 1;
                        self.good_pdu = false;
                        self.skip_bad_pdu();
                        return self.transport_header.is_none();
                    }
                    HeaderParse::Parsed { header, consumed } => {
                        self.buffers.consume(consumed);
                        self.pdu_remaining -= consumed;
                        self.receive_sample_remaining = header.message_length();
                        if self.receive_sample_remaining > self.pdu_remaining {
                            debug!("sample length {} exceeds the remaining PDU length {} - skipping the rest of the PDU", self.receive_sample_remaining, self.pdu_remaining);
                            self.stats.invalid_samples += 1;
                            self.good_pdu = false;
                            self.skip_bad_pdu();
                            return self.transport_header.is_none();
                        }
                        let discard = !sink.check_sample_header(&header);
                        self.sample = Some(SampleInProgress {
                            header,
                            payload: SamplePayload::new(),
                            discard,
                        });
                    }
                }
            }

            let n = self.receive_sample_remaining.min(self.buffers.unread());
            let chunk = self.buffers.take(n);
            self.pdu_remaining -= n;
            self.receive_sample_remaining -= n;
            if let Some(sample) = &mut self.sample {
                sample.payload.append(chunk);
            }

            if self.receive_sample_remaining > 0 {
                trace!("partial payload - {} bytes remaining", self.receive_sample_remaining);
                return false;
            }

            if let Some(sample) = self.sample.take() {
                if !sample.discard {
                    self.deliver(sample, from, sink);
                }
            }
        }

        self.end_pdu();
        true
    }

    fn deliver(&mut self, sample: SampleInProgress<W::Inner>, from: SocketAddr, sink: &mut impl SampleSink<W>) {
        let is_fragment = sample.header.more_fragments()
            || self.transport_header.as_ref().map(|h| h.last_fragment()).unwrap_or(false);

        let sample = ReceivedSample {
            header: sample.header,
            payload: sample.payload,
        };

        if is_fragment {
            let reassembled = match &self.transport_header {
                Some(transport_header) => sink.reassemble(sample, transport_header),
                None => None,
            };
            if let Some(complete) = reassembled {
                self.stats.delivered_samples += 1;
                sink.deliver_sample(complete, from);
            }
        }
        else {
            self.stats.delivered_samples += 1;
            sink.deliver_sample(sample, from);
        }
    }
}
