use crate::wire::guid::Guid;
use crate::wire::sequence_number::SequenceNumber;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// The application's view of a sample it handed to a writer: exactly one of these callbacks
///  is invoked per [OutboundSample]
#[cfg_attr(test, automock)]
pub trait SampleListener: Send + Sync + 'static {
    /// all associated readers acknowledged the sample
    fn data_delivered(&self, writer: Guid, seq: SequenceNumber);
    /// the sample was withdrawn or discarded before every reader acknowledged it
    fn data_dropped(&self, writer: Guid, seq: SequenceNumber);
}

/// A serialized sample on the sending side. Notification consumes the sample, so each
///  instance is reported to its listener at most once.
pub struct OutboundSample {
    pub writer: Guid,
    pub seq: SequenceNumber,
    pub payload: Bytes,
    listener: Arc<dyn SampleListener>,
}

impl Debug for OutboundSample {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundSample")
            .field("writer", &self.writer)
            .field("seq", &self.seq)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl OutboundSample {
    pub fn new(writer: Guid, seq: SequenceNumber, payload: Bytes, listener: Arc<dyn SampleListener>) -> OutboundSample {
        OutboundSample { writer, seq, payload, listener }
    }

    pub fn delivered(self) {
        self.listener.data_delivered(self.writer, self.seq);
    }

    pub fn dropped(self) {
        self.listener.data_dropped(self.writer, self.seq);
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records notifications in order, for tests that care about the sequence rather than
    ///  about individual expectations
    #[derive(Default)]
    pub struct RecordingListener {
        pub delivered: Mutex<Vec<SequenceNumber>>,
        pub dropped: Mutex<Vec<SequenceNumber>>,
    }
    impl RecordingListener {
        pub fn delivered(&self) -> Vec<i64> {
            self.delivered.lock().unwrap().iter().map(|s| s.to_raw()).collect()
        }
        pub fn dropped(&self) -> Vec<i64> {
            self.dropped.lock().unwrap().iter().map(|s| s.to_raw()).collect()
        }
    }
    impl SampleListener for RecordingListener {
        fn data_delivered(&self, _writer: Guid, seq: SequenceNumber) {
            self.delivered.lock().unwrap().push(seq);
        }
        fn data_dropped(&self, _writer: Guid, seq: SequenceNumber) {
            self.dropped.lock().unwrap().push(seq);
        }
    }

    #[test]
    fn test_notifications() {
        let writer = Guid::UNKNOWN;

        let mut listener = MockSampleListener::new();
        listener.expect_data_delivered()
            .withf(move |w, seq| *w == writer && seq.to_raw() == 3)
            .once()
            .return_const(());
        listener.expect_data_dropped()
            .withf(move |w, seq| *w == writer && seq.to_raw() == 4)
            .once()
            .return_const(());
        let listener: Arc<dyn SampleListener> = Arc::new(listener);

        OutboundSample::new(writer, SequenceNumber::from_raw(3), Bytes::from_static(b"a"), listener.clone()).delivered();
        OutboundSample::new(writer, SequenceNumber::from_raw(4), Bytes::from_static(b"b"), listener).dropped();
    }
}
