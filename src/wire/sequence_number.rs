use crate::util::buf_ext::{BufExt, Endianness};
use bytes::{Buf, BufMut};
use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};

/// A writer's sample sequence number. Valid sequence numbers start at 1; zero and negative
///  values are sentinels.
///
/// On the wire, sequence numbers are a pair of a signed high and an unsigned low 32 bit word.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SequenceNumber(i64);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);
    pub const ONE: SequenceNumber = SequenceNumber(1);
    /// RTPS' SEQUENCENUMBER_UNKNOWN, i.e. high = -1 and low = 0
    pub const UNKNOWN: SequenceNumber = SequenceNumber(-(1i64 << 32));
    pub const MAX: SequenceNumber = SequenceNumber(i64::MAX);

    pub const SERIALIZED_LEN: usize = 8;

    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> i64 {
        self.0
    }

    pub fn from_parts(high: i32, low: u32) -> SequenceNumber {
        SequenceNumber(((high as i64) << 32) | low as i64)
    }

    pub fn high(&self) -> i32 {
        (self.0 >> 32) as i32
    }

    pub fn low(&self) -> u32 {
        self.0 as u32
    }

    /// Sequence numbers are saturating: MAX is never reached by a real writer, and this keeps
    ///  range arithmetic near the sentinels free of overflow checks
    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.saturating_add(1))
    }

    pub fn previous(&self) -> SequenceNumber {
        SequenceNumber(self.0.saturating_sub(1))
    }

    pub fn is_valid(&self) -> bool {
        self.0 >= 1
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.high());
        buf.put_u32_le(self.low());
    }

    pub fn deser(buf: &mut impl Buf, endianness: Endianness) -> anyhow::Result<SequenceNumber> {
        let high = buf.read_checked_i32(endianness)?;
        let low = buf.read_checked_u32(endianness)?;
        Ok(SequenceNumber::from_parts(high, low))
    }
}

impl Add<i64> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: i64) -> Self::Output {
        SequenceNumber(self.0.saturating_add(rhs))
    }
}

impl Sub<i64> for SequenceNumber {
    type Output = SequenceNumber;

    fn sub(self, rhs: i64) -> Self::Output {
        SequenceNumber(self.0.saturating_sub(rhs))
    }
}

/// distance between two sequence numbers
impl Sub<SequenceNumber> for SequenceNumber {
    type Output = i64;

    fn sub(self, rhs: SequenceNumber) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}
