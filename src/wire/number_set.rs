//! Bitmap-encoded sets of sequence numbers and fragment numbers as carried by ACKNACK, GAP and
//!  NACK_FRAG sub-messages.
//!
//! Bit `i` of a bitmap stands for `bitmap_base + i`. Bits are packed into 32 bit words with the
//!  first bit in the *most* significant position of word 0, which is RTPS' wire layout.

use crate::util::buf_ext::{BufExt, Endianness};
use crate::util::safe_converter::SafeCast;
use crate::wire::sequence_number::SequenceNumber;
use anyhow::bail;
use bytes::{Buf, BufMut};

/// No sequence number or fragment number set on the wire holds more than this many bits
pub const MAX_BITMAP_BITS: u32 = 256;
pub const MAX_BITMAP_WORDS: usize = 8;

pub fn bitmap_num_words(num_bits: u32) -> usize {
    num_bits.div_ceil(32).safe_cast()
}

pub fn is_bit_set(bitmap: &[u32], index: u32) -> bool {
    let word: usize = (index / 32).safe_cast();
    match bitmap.get(word) {
        Some(w) => w & (1 << (31 - index % 32)) != 0,
        None => false,
    }
}

/// NB: the bitmap must be big enough for the index
pub fn set_bit(bitmap: &mut [u32], index: u32) {
    let word: usize = (index / 32).safe_cast();
    bitmap[word] |= 1 << (31 - index % 32);
}

/// Indices of all set bits in ascending order
pub fn set_bits(bitmap: &[u32], num_bits: u32) -> impl Iterator<Item = u32> + '_ {
    (0..num_bits).filter(move |&i| is_bit_set(bitmap, i))
}

fn ser_bitmap(bitmap: &[u32], num_bits: u32, buf: &mut impl BufMut) {
    buf.put_u32_le(num_bits);
    for i in 0..bitmap_num_words(num_bits) {
        buf.put_u32_le(bitmap.get(i).copied().unwrap_or(0));
    }
}

fn deser_bitmap(buf: &mut impl Buf, endianness: Endianness) -> anyhow::Result<(u32, Vec<u32>)> {
    let num_bits = buf.read_checked_u32(endianness)?;
    if num_bits > MAX_BITMAP_BITS {
        bail!("bitmap with {} bits exceeds the maximum of {}", num_bits, MAX_BITMAP_BITS);
    }
    let mut bitmap = Vec::with_capacity(bitmap_num_words(num_bits));
    for _ in 0..bitmap_num_words(num_bits) {
        bitmap.push(buf.read_checked_u32(endianness)?);
    }
    Ok((num_bits, bitmap))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SequenceNumberSet {
    pub bitmap_base: SequenceNumber,
    pub num_bits: u32,
    pub bitmap: Vec<u32>,
}
impl SequenceNumberSet {
    pub fn empty(bitmap_base: SequenceNumber) -> SequenceNumberSet {
        SequenceNumberSet {
            bitmap_base,
            num_bits: 0,
            bitmap: Vec::new(),
        }
    }

    /// Builds a set containing all given sequence numbers, which must be in the window
    ///  `[bitmap_base, bitmap_base + 256)`
    pub fn from_sequence_numbers(bitmap_base: SequenceNumber, sequence_numbers: impl IntoIterator<Item = SequenceNumber>) -> SequenceNumberSet {
        let mut result = SequenceNumberSet {
            bitmap_base,
            num_bits: 0,
            bitmap: vec![0; MAX_BITMAP_WORDS],
        };
        for sn in sequence_numbers {
            let offset = sn - bitmap_base;
            assert!((0..MAX_BITMAP_BITS as i64).contains(&offset), "sequence number {} outside of bitmap window starting at {}", sn, bitmap_base);
            let offset = offset as u32;
            set_bit(&mut result.bitmap, offset);
            result.num_bits = result.num_bits.max(offset + 1);
        }
        result.bitmap.truncate(bitmap_num_words(result.num_bits));
        result
    }

    pub fn contains(&self, sn: SequenceNumber) -> bool {
        let offset = sn - self.bitmap_base;
        if offset < 0 || offset >= self.num_bits as i64 {
            return false;
        }
        is_bit_set(&self.bitmap, offset as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        set_bits(&self.bitmap, self.num_bits)
            .map(|i| self.bitmap_base + i as i64)
    }

    pub fn serialized_len(&self) -> usize {
        SequenceNumber::SERIALIZED_LEN + 4 + 4 * bitmap_num_words(self.num_bits)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.bitmap_base.ser(buf);
        ser_bitmap(&self.bitmap, self.num_bits, buf);
    }

    /// A set is valid with a base of at least 1, and all of its bits must stand for
    ///  representable sequence numbers
    pub fn deser(buf: &mut impl Buf, endianness: Endianness) -> anyhow::Result<SequenceNumberSet> {
        let bitmap_base = SequenceNumber::deser(buf, endianness)?;
        let (num_bits, bitmap) = deser_bitmap(buf, endianness)?;
        if !bitmap_base.is_valid() {
            bail!("sequence number set with invalid base {}", bitmap_base);
        }
        if bitmap_base.to_raw().checked_add(i64::from(num_bits.saturating_sub(1))).is_none() {
            bail!("sequence number set with base {} and {} bits exceeds the sequence number range", bitmap_base, num_bits);
        }
        Ok(SequenceNumberSet { bitmap_base, num_bits, bitmap })
    }
}

/// Fragment numbers start at 1 and are relative to a single sample
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FragmentNumberSet {
    pub bitmap_base: u32,
    pub num_bits: u32,
    pub bitmap: Vec<u32>,
}
impl FragmentNumberSet {
    pub fn from_fragment_numbers(bitmap_base: u32, fragment_numbers: impl IntoIterator<Item = u32>) -> FragmentNumberSet {
        let mut result = FragmentNumberSet {
            bitmap_base,
            num_bits: 0,
            bitmap: vec![0; MAX_BITMAP_WORDS],
        };
        for frag in fragment_numbers {
            assert!(frag >= bitmap_base && frag - bitmap_base < MAX_BITMAP_BITS, "fragment {} outside of bitmap window starting at {}", frag, bitmap_base);
            let offset = frag - bitmap_base;
            set_bit(&mut result.bitmap, offset);
            result.num_bits = result.num_bits.max(offset + 1);
        }
        result.bitmap.truncate(bitmap_num_words(result.num_bits));
        result
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// bits that stand for fragment numbers beyond `u32::MAX` are skipped
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        set_bits(&self.bitmap, self.num_bits)
            .filter_map(|i| self.bitmap_base.checked_add(i))
    }

    pub fn serialized_len(&self) -> usize {
        4 + 4 + 4 * bitmap_num_words(self.num_bits)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.bitmap_base);
        ser_bitmap(&self.bitmap, self.num_bits, buf);
    }

    /// Fragment numbers start at 1, and all bits must stand for representable fragment numbers
    pub fn deser(buf: &mut impl Buf, endianness: Endianness) -> anyhow::Result<FragmentNumberSet> {
        let bitmap_base = buf.read_checked_u32(endianness)?;
        let (num_bits, bitmap) = deser_bitmap(buf, endianness)?;
        if bitmap_base == 0 {
            bail!("fragment number set with base 0");
        }
        if num_bits > 0 && bitmap_base.checked_add(num_bits - 1).is_none() {
            bail!("fragment number set with base {} and {} bits exceeds the fragment number range", bitmap_base, num_bits);
        }
        Ok(FragmentNumberSet { bitmap_base, num_bits, bitmap })
    }
}
