use anyhow::anyhow;
use bytes::Buf;
use std::mem::size_of;

/// Byte order of a sub-message body. RTPS carries it per sub-message in the 'E' flag, so every
///  multi-byte read on the receive path is parameterized with it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endianness {
    Big,
    Little,
}
impl Endianness {
    pub fn from_flag(little_endian: bool) -> Endianness {
        if little_endian {
            Endianness::Little
        }
        else {
            Endianness::Big
        }
    }
}

macro_rules! read_checked_impl {
    ($reader: ident, $ty:ty, $be_getter: ident, $le_getter: ident) => {
        fn $reader(&mut self, endianness: Endianness) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(match endianness {
                Endianness::Big => self.$be_getter(),
                Endianness::Little => self.$le_getter(),
            })
        }
    }
}

/// Length-checked reads for parsing untrusted datagrams: running out of bytes is an error rather
///  than a panic.
///
/// NB: `bytes` has `try_get_*` methods of its own in recent versions, so these are deliberately
///      named differently to avoid ambiguity at call sites
pub trait BufExt: Buf {
    fn read_checked_u8(&mut self) -> anyhow::Result<u8> {
        if self.remaining() < 1 {
            return Err(anyhow!("buffer underflow"));
        }
        Ok(self.get_u8())
    }

    read_checked_impl!(read_checked_u16, u16, get_u16, get_u16_le);
    read_checked_impl!(read_checked_u32, u32, get_u32, get_u32_le);
    read_checked_impl!(read_checked_i32, i32, get_i32, get_i32_le);

    fn read_checked_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            return Err(anyhow!("buffer underflow"));
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    fn skip_checked(&mut self, n: usize) -> anyhow::Result<()> {
        if self.remaining() < n {
            return Err(anyhow!("buffer underflow: skipping {} bytes with {} remaining", n, self.remaining()));
        }
        self.advance(n);
        Ok(())
    }
}

impl <T: Buf> BufExt for T {}
