//! Numeric conversions between wire field widths and `usize`.

pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// Narrowing casts for values that were bounded before, e.g. a sub-message length checked
///  against the maximum message size. Panics if the bound was not enforced.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("value range should have been checked against the wire field width")
    }
}

impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("value range should have been checked against the wire field width")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::max_message(65_507, 65_507)]
    #[case::max_fragment_count(u32::MAX as usize, u32::MAX)]
    fn test_prechecked_cast_within_range(#[case] value: usize, #[case] expected: u32) {
        let actual: u32 = value.prechecked_cast();
        assert_eq!(actual, expected);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_cast_beyond_u16() {
        let _: u16 = 70_000usize.prechecked_cast();
    }

    #[test]
    fn test_wire_widths_fit_usize() {
        let from_u16: usize = u16::MAX.safe_cast();
        let from_u32: usize = u32::MAX.safe_cast();
        assert_eq!(from_u16, 65_535);
        assert_eq!(from_u32 as u64, u64::from(u32::MAX));
    }
}
