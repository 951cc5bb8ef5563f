use core::ops::BitOrAssign;

use num::{NumCast, PrimInt, ToPrimitive, Unsigned};

use crate::error::ErrorKind;

/// Returns the size of the type in bits.
pub(crate) const fn bit_size_of<T: Sized>() -> usize {
    8 * size_of::<T>()
}

/// Composes and decomposes the members of a packed integer at runtime.
///
/// Member positions are given as a left shift and a width in bits, both
/// counted from the least significant bit. [`crate::bit::BitLayout`]
/// computes those positions from its declared most-significant-first order.
pub(crate) struct BitField<Packed>
where
    Packed: PrimInt + Unsigned + BitOrAssign,
{
    bits: Packed,
}

impl<Packed> BitField<Packed>
where
    Packed: PrimInt + Unsigned + BitOrAssign,
{
    pub(crate) fn new() -> Self {
        Self { bits: Packed::zero() }
    }

    pub(crate) fn from_bits(bits: Packed) -> Self {
        Self { bits }
    }

    /// Insert a member, range-checking it against `width` bits.
    pub(crate) fn insert(&mut self, value: u64, shift: u32, width: u32) -> Result<(), ErrorKind> {
        if width < 64 && value >> width != 0 {
            return Err(ErrorKind::OutOfRange { value: value as i128, bits: width });
        }
        let packed: Packed =
            NumCast::from(value).ok_or(ErrorKind::OutOfRange { value: value as i128, bits: width })?;
        self.bits |= packed << shift as usize;
        Ok(())
    }

    /// Read the member occupying `width` bits at `shift`.
    pub(crate) fn extract(&self, shift: u32, width: u32) -> u64 {
        let mask = if (width as usize) < bit_size_of::<Packed>() {
            (Packed::one() << width as usize) - Packed::one()
        } else {
            !Packed::zero()
        };
        let member = (self.bits >> shift as usize) & mask;
        member.to_u64().expect("a member of at most 64 bits fits in u64")
    }

    pub(crate) fn into_bits(self) -> Packed {
        self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_places_members() {
        let mut field = BitField::<u32>::new();
        field.insert(0b1011, 7, 4).unwrap();
        field.insert(0b11_1011, 18, 6).unwrap();
        assert_eq!(field.into_bits(), 0b0000_0000_1110_1100_0000_0101_1000_0000);
    }

    #[test]
    fn insert_rejects_wide_values() {
        let mut field = BitField::<u32>::new();
        assert_eq!(field.insert(0b100, 0, 2), Err(ErrorKind::OutOfRange { value: 4, bits: 2 }));
    }

    #[test]
    fn extract_reads_members_back() {
        let field = BitField::from_bits(0b0000_0101_1000_0001_u16);
        assert_eq!(field.extract(7, 4), 0b1011);
        assert_eq!(field.extract(0, 1), 1);
    }

    #[test]
    fn full_width_member_round_trips() {
        let mut field = BitField::<u64>::new();
        field.insert(u64::MAX, 0, 64).unwrap();
        assert_eq!(field.extract(0, 64), u64::MAX);
    }
}
