//! Fixed-width integer and float codecs.
//!
//! A [`Scalar`] describes one fixed-width number on the wire: its
//! representation (unsigned, two's complement, or IEEE 754 float), its byte
//! width, and its [`ByteOrder`]. Integer widths cover every whole number of
//! bytes from 1 to 8, including the 24/40/48/56-bit widths that binary
//! protocols are fond of; those are cut from the 8-byte two's-complement
//! image and sign-extended again on decode.

use crate::byte_order::ByteOrder;
use crate::error::ErrorKind;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Repr {
    Unsigned,
    Signed,
    Float,
}

/// The wire shape of one fixed-width number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scalar {
    repr: Repr,
    width: u8,
    order: ByteOrder,
}

macro_rules! scalar_ctor {
    ($(#[$doc:meta])* $name:ident, $repr:ident, $width:expr) => {
        $(#[$doc])*
        pub fn $name() -> Self {
            Self { repr: Repr::$repr, width: $width, order: ByteOrder::BigEndian }
        }
    };
}

impl Scalar {
    scalar_ctor!(/// An unsigned 8-bit integer.
        u8, Unsigned, 1);
    scalar_ctor!(/// An unsigned 16-bit integer.
        u16, Unsigned, 2);
    scalar_ctor!(/// An unsigned 24-bit integer.
        u24, Unsigned, 3);
    scalar_ctor!(/// An unsigned 32-bit integer.
        u32, Unsigned, 4);
    scalar_ctor!(/// An unsigned 40-bit integer.
        u40, Unsigned, 5);
    scalar_ctor!(/// An unsigned 48-bit integer.
        u48, Unsigned, 6);
    scalar_ctor!(/// An unsigned 56-bit integer.
        u56, Unsigned, 7);
    scalar_ctor!(/// An unsigned 64-bit integer.
        u64, Unsigned, 8);
    scalar_ctor!(/// A signed 8-bit integer.
        i8, Signed, 1);
    scalar_ctor!(/// A signed 16-bit integer.
        i16, Signed, 2);
    scalar_ctor!(/// A signed 24-bit integer.
        i24, Signed, 3);
    scalar_ctor!(/// A signed 32-bit integer.
        i32, Signed, 4);
    scalar_ctor!(/// A signed 40-bit integer.
        i40, Signed, 5);
    scalar_ctor!(/// A signed 48-bit integer.
        i48, Signed, 6);
    scalar_ctor!(/// A signed 56-bit integer.
        i56, Signed, 7);
    scalar_ctor!(/// A signed 64-bit integer.
        i64, Signed, 8);
    scalar_ctor!(/// An IEEE 754 single-precision float.
        f32, Float, 4);
    scalar_ctor!(/// An IEEE 754 double-precision float.
        f64, Float, 8);

    /// Use little-endian byte order instead of the big-endian default.
    pub fn little_endian(self) -> Self {
        Self { order: ByteOrder::LittleEndian, ..self }
    }

    /// Use big-endian byte order. This is the default.
    pub fn big_endian(self) -> Self {
        Self { order: ByteOrder::BigEndian, ..self }
    }

    /// Width on the wire, in bytes.
    pub fn width(&self) -> usize {
        self.width as usize
    }

    pub(crate) fn is_integer(&self) -> bool {
        !matches!(self.repr, Repr::Float)
    }

    /// Encode `value` into exactly [`Self::width`] bytes.
    pub(crate) fn encode(&self, value: &Value) -> Result<Vec<u8>, ErrorKind> {
        let width = self.width as usize;
        let bits = 8 * self.width as u32;
        match self.repr {
            Repr::Unsigned => {
                let v = value.as_unsigned().ok_or(ErrorKind::TypeMismatch)?;
                if bits < 64 && (v >> bits) != 0 {
                    return Err(ErrorKind::OutOfRange { value: v as i128, bits });
                }
                Ok(trim(&v.to_be_bytes(), width, self.order))
            }
            Repr::Signed => {
                let v = value.as_signed().ok_or(ErrorKind::TypeMismatch)?;
                let (min, max) = signed_bounds(bits);
                if (v as i128) < min || (v as i128) > max {
                    return Err(ErrorKind::OutOfRange { value: v as i128, bits });
                }
                Ok(trim(&v.to_be_bytes(), width, self.order))
            }
            Repr::Float => {
                let v = value.as_float().ok_or(ErrorKind::TypeMismatch)?;
                let image = if width == 4 { (v as f32).to_bits() as u64 } else { v.to_bits() };
                Ok(trim(&image.to_be_bytes(), width, self.order))
            }
        }
    }

    /// Decode [`Self::width`] bytes from the front of `bytes`, returning the
    /// value and the number of bytes consumed.
    pub(crate) fn decode(&self, bytes: &[u8]) -> Result<(Value, usize), ErrorKind> {
        let width = self.width as usize;
        if bytes.len() < width {
            return Err(ErrorKind::ShortBuffer { needed: width, available: bytes.len() });
        }
        let raw = gather(&bytes[..width], self.order);
        let value = match self.repr {
            Repr::Unsigned => Value::UInt(raw),
            Repr::Signed => Value::Int(sign_extend(raw, 8 * self.width as u32)),
            Repr::Float if width == 4 => Value::Float(f32::from_bits(raw as u32) as f64),
            Repr::Float => Value::Float(f64::from_bits(raw)),
        };
        Ok((value, width))
    }
}

/// Cut the low `width` bytes out of a full 8-byte big-endian image.
fn trim(be_image: &[u8; 8], width: usize, order: ByteOrder) -> Vec<u8> {
    let tail = &be_image[8 - width..];
    match order {
        ByteOrder::BigEndian => tail.to_vec(),
        ByteOrder::LittleEndian => tail.iter().rev().copied().collect(),
    }
}

/// Fold `width` wire bytes into the unsigned integer they spell.
fn gather(bytes: &[u8], order: ByteOrder) -> u64 {
    let fold = |acc: u64, byte: &u8| (acc << 8) | u64::from(*byte);
    match order {
        ByteOrder::BigEndian => bytes.iter().fold(0, fold),
        ByteOrder::LittleEndian => bytes.iter().rev().fold(0, fold),
    }
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    if bits < 64 && raw & (1 << (bits - 1)) != 0 { (raw | (!0u64 << bits)) as i64 } else { raw as i64 }
}

fn signed_bounds(bits: u32) -> (i128, i128) {
    (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
}
