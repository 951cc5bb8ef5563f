//! Byte order of multi-byte scalars on the wire.

/// The order in which the bytes of a multi-byte scalar appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ByteOrder {
    /// Least significant byte first.
    LittleEndian,
    /// Most significant byte first. This is network order and the default
    /// for every scalar constructor.
    BigEndian,
}
