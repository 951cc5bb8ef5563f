//! Fixed-width containers of named bit fields.
//!
//! A [`BitLayout`] declares a container of 8 to 64 bits and an ordered list
//! of named sub-fields, packed most-significant-first. The container is
//! serialized as a big-endian integer of the declared width. Decoded
//! sub-field values live in a [`BitValues`], and any sub-field can act as a
//! length or dispatch provider for a later field of the enclosing
//! structure.

mod field;
mod layout;

pub use layout::{BitLayout, BitLayoutBuilder, BitValues};
