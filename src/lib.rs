#![warn(missing_docs)]

//! # Valise
//!
//! Valise is a library for describing binary protocol frames
//! declaratively. One declaration yields a packer (structured value to
//! wire bytes), an unpacker (wire bytes back to the structured value),
//! and a stream framer that recovers whole frames from an arbitrarily
//! chunked byte stream.
//!
//! ## Declaring a frame
//!
//! A frame is a [`structure::Structure`]: an ordered list of named fields,
//! each bound to a [`field::FieldKind`]. Declaration order is wire order.
//! Fields of variable extent name the earlier field that bounds them — a
//! length field sizes a payload, a count field sizes an array, a dispatch
//! field selects which sub-structure a body decodes as — and the builder
//! resolves and validates that wiring once, when the declaration is
//! built.
//!
//! ```
//! use valise::field::FieldKind;
//! use valise::scalar::Scalar;
//! use valise::structure::Structure;
//! use valise::value::Record;
//!
//! let echo = Structure::builder("echo")
//!     .field("frame_type", FieldKind::scalar(Scalar::u8()))
//!     .field("len", FieldKind::length(Scalar::u16()))
//!     .field("payload", FieldKind::sized_payload("len"))
//!     .build()?;
//!
//! let mut frame = Record::new(&echo);
//! frame.set("frame_type", 0x10u8)?;
//! frame.set("payload", &b"hi"[..])?;
//!
//! let wire = echo.pack(&mut frame)?;
//! assert_eq!(wire, [0x10, 0x00, 0x02, 0x68, 0x69]);
//! assert_eq!(echo.unpack(&wire)?, frame);
//! # Ok::<(), valise::error::Error>(())
//! ```
//!
//! Note that `len` was never set by hand: packing resolves every derived
//! field — lengths, counts, dispatch keys, magic constants — and writes it
//! back into the record before emitting bytes, so a packed record always
//! equals its re-parsed image.
//!
//! ## Field kinds
//!
//! Beyond fixed-width scalars ([`scalar::Scalar`]), fields can be:
//!
//! - opaque byte blocks, fixed ([`field::FieldKind::bytes`]) or sized by a
//!   length field ([`field::FieldKind::sized_payload`]), or greedy
//!   ([`field::FieldKind::payload`]) — taking everything left in the frame
//!   ahead of a fixed trailer;
//! - magic constants ([`field::FieldKind::magic`]) that anchor a frame and
//!   let the stream framer resynchronize;
//! - bit records ([`bit::BitLayout`]): a container of 8 to 64 bits split
//!   into named members, most significant first, any of which can act as
//!   a length or dispatch provider for a later field;
//! - nested structures, arrays of structures, and dispatch targets that
//!   decode as one of several structures keyed by an earlier dispatch
//!   field;
//! - conditional fields, present only when a predicate over earlier
//!   fields holds, and derived fields computed from an earlier field at
//!   pack time.
//!
//! ## Framing a stream
//!
//! A [`framer::Framer`] owns a buffer and a frame callback. Feed it bytes
//! as they arrive — in whatever chunking the transport produced — and it
//! delivers each complete frame exactly once, in order. Garbage between
//! frames is skipped by hunting for the magic prefix, parse failures are
//! reported through an event callback before resynchronizing, and an
//! optional buffer cap guards against a peer that never syncs.
//!
//! ## Errors
//!
//! Declaration mistakes (two greedy fields, a dangling length provider, a
//! bit record that does not fill its container) fail at build time with
//! [`error::DeclarationError`]. Runtime failures carry an
//! [`error::ErrorKind`], the dotted path of the offending field
//! (`body.items[3].len`), and the byte offset within the frame.

pub mod bit;
pub mod byte_order;
pub mod error;
pub mod field;
pub mod framer;
pub mod scalar;
pub mod structure;
pub mod value;
