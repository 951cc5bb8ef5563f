//! The field algebra: everything one slot of a structure can be.
//!
//! A [`FieldKind`] is a tagged description of how one named field encodes
//! and decodes. Fields of variable extent name the earlier provider field
//! that bounds them through a [`SizeRef`]; the structure builder resolves
//! those names to slot indices and validates the wiring when the
//! declaration is built.

use std::fmt;
use std::sync::Arc;

use crate::bit::BitLayout;
use crate::error::ErrorKind;
use crate::scalar::Scalar;
use crate::structure::Structure;
use crate::value::{Record, Value};

/// Width classification of a field before any data is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// Width known from the declaration alone.
    Fixed(usize),
    /// Width determined at runtime by a length or count provider.
    Bounded,
    /// Consumes everything remaining in the enclosing region, minus the
    /// fixed trailer behind it.
    Greedy,
}

/// Whether a provider counts bytes or array elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeMode {
    /// The provider stores the consumer's extent in bytes.
    Bytes,
    /// The provider stores the consumer's element count.
    Count,
}

/// How a variable-width field finds its extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeRef {
    /// All remaining bytes of the enclosing region.
    Greedy,
    /// The named provider field: `"len"`, or `"flags.len"` for a
    /// bit-record member.
    Provider(String),
}

impl SizeRef {
    pub(crate) fn extent(&self) -> Extent {
        match self {
            SizeRef::Greedy => Extent::Greedy,
            SizeRef::Provider(_) => Extent::Bounded,
        }
    }
}

/// A get/set transform pair between a consumer's actual extent and the
/// value its length provider stores on the wire.
///
/// Packing verifies the pair round-trips for the length at hand and raises
/// `LengthInconsistency` when it does not (for example a `scaled(4)`
/// adjustment over a payload that is not a multiple of four bytes).
#[derive(Clone)]
pub struct LengthAdjust {
    encode: Arc<dyn Fn(u64) -> u64 + Send + Sync>,
    decode: Arc<dyn Fn(u64) -> u64 + Send + Sync>,
}

impl LengthAdjust {
    /// Build from an encode (actual extent to stored value) and decode
    /// (stored value to actual extent) pair.
    pub fn new(
        encode: impl Fn(u64) -> u64 + Send + Sync + 'static,
        decode: impl Fn(u64) -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self { encode: Arc::new(encode), decode: Arc::new(decode) }
    }

    /// The stored value counts units of `unit` bytes, e.g. 16-bit words.
    pub fn scaled(unit: u64) -> Self {
        Self::new(move |n| n / unit, move |n| n * unit)
    }

    /// The stored value also covers `extra` bytes outside the consumer,
    /// e.g. a header length that includes the header itself.
    pub fn offset(extra: u64) -> Self {
        Self::new(move |n| n + extra, move |n| n.saturating_sub(extra))
    }

    pub(crate) fn to_wire(&self, n: u64) -> u64 {
        (self.encode)(n)
    }

    pub(crate) fn from_wire(&self, n: u64) -> u64 {
        (self.decode)(n)
    }
}

impl fmt::Debug for LengthAdjust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LengthAdjust").finish_non_exhaustive()
    }
}

/// A presence condition for an optional field.
///
/// The condition names the fields it reads so the declaration can check
/// they precede it in wire order; evaluating against a partial frame where
/// an input is still unset raises `ConditionNotEvaluable`.
#[derive(Clone)]
pub struct Condition {
    inputs: Vec<String>,
    eval: Arc<dyn Fn(&Record) -> bool + Send + Sync>,
}

impl Condition {
    /// Build from the dotted paths of the fields read and the predicate
    /// itself.
    ///
    /// ```
    /// use valise::field::Condition;
    ///
    /// let extended = Condition::new(["flags.ext"], |frame| {
    ///     frame.lookup("flags.ext").and_then(|v| v.as_uint()) == Some(1)
    /// });
    /// ```
    pub fn new<I, N, F>(inputs: I, eval: F) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        Self { inputs: inputs.into_iter().map(Into::into).collect(), eval: Arc::new(eval) }
    }

    pub(crate) fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub(crate) fn evaluate(&self, frame: &Record) -> Result<bool, ErrorKind> {
        if self.inputs.iter().any(|input| frame.lookup(input).is_none()) {
            return Err(ErrorKind::ConditionNotEvaluable);
        }
        Ok((self.eval)(frame))
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition").field("inputs", &self.inputs).finish_non_exhaustive()
    }
}

/// The pack-time transform of a derived field, applied to its source
/// field's value.
#[derive(Clone)]
pub struct Derivation(Arc<dyn Fn(&Value) -> Value + Send + Sync>);

impl Derivation {
    /// Wrap the transform applied to the source field's value at pack time.
    pub fn new(transform: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(transform))
    }

    pub(crate) fn apply(&self, source: &Value) -> Value {
        (self.0)(source)
    }
}

impl fmt::Debug for Derivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Derivation").finish_non_exhaustive()
    }
}

/// What one named field of a [`Structure`] is.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// A fixed-width integer or float.
    Scalar(Scalar),
    /// An opaque byte block of the declared length.
    FixedBytes(usize),
    /// A constant; packed verbatim, verified on unpack.
    Magic(Vec<u8>),
    /// A bit-record container.
    Bits(BitLayout),
    /// An integer storing the extent of its one later consumer field.
    Length {
        /// Wire shape of the stored value; must be an integer scalar.
        scalar: Scalar,
        /// Whether the stored value counts bytes or elements.
        mode: SizeMode,
        /// Optional transform between actual extent and stored value.
        adjust: Option<LengthAdjust>,
    },
    /// An integer selecting the dispatch arm of its one later target field.
    Dispatch {
        /// Wire shape of the key; must be an integer scalar.
        scalar: Scalar,
    },
    /// A run of raw bytes.
    Payload {
        /// Provider-bounded or greedy.
        size: SizeRef,
    },
    /// A nested structure.
    Substruct {
        /// The nested structure's layout.
        layout: Structure,
        /// Provider-bounded or greedy; a greedy fixed-width layout is
        /// classified as fixed.
        size: SizeRef,
    },
    /// A sub-structure chosen by a dispatch field's key.
    Target {
        /// Name of the dispatch field (or bit-record member) providing the
        /// key.
        select: String,
        /// Provider-bounded or greedy.
        size: SizeRef,
        /// Key-to-structure mapping.
        arms: Vec<(u64, Structure)>,
        /// Structure used when no arm matches the key.
        fallback: Option<Structure>,
    },
    /// Consecutive instances of one element structure.
    Array {
        /// Layout of each element.
        element: Structure,
        /// Provider-bounded or greedy.
        size: SizeRef,
        /// Whether the provider counts bytes or elements.
        mode: SizeMode,
    },
    /// A field that is only present when a condition on earlier fields
    /// holds.
    Conditional {
        /// The presence condition.
        condition: Condition,
        /// The field that is present when the condition holds.
        inner: Box<FieldKind>,
    },
    /// A field computed at pack time from an earlier scalar field; it
    /// encodes with its source's wire shape.
    Derived {
        /// Name of the source field.
        source: String,
        /// Transform applied to the source value at pack time.
        derivation: Derivation,
    },
}

impl FieldKind {
    /// A fixed-width integer or float.
    pub fn scalar(scalar: Scalar) -> Self {
        FieldKind::Scalar(scalar)
    }

    /// An opaque byte block of exactly `len` bytes.
    pub fn bytes(len: usize) -> Self {
        FieldKind::FixedBytes(len)
    }

    /// A constant the wire must carry verbatim.
    pub fn magic(constant: impl Into<Vec<u8>>) -> Self {
        FieldKind::Magic(constant.into())
    }

    /// A bit-record container.
    pub fn bits(layout: BitLayout) -> Self {
        FieldKind::Bits(layout)
    }

    /// A byte-length provider for one later consumer field.
    pub fn length(scalar: Scalar) -> Self {
        FieldKind::Length { scalar, mode: SizeMode::Bytes, adjust: None }
    }

    /// A byte-length provider whose stored value goes through `adjust`.
    pub fn adjusted_length(scalar: Scalar, adjust: LengthAdjust) -> Self {
        FieldKind::Length { scalar, mode: SizeMode::Bytes, adjust: Some(adjust) }
    }

    /// An element-count provider for one later array field.
    pub fn count(scalar: Scalar) -> Self {
        FieldKind::Length { scalar, mode: SizeMode::Count, adjust: None }
    }

    /// A dispatch-key provider for one later target field.
    pub fn dispatch(scalar: Scalar) -> Self {
        FieldKind::Dispatch { scalar }
    }

    /// A greedy run of raw bytes.
    pub fn payload() -> Self {
        FieldKind::Payload { size: SizeRef::Greedy }
    }

    /// A run of raw bytes sized by the named provider.
    pub fn sized_payload(provider: impl Into<String>) -> Self {
        FieldKind::Payload { size: SizeRef::Provider(provider.into()) }
    }

    /// A nested structure occupying the rest of the region (or its fixed
    /// width, when the layout is fully fixed).
    pub fn substruct(layout: Structure) -> Self {
        FieldKind::Substruct { layout, size: SizeRef::Greedy }
    }

    /// A nested structure sized by the named provider.
    pub fn sized_substruct(layout: Structure, provider: impl Into<String>) -> Self {
        FieldKind::Substruct { layout, size: SizeRef::Provider(provider.into()) }
    }

    /// A greedy array of `element` instances.
    pub fn array(element: Structure) -> Self {
        FieldKind::Array { element, size: SizeRef::Greedy, mode: SizeMode::Bytes }
    }

    /// An array whose byte extent comes from the named provider.
    pub fn sized_array(element: Structure, provider: impl Into<String>) -> Self {
        FieldKind::Array { element, size: SizeRef::Provider(provider.into()), mode: SizeMode::Bytes }
    }

    /// An array whose element count comes from the named provider.
    pub fn counted_array(element: Structure, provider: impl Into<String>) -> Self {
        FieldKind::Array { element, size: SizeRef::Provider(provider.into()), mode: SizeMode::Count }
    }

    /// A greedy dispatch target selected by the named dispatch field.
    pub fn target(select: impl Into<String>, arms: impl IntoIterator<Item = (u64, Structure)>) -> Self {
        FieldKind::Target {
            select: select.into(),
            size: SizeRef::Greedy,
            arms: arms.into_iter().collect(),
            fallback: None,
        }
    }

    /// A dispatch target sized by the named length provider.
    pub fn sized_target(
        select: impl Into<String>,
        provider: impl Into<String>,
        arms: impl IntoIterator<Item = (u64, Structure)>,
    ) -> Self {
        FieldKind::Target {
            select: select.into(),
            size: SizeRef::Provider(provider.into()),
            arms: arms.into_iter().collect(),
            fallback: None,
        }
    }

    /// A field present only when `condition` holds.
    pub fn conditional(condition: Condition, inner: FieldKind) -> Self {
        FieldKind::Conditional { condition, inner: Box::new(inner) }
    }

    /// A field computed from the named earlier field at pack time.
    pub fn derived(source: impl Into<String>, transform: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        FieldKind::Derived { source: source.into(), derivation: Derivation::new(transform) }
    }

    /// Width classification before any data is seen.
    ///
    /// Derived fields report [`Extent::Bounded`] here; their concrete width
    /// is resolved against their source when the structure is built.
    pub fn extent(&self) -> Extent {
        match self {
            FieldKind::Scalar(scalar) => Extent::Fixed(scalar.width()),
            FieldKind::FixedBytes(len) => Extent::Fixed(*len),
            FieldKind::Magic(constant) => Extent::Fixed(constant.len()),
            FieldKind::Bits(layout) => Extent::Fixed(layout.width_bytes()),
            FieldKind::Length { scalar, .. } | FieldKind::Dispatch { scalar } => Extent::Fixed(scalar.width()),
            FieldKind::Payload { size } | FieldKind::Target { size, .. } | FieldKind::Array { size, .. } => {
                size.extent()
            }
            FieldKind::Substruct { layout, size } => match (size, layout.fixed_width()) {
                (SizeRef::Greedy, Some(width)) => Extent::Fixed(width),
                (SizeRef::Greedy, None) => Extent::Greedy,
                (SizeRef::Provider(_), _) => Extent::Bounded,
            },
            FieldKind::Conditional { inner, .. } => match inner.extent() {
                Extent::Greedy => Extent::Greedy,
                _ => Extent::Bounded,
            },
            FieldKind::Derived { .. } => Extent::Bounded,
        }
    }
}
