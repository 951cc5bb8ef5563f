//! Structure descriptors: an ordered sequence of named fields.
//!
//! A [`Structure`] is declared once through [`Structure::builder`] and is
//! immutable afterwards. Building resolves every cross-field reference
//! (length and count providers, dispatch selectors, condition and
//! derivation inputs) to slot indices, classifies each field's extent, and
//! caches the metadata the packer, unpacker, and framer need: the greedy
//! slot, per-slot fixed-suffix sums, and whether a whole frame can be
//! sized from a bounded prefix.

mod pack;
pub(crate) mod unpack;

use std::sync::Arc;

use itertools::Itertools;

use crate::error::{DeclarationError, Error};
use crate::field::{Extent, FieldKind, LengthAdjust, SizeMode, SizeRef};
use crate::scalar::Scalar;
use crate::value::Record;

/// One named field of a structure.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) name: String,
    pub(crate) kind: FieldKind,
}

/// A provider reference resolved to slot indices.
#[derive(Debug, Clone)]
pub(crate) struct ProviderRef {
    pub(crate) slot: usize,
    /// Member index when the provider is a bit-record member.
    pub(crate) sub: Option<usize>,
    pub(crate) adjust: Option<LengthAdjust>,
    pub(crate) mode: SizeMode,
}

/// Provider-to-consumer back link, kept in consumer declaration order.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub(crate) provider: usize,
    pub(crate) sub: Option<usize>,
    pub(crate) consumer: usize,
    pub(crate) role: LinkRole,
}

#[derive(Debug, Clone)]
pub(crate) enum LinkRole {
    Size { mode: SizeMode, adjust: Option<LengthAdjust> },
    Dispatch,
}

/// Metadata cached when the declaration is built.
#[derive(Debug, Default)]
pub(crate) struct Meta {
    /// Fixed width per slot; `None` for variable-width slots.
    pub(crate) widths: Vec<Option<usize>>,
    /// Index of the greedy slot, if any.
    pub(crate) greedy: Option<usize>,
    /// Sum of the fixed widths following each slot, up to the next
    /// variable-width slot. Pins the end of the greedy region.
    pub(crate) suffixes: Vec<usize>,
    /// For each consumer slot, its resolved size provider.
    pub(crate) size_refs: Vec<Option<ProviderRef>>,
    /// For each dispatch target slot, its resolved key provider.
    pub(crate) select_refs: Vec<Option<ProviderRef>>,
    /// All provider/consumer pairs, used by the packer's first pass.
    pub(crate) links: Vec<Link>,
    /// Wire shape of each derived slot, mirrored from its source.
    pub(crate) derived_scalars: Vec<Option<Scalar>>,
    /// Source slot index of each derived slot.
    pub(crate) derived_sources: Vec<Option<usize>>,
    /// Total width when every slot is fixed.
    pub(crate) fixed_width: Option<usize>,
    /// Whether a frame's total length is determinable from a bounded
    /// prefix, which the stream framer requires.
    pub(crate) sizable: bool,
}

#[derive(Debug)]
struct Inner {
    name: String,
    slots: Vec<Slot>,
    meta: Meta,
}

/// An immutable frame declaration. Cheap to clone and share.
///
/// ```
/// use valise::field::FieldKind;
/// use valise::scalar::Scalar;
/// use valise::structure::Structure;
///
/// let header = Structure::builder("header")
///     .field("version", FieldKind::scalar(Scalar::u8()))
///     .field("len", FieldKind::length(Scalar::u16()))
///     .field("body", FieldKind::sized_payload("len"))
///     .build()?;
/// assert_eq!(header.fixed_width(), None);
/// # Ok::<(), valise::error::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Structure {
    inner: Arc<Inner>,
}

/// Builder returned by [`Structure::builder`].
#[derive(Debug)]
pub struct StructureBuilder {
    name: String,
    slots: Vec<Slot>,
}

impl Structure {
    /// Start declaring a structure called `name`.
    pub fn builder(name: impl Into<String>) -> StructureBuilder {
        StructureBuilder { name: name.into(), slots: Vec::new() }
    }

    /// The name the structure was declared with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of declared fields.
    pub fn slot_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Index of the field called `name`.
    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.inner.slots.iter().position(|slot| slot.name == name)
    }

    /// Total wire width, when every field is fixed-width.
    pub fn fixed_width(&self) -> Option<usize> {
        self.inner.meta.fixed_width
    }

    /// Pack `record` into its wire bytes.
    ///
    /// Derived values (lengths, counts, dispatch keys, magic constants,
    /// derived fields) are resolved first and written back into `record`,
    /// then the fields are emitted in declaration order. The same record
    /// state always packs to the same bytes.
    pub fn pack(&self, record: &mut Record) -> Result<Vec<u8>, Error> {
        pack::pack(self, record)
    }

    /// Unpack a complete frame; `bytes` must be consumed exactly.
    pub fn unpack(&self, bytes: &[u8]) -> Result<Record, Error> {
        unpack::unpack(self, bytes)
    }

    /// Unpack a frame from the front of `bytes`, returning it together with
    /// the number of bytes consumed.
    pub fn unpack_partial(&self, bytes: &[u8]) -> Result<(Record, usize), Error> {
        unpack::unpack_region(self, bytes, 0)
    }

    pub(crate) fn slots(&self) -> &[Slot] {
        &self.inner.slots
    }

    pub(crate) fn slot_name(&self, index: usize) -> &str {
        &self.inner.slots[index].name
    }

    pub(crate) fn meta(&self) -> &Meta {
        &self.inner.meta
    }

    pub(crate) fn same_layout(&self, other: &Structure) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.name == other.inner.name
    }

    /// The declared width of slot `index`, looking through derived fields.
    pub(crate) fn slot_width(&self, index: usize) -> Option<usize> {
        self.inner.meta.widths[index]
    }

    /// The scalar a slot encodes with, for scalar-like slots.
    pub(crate) fn slot_scalar(&self, index: usize) -> Option<Scalar> {
        match base_kind(&self.inner.slots[index].kind) {
            FieldKind::Scalar(scalar)
            | FieldKind::Length { scalar, .. }
            | FieldKind::Dispatch { scalar } => Some(*scalar),
            FieldKind::Derived { .. } => self.inner.meta.derived_scalars[index],
            _ => None,
        }
    }
}

impl PartialEq for Structure {
    fn eq(&self, other: &Self) -> bool {
        self.same_layout(other)
    }
}

/// Look through conditional wrappers to the field that is actually
/// present when the conditions hold.
pub(crate) fn base_kind(kind: &FieldKind) -> &FieldKind {
    match kind {
        FieldKind::Conditional { inner, .. } => base_kind(inner),
        other => other,
    }
}

/// Evaluate the conditional wrappers of slot `index` against the partial
/// frame; `Ok(false)` means the field is absent.
pub(crate) fn condition_holds(layout: &Structure, index: usize, frame: &Record) -> Result<bool, Error> {
    let mut kind = &layout.slots()[index].kind;
    while let FieldKind::Conditional { condition, inner } = kind {
        match condition.evaluate(frame) {
            Ok(true) => kind = inner.as_ref(),
            Ok(false) => return Ok(false),
            Err(cause) => return Err(Error::new(cause).in_field(layout.slot_name(index))),
        }
    }
    Ok(true)
}

impl StructureBuilder {
    /// Append a field. Wire order is declaration order.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.slots.push(Slot { name: name.into(), kind });
        self
    }

    /// Validate the declaration and build the immutable descriptor.
    pub fn build(self) -> Result<Structure, Error> {
        let Self { name, slots } = self;

        if let Some(dup) = slots.iter().map(|slot| &slot.name).duplicates().next() {
            return Err(DeclarationError::DuplicateName(dup.clone()).into());
        }

        let count = slots.len();
        let mut meta = Meta {
            widths: vec![None; count],
            greedy: None,
            suffixes: vec![0; count],
            size_refs: vec![None; count],
            select_refs: vec![None; count],
            links: Vec::new(),
            derived_scalars: vec![None; count],
            derived_sources: vec![None; count],
            fixed_width: None,
            sizable: false,
        };

        resolve_inputs(&slots, &mut meta)?;
        classify_extents(&slots, &mut meta)?;
        resolve_providers(&slots, &mut meta)?;
        check_provider_use(&slots, &meta)?;
        meta.sizable = frame_is_sizable(&slots, &meta);

        Ok(Structure { inner: Arc::new(Inner { name, slots, meta }) })
    }
}

/// Validate condition inputs and derivation sources against wire order
/// (they must read strictly-earlier fields), and mirror each derived
/// slot's wire shape from its source.
fn resolve_inputs(slots: &[Slot], meta: &mut Meta) -> Result<(), Error> {
    for (index, slot) in slots.iter().enumerate() {
        let mut kind = &slot.kind;
        while let FieldKind::Conditional { condition, inner } = kind {
            for input in condition.inputs() {
                check_input_path(slots, input, index)?;
            }
            kind = inner.as_ref();
        }

        match kind {
            FieldKind::Derived { source, .. } => {
                let source_index = slots
                    .iter()
                    .position(|slot| slot.name == *source)
                    .ok_or_else(|| DeclarationError::UnknownProvider(source.clone()))?;
                if source_index >= index {
                    return Err(DeclarationError::ForwardInput(source.clone()).into());
                }
                let scalar = match base_kind(&slots[source_index].kind) {
                    FieldKind::Scalar(scalar)
                    | FieldKind::Length { scalar, .. }
                    | FieldKind::Dispatch { scalar } => *scalar,
                    _ => return Err(DeclarationError::DerivedSource(source.clone()).into()),
                };
                meta.derived_scalars[index] = Some(scalar);
                meta.derived_sources[index] = Some(source_index);
            }
            FieldKind::Length { scalar, .. } | FieldKind::Dispatch { scalar } => {
                if !scalar.is_integer() {
                    return Err(DeclarationError::NonIntegerProvider(slot.name.clone()).into());
                }
                if !matches!(slot.kind, FieldKind::Length { .. } | FieldKind::Dispatch { .. }) {
                    return Err(DeclarationError::ConditionalProvider(slot.name.clone()).into());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// A condition input must name a strictly-earlier field, either a whole
/// slot or a bit-record member of one.
fn check_input_path(slots: &[Slot], input: &str, reader: usize) -> Result<(), Error> {
    let (head, member) = match input.split_once('.') {
        Some((head, member)) => (head, Some(member)),
        None => (input, None),
    };
    let head_index = slots
        .iter()
        .position(|slot| slot.name == head)
        .ok_or_else(|| DeclarationError::UnknownProvider(input.into()))?;
    if head_index >= reader {
        return Err(DeclarationError::ForwardInput(input.into()).into());
    }
    if let Some(member) = member {
        match base_kind(&slots[head_index].kind) {
            FieldKind::Bits(layout) if layout.slot_index(member).is_some() => {}
            _ => return Err(DeclarationError::UnknownProvider(input.into()).into()),
        }
    }
    Ok(())
}

fn classify_extents(slots: &[Slot], meta: &mut Meta) -> Result<(), Error> {
    for (index, slot) in slots.iter().enumerate() {
        let extent = match &slot.kind {
            FieldKind::Derived { .. } => {
                let scalar = meta.derived_scalars[index].expect("derived shapes resolve before extents");
                Extent::Fixed(scalar.width())
            }
            kind => kind.extent(),
        };
        match extent {
            Extent::Fixed(width) => meta.widths[index] = Some(width),
            Extent::Bounded => {}
            Extent::Greedy => {
                if meta.greedy.is_some() {
                    return Err(DeclarationError::DuplicateGreedy(slot.name.clone()).into());
                }
                meta.greedy = Some(index);
            }
        }
    }

    if let Some(greedy) = meta.greedy {
        if let Some(variable) = (greedy + 1..slots.len()).find(|i| meta.widths[*i].is_none()) {
            return Err(DeclarationError::VariableSuffix(slots[variable].name.clone()).into());
        }
    }

    let mut trailing = 0;
    for index in (0..slots.len()).rev() {
        meta.suffixes[index] = trailing;
        match meta.widths[index] {
            Some(width) => trailing += width,
            None => trailing = 0,
        }
    }

    meta.fixed_width =
        meta.widths.iter().copied().try_fold(0usize, |total, width| width.map(|width| total + width));
    Ok(())
}

fn resolve_providers(slots: &[Slot], meta: &mut Meta) -> Result<(), Error> {
    for (index, slot) in slots.iter().enumerate() {
        match base_kind(&slot.kind) {
            FieldKind::Payload { size } | FieldKind::Substruct { size, .. } => {
                if let SizeRef::Provider(path) = size {
                    link_size(slots, meta, path, index, SizeMode::Bytes)?;
                }
            }
            FieldKind::Array { element, size, mode } => {
                if element.fixed_width() == Some(0) {
                    return Err(DeclarationError::EmptyArrayElement(element.name().into()).into());
                }
                if let SizeRef::Provider(path) = size {
                    link_size(slots, meta, path, index, *mode)?;
                }
            }
            FieldKind::Target { select, size, arms, .. } => {
                if let Some(key) = arms.iter().map(|(key, _)| key).duplicates().next() {
                    return Err(DeclarationError::DuplicateDispatch(*key).into());
                }
                link_select(slots, meta, select, index)?;
                if let SizeRef::Provider(path) = size {
                    link_size(slots, meta, path, index, SizeMode::Bytes)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn link_size(
    slots: &[Slot],
    meta: &mut Meta,
    path: &str,
    consumer: usize,
    mode: SizeMode,
) -> Result<(), Error> {
    let (slot, sub) = resolve_provider_slot(slots, path, consumer)?;
    let adjust = match (sub, base_kind(&slots[slot].kind)) {
        (None, FieldKind::Length { mode: declared, adjust, .. }) => {
            if *declared != mode {
                return Err(DeclarationError::ProviderMode(path.into()).into());
            }
            adjust.clone()
        }
        (None, _) => return Err(DeclarationError::ProviderMode(path.into()).into()),
        (Some(_), _) => None,
    };
    meta.size_refs[consumer] = Some(ProviderRef { slot, sub, adjust: adjust.clone(), mode });
    meta.links.push(Link { provider: slot, sub, consumer, role: LinkRole::Size { mode, adjust } });
    Ok(())
}

fn link_select(slots: &[Slot], meta: &mut Meta, path: &str, consumer: usize) -> Result<(), Error> {
    let (slot, sub) = resolve_provider_slot(slots, path, consumer)?;
    if sub.is_none() && !matches!(base_kind(&slots[slot].kind), FieldKind::Dispatch { .. }) {
        return Err(DeclarationError::ProviderMode(path.into()).into());
    }
    meta.select_refs[consumer] =
        Some(ProviderRef { slot, sub, adjust: None, mode: SizeMode::Bytes });
    meta.links.push(Link { provider: slot, sub, consumer, role: LinkRole::Dispatch });
    Ok(())
}

/// Resolve `"name"` or `"name.member"` to (slot index, member index),
/// requiring it to precede the consumer in wire order.
fn resolve_provider_slot(
    slots: &[Slot],
    path: &str,
    consumer: usize,
) -> Result<(usize, Option<usize>), Error> {
    let (head, member) = match path.split_once('.') {
        Some((head, member)) => (head, Some(member)),
        None => (path, None),
    };
    let slot = slots
        .iter()
        .position(|slot| slot.name == head)
        .ok_or_else(|| DeclarationError::UnknownProvider(path.into()))?;
    if slot >= consumer {
        return Err(DeclarationError::ForwardProvider(path.into()).into());
    }
    let sub = match member {
        None => None,
        Some(member) => match base_kind(&slots[slot].kind) {
            FieldKind::Bits(layout) => Some(
                layout
                    .slot_index(member)
                    .ok_or_else(|| DeclarationError::UnknownProvider(path.into()))?,
            ),
            _ => return Err(DeclarationError::UnknownProvider(path.into()).into()),
        },
    };
    Ok((slot, sub))
}

/// Every length/count/dispatch provider must have exactly one consumer.
fn check_provider_use(slots: &[Slot], meta: &Meta) -> Result<(), Error> {
    let uses = meta.links.iter().map(|link| (link.provider, link.sub)).counts();
    for (index, slot) in slots.iter().enumerate() {
        if matches!(base_kind(&slot.kind), FieldKind::Length { .. } | FieldKind::Dispatch { .. }) {
            match uses.get(&(index, None)).copied().unwrap_or(0) {
                0 => return Err(DeclarationError::DanglingProvider(slot.name.clone()).into()),
                1 => {}
                _ => return Err(DeclarationError::ProviderConflict(slot.name.clone()).into()),
            }
        }
    }
    for ((provider, sub), consumers) in uses {
        if consumers > 1 {
            let name = match sub {
                Some(sub) => match base_kind(&slots[provider].kind) {
                    FieldKind::Bits(layout) => {
                        format!("{}.{}", slots[provider].name, layout.slot_name(sub))
                    }
                    _ => slots[provider].name.clone(),
                },
                None => slots[provider].name.clone(),
            };
            return Err(DeclarationError::ProviderConflict(name).into());
        }
    }
    Ok(())
}

/// Whether the total frame length is determinable from a bounded prefix:
/// every slot is fixed, provider-bounded, or a greedy nested structure
/// whose own layout is sizable again. A greedy payload or array cannot be
/// delimited in a stream.
fn frame_is_sizable(slots: &[Slot], meta: &Meta) -> bool {
    slots.iter().enumerate().all(|(index, slot)| {
        if meta.widths[index].is_some() || meta.size_refs[index].is_some() {
            return true;
        }
        match base_kind(&slot.kind) {
            FieldKind::Payload { .. } | FieldKind::Array { .. } => false,
            FieldKind::Substruct { layout, .. } => layout.meta().sizable,
            FieldKind::Target { arms, fallback, .. } => {
                arms.iter().all(|(_, arm)| arm.meta().sizable)
                    && fallback.as_ref().is_none_or(|arm| arm.meta().sizable)
            }
            _ => true,
        }
    })
}
