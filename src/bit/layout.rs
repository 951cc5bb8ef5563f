use std::sync::Arc;

use itertools::Itertools;

use crate::bit::field::BitField;
use crate::error::{DeclarationError, Error, ErrorKind};

const CONTAINER_WIDTHS: [u32; 8] = [8, 16, 24, 32, 40, 48, 56, 64];

#[derive(Debug, Clone, PartialEq, Eq)]
struct BitSlot {
    name: String,
    width: u32,
    flag: bool,
    /// Left shift of the member's least significant bit, computed from the
    /// declared most-significant-first order.
    shift: u32,
}

#[derive(Debug, PartialEq, Eq)]
struct Inner {
    name: String,
    width: u32,
    slots: Vec<BitSlot>,
}

/// A fixed-width container of named bit fields.
///
/// Declared sub-fields fill the container most-significant-first and must
/// cover it exactly; the container serializes as a big-endian integer of
/// the declared width. The handle is cheap to clone and immutable once
/// built.
///
/// ```
/// use valise::bit::BitLayout;
///
/// let flags = BitLayout::builder("flags", 8)
///     .number("version", 3)
///     .flag("secure")
///     .number("channel", 4)
///     .build()?;
/// assert_eq!(flags.width_bytes(), 1);
/// # Ok::<(), valise::error::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct BitLayout {
    inner: Arc<Inner>,
}

/// Builder returned by [`BitLayout::builder`].
#[derive(Debug)]
pub struct BitLayoutBuilder {
    name: String,
    width: u32,
    slots: Vec<(String, u32, bool)>,
}

/// The decoded sub-field values of one [`BitLayout`] container.
///
/// Flags are stored as 0/1 like any other member; [`BitValues::flag`] and
/// [`BitValues::set_flag`] translate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitValues {
    layout: BitLayout,
    values: Vec<Option<u64>>,
}

impl BitLayout {
    /// Start declaring a container of `width` bits. Valid widths are whole
    /// bytes from 8 to 64.
    pub fn builder(name: impl Into<String>, width: u32) -> BitLayoutBuilder {
        BitLayoutBuilder { name: name.into(), width, slots: Vec::new() }
    }

    /// The name the container was declared with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Serialized width of the container in bytes.
    pub fn width_bytes(&self) -> usize {
        (self.inner.width / 8) as usize
    }

    pub(crate) fn slot_index(&self, name: &str) -> Option<usize> {
        self.inner.slots.iter().position(|slot| slot.name == name)
    }

    pub(crate) fn slot_name(&self, index: usize) -> &str {
        &self.inner.slots[index].name
    }

    pub(crate) fn pack(&self, values: &BitValues) -> Result<Vec<u8>, Error> {
        if !self.same_layout(&values.layout) {
            return Err(ErrorKind::TypeMismatch.into());
        }
        let mut field = BitField::<u64>::new();
        for (slot, value) in self.inner.slots.iter().zip(&values.values) {
            let value = value.ok_or_else(|| Error::new(ErrorKind::UnsetField).in_field(&slot.name))?;
            field
                .insert(value, slot.shift, slot.width)
                .map_err(|kind| Error::new(kind).in_field(&slot.name))?;
        }
        let image = field.into_bits().to_be_bytes();
        Ok(image[8 - self.width_bytes()..].to_vec())
    }

    pub(crate) fn unpack(&self, bytes: &[u8]) -> Result<(BitValues, usize), Error> {
        let width = self.width_bytes();
        if bytes.len() < width {
            return Err(ErrorKind::ShortBuffer { needed: width, available: bytes.len() }.into());
        }
        let container = bytes[..width].iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        let field = BitField::from_bits(container);
        let mut values = BitValues::new(self);
        for (index, slot) in self.inner.slots.iter().enumerate() {
            values.values[index] = Some(field.extract(slot.shift, slot.width));
        }
        Ok((values, width))
    }

    fn same_layout(&self, other: &BitLayout) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner == other.inner
    }
}

impl PartialEq for BitLayout {
    fn eq(&self, other: &Self) -> bool {
        self.same_layout(other)
    }
}

impl Eq for BitLayout {}

impl BitLayoutBuilder {
    /// Append an unsigned member of `width` bits.
    pub fn number(mut self, name: impl Into<String>, width: u32) -> Self {
        self.slots.push((name.into(), width, false));
        self
    }

    /// Append a single-bit boolean member.
    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.slots.push((name.into(), 1, true));
        self
    }

    /// Validate the declaration and build the immutable layout.
    pub fn build(self) -> Result<BitLayout, Error> {
        if !CONTAINER_WIDTHS.contains(&self.width) {
            return Err(DeclarationError::BitContainerWidth(self.width).into());
        }
        if let Some((name, ..)) = self.slots.iter().find(|(_, width, _)| *width == 0) {
            return Err(DeclarationError::ZeroWidthBitSlot(name.clone()).into());
        }
        if let Some(name) = self.slots.iter().map(|(name, ..)| name).duplicates().next() {
            return Err(DeclarationError::DuplicateName(name.clone()).into());
        }
        let total: u32 = self.slots.iter().map(|(_, width, _)| width).sum();
        if total != self.width {
            return Err(DeclarationError::BitWidthMismatch { declared: self.width, actual: total }.into());
        }

        let mut used = 0;
        let slots = self
            .slots
            .into_iter()
            .map(|(name, width, flag)| {
                used += width;
                BitSlot { name, width, flag, shift: self.width - used }
            })
            .collect();
        Ok(BitLayout { inner: Arc::new(Inner { name: self.name, width: self.width, slots }) })
    }
}

impl BitValues {
    /// An empty value set for `layout`; every member starts unset.
    pub fn new(layout: &BitLayout) -> Self {
        Self { layout: layout.clone(), values: vec![None; layout.inner.slots.len()] }
    }

    /// The layout these values belong to.
    pub fn layout(&self) -> &BitLayout {
        &self.layout
    }

    /// Set the member called `name`. Single-bit members only accept 0 or 1.
    pub fn set(&mut self, name: &str, value: u64) -> Result<(), Error> {
        let index = self
            .layout
            .slot_index(name)
            .ok_or_else(|| Error::new(ErrorKind::UnknownField(name.into())))?;
        if self.layout.inner.slots[index].flag && value > 1 {
            return Err(Error::new(ErrorKind::OutOfRange { value: value as i128, bits: 1 })
                .in_field(name));
        }
        self.values[index] = Some(value);
        Ok(())
    }

    /// Set the single-bit member called `name`.
    pub fn set_flag(&mut self, name: &str, value: bool) -> Result<(), Error> {
        self.set(name, u64::from(value))
    }

    /// Chainable [`Self::set`].
    pub fn with(mut self, name: &str, value: u64) -> Result<Self, Error> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Chainable [`Self::set_flag`].
    pub fn with_flag(mut self, name: &str, value: bool) -> Result<Self, Error> {
        self.set_flag(name, value)?;
        Ok(self)
    }

    /// The member called `name`, if set.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values[self.layout.slot_index(name)?]
    }

    /// The single-bit member called `name`, if set.
    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name).map(|value| value != 0)
    }

    pub(crate) fn get_index(&self, index: usize) -> Option<u64> {
        self.values.get(index).copied().flatten()
    }

    pub(crate) fn set_index(&mut self, index: usize, value: u64) {
        self.values[index] = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BitLayout {
        BitLayout::builder("flags", 16)
            .number("a", 4)
            .number("b", 3)
            .flag("c")
            .number("d", 8)
            .build()
            .unwrap()
    }

    #[test]
    fn members_pack_most_significant_first() {
        let layout = sample();
        let values = BitValues::new(&layout)
            .with("a", 0xA)
            .unwrap()
            .with("b", 0x5)
            .unwrap()
            .with_flag("c", true)
            .unwrap()
            .with("d", 0x7F)
            .unwrap();
        assert_eq!(layout.pack(&values).unwrap(), [0xAB, 0x7F]);
    }

    #[test]
    fn unpack_decomposes_members() {
        let layout = sample();
        let (values, consumed) = layout.unpack(&[0xAB, 0x7F, 0xEE]).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(values.get("a"), Some(0xA));
        assert_eq!(values.get("b"), Some(0x5));
        assert_eq!(values.flag("c"), Some(true));
        assert_eq!(values.get("d"), Some(0x7F));
    }

    #[test]
    fn pack_rejects_unset_and_wide_members() {
        let layout = sample();
        let partial = BitValues::new(&layout).with("a", 0xA).unwrap();
        let err = layout.pack(&partial).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::UnsetField);
        assert_eq!(err.path(), "b");

        let wide = BitValues::new(&layout)
            .with("a", 0x1F)
            .unwrap()
            .with("b", 0)
            .unwrap()
            .with_flag("c", false)
            .unwrap()
            .with("d", 0)
            .unwrap();
        let err = layout.pack(&wide).unwrap_err();
        assert_eq!(err.path(), "a");
        assert!(matches!(err.kind(), ErrorKind::OutOfRange { .. }));
    }

    #[test]
    fn builder_checks_widths() {
        let err = BitLayout::builder("flags", 12).number("a", 12).build().unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Declaration(DeclarationError::BitContainerWidth(12)));

        let err = BitLayout::builder("flags", 16).number("a", 9).build().unwrap_err();
        assert_eq!(
            *err.kind(),
            ErrorKind::Declaration(DeclarationError::BitWidthMismatch { declared: 16, actual: 9 })
        );

        let err = BitLayout::builder("flags", 8).number("a", 4).number("a", 4).build().unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Declaration(DeclarationError::DuplicateName("a".into())));
    }
}
