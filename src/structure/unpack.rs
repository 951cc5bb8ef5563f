//! The region unpacker.
//!
//! Fields decode in wire order with a cursor over the enclosing region.
//! Providers decode before their consumers, so a bounded consumer's extent
//! is always known when the cursor reaches it; a greedy field takes
//! whatever remains minus the cached fixed-suffix width behind it. Nested
//! structures must consume their allotted region exactly.

use crate::error::{Error, ErrorKind};
use crate::field::{FieldKind, SizeMode};
use crate::structure::{ProviderRef, Structure, base_kind, condition_holds};
use crate::value::{Record, Value};

pub(crate) fn unpack(layout: &Structure, bytes: &[u8]) -> Result<Record, Error> {
    let (record, consumed) = unpack_region(layout, bytes, 0)?;
    if consumed != bytes.len() {
        return Err(Error::new(ErrorKind::LengthInconsistency {
            declared: bytes.len(),
            actual: consumed,
        })
        .at_offset(consumed));
    }
    Ok(record)
}

/// Unpack one structure from the front of `region`, which starts at
/// absolute offset `base` within the top-level frame. Returns the record
/// and the number of bytes consumed.
pub(crate) fn unpack_region(
    layout: &Structure,
    region: &[u8],
    base: usize,
) -> Result<(Record, usize), Error> {
    let mut record = Record::new(layout);
    let mut cursor = 0usize;

    for index in 0..layout.slot_count() {
        let name = layout.slot_name(index);
        let at = base + cursor;
        if !condition_holds(layout, index, &record).map_err(|err| err.at_offset(at))? {
            continue;
        }
        let remaining = region.len() - cursor;

        match base_kind(&layout.slots()[index].kind) {
            FieldKind::Scalar(_)
            | FieldKind::Length { .. }
            | FieldKind::Dispatch { .. }
            | FieldKind::Derived { .. } => {
                let scalar = layout.slot_scalar(index).expect("scalar-like slots carry a scalar");
                let (value, used) = scalar
                    .decode(&region[cursor..])
                    .map_err(|kind| Error::new(kind).at_offset(at).in_field(name))?;
                record.set_slot(index, value);
                cursor += used;
            }
            FieldKind::FixedBytes(len) => {
                if remaining < *len {
                    return Err(Error::new(ErrorKind::ShortBuffer {
                        needed: *len,
                        available: remaining,
                    })
                    .at_offset(at)
                    .in_field(name));
                }
                record.set_slot(index, Value::Bytes(region[cursor..cursor + len].to_vec()));
                cursor += len;
            }
            FieldKind::Magic(constant) => {
                let len = constant.len();
                if remaining < len {
                    return Err(Error::new(ErrorKind::ShortBuffer {
                        needed: len,
                        available: remaining,
                    })
                    .at_offset(at)
                    .in_field(name));
                }
                let got = &region[cursor..cursor + len];
                if got != constant.as_slice() {
                    return Err(Error::new(ErrorKind::MagicMismatch {
                        expected: constant.clone(),
                        got: got.to_vec(),
                    })
                    .at_offset(at)
                    .in_field(name));
                }
                record.set_slot(index, Value::Bytes(constant.clone()));
                cursor += len;
            }
            FieldKind::Bits(bit_layout) => {
                let (values, used) = bit_layout
                    .unpack(&region[cursor..])
                    .map_err(|err| err.at_offset(at).in_field(name))?;
                record.set_slot(index, Value::Bits(values));
                cursor += used;
            }
            FieldKind::Payload { .. } => {
                let len = region_len(layout, &record, index, remaining, at)?;
                record.set_slot(index, Value::Bytes(region[cursor..cursor + len].to_vec()));
                cursor += len;
            }
            FieldKind::Substruct { layout: inner, .. } => {
                let len = region_len(layout, &record, index, remaining, at)?;
                let value = unpack_exact(inner, &region[cursor..cursor + len], at)
                    .map_err(|err| err.in_field(name))?;
                record.set_slot(index, Value::Record(value));
                cursor += len;
            }
            FieldKind::Target { arms, fallback, .. } => {
                let select =
                    layout.meta().select_refs[index].as_ref().expect("targets resolve a selector");
                let key = provider_value(layout, &record, select, at)?;
                let arm = arms
                    .iter()
                    .find(|(arm_key, _)| *arm_key == key)
                    .map(|(_, arm)| arm)
                    .or(fallback.as_ref())
                    .ok_or_else(|| {
                        Error::new(ErrorKind::UnknownDispatch(key)).at_offset(at).in_field(name)
                    })?;
                let len = region_len(layout, &record, index, remaining, at)?;
                let value = unpack_exact(arm, &region[cursor..cursor + len], at)
                    .map_err(|err| err.in_field(name))?;
                record.set_slot(index, Value::Record(value));
                cursor += len;
            }
            FieldKind::Array { element, mode, .. } => {
                let items = match mode {
                    SizeMode::Count => {
                        let provider =
                            layout.meta().size_refs[index].as_ref().expect("counted arrays resolve a provider");
                        let count = provider_value(layout, &record, provider, at)?;
                        let mut items = Vec::new();
                        for position in 0..count {
                            let (item, used) =
                                unpack_region(element, &region[cursor..], base + cursor)
                                    .map_err(|err| err.in_element(name, position as usize))?;
                            if used == 0 {
                                return Err(Error::new(ErrorKind::ArrayElementUnderflow {
                                    leftover: region.len() - cursor,
                                })
                                .at_offset(base + cursor)
                                .in_element(name, position as usize));
                            }
                            items.push(item);
                            cursor += used;
                        }
                        items
                    }
                    SizeMode::Bytes => {
                        let len = region_len(layout, &record, index, remaining, at)?;
                        let items = unpack_elements(element, &region[cursor..cursor + len], at, name)?;
                        cursor += len;
                        items
                    }
                };
                record.set_slot(index, Value::Array(items));
            }
            FieldKind::Conditional { .. } => unreachable!("base_kind looks through conditionals"),
        }
    }

    Ok((record, cursor))
}

/// Unpack a nested structure that must consume `region` exactly.
fn unpack_exact(layout: &Structure, region: &[u8], base: usize) -> Result<Record, Error> {
    let (record, consumed) = unpack_region(layout, region, base)?;
    if consumed != region.len() {
        return Err(Error::new(ErrorKind::LengthInconsistency {
            declared: region.len(),
            actual: consumed,
        })
        .at_offset(base + consumed));
    }
    Ok(record)
}

/// Unpack consecutive elements until a byte-sized region is exhausted.
fn unpack_elements(
    element: &Structure,
    region: &[u8],
    base: usize,
    name: &str,
) -> Result<Vec<Record>, Error> {
    let mut items = Vec::new();
    let mut cursor = 0usize;
    while cursor < region.len() {
        match unpack_region(element, &region[cursor..], base + cursor) {
            Ok((_, 0)) => {
                return Err(Error::new(ErrorKind::ArrayElementUnderflow {
                    leftover: region.len() - cursor,
                })
                .at_offset(base + cursor)
                .in_element(name, items.len()));
            }
            Ok((item, used)) => {
                items.push(item);
                cursor += used;
            }
            Err(err) if matches!(err.kind(), ErrorKind::ShortBuffer { .. }) => {
                return Err(Error::new(ErrorKind::ArrayElementUnderflow {
                    leftover: region.len() - cursor,
                })
                .at_offset(base + cursor)
                .in_element(name, items.len()));
            }
            Err(err) => return Err(err.in_element(name, items.len())),
        }
    }
    Ok(items)
}

/// The byte extent allotted to the variable-width slot `index`.
pub(crate) fn region_len(
    layout: &Structure,
    record: &Record,
    index: usize,
    remaining: usize,
    at: usize,
) -> Result<usize, Error> {
    let name = layout.slot_name(index);
    if let Some(width) = layout.slot_width(index) {
        if remaining < width {
            return Err(Error::new(ErrorKind::ShortBuffer { needed: width, available: remaining })
                .at_offset(at)
                .in_field(name));
        }
        return Ok(width);
    }
    match layout.meta().size_refs[index].as_ref() {
        Some(provider) => {
            let len = provider_value(layout, record, provider, at)?;
            if len > remaining as u64 {
                return Err(Error::new(ErrorKind::ShortBuffer {
                    needed: len as usize,
                    available: remaining,
                })
                .at_offset(at)
                .in_field(name));
            }
            Ok(len as usize)
        }
        None => {
            let suffix = layout.meta().suffixes[index];
            if remaining < suffix {
                return Err(Error::new(ErrorKind::GreedyUnderflow { missing: suffix - remaining })
                    .at_offset(at)
                    .in_field(name));
            }
            Ok(remaining - suffix)
        }
    }
}

/// Read a provider's already-decoded value, applying its adjustment.
pub(crate) fn provider_value(
    layout: &Structure,
    record: &Record,
    provider: &ProviderRef,
    at: usize,
) -> Result<u64, Error> {
    let provider_name = layout.slot_name(provider.slot);
    let raw = match provider.sub {
        None => record.slot(provider.slot).and_then(Value::as_unsigned),
        Some(sub) => record
            .slot(provider.slot)
            .and_then(Value::as_bits)
            .and_then(|bits| bits.get_index(sub)),
    }
    .ok_or_else(|| Error::new(ErrorKind::UnsetField).at_offset(at).in_field(provider_name))?;
    Ok(provider.adjust.as_ref().map_or(raw, |adjust| adjust.from_wire(raw)))
}
