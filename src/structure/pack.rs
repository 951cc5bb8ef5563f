//! The two-pass packer.
//!
//! Pass 1 ([`resolve`]) walks the fields in wire order and writes every
//! derived value back into the record: magic constants, derived fields,
//! and the value of each length/count/dispatch provider, learned by
//! tentatively packing its consumer. Nested structures resolve before the
//! provider that measures them, so inner lengths settle first. Pass 2
//! ([`emit`]) walks the fields again and appends their wire bytes.

use crate::bit::BitValues;
use crate::error::{Error, ErrorKind};
use crate::field::{FieldKind, SizeMode};
use crate::structure::{LinkRole, Structure, base_kind, condition_holds};
use crate::value::{Record, Value};

pub(crate) fn pack(layout: &Structure, record: &mut Record) -> Result<Vec<u8>, Error> {
    if !layout.same_layout(record.layout()) {
        return Err(ErrorKind::TypeMismatch.into());
    }
    resolve(record)?;
    let mut wire = Vec::new();
    emit(record, &mut wire)?;
    Ok(wire)
}

/// Pass 1: compute every derived value and write it into the record.
fn resolve(record: &mut Record) -> Result<(), Error> {
    let layout = record.layout().clone();
    for index in 0..layout.slot_count() {
        if !condition_holds(&layout, index, record)? {
            continue;
        }
        match base_kind(&layout.slots()[index].kind) {
            FieldKind::Magic(constant) => fill_magic(&layout, record, index, constant)?,
            FieldKind::Derived { derivation, .. } => {
                let source = layout.meta().derived_sources[index].expect("resolved at declaration");
                let value = record.slot(source).ok_or_else(|| {
                    Error::new(ErrorKind::UnsetField).in_field(layout.slot_name(source))
                })?;
                let computed = derivation.apply(value);
                record.set_slot(index, computed);
            }
            FieldKind::Substruct { .. } | FieldKind::Target { .. } | FieldKind::Array { .. } => {
                resolve_nested(&layout, record, index)?;
            }
            _ => {}
        }

        for link in layout.meta().links.iter().filter(|link| link.provider == index) {
            match &link.role {
                LinkRole::Size { mode, adjust } => {
                    let measured = measure_consumer(&layout, record, link.consumer, *mode)?;
                    let stored = adjust.as_ref().map_or(measured, |adjust| adjust.to_wire(measured));
                    let recovered = adjust.as_ref().map_or(stored, |adjust| adjust.from_wire(stored));
                    if recovered != measured {
                        return Err(Error::new(ErrorKind::LengthInconsistency {
                            declared: recovered as usize,
                            actual: measured as usize,
                        })
                        .in_field(layout.slot_name(link.consumer)));
                    }
                    write_provider(&layout, record, index, link.sub, stored)?;
                }
                LinkRole::Dispatch => {
                    resolve_dispatch(&layout, record, index, link.sub, link.consumer)?;
                }
            }
        }
    }
    Ok(())
}

/// Pass 2: append the record's wire bytes to `out` in wire order.
fn emit(record: &Record, out: &mut Vec<u8>) -> Result<(), Error> {
    for index in 0..record.layout().slot_count() {
        emit_slot(record, index, out)?;
    }
    Ok(())
}

fn emit_slot(record: &Record, index: usize, out: &mut Vec<u8>) -> Result<(), Error> {
    let layout = record.layout().clone();
    if !condition_holds(&layout, index, record)? {
        return Ok(());
    }
    let name = layout.slot_name(index);
    let offset = out.len();
    let unset = || Error::new(ErrorKind::UnsetField).at_offset(offset).in_field(name);
    let mismatch = || Error::new(ErrorKind::TypeMismatch).at_offset(offset).in_field(name);

    match base_kind(&layout.slots()[index].kind) {
        FieldKind::Scalar(_)
        | FieldKind::Length { .. }
        | FieldKind::Dispatch { .. }
        | FieldKind::Derived { .. } => {
            let scalar = layout.slot_scalar(index).expect("scalar-like slots carry a scalar");
            let value = record.slot(index).ok_or_else(unset)?;
            let bytes = scalar
                .encode(value)
                .map_err(|kind| Error::new(kind).at_offset(offset).in_field(name))?;
            out.extend_from_slice(&bytes);
        }
        FieldKind::FixedBytes(declared) => {
            let bytes = record.slot(index).ok_or_else(unset)?.as_bytes().ok_or_else(mismatch)?;
            if bytes.len() != *declared {
                return Err(Error::new(ErrorKind::LengthInconsistency {
                    declared: *declared,
                    actual: bytes.len(),
                })
                .at_offset(offset)
                .in_field(name));
            }
            out.extend_from_slice(bytes);
        }
        FieldKind::Magic(constant) => {
            // resolve() filled and verified the slot
            out.extend_from_slice(constant);
        }
        FieldKind::Bits(bit_layout) => {
            let bits = record.slot(index).ok_or_else(unset)?.as_bits().ok_or_else(mismatch)?;
            let bytes =
                bit_layout.pack(bits).map_err(|err| err.at_offset(offset).in_field(name))?;
            out.extend_from_slice(&bytes);
        }
        FieldKind::Payload { .. } => {
            let bytes = record.slot(index).ok_or_else(unset)?.as_bytes().ok_or_else(mismatch)?;
            out.extend_from_slice(bytes);
        }
        FieldKind::Substruct { .. } | FieldKind::Target { .. } => {
            let inner = record.slot(index).ok_or_else(unset)?.as_record().ok_or_else(mismatch)?;
            emit(inner, out).map_err(|err| err.in_field(name))?;
        }
        FieldKind::Array { .. } => {
            let items = record.slot(index).ok_or_else(unset)?.as_array().ok_or_else(mismatch)?;
            for (position, item) in items.iter().enumerate() {
                emit(item, out).map_err(|err| err.in_element(name, position))?;
            }
        }
        FieldKind::Conditional { .. } => unreachable!("base_kind looks through conditionals"),
    }
    Ok(())
}

fn fill_magic(
    layout: &Structure,
    record: &mut Record,
    index: usize,
    constant: &[u8],
) -> Result<(), Error> {
    match record.slot(index) {
        Some(Value::Bytes(existing)) if existing.as_slice() != constant => {
            return Err(Error::new(ErrorKind::MagicMismatch {
                expected: constant.to_vec(),
                got: existing.clone(),
            })
            .in_field(layout.slot_name(index)));
        }
        Some(Value::Bytes(_)) | None => {}
        Some(_) => {
            return Err(Error::new(ErrorKind::TypeMismatch).in_field(layout.slot_name(index)));
        }
    }
    record.set_slot(index, Value::Bytes(constant.to_vec()));
    Ok(())
}

/// Resolve the nested records stored under a container slot, settling
/// their inner providers before the outer provider measures them.
fn resolve_nested(layout: &Structure, record: &mut Record, index: usize) -> Result<(), Error> {
    let name = layout.slot_name(index);
    match base_kind(&layout.slots()[index].kind) {
        FieldKind::Substruct { .. } | FieldKind::Target { .. } => {
            if let Some(Value::Record(inner)) = record.slot_mut(index).as_mut() {
                resolve(inner).map_err(|err| err.in_field(name))?;
            }
        }
        FieldKind::Array { .. } => {
            if let Some(Value::Array(items)) = record.slot_mut(index).as_mut() {
                for (position, item) in items.iter_mut().enumerate() {
                    resolve(item).map_err(|err| err.in_element(name, position))?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Tentatively pack a consumer to learn the value its provider stores.
/// An absent conditional consumer measures as zero.
fn measure_consumer(
    layout: &Structure,
    record: &mut Record,
    consumer: usize,
    mode: SizeMode,
) -> Result<u64, Error> {
    if !condition_holds(layout, consumer, record)? {
        return Ok(0);
    }
    resolve_nested(layout, record, consumer)?;
    let name = layout.slot_name(consumer);
    let value = record
        .slot(consumer)
        .ok_or_else(|| Error::new(ErrorKind::UnsetField).in_field(name))?;
    match mode {
        SizeMode::Count => value
            .as_array()
            .map(|items| items.len() as u64)
            .ok_or_else(|| Error::new(ErrorKind::TypeMismatch).in_field(name)),
        SizeMode::Bytes => {
            let mut scratch = Vec::new();
            emit_slot(record, consumer, &mut scratch)?;
            Ok(scratch.len() as u64)
        }
    }
}

/// Derive a dispatch key from the target's record and store it in the
/// provider. A record built on the fallback structure keeps whatever key
/// the caller set.
fn resolve_dispatch(
    layout: &Structure,
    record: &mut Record,
    provider: usize,
    sub: Option<usize>,
    consumer: usize,
) -> Result<(), Error> {
    let name = layout.slot_name(consumer);
    let inner_layout = match record.slot(consumer) {
        // an unset target is reported by the emit pass
        None => return Ok(()),
        Some(value) => value
            .as_record()
            .ok_or_else(|| Error::new(ErrorKind::TypeMismatch).in_field(name))?
            .layout()
            .clone(),
    };
    if let FieldKind::Target { arms, .. } = base_kind(&layout.slots()[consumer].kind) {
        match arms.iter().find(|(_, arm)| arm.same_layout(&inner_layout)) {
            Some((key, _)) => write_provider(layout, record, provider, sub, *key)?,
            None => {
                if read_provider(record, provider, sub).is_none() {
                    return Err(Error::new(ErrorKind::TypeMismatch).in_field(name));
                }
            }
        }
    }
    Ok(())
}

fn write_provider(
    layout: &Structure,
    record: &mut Record,
    provider: usize,
    sub: Option<usize>,
    value: u64,
) -> Result<(), Error> {
    match sub {
        None => record.set_slot(provider, Value::UInt(value)),
        Some(sub) => {
            let FieldKind::Bits(bit_layout) = base_kind(&layout.slots()[provider].kind) else {
                return Err(Error::new(ErrorKind::TypeMismatch).in_field(layout.slot_name(provider)));
            };
            match record.slot_mut(provider).as_mut() {
                Some(Value::Bits(bits)) => bits.set_index(sub, value),
                Some(_) => {
                    return Err(
                        Error::new(ErrorKind::TypeMismatch).in_field(layout.slot_name(provider))
                    );
                }
                None => {
                    let mut bits = BitValues::new(bit_layout);
                    bits.set_index(sub, value);
                    record.set_slot(provider, Value::Bits(bits));
                }
            }
        }
    }
    Ok(())
}

fn read_provider(record: &Record, provider: usize, sub: Option<usize>) -> Option<u64> {
    match sub {
        None => record.slot(provider)?.as_unsigned(),
        Some(sub) => record.slot(provider)?.as_bits()?.get_index(sub),
    }
}
