//! Runtime values and frame instances.
//!
//! A [`Record`] is one instance of a [`Structure`]: a slot per declared
//! field, each either unset or holding a [`Value`]. Callers populate a
//! record before packing; the unpacker returns a fully populated one.
//! Derived fields (lengths, dispatch keys, magic constants) are written
//! into the record when it is packed, so a packed record compares equal to
//! its unpacked image.

use crate::bit::BitValues;
use crate::error::{Error, ErrorKind};
use crate::structure::Structure;

/// One field's value inside a [`Record`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An unsigned integer, also used for bit-record members and dispatch
    /// keys.
    UInt(u64),
    /// A signed integer.
    Int(i64),
    /// A float; single-precision fields narrow on the wire.
    Float(f64),
    /// An opaque byte block or payload.
    Bytes(Vec<u8>),
    /// The members of a bit-record container.
    Bits(BitValues),
    /// A nested structure instance.
    Record(Record),
    /// Elements of a field array.
    Array(Vec<Record>),
}

impl Value {
    /// The unsigned integer, if this is a `UInt`.
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::UInt(value) => Some(*value),
            _ => None,
        }
    }

    /// The signed integer, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The float, if this is a `Float`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// The byte block, if this is `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The bit-record members, if this is `Bits`.
    pub fn as_bits(&self) -> Option<&BitValues> {
        match self {
            Value::Bits(bits) => Some(bits),
            _ => None,
        }
    }

    /// The nested instance, if this is a `Record`.
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    /// The array elements, if this is an `Array`.
    pub fn as_array(&self) -> Option<&[Record]> {
        match self {
            Value::Array(elements) => Some(elements),
            _ => None,
        }
    }

    /// Integer view for unsigned wire fields; accepts a non-negative `Int`.
    pub(crate) fn as_unsigned(&self) -> Option<u64> {
        match self {
            Value::UInt(value) => Some(*value),
            Value::Int(value) if *value >= 0 => Some(*value as u64),
            _ => None,
        }
    }

    /// Integer view for signed wire fields; accepts a small enough `UInt`.
    pub(crate) fn as_signed(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::UInt(value) => i64::try_from(*value).ok(),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($type:ty, $variant:ident) => {
        impl From<$type> for Value {
            fn from(value: $type) -> Self {
                Value::$variant(value.into())
            }
        }
    };
}

value_from!(u8, UInt);
value_from!(u16, UInt);
value_from!(u32, UInt);
value_from!(u64, UInt);
value_from!(i8, Int);
value_from!(i16, Int);
value_from!(i32, Int);
value_from!(i64, Int);
value_from!(f32, Float);
value_from!(f64, Float);
value_from!(Vec<u8>, Bytes);
value_from!(BitValues, Bits);
value_from!(Record, Record);
value_from!(Vec<Record>, Array);

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

/// One instance of a [`Structure`].
#[derive(Debug, Clone)]
pub struct Record {
    layout: Structure,
    slots: Vec<Option<Value>>,
}

impl Record {
    /// An empty instance of `layout`; every field starts unset.
    pub fn new(layout: &Structure) -> Self {
        Self { layout: layout.clone(), slots: vec![None; layout.slot_count()] }
    }

    /// The structure this instance belongs to.
    pub fn layout(&self) -> &Structure {
        &self.layout
    }

    /// Set the field called `name`.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        let index = self
            .layout
            .slot_index(name)
            .ok_or_else(|| Error::new(ErrorKind::UnknownField(name.into())))?;
        self.slots[index] = Some(value.into());
        Ok(())
    }

    /// Chainable [`Self::set`].
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Result<Self, Error> {
        self.set(name, value)?;
        Ok(self)
    }

    /// The field called `name`, if set.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.slots[self.layout.slot_index(name)?].as_ref()
    }

    /// Resolve a dotted path such as `body.items` or `flags.version`,
    /// descending through nested records and bit-record members.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.get(path).cloned(),
            Some((head, rest)) => match self.get(head)? {
                Value::Record(inner) => inner.lookup(rest),
                Value::Bits(bits) if !rest.contains('.') => bits.get(rest).map(Value::UInt),
                _ => None,
            },
        }
    }

    /// Shorthand for [`Self::get`] plus [`Value::as_uint`].
    pub fn uint(&self, name: &str) -> Option<u64> {
        self.get(name)?.as_uint()
    }

    /// Shorthand for [`Self::get`] plus [`Value::as_int`].
    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name)?.as_int()
    }

    /// Shorthand for [`Self::get`] plus [`Value::as_float`].
    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name)?.as_float()
    }

    /// Shorthand for [`Self::get`] plus [`Value::as_bytes`].
    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.get(name)?.as_bytes()
    }

    /// Shorthand for [`Self::get`] plus [`Value::as_bits`].
    pub fn bits(&self, name: &str) -> Option<&BitValues> {
        self.get(name)?.as_bits()
    }

    /// Shorthand for [`Self::get`] plus [`Value::as_record`].
    pub fn record(&self, name: &str) -> Option<&Record> {
        self.get(name)?.as_record()
    }

    /// Shorthand for [`Self::get`] plus [`Value::as_array`].
    pub fn array(&self, name: &str) -> Option<&[Record]> {
        self.get(name)?.as_array()
    }

    pub(crate) fn slot(&self, index: usize) -> Option<&Value> {
        self.slots[index].as_ref()
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut Option<Value> {
        &mut self.slots[index]
    }

    pub(crate) fn set_slot(&mut self, index: usize, value: Value) {
        self.slots[index] = Some(value);
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.layout == other.layout && self.slots == other.slots
    }
}
