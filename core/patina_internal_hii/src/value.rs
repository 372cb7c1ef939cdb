//! HII value model.
//!
//! [`HiiValue`] is the tagged value every question, option, default and expression produces. It mirrors the
//! `EFI_HII_VALUE` union: a type tag plus one of the IFR value kinds.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use core::cmp::Ordering;

use r_efi::efi;

use crate::{
    error::{HiiError, Result},
    services::StringTable,
};

/// Identifier of a string in the form set's string package.
pub type StringId = u16;
/// Identifier of a question, unique within a form set.
pub type QuestionId = u16;
/// Identifier of a form within a form set.
pub type FormId = u16;
/// Identifier of a varstore within a form set.
pub type VarStoreId = u16;
/// Identifier of a default class (default store).
pub type DefaultId = u16;

/// The standard default class.
pub const DEFAULT_CLASS_STANDARD: DefaultId = 0x0000;
/// The manufacturing default class.
pub const DEFAULT_CLASS_MANUFACTURING: DefaultId = 0x0001;

/// Size of a GUID in bytes.
pub const GUID_SIZE: usize = core::mem::size_of::<efi::Guid>();

/// IFR value type tags (`EFI_IFR_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    /// 8 bit unsigned integer.
    U8 = 0x00,
    /// 16 bit unsigned integer.
    U16 = 0x01,
    /// 32 bit unsigned integer.
    U32 = 0x02,
    /// 64 bit unsigned integer.
    U64 = 0x03,
    /// Boolean, stored as one byte.
    Boolean = 0x04,
    /// Hour, minute and second.
    Time = 0x05,
    /// Year, month and day.
    Date = 0x06,
    /// String id into the string package.
    String = 0x07,
    /// A value the parser does not interpret.
    Other = 0x08,
    /// No value.
    Undefined = 0x09,
    /// Cross reference to a question.
    Ref = 0x0A,
    /// Byte buffer of any length.
    Buffer = 0x0B,
    /// String id of an action's configuration request.
    Action = 0x0C,
}

impl ValueType {
    /// Decodes a raw `EFI_IFR_TYPE_*` tag.
    pub fn from_raw(raw: u8) -> Option<ValueType> {
        Some(match raw {
            0x00 => ValueType::U8,
            0x01 => ValueType::U16,
            0x02 => ValueType::U32,
            0x03 => ValueType::U64,
            0x04 => ValueType::Boolean,
            0x05 => ValueType::Time,
            0x06 => ValueType::Date,
            0x07 => ValueType::String,
            0x08 => ValueType::Other,
            0x09 => ValueType::Undefined,
            0x0A => ValueType::Ref,
            0x0B => ValueType::Buffer,
            0x0C => ValueType::Action,
            _ => return None,
        })
    }

    /// Decodes the size field of numeric and one-of flags (`EFI_IFR_NUMERIC_SIZE`).
    pub fn from_numeric_size(flags: u8) -> ValueType {
        match flags & 0x03 {
            0 => ValueType::U8,
            1 => ValueType::U16,
            2 => ValueType::U32,
            _ => ValueType::U64,
        }
    }

    /// The number of bytes a value of this type occupies in storage. Buffers have no fixed width.
    pub fn width(&self) -> usize {
        match self {
            ValueType::U8 | ValueType::Boolean => 1,
            ValueType::U16 | ValueType::String | ValueType::Action => 2,
            ValueType::U32 => 4,
            ValueType::U64 => 8,
            ValueType::Time => 3,
            ValueType::Date => 4,
            ValueType::Ref => HiiRef::SIZE,
            ValueType::Other | ValueType::Undefined | ValueType::Buffer => 0,
        }
    }

    /// True for the fixed width unsigned integer types.
    pub fn is_integer(&self) -> bool {
        matches!(self, ValueType::U8 | ValueType::U16 | ValueType::U32 | ValueType::U64)
    }
}

/// An `EFI_HII_TIME` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HiiTime {
    /// 0-23.
    pub hour: u8,
    /// 0-59.
    pub minute: u8,
    /// 0-59.
    pub second: u8,
}

impl HiiTime {
    fn packed(&self) -> u64 {
        (self.hour as u64) << 16 | (self.minute as u64) << 8 | self.second as u64
    }
}

/// An `EFI_HII_DATE` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HiiDate {
    pub year: u16,
    /// 1-12.
    pub month: u8,
    /// 1-31.
    pub day: u8,
}

impl HiiDate {
    fn packed(&self) -> u64 {
        (self.year as u64) << 16 | (self.month as u64) << 8 | self.day as u64
    }
}

/// An `EFI_HII_REF` value: a cross reference to a question, form and form set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiiRef {
    /// The referenced question, zero for none.
    pub question_id: QuestionId,
    /// The form holding the question.
    pub form_id: FormId,
    /// The form set holding the form. All zero means the current one.
    pub form_set_guid: efi::Guid,
    /// String id of the device path of the driver publishing the form set, zero for the current one.
    pub device_path: StringId,
}

impl HiiRef {
    /// Serialized size of the reference.
    pub const SIZE: usize = 2 + 2 + GUID_SIZE + 2;
}

impl Default for HiiRef {
    fn default() -> Self {
        Self { question_id: 0, form_id: 0, form_set_guid: efi::Guid::from_bytes(&[0; GUID_SIZE]), device_path: 0 }
    }
}

/// A typed HII value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HiiValue {
    /// The result of an operation that could not produce a value.
    #[default]
    Undefined,
    /// True or false.
    Boolean(bool),
    /// 8 bit unsigned integer.
    U8(u8),
    /// 16 bit unsigned integer.
    U16(u16),
    /// 32 bit unsigned integer.
    U32(u32),
    /// 64 bit unsigned integer; the result type of every arithmetic operator.
    U64(u64),
    /// A time of day.
    Time(HiiTime),
    /// A calendar date.
    Date(HiiDate),
    /// A handle into the string table.
    String(StringId),
    /// A cross reference to a question.
    Ref(HiiRef),
    /// An opaque byte buffer, used by ordered lists and buffer conversions.
    Buffer(Vec<u8>),
    /// The configuration request string of an action question.
    Action(StringId),
}

impl HiiValue {
    /// The type tag of the value.
    pub fn value_type(&self) -> ValueType {
        match self {
            HiiValue::Undefined => ValueType::Undefined,
            HiiValue::Boolean(_) => ValueType::Boolean,
            HiiValue::U8(_) => ValueType::U8,
            HiiValue::U16(_) => ValueType::U16,
            HiiValue::U32(_) => ValueType::U32,
            HiiValue::U64(_) => ValueType::U64,
            HiiValue::Time(_) => ValueType::Time,
            HiiValue::Date(_) => ValueType::Date,
            HiiValue::String(_) => ValueType::String,
            HiiValue::Ref(_) => ValueType::Ref,
            HiiValue::Buffer(_) => ValueType::Buffer,
            HiiValue::Action(_) => ValueType::Action,
        }
    }

    /// True when the value is [`HiiValue::Undefined`].
    pub fn is_undefined(&self) -> bool {
        matches!(self, HiiValue::Undefined)
    }

    /// Reduces integers and booleans to a `u64`. Every other kind is not integer-coercible.
    pub fn to_u64(&self) -> Option<u64> {
        match *self {
            HiiValue::Boolean(b) => Some(b as u64),
            HiiValue::U8(v) => Some(v as u64),
            HiiValue::U16(v) => Some(v as u64),
            HiiValue::U32(v) => Some(v as u64),
            HiiValue::U64(v) => Some(v),
            _ => None,
        }
    }

    /// Truthiness used by conditionals: booleans by value, integers when non-zero, everything else false.
    pub fn is_true(&self) -> bool {
        match self {
            HiiValue::Boolean(b) => *b,
            other => other.value_type().is_integer() && other.to_u64().is_some_and(|v| v != 0),
        }
    }

    /// Builds an integer (or boolean) value of `value_type` from `value`, truncating to the type's width.
    pub fn from_u64(value_type: ValueType, value: u64) -> HiiValue {
        match value_type {
            ValueType::U8 => HiiValue::U8(value as u8),
            ValueType::U16 => HiiValue::U16(value as u16),
            ValueType::U32 => HiiValue::U32(value as u32),
            ValueType::U64 => HiiValue::U64(value),
            ValueType::Boolean => HiiValue::Boolean(value != 0),
            ValueType::String => HiiValue::String(value as u16),
            ValueType::Action => HiiValue::Action(value as u16),
            _ => HiiValue::Undefined,
        }
    }

    /// The zero value of `value_type`. Buffers are `width` zero bytes.
    pub fn zero(value_type: ValueType, width: usize) -> HiiValue {
        match value_type {
            ValueType::Time => HiiValue::Time(HiiTime::default()),
            ValueType::Date => HiiValue::Date(HiiDate::default()),
            ValueType::Ref => HiiValue::Ref(HiiRef::default()),
            ValueType::Buffer => HiiValue::Buffer(alloc::vec![0; width]),
            other => HiiValue::from_u64(other, 0),
        }
    }

    /// Re-types an integer or boolean value as the integer type `value_type`. Anything else is returned unchanged.
    pub fn into_type(self, value_type: ValueType) -> HiiValue {
        match self.to_u64() {
            Some(number) if value_type.is_integer() && self.value_type() != value_type => {
                HiiValue::from_u64(value_type, number)
            }
            _ => self,
        }
    }

    /// Decodes a value of `value_type` from its little endian storage representation.
    ///
    /// Buffers take the whole slice. Returns `None` when `bytes` is shorter than the type's width.
    pub fn from_bytes(value_type: ValueType, bytes: &[u8]) -> Option<HiiValue> {
        let width = value_type.width();
        if bytes.len() < width {
            return None;
        }
        let mut raw = [0u8; 8];
        if width <= 8 {
            raw[..width].copy_from_slice(&bytes[..width]);
        }
        let number = u64::from_le_bytes(raw);
        Some(match value_type {
            ValueType::U8 | ValueType::U16 | ValueType::U32 | ValueType::U64 => {
                HiiValue::from_u64(value_type, number)
            }
            ValueType::Boolean => HiiValue::Boolean(bytes[0] != 0),
            ValueType::String => HiiValue::String(number as u16),
            ValueType::Action => HiiValue::Action(number as u16),
            ValueType::Time => HiiValue::Time(HiiTime { hour: bytes[0], minute: bytes[1], second: bytes[2] }),
            ValueType::Date => HiiValue::Date(HiiDate {
                year: u16::from_le_bytes([bytes[0], bytes[1]]),
                month: bytes[2],
                day: bytes[3],
            }),
            ValueType::Ref => {
                let mut guid = [0u8; GUID_SIZE];
                guid.copy_from_slice(&bytes[4..4 + GUID_SIZE]);
                HiiValue::Ref(HiiRef {
                    question_id: u16::from_le_bytes([bytes[0], bytes[1]]),
                    form_id: u16::from_le_bytes([bytes[2], bytes[3]]),
                    form_set_guid: efi::Guid::from_bytes(&guid),
                    device_path: u16::from_le_bytes([bytes[4 + GUID_SIZE], bytes[5 + GUID_SIZE]]),
                })
            }
            ValueType::Buffer => HiiValue::Buffer(bytes.to_vec()),
            ValueType::Other | ValueType::Undefined => HiiValue::Undefined,
        })
    }

    /// Encodes the value into its little endian storage representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            HiiValue::Undefined => Vec::new(),
            HiiValue::Boolean(b) => alloc::vec![*b as u8],
            HiiValue::U8(v) => alloc::vec![*v],
            HiiValue::U16(v) | HiiValue::String(v) | HiiValue::Action(v) => v.to_le_bytes().to_vec(),
            HiiValue::U32(v) => v.to_le_bytes().to_vec(),
            HiiValue::U64(v) => v.to_le_bytes().to_vec(),
            HiiValue::Time(t) => alloc::vec![t.hour, t.minute, t.second],
            HiiValue::Date(d) => {
                let year = d.year.to_le_bytes();
                alloc::vec![year[0], year[1], d.month, d.day]
            }
            HiiValue::Ref(r) => {
                let mut bytes = Vec::with_capacity(HiiRef::SIZE);
                bytes.extend_from_slice(&r.question_id.to_le_bytes());
                bytes.extend_from_slice(&r.form_id.to_le_bytes());
                bytes.extend_from_slice(r.form_set_guid.as_bytes());
                bytes.extend_from_slice(&r.device_path.to_le_bytes());
                bytes
            }
            HiiValue::Buffer(buffer) => buffer.clone(),
        }
    }

    /// Compares two values.
    ///
    /// Integers and booleans compare numerically regardless of width. Buffers compare byte-wise over the common
    /// length, and on an equal shared prefix the longer buffer is greater. Strings compare case-sensitively by
    /// UTF-16 code unit, which needs the string table. Dates and times compare only against their own kind.
    /// Any other pairing is [`HiiError::Unsupported`].
    pub fn compare(&self, other: &HiiValue, strings: &dyn StringTable) -> Result<Ordering> {
        match (self, other) {
            (HiiValue::Buffer(a), HiiValue::Buffer(b)) => {
                let common = a.len().min(b.len());
                Ok(a[..common].cmp(&b[..common]).then(a.len().cmp(&b.len())))
            }
            (HiiValue::String(a), HiiValue::String(b)) => {
                let a = strings.get_string(*a).ok_or(HiiError::NotFound)?;
                let b = strings.get_string(*b).ok_or(HiiError::NotFound)?;
                Ok(a.encode_utf16().cmp(b.encode_utf16()))
            }
            (HiiValue::Date(a), HiiValue::Date(b)) => Ok(a.packed().cmp(&b.packed())),
            (HiiValue::Time(a), HiiValue::Time(b)) => Ok(a.packed().cmp(&b.packed())),
            (a, b) => match (a.to_u64(), b.to_u64()) {
                (Some(a), Some(b)) => Ok(a.cmp(&b)),
                _ => Err(HiiError::Unsupported),
            },
        }
    }
}

/// Reads element `index` of an ordered-list buffer whose elements are `element_type` wide.
pub fn array_element(buffer: &[u8], element_type: ValueType, index: usize) -> Option<u64> {
    let width = element_type.width();
    if width == 0 || width > 8 {
        return None;
    }
    let start = index.checked_mul(width)?;
    let bytes = buffer.get(start..start + width)?;
    let mut raw = [0u8; 8];
    raw[..width].copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

/// Writes element `index` of an ordered-list buffer whose elements are `element_type` wide.
pub fn set_array_element(buffer: &mut [u8], element_type: ValueType, index: usize, value: u64) -> Result<()> {
    let width = element_type.width();
    if width == 0 || width > 8 {
        return Err(HiiError::InvalidParameter);
    }
    let start = index.checked_mul(width).ok_or(HiiError::InvalidParameter)?;
    let slot = buffer.get_mut(start..start + width).ok_or(HiiError::BufferTooSmall)?;
    slot.copy_from_slice(&value.to_le_bytes()[..width]);
    Ok(())
}
