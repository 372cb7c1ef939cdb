//! IFR (Internal Forms Representation) record framing.
//!
//! An IFR stream is a sequence of self-delimiting records. Each record starts with an `EFI_IFR_OP_HEADER`: a
//! one byte opcode, then a byte holding the 7-bit record length (header included) and the scope bit in bit 7.
//! This module splits a buffer into [`Record`]s and provides bounds-checked readers for their payload fields.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{string::String, vec::Vec};

use r_efi::efi;
use scroll::Pread;

use crate::{
    error::{HiiError, Result},
    value::{QuestionId, StringId, VarStoreId, GUID_SIZE},
};

/// Size of `EFI_IFR_OP_HEADER`.
pub const OP_HEADER_SIZE: usize = 2;

/// IFR opcode tags (`EFI_IFR_*_OP`).
pub mod opcode {
    pub const FORM: u8 = 0x01;
    pub const SUBTITLE: u8 = 0x02;
    pub const TEXT: u8 = 0x03;
    pub const IMAGE: u8 = 0x04;
    pub const ONE_OF: u8 = 0x05;
    pub const CHECKBOX: u8 = 0x06;
    pub const NUMERIC: u8 = 0x07;
    pub const PASSWORD: u8 = 0x08;
    pub const ONE_OF_OPTION: u8 = 0x09;
    pub const SUPPRESS_IF: u8 = 0x0A;
    pub const LOCKED: u8 = 0x0B;
    pub const ACTION: u8 = 0x0C;
    pub const RESET_BUTTON: u8 = 0x0D;
    pub const FORM_SET: u8 = 0x0E;
    pub const REF: u8 = 0x0F;
    pub const NO_SUBMIT_IF: u8 = 0x10;
    pub const INCONSISTENT_IF: u8 = 0x11;
    pub const EQ_ID_VAL: u8 = 0x12;
    pub const EQ_ID_ID: u8 = 0x13;
    pub const EQ_ID_VAL_LIST: u8 = 0x14;
    pub const AND: u8 = 0x15;
    pub const OR: u8 = 0x16;
    pub const NOT: u8 = 0x17;
    pub const RULE: u8 = 0x18;
    pub const GRAY_OUT_IF: u8 = 0x19;
    pub const DATE: u8 = 0x1A;
    pub const TIME: u8 = 0x1B;
    pub const STRING: u8 = 0x1C;
    pub const REFRESH: u8 = 0x1D;
    pub const DISABLE_IF: u8 = 0x1E;
    pub const ANIMATION: u8 = 0x1F;
    pub const TO_LOWER: u8 = 0x20;
    pub const TO_UPPER: u8 = 0x21;
    pub const MAP: u8 = 0x22;
    pub const ORDERED_LIST: u8 = 0x23;
    pub const VARSTORE: u8 = 0x24;
    pub const VARSTORE_NAME_VALUE: u8 = 0x25;
    pub const VARSTORE_EFI: u8 = 0x26;
    pub const VARSTORE_DEVICE: u8 = 0x27;
    pub const VERSION: u8 = 0x28;
    pub const END: u8 = 0x29;
    pub const MATCH: u8 = 0x2A;
    pub const GET: u8 = 0x2B;
    pub const SET: u8 = 0x2C;
    pub const READ: u8 = 0x2D;
    pub const WRITE: u8 = 0x2E;
    pub const EQUAL: u8 = 0x2F;
    pub const NOT_EQUAL: u8 = 0x30;
    pub const GREATER_THAN: u8 = 0x31;
    pub const GREATER_EQUAL: u8 = 0x32;
    pub const LESS_THAN: u8 = 0x33;
    pub const LESS_EQUAL: u8 = 0x34;
    pub const BITWISE_AND: u8 = 0x35;
    pub const BITWISE_OR: u8 = 0x36;
    pub const BITWISE_NOT: u8 = 0x37;
    pub const SHIFT_LEFT: u8 = 0x38;
    pub const SHIFT_RIGHT: u8 = 0x39;
    pub const ADD: u8 = 0x3A;
    pub const SUBTRACT: u8 = 0x3B;
    pub const MULTIPLY: u8 = 0x3C;
    pub const DIVIDE: u8 = 0x3D;
    pub const MODULO: u8 = 0x3E;
    pub const RULE_REF: u8 = 0x3F;
    pub const QUESTION_REF1: u8 = 0x40;
    pub const QUESTION_REF2: u8 = 0x41;
    pub const UINT8: u8 = 0x42;
    pub const UINT16: u8 = 0x43;
    pub const UINT32: u8 = 0x44;
    pub const UINT64: u8 = 0x45;
    pub const TRUE: u8 = 0x46;
    pub const FALSE: u8 = 0x47;
    pub const TO_UINT: u8 = 0x48;
    pub const TO_STRING: u8 = 0x49;
    pub const TO_BOOLEAN: u8 = 0x4A;
    pub const MID: u8 = 0x4B;
    pub const FIND: u8 = 0x4C;
    pub const TOKEN: u8 = 0x4D;
    pub const STRING_REF1: u8 = 0x4E;
    pub const STRING_REF2: u8 = 0x4F;
    pub const CONDITIONAL: u8 = 0x50;
    pub const QUESTION_REF3: u8 = 0x51;
    pub const ZERO: u8 = 0x52;
    pub const ONE: u8 = 0x53;
    pub const ONES: u8 = 0x54;
    pub const UNDEFINED: u8 = 0x55;
    pub const LENGTH: u8 = 0x56;
    pub const DUP: u8 = 0x57;
    pub const THIS: u8 = 0x58;
    pub const SPAN: u8 = 0x59;
    pub const VALUE: u8 = 0x5A;
    pub const DEFAULT: u8 = 0x5B;
    pub const DEFAULTSTORE: u8 = 0x5C;
    pub const FORM_MAP: u8 = 0x5D;
    pub const CATENATE: u8 = 0x5E;
    pub const GUID: u8 = 0x5F;
    pub const SECURITY: u8 = 0x60;
    pub const MODAL_TAG: u8 = 0x61;
    pub const REFRESH_ID: u8 = 0x62;
    pub const WARNING_IF: u8 = 0x63;
    pub const MATCH2: u8 = 0x64;
}

/// The highest opcode this implementation understands. Anything above is skipped.
pub const MAX_KNOWN_OPCODE: u8 = opcode::MATCH2;

/// Question header flags (`EFI_IFR_FLAG_*`).
pub mod question_flags {
    pub const READ_ONLY: u8 = 0x01;
    pub const CALLBACK: u8 = 0x04;
    pub const RESET_REQUIRED: u8 = 0x10;
    pub const RECONNECT_REQUIRED: u8 = 0x40;
    pub const OPTIONS_ONLY: u8 = 0x80;
}

/// Returns true for opcodes that belong inside an expression.
pub fn is_expression_opcode(op: u8) -> bool {
    (opcode::EQ_ID_VAL..=opcode::NOT).contains(&op)
        || (opcode::MATCH..=opcode::SET).contains(&op)
        || (opcode::EQUAL..=opcode::SPAN).contains(&op)
        || matches!(
            op,
            opcode::CATENATE
                | opcode::TO_LOWER
                | opcode::TO_UPPER
                | opcode::MAP
                | opcode::VERSION
                | opcode::SECURITY
                | opcode::MATCH2
        )
}

/// Returns true for opcodes that open a statement or question.
pub fn is_statement_opcode(op: u8) -> bool {
    matches!(
        op,
        opcode::SUBTITLE
            | opcode::TEXT
            | opcode::RESET_BUTTON
            | opcode::ACTION
            | opcode::REF
            | opcode::CHECKBOX
            | opcode::NUMERIC
            | opcode::ONE_OF
            | opcode::ORDERED_LIST
            | opcode::STRING
            | opcode::PASSWORD
            | opcode::DATE
            | opcode::TIME
    )
}

/// One IFR record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    /// The opcode tag.
    pub opcode: u8,
    /// True if the record opens a scope closed by a later `END` record.
    pub scope: bool,
    /// Offset of the record within the opcode buffer.
    pub offset: usize,
    bytes: &'a [u8],
}

impl<'a> Record<'a> {
    /// The record bytes, header included.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The record payload following the op header.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[OP_HEADER_SIZE..]
    }

    /// A reader positioned at the start of the payload.
    pub fn reader(&self) -> PayloadReader<'a> {
        PayloadReader { opcode: self.opcode, record_offset: self.offset, payload: self.payload(), offset: 0 }
    }
}

/// Splits an IFR buffer into records.
pub struct RecordIter<'a> {
    buffer: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> RecordIter<'a> {
    /// Creates an iterator over the records in `buffer`.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0, failed: false }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buffer.len() {
            return None;
        }
        let offset = self.offset;
        let remaining = &self.buffer[offset..];
        if remaining.len() < OP_HEADER_SIZE {
            self.failed = true;
            return Some(Err(HiiError::TruncatedRecord { offset }));
        }
        let length = (remaining[1] & 0x7F) as usize;
        if length < OP_HEADER_SIZE || length > remaining.len() {
            self.failed = true;
            return Some(Err(HiiError::InvalidRecordLength { offset, length }));
        }
        self.offset += length;
        Some(Ok(Record { opcode: remaining[0], scope: remaining[1] & 0x80 != 0, offset, bytes: &remaining[..length] }))
    }
}

/// Bounds-checked little endian reader over a record payload.
pub struct PayloadReader<'a> {
    opcode: u8,
    record_offset: usize,
    payload: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    fn too_short(&self) -> HiiError {
        HiiError::PayloadTooShort { opcode: self.opcode, offset: self.record_offset }
    }

    pub fn u8(&mut self) -> Result<u8> {
        let opcode_err = self.too_short();
        self.payload.gread_with::<u8>(&mut self.offset, scroll::LE).map_err(|_| opcode_err)
    }

    pub fn u16(&mut self) -> Result<u16> {
        let opcode_err = self.too_short();
        self.payload.gread_with::<u16>(&mut self.offset, scroll::LE).map_err(|_| opcode_err)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let opcode_err = self.too_short();
        self.payload.gread_with::<u32>(&mut self.offset, scroll::LE).map_err(|_| opcode_err)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let opcode_err = self.too_short();
        self.payload.gread_with::<u64>(&mut self.offset, scroll::LE).map_err(|_| opcode_err)
    }

    /// Reads `len` raw bytes.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let payload = self.payload;
        let end = self.offset.checked_add(len).ok_or_else(|| self.too_short())?;
        let bytes = payload.get(self.offset..end).ok_or_else(|| self.too_short())?;
        self.offset = end;
        Ok(bytes)
    }

    /// Reads an `EFI_GUID`.
    pub fn guid(&mut self) -> Result<efi::Guid> {
        let bytes: [u8; GUID_SIZE] = self.bytes(GUID_SIZE)?.try_into().map_err(|_| self.too_short())?;
        Ok(efi::Guid::from_bytes(&bytes))
    }

    /// Reads a NUL terminated ASCII string; the terminator is optional at the end of the payload.
    pub fn ascii_string(&mut self) -> Result<String> {
        let payload = self.payload;
        let rest = &payload[self.offset..];
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let text = rest[..len].iter().map(|&b| b as char).collect();
        self.offset += (len + 1).min(rest.len());
        Ok(text)
    }

    /// Reads everything left in the payload.
    pub fn rest(&mut self) -> &'a [u8] {
        let payload = self.payload;
        let rest = &payload[self.offset..];
        self.offset = self.payload.len();
        rest
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }
}

/// `EFI_IFR_STATEMENT_HEADER`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementHeader {
    pub prompt: StringId,
    pub help: StringId,
}

impl StatementHeader {
    pub fn read(reader: &mut PayloadReader<'_>) -> Result<Self> {
        Ok(Self { prompt: reader.u16()?, help: reader.u16()? })
    }
}

/// `EFI_IFR_QUESTION_HEADER`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuestionHeader {
    pub statement: StatementHeader,
    pub question_id: QuestionId,
    pub var_store_id: VarStoreId,
    /// Either the byte offset into a buffer varstore or the string id naming a name/value or variable entry.
    pub var_store_info: u16,
    pub flags: u8,
}

impl QuestionHeader {
    pub fn read(reader: &mut PayloadReader<'_>) -> Result<Self> {
        Ok(Self {
            statement: StatementHeader::read(reader)?,
            question_id: reader.u16()?,
            var_store_id: reader.u16()?,
            var_store_info: reader.u16()?,
            flags: reader.u8()?,
        })
    }
}

/// Encodes a record header for `opcode` with the given payload length.
pub fn encode_header(opcode: u8, payload_len: usize, scope: bool) -> [u8; OP_HEADER_SIZE] {
    let length = ((payload_len + OP_HEADER_SIZE) as u8) & 0x7F;
    [opcode, length | if scope { 0x80 } else { 0 }]
}

/// Builds a complete record, used by tests and tooling that synthesize IFR.
pub fn encode_record(opcode: u8, payload: &[u8], scope: bool) -> Vec<u8> {
    let mut record = encode_header(opcode, payload.len(), scope).to_vec();
    record.extend_from_slice(payload);
    record
}
