//! Error types and conversions for the HII form interpreter.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

use r_efi::efi;

/// A specialized [`Result`](core::result::Result) type for HII operations.
pub type Result<T> = core::result::Result<T, HiiError>;

/// Errors produced while decoding IFR, evaluating expressions, or talking to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiiError {
    // Decode errors. Any of these leaves the form set unusable.
    /// A record header runs past the end of the buffer.
    TruncatedRecord {
        /// Offset of the record in the opcode buffer.
        offset: usize,
    },
    /// A record declares a length smaller than its header or larger than the remaining buffer.
    InvalidRecordLength {
        /// Offset of the record in the opcode buffer.
        offset: usize,
        /// The declared record length.
        length: usize,
    },
    /// A record payload is shorter than the fields its opcode requires.
    PayloadTooShort {
        /// The opcode tag of the record.
        opcode: u8,
        /// Offset of the record in the opcode buffer.
        offset: usize,
    },
    /// An END record appeared with no open scope, or scopes were still open at the end of the stream.
    UnbalancedScope {
        /// Number of scopes still open, zero when an END underflowed the scope stack.
        open: usize,
    },
    /// A record appeared in a position where it is not allowed.
    UnexpectedOpcode {
        /// The opcode tag of the record.
        opcode: u8,
        /// Offset of the record in the opcode buffer.
        offset: usize,
    },
    /// A question references a storage id that no varstore record declared.
    UnknownStorage(u16),
    /// The stream does not start with a form set record.
    MissingFormSet,
    /// A map expression does not contain an even number of child expressions.
    MalformedMap,
    /// The HII package header is malformed or not a forms package.
    InvalidPackage,

    // Evaluation errors. These abort only the expression being evaluated.
    /// An operator popped from an empty value stack.
    StackUnderflow,
    /// An expression finished with other than exactly one value on the stack.
    StackImbalance {
        /// The number of values remaining on the stack.
        remaining: usize,
    },
    /// Nested rule, map, or default evaluation went deeper than the configured limit.
    RecursionLimit,
    /// An expression referenced a rule that is not defined on the form.
    UnknownRule(u8),

    // Collaborator and lookup errors. These are recoverable.
    /// The requested item was not found.
    NotFound,
    /// The operation is not supported.
    Unsupported,
    /// A parameter was incorrect.
    InvalidParameter,
    /// A buffer was not large enough for the request.
    BufferTooSmall,
    /// A collaborator reported a device failure.
    DeviceError,
    /// Access was denied.
    AccessDenied,
    /// A config string could not be parsed.
    InvalidConfigString,
    /// An allocation failed.
    OutOfResources,
    /// An unknown EFI status code was returned by a collaborator.
    Unknown(efi::Status),
}

impl HiiError {
    /// Converts a collaborator `efi::Status` into a `Result`.
    pub fn status_to_result(status: efi::Status) -> Result<()> {
        match status {
            efi::Status::SUCCESS => Ok(()),
            efi::Status::NOT_FOUND => Err(HiiError::NotFound),
            efi::Status::UNSUPPORTED => Err(HiiError::Unsupported),
            efi::Status::INVALID_PARAMETER => Err(HiiError::InvalidParameter),
            efi::Status::BUFFER_TOO_SMALL => Err(HiiError::BufferTooSmall),
            efi::Status::DEVICE_ERROR => Err(HiiError::DeviceError),
            efi::Status::ACCESS_DENIED => Err(HiiError::AccessDenied),
            efi::Status::OUT_OF_RESOURCES => Err(HiiError::OutOfResources),
            _ => Err(HiiError::Unknown(status)),
        }
    }

    /// Returns true for errors that invalidate a whole form set.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            HiiError::TruncatedRecord { .. }
                | HiiError::InvalidRecordLength { .. }
                | HiiError::PayloadTooShort { .. }
                | HiiError::UnbalancedScope { .. }
                | HiiError::UnexpectedOpcode { .. }
                | HiiError::UnknownStorage(_)
                | HiiError::MissingFormSet
                | HiiError::MalformedMap
                | HiiError::InvalidPackage
        )
    }
}

impl fmt::Display for HiiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HiiError::TruncatedRecord { offset } => write!(f, "truncated IFR record at offset {offset:#x}"),
            HiiError::InvalidRecordLength { offset, length } => {
                write!(f, "invalid IFR record length {length} at offset {offset:#x}")
            }
            HiiError::PayloadTooShort { opcode, offset } => {
                write!(f, "payload of opcode {opcode:#04x} at offset {offset:#x} is too short")
            }
            HiiError::UnbalancedScope { open } => write!(f, "unbalanced IFR scope, {open} scope(s) open"),
            HiiError::UnexpectedOpcode { opcode, offset } => {
                write!(f, "unexpected opcode {opcode:#04x} at offset {offset:#x}")
            }
            HiiError::UnknownStorage(id) => write!(f, "question references unknown varstore {id:#x}"),
            HiiError::MissingFormSet => write!(f, "IFR stream does not begin with a form set"),
            HiiError::MalformedMap => write!(f, "map expression has an unpaired child expression"),
            HiiError::InvalidPackage => write!(f, "invalid HII forms package"),
            HiiError::StackUnderflow => write!(f, "expression stack underflow"),
            HiiError::StackImbalance { remaining } => {
                write!(f, "expression left {remaining} value(s) on the stack, expected 1")
            }
            HiiError::RecursionLimit => write!(f, "expression nesting limit exceeded"),
            HiiError::UnknownRule(id) => write!(f, "rule {id} is not defined on the form"),
            HiiError::NotFound => write!(f, "not found"),
            HiiError::Unsupported => write!(f, "unsupported"),
            HiiError::InvalidParameter => write!(f, "invalid parameter"),
            HiiError::BufferTooSmall => write!(f, "buffer too small"),
            HiiError::DeviceError => write!(f, "device error"),
            HiiError::AccessDenied => write!(f, "access denied"),
            HiiError::InvalidConfigString => write!(f, "malformed config string"),
            HiiError::OutOfResources => write!(f, "out of resources"),
            HiiError::Unknown(status) => write!(f, "unknown status {:#x}", status.as_usize()),
        }
    }
}

impl core::error::Error for HiiError {}

impl From<HiiError> for efi::Status {
    fn from(value: HiiError) -> Self {
        match value {
            HiiError::TruncatedRecord { .. }
            | HiiError::InvalidRecordLength { .. }
            | HiiError::PayloadTooShort { .. }
            | HiiError::UnbalancedScope { .. }
            | HiiError::UnexpectedOpcode { .. }
            | HiiError::MalformedMap
            | HiiError::MissingFormSet => efi::Status::VOLUME_CORRUPTED,
            HiiError::UnknownStorage(_) => efi::Status::NOT_FOUND,
            HiiError::InvalidPackage => efi::Status::INVALID_PARAMETER,
            HiiError::StackUnderflow
            | HiiError::StackImbalance { .. }
            | HiiError::RecursionLimit
            | HiiError::InvalidParameter
            | HiiError::InvalidConfigString => efi::Status::INVALID_PARAMETER,
            HiiError::UnknownRule(_) | HiiError::NotFound => efi::Status::NOT_FOUND,
            HiiError::Unsupported => efi::Status::UNSUPPORTED,
            HiiError::BufferTooSmall => efi::Status::BUFFER_TOO_SMALL,
            HiiError::DeviceError => efi::Status::DEVICE_ERROR,
            HiiError::AccessDenied => efi::Status::ACCESS_DENIED,
            HiiError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            HiiError::Unknown(status) => status,
        }
    }
}

impl From<scroll::Error> for HiiError {
    fn from(_: scroll::Error) -> Self {
        HiiError::BufferTooSmall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_error() {
        assert_eq!(HiiError::status_to_result(efi::Status::SUCCESS), Ok(()));
        assert_eq!(HiiError::status_to_result(efi::Status::NOT_FOUND), Err(HiiError::NotFound));
        let status: efi::Status = HiiError::AccessDenied.into();
        assert_eq!(status, efi::Status::ACCESS_DENIED);
        assert_eq!(
            HiiError::status_to_result(efi::Status::NO_MEDIA),
            Err(HiiError::Unknown(efi::Status::NO_MEDIA))
        );
    }

    #[test]
    fn decode_errors_map_to_volume_corrupted() {
        let status: efi::Status = HiiError::TruncatedRecord { offset: 4 }.into();
        assert_eq!(status, efi::Status::VOLUME_CORRUPTED);
        assert!(HiiError::UnbalancedScope { open: 1 }.is_decode_error());
        assert!(!HiiError::StackUnderflow.is_decode_error());
    }
}
