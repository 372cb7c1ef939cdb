//! IFR expressions.
//!
//! An [`Expression`] is an ordered postfix list of [`ExpressionOpcode`]s plus the cached result of its last
//! evaluation. The parser builds the lists; [`ExpressionTree::from_expression`] converts one into an owned operator
//! tree for dependency analysis.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{rc::Rc, vec::Vec};
use core::cell::RefCell;

use r_efi::efi;

use crate::{
    error::{HiiError, Result},
    ifr::{opcode, Record},
    value::{HiiValue, QuestionId, StringId, ValueType, VarStoreId},
};

/// `TO_STRING` / `FIND` / `SPAN` format and flag values.
pub mod format {
    pub const STRING_UNSIGNED_DEC: u8 = 0x00;
    pub const STRING_SIGNED_DEC: u8 = 0x01;
    pub const STRING_LOWERCASE_HEX: u8 = 0x02;
    pub const STRING_UPPERCASE_HEX: u8 = 0x03;
    pub const STRING_ASCII: u8 = 0x00;
    pub const STRING_UNICODE: u8 = 0x08;
    pub const FF_CASE_SENSITIVE: u8 = 0x00;
    pub const FF_CASE_INSENSITIVE: u8 = 0x01;
    pub const FLAGS_FIRST_MATCHING: u8 = 0x00;
    pub const FLAGS_FIRST_NON_MATCHING: u8 = 0x01;
}

/// A storage location addressed by `GET` and `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarAccess {
    pub var_store_id: VarStoreId,
    /// Byte offset for buffer storage, string id of the name otherwise.
    pub var_store_info: u16,
    pub value_type: ValueType,
}

/// One (match, result) pair of a `MAP` expression.
#[derive(Debug)]
pub struct MapPair {
    pub match_expression: Expression,
    pub result_expression: Expression,
}

/// A typed expression opcode.
///
/// Operands are popped in reverse push order; the last pushed operand is the top of the stack.
#[derive(Debug)]
pub enum ExpressionOpcode {
    /// Pushes an 8 bit unsigned integer.
    Uint8(u8),
    /// Pushes a 16 bit unsigned integer.
    Uint16(u16),
    /// Pushes a 32 bit unsigned integer.
    Uint32(u32),
    /// Pushes a 64 bit unsigned integer.
    Uint64(u64),
    /// Pushes a true value.
    True,
    /// Pushes a false value.
    False,
    /// Pushes 8 bit zero.
    Zero,
    /// Pushes 8 bit one.
    One,
    /// Pushes a 64 bit value with every bit set.
    Ones,
    /// Pushes undefined, which ends the evaluation.
    Undefined,
    /// Pushes the supported IFR version as a 16 bit integer.
    Version,
    /// Pushes a string id.
    StringRef1(StringId),

    /// Pushes whether a question's value equals a 16 bit constant.
    EqIdVal {
        /// The question to read.
        question_id: QuestionId,
        /// The constant to compare with.
        value: u16,
    },
    /// Pushes whether the values of two questions are equal.
    EqIdId {
        /// The first question to read.
        question_id_1: QuestionId,
        /// The second question to read.
        question_id_2: QuestionId,
    },
    /// Pushes whether a question's value equals any entry of a list.
    EqIdValList {
        /// The question to read.
        question_id: QuestionId,
        /// The candidate values.
        values: Vec<u16>,
    },
    /// Pushes the value of a question.
    QuestionRef1(QuestionId),
    /// Pops a question id and pushes that question's value.
    QuestionRef2,
    /// Pops a question id and pushes that question's value, if it lives in this form set.
    QuestionRef3 {
        /// Device path string naming the form set's driver. Zero or absent means this one.
        device_path: Option<StringId>,
        /// The form set holding the question. Absent means this one.
        form_set_guid: Option<efi::Guid>,
    },
    /// The question that owns the expression, resolved while parsing.
    This(QuestionId),
    /// Evaluates a form-local rule and pushes its result.
    RuleRef(u8),
    /// Pushes a value read from a storage.
    Get(VarAccess),
    /// Pops a value, writes it to a storage and pushes whether the write succeeded.
    Set(VarAccess),
    /// Pushes whether the user holds the permission named by the GUID.
    Security(efi::Guid),
    /// Pushes a copy of the top of the stack.
    Dup,

    /// Logical NOT of a boolean.
    Not,
    /// Bitwise NOT of an integer, as 64 bits.
    BitwiseNot,
    /// Length of a string in characters or of a buffer in bytes.
    Length,
    /// Converts an integer, string or buffer to a boolean.
    ToBoolean,
    /// Converts a boolean, string or buffer to a 64 bit integer.
    ToUint,
    /// Converts a value to a new string, formatted per [`format`].
    ToString(u8),
    /// Lowercases a string.
    ToLower,
    /// Uppercases a string.
    ToUpper,
    /// Pops a string id and pushes it back if the string exists.
    StringRef2,

    /// Logical AND of two booleans.
    And,
    /// Logical OR of two booleans.
    Or,
    /// Pushes whether the two operands are equal.
    Equal,
    /// Pushes whether the two operands differ.
    NotEqual,
    /// Pushes whether the lower operand is greater than the top one.
    GreaterThan,
    /// Pushes whether the lower operand is at least the top one.
    GreaterEqual,
    /// Pushes whether the lower operand is less than the top one.
    LessThan,
    /// Pushes whether the lower operand is at most the top one.
    LessEqual,
    /// Bitwise AND of two integers.
    BitwiseAnd,
    /// Bitwise OR of two integers.
    BitwiseOr,
    /// Shifts the lower operand left by the top one.
    ShiftLeft,
    /// Shifts the lower operand right by the top one.
    ShiftRight,
    /// Wrapping 64 bit addition.
    Add,
    /// Wrapping 64 bit subtraction.
    Subtract,
    /// Wrapping 64 bit multiplication.
    Multiply,
    /// Integer division. Division by zero is undefined.
    Divide,
    /// Integer remainder. Division by zero is undefined.
    Modulo,
    /// Joins two strings or two buffers.
    Catenate,
    /// Matches a string against a pattern with the text matcher. The string is the top operand.
    Match,
    /// Matches a string against a regular expression of the syntax named by the GUID.
    Match2(efi::Guid),

    /// Pops the true value, the false value and then the condition, and pushes the selected value.
    Conditional,
    /// Pushes the part of a string or buffer given by a start and a length.
    Mid,
    /// Pushes the index of a substring at or after a start index, using the given [`format`] flags.
    Find(u8),
    /// Pushes the n-th token of a string split on a set of delimiters.
    Token,
    /// Pushes the index of the first character at or after a start index that does (or does not) fall in the
    /// given character ranges.
    Span(u8),

    /// Table lookup. Pops a key and evaluates the result of the first pair whose match expression equals it.
    Map(Vec<MapPair>),
}

impl ExpressionOpcode {
    /// Decodes an expression record. `this` is the question that encloses the record, if any.
    ///
    /// `MAP` decodes to an empty table; the parser fills in the pairs when the map scope closes.
    pub fn decode(record: &Record<'_>, this: Option<QuestionId>) -> Result<Self> {
        let mut reader = record.reader();
        Ok(match record.opcode {
            opcode::UINT8 => Self::Uint8(reader.u8()?),
            opcode::UINT16 => Self::Uint16(reader.u16()?),
            opcode::UINT32 => Self::Uint32(reader.u32()?),
            opcode::UINT64 => Self::Uint64(reader.u64()?),
            opcode::TRUE => Self::True,
            opcode::FALSE => Self::False,
            opcode::ZERO => Self::Zero,
            opcode::ONE => Self::One,
            opcode::ONES => Self::Ones,
            opcode::UNDEFINED => Self::Undefined,
            opcode::VERSION => Self::Version,
            opcode::STRING_REF1 => Self::StringRef1(reader.u16()?),
            opcode::EQ_ID_VAL => Self::EqIdVal { question_id: reader.u16()?, value: reader.u16()? },
            opcode::EQ_ID_ID => Self::EqIdId { question_id_1: reader.u16()?, question_id_2: reader.u16()? },
            opcode::EQ_ID_VAL_LIST => {
                let question_id = reader.u16()?;
                let count = reader.u16()?;
                let values = (0..count).map(|_| reader.u16()).collect::<Result<Vec<_>>>()?;
                Self::EqIdValList { question_id, values }
            }
            opcode::QUESTION_REF1 => Self::QuestionRef1(reader.u16()?),
            opcode::QUESTION_REF2 => Self::QuestionRef2,
            opcode::QUESTION_REF3 => {
                let device_path = if reader.remaining() >= 2 { Some(reader.u16()?) } else { None };
                let form_set_guid = if reader.remaining() > 0 { Some(reader.guid()?) } else { None };
                Self::QuestionRef3 { device_path, form_set_guid }
            }
            opcode::THIS => Self::This(this.unwrap_or(0)),
            opcode::RULE_REF => Self::RuleRef(reader.u8()?),
            opcode::GET | opcode::SET => {
                let var_store_id = reader.u16()?;
                let var_store_info = reader.u16()?;
                let raw_type = reader.u8()?;
                let value_type = ValueType::from_raw(raw_type)
                    .ok_or(HiiError::UnexpectedOpcode { opcode: record.opcode, offset: record.offset })?;
                let access = VarAccess { var_store_id, var_store_info, value_type };
                if record.opcode == opcode::GET {
                    Self::Get(access)
                } else {
                    Self::Set(access)
                }
            }
            opcode::SECURITY => Self::Security(reader.guid()?),
            opcode::DUP => Self::Dup,
            opcode::NOT => Self::Not,
            opcode::BITWISE_NOT => Self::BitwiseNot,
            opcode::LENGTH => Self::Length,
            opcode::TO_BOOLEAN => Self::ToBoolean,
            opcode::TO_UINT => Self::ToUint,
            opcode::TO_STRING => Self::ToString(reader.u8()?),
            opcode::TO_LOWER => Self::ToLower,
            opcode::TO_UPPER => Self::ToUpper,
            opcode::STRING_REF2 => Self::StringRef2,
            opcode::AND => Self::And,
            opcode::OR => Self::Or,
            opcode::EQUAL => Self::Equal,
            opcode::NOT_EQUAL => Self::NotEqual,
            opcode::GREATER_THAN => Self::GreaterThan,
            opcode::GREATER_EQUAL => Self::GreaterEqual,
            opcode::LESS_THAN => Self::LessThan,
            opcode::LESS_EQUAL => Self::LessEqual,
            opcode::BITWISE_AND => Self::BitwiseAnd,
            opcode::BITWISE_OR => Self::BitwiseOr,
            opcode::SHIFT_LEFT => Self::ShiftLeft,
            opcode::SHIFT_RIGHT => Self::ShiftRight,
            opcode::ADD => Self::Add,
            opcode::SUBTRACT => Self::Subtract,
            opcode::MULTIPLY => Self::Multiply,
            opcode::DIVIDE => Self::Divide,
            opcode::MODULO => Self::Modulo,
            opcode::CATENATE => Self::Catenate,
            opcode::MATCH => Self::Match,
            opcode::MATCH2 => Self::Match2(reader.guid()?),
            opcode::CONDITIONAL => Self::Conditional,
            opcode::MID => Self::Mid,
            opcode::FIND => Self::Find(reader.u8()?),
            opcode::TOKEN => Self::Token,
            opcode::SPAN => Self::Span(reader.u8()?),
            opcode::MAP => Self::Map(Vec::new()),
            other => return Err(HiiError::UnexpectedOpcode { opcode: other, offset: record.offset }),
        })
    }

    /// Number of operands the opcode pops.
    pub fn arity(&self) -> usize {
        match self {
            Self::Uint8(_)
            | Self::Uint16(_)
            | Self::Uint32(_)
            | Self::Uint64(_)
            | Self::True
            | Self::False
            | Self::Zero
            | Self::One
            | Self::Ones
            | Self::Undefined
            | Self::Version
            | Self::StringRef1(_)
            | Self::EqIdVal { .. }
            | Self::EqIdId { .. }
            | Self::EqIdValList { .. }
            | Self::QuestionRef1(_)
            | Self::This(_)
            | Self::RuleRef(_)
            | Self::Get(_)
            | Self::Security(_)
            | Self::Dup => 0,
            Self::QuestionRef2
            | Self::QuestionRef3 { .. }
            | Self::Set(_)
            | Self::Not
            | Self::BitwiseNot
            | Self::Length
            | Self::ToBoolean
            | Self::ToUint
            | Self::ToString(_)
            | Self::ToLower
            | Self::ToUpper
            | Self::StringRef2
            | Self::Map(_) => 1,
            Self::And
            | Self::Or
            | Self::Equal
            | Self::NotEqual
            | Self::GreaterThan
            | Self::GreaterEqual
            | Self::LessThan
            | Self::LessEqual
            | Self::BitwiseAnd
            | Self::BitwiseOr
            | Self::ShiftLeft
            | Self::ShiftRight
            | Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::Divide
            | Self::Modulo
            | Self::Catenate
            | Self::Match
            | Self::Match2(_) => 2,
            Self::Conditional | Self::Mid | Self::Find(_) | Self::Token | Self::Span(_) => 3,
        }
    }
}

/// What an expression is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionKind {
    SuppressIf,
    GrayOutIf,
    DisableIf,
    NoSubmitIf { error: StringId },
    InconsistentIf { error: StringId },
    WarningIf { warning: StringId, timeout: u8 },
    /// Computes a question's value (`EFI_IFR_VALUE`), or a default when nested in `EFI_IFR_DEFAULT`.
    Value,
    Read,
    Write,
    Rule(u8),
    /// A child of a `MAP` table.
    MapChild,
}

/// A postfix expression and the result of its last evaluation.
#[derive(Debug)]
pub struct Expression {
    pub kind: ExpressionKind,
    pub opcodes: Vec<ExpressionOpcode>,
    result: RefCell<HiiValue>,
}

/// Shared handle to an expression. Conditionals are shared by every statement in their scope.
pub type ExpressionRef = Rc<Expression>;

impl Expression {
    /// Creates an empty expression of `kind`.
    pub fn new(kind: ExpressionKind) -> Self {
        Self { kind, opcodes: Vec::new(), result: RefCell::new(HiiValue::Undefined) }
    }

    /// Creates an expression from an opcode list.
    pub fn with_opcodes(kind: ExpressionKind, opcodes: Vec<ExpressionOpcode>) -> Self {
        Self { kind, opcodes, result: RefCell::new(HiiValue::Undefined) }
    }

    /// The result of the last evaluation, or undefined if the expression has not been evaluated.
    pub fn result(&self) -> HiiValue {
        self.result.borrow().clone()
    }

    /// Caches `value` as the result of the last evaluation.
    pub fn set_result(&self, value: HiiValue) {
        *self.result.borrow_mut() = value;
    }

    /// The rule id, for rule expressions.
    pub fn rule_id(&self) -> Option<u8> {
        match self.kind {
            ExpressionKind::Rule(id) => Some(id),
            _ => None,
        }
    }
}

/// A node of an operator tree built from a postfix expression.
#[derive(Debug)]
pub struct ExpressionTree<'a> {
    pub opcode: &'a ExpressionOpcode,
    pub operands: Vec<ExpressionTree<'a>>,
}

impl<'a> Clone for ExpressionTree<'a> {
    fn clone(&self) -> Self {
        Self { opcode: self.opcode, operands: self.operands.clone() }
    }
}

impl<'a> ExpressionTree<'a> {
    /// Converts the postfix list of `expression` into a tree.
    ///
    /// Fails with [`HiiError::StackUnderflow`] if an operator lacks operands and with
    /// [`HiiError::StackImbalance`] if the list does not reduce to exactly one tree.
    pub fn from_expression(expression: &'a Expression) -> Result<Self> {
        let mut stack: Vec<ExpressionTree<'a>> = Vec::new();
        for opcode in &expression.opcodes {
            if let ExpressionOpcode::Dup = opcode {
                let top = stack.last().cloned().ok_or(HiiError::StackUnderflow)?;
                stack.push(top);
                continue;
            }
            let arity = opcode.arity();
            if stack.len() < arity {
                return Err(HiiError::StackUnderflow);
            }
            let operands = stack.split_off(stack.len() - arity);
            stack.push(ExpressionTree { opcode, operands });
        }
        if stack.len() != 1 {
            return Err(HiiError::StackImbalance { remaining: stack.len() });
        }
        stack.pop().ok_or(HiiError::StackUnderflow)
    }

    /// Depth of the tree, a leaf being depth one.
    pub fn depth(&self) -> usize {
        1 + self.operands.iter().map(ExpressionTree::depth).max().unwrap_or(0)
    }

    /// Question ids whose values the expression reads, sorted and without duplicates.
    ///
    /// Questions addressed dynamically (`QUESTION_REF2`/`QUESTION_REF3`) cannot be resolved statically and are not
    /// reported.
    pub fn question_dependencies(&self) -> Vec<QuestionId> {
        let mut ids = Vec::new();
        self.collect(&mut ids, &mut Vec::new());
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Rule ids the expression references, sorted and without duplicates.
    pub fn rule_dependencies(&self) -> Vec<u8> {
        let mut rules = Vec::new();
        self.collect(&mut Vec::new(), &mut rules);
        rules.sort_unstable();
        rules.dedup();
        rules
    }

    fn collect(&self, ids: &mut Vec<QuestionId>, rules: &mut Vec<u8>) {
        match self.opcode {
            ExpressionOpcode::EqIdVal { question_id, .. }
            | ExpressionOpcode::EqIdValList { question_id, .. }
            | ExpressionOpcode::QuestionRef1(question_id) => ids.push(*question_id),
            ExpressionOpcode::This(question_id) if *question_id != 0 => ids.push(*question_id),
            ExpressionOpcode::EqIdId { question_id_1, question_id_2 } => {
                ids.push(*question_id_1);
                ids.push(*question_id_2);
            }
            ExpressionOpcode::RuleRef(rule) => rules.push(*rule),
            ExpressionOpcode::Map(pairs) => {
                for pair in pairs {
                    for child in [&pair.match_expression, &pair.result_expression] {
                        if let Ok(node) = ExpressionTree::from_expression(child) {
                            node.collect(ids, rules);
                        }
                    }
                }
            }
            _ => {}
        }
        for operand in &self.operands {
            operand.collect(ids, rules);
        }
    }
}
