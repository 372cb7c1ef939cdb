//! IFR expression evaluator.
//!
//! Runs the postfix opcode list of an [`Expression`] on a value stack and produces one [`HiiValue`]. Every call
//! gets its own stack, so rules, map children and default expressions evaluated from inside another expression
//! never see the caller's operands.
//!
//! Type mismatches and failing collaborators make an operator produce [`HiiValue::Undefined`], which ends the
//! evaluation with an undefined result. Stack underflow, an unbalanced stack and runaway recursion are errors.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::cmp::Ordering;

use crate::{
    config_string,
    error::{HiiError, Result},
    expression::{format, Expression, ExpressionOpcode, VarAccess},
    form::FormSet,
    services::HiiServices,
    stack::Stack,
    storage::StorageKind,
    value::{HiiValue, QuestionId, ValueType},
};

/// Value pushed by `VERSION`: UEFI 2.70.
pub const IFR_SPECIFICATION_VERSION: u16 = 0x0270;

/// Index returned by `FIND` when the substring does not occur.
pub const NOT_FOUND: u64 = u64::MAX;

/// Evaluates `expression` in the context of `form` and caches the result on the expression.
///
/// `form` is the index of the form the expression belongs to; it is searched first for question references and
/// is the only place rules are looked up. Expressions stored in the form set must be cloned out (they are
/// [`ExpressionRef`](crate::expression::ExpressionRef)s) before being passed here alongside `form_set`.
pub fn evaluate_expression(
    form_set: &mut FormSet,
    form: Option<usize>,
    expression: &Expression,
    services: &HiiServices<'_>,
) -> Result<HiiValue> {
    Evaluator { form_set, form, services, depth: 0 }.evaluate(expression)
}

/// Evaluates the `VALUE` expression of a question, if it has one, and stores the result as the question's value.
pub fn evaluate_value_expression(
    form_set: &mut FormSet,
    form: usize,
    statement: usize,
    services: &HiiServices<'_>,
) -> Result<Option<HiiValue>> {
    let question = form_set.forms.get(form).and_then(|f| f.statements.get(statement)).ok_or(HiiError::NotFound)?;
    let Some(expression) = question.value_expression.clone() else {
        return Ok(None);
    };
    let value_type = question.value_type;
    let value = evaluate_expression(form_set, Some(form), &expression, services)?.into_type(value_type);
    if !value.is_undefined() {
        form_set.forms[form].statements[statement].value = value.clone();
    }
    Ok(Some(value))
}

struct Evaluator<'f, 's> {
    form_set: &'f mut FormSet,
    form: Option<usize>,
    services: &'f HiiServices<'s>,
    depth: usize,
}

impl Evaluator<'_, '_> {
    fn evaluate(&mut self, expression: &Expression) -> Result<HiiValue> {
        if self.depth >= self.form_set.config.max_recursion_depth {
            log::warn!(target: "hii_eval", "expression nesting exceeds {}", self.form_set.config.max_recursion_depth);
            return Err(HiiError::RecursionLimit);
        }
        self.depth += 1;
        let result = self.run(expression);
        self.depth -= 1;
        match &result {
            Ok(value) => expression.set_result(value.clone()),
            Err(err) => {
                log::warn!(target: "hii_eval", "{:?} expression failed: {err}", expression.kind);
                expression.set_result(HiiValue::Undefined);
            }
        }
        result
    }

    fn run(&mut self, expression: &Expression) -> Result<HiiValue> {
        let mut stack = Stack::with_capacity(self.form_set.config.stack_size_increment);
        for opcode in &expression.opcodes {
            let value = self.execute(opcode, &mut stack)?;
            log::trace!(target: "hii_eval", "{opcode:?} => {value:?}, stack {stack:?}");
            if value.is_undefined() {
                return Ok(HiiValue::Undefined);
            }
            stack.push(value)?;
        }
        match stack.len() {
            1 => stack.pop(),
            remaining => Err(HiiError::StackImbalance { remaining }),
        }
    }

    fn execute(&mut self, opcode: &ExpressionOpcode, stack: &mut Stack<HiiValue>) -> Result<HiiValue> {
        use ExpressionOpcode as Op;

        Ok(match opcode {
            Op::Uint8(value) => HiiValue::U8(*value),
            Op::Uint16(value) => HiiValue::U16(*value),
            Op::Uint32(value) => HiiValue::U32(*value),
            Op::Uint64(value) => HiiValue::U64(*value),
            Op::True => HiiValue::Boolean(true),
            Op::False => HiiValue::Boolean(false),
            Op::Zero => HiiValue::U8(0),
            Op::One => HiiValue::U8(1),
            Op::Ones => HiiValue::U64(u64::MAX),
            Op::Undefined => HiiValue::Undefined,
            Op::Version => HiiValue::U16(IFR_SPECIFICATION_VERSION),
            Op::StringRef1(id) => HiiValue::String(*id),

            Op::EqIdVal { question_id, value } => {
                let question = self.question(*question_id);
                self.equals(&question, &HiiValue::U16(*value))
            }
            Op::EqIdId { question_id_1, question_id_2 } => {
                let first = self.question(*question_id_1);
                let second = self.question(*question_id_2);
                self.equals(&first, &second)
            }
            Op::EqIdValList { question_id, values } => {
                let question = self.question(*question_id);
                if question.is_undefined() {
                    return Ok(HiiValue::Undefined);
                }
                let found =
                    values.iter().any(|value| self.equals(&question, &HiiValue::U16(*value)) == HiiValue::Boolean(true));
                HiiValue::Boolean(found)
            }
            Op::QuestionRef1(question_id) | Op::This(question_id) => self.question(*question_id),
            Op::QuestionRef2 => match stack.pop()?.to_u64() {
                Some(question_id) => self.question(question_id as QuestionId),
                None => HiiValue::Undefined,
            },
            Op::QuestionRef3 { device_path, form_set_guid } => {
                let question_id = stack.pop()?.to_u64();
                let foreign_device = device_path.is_some_and(|path| path != 0);
                let foreign_form_set = form_set_guid.is_some_and(|guid| guid != self.form_set.guid);
                match question_id {
                    Some(question_id) if !foreign_device && !foreign_form_set => {
                        self.question(question_id as QuestionId)
                    }
                    _ => HiiValue::Undefined,
                }
            }
            Op::RuleRef(rule_id) => {
                let rule = self
                    .form
                    .and_then(|form| self.form_set.forms.get(form))
                    .and_then(|form| form.rule(*rule_id))
                    .ok_or(HiiError::UnknownRule(*rule_id))?;
                self.evaluate(&rule)?
            }
            Op::Get(access) => self.get(access),
            Op::Set(access) => {
                let value = stack.pop()?;
                HiiValue::Boolean(self.set(access, &value))
            }
            Op::Security(permissions) => {
                HiiValue::Boolean(self.services.authorization.map_or(true, |auth| auth.has_permission(permissions)))
            }
            Op::Dup => stack.peek()?.clone(),

            Op::Not => match stack.pop()? {
                HiiValue::Boolean(value) => HiiValue::Boolean(!value),
                _ => HiiValue::Undefined,
            },
            Op::BitwiseNot => stack.pop()?.to_u64().map_or(HiiValue::Undefined, |value| HiiValue::U64(!value)),
            Op::Length => match stack.pop()? {
                HiiValue::Buffer(buffer) => HiiValue::U64(buffer.len() as u64),
                value => self.units(&value).map_or(HiiValue::Undefined, |units| HiiValue::U64(units.len() as u64)),
            },
            Op::ToBoolean => self.to_boolean(stack.pop()?),
            Op::ToUint => self.to_uint(stack.pop()?),
            Op::ToString(mode) => self.to_string(stack.pop()?, *mode),
            Op::ToLower | Op::ToUpper => {
                let value = stack.pop()?;
                match self.text(&value) {
                    Some(text) if matches!(opcode, Op::ToLower) => self.new_string(&text.to_ascii_lowercase()),
                    Some(text) => self.new_string(&text.to_ascii_uppercase()),
                    None => HiiValue::Undefined,
                }
            }
            Op::StringRef2 => match stack.pop()?.to_u64() {
                Some(id) if self.services.strings.get_string(id as u16).is_some() => HiiValue::String(id as u16),
                _ => HiiValue::Undefined,
            },

            Op::And | Op::Or => {
                let data2 = stack.pop()?;
                let data1 = stack.pop()?;
                match (data1, data2) {
                    (HiiValue::Boolean(a), HiiValue::Boolean(b)) if matches!(opcode, Op::And) => HiiValue::Boolean(a && b),
                    (HiiValue::Boolean(a), HiiValue::Boolean(b)) => HiiValue::Boolean(a || b),
                    _ => HiiValue::Undefined,
                }
            }
            Op::Equal | Op::NotEqual | Op::GreaterThan | Op::GreaterEqual | Op::LessThan | Op::LessEqual => {
                let data2 = stack.pop()?;
                let data1 = stack.pop()?;
                match data1.compare(&data2, self.services.strings) {
                    Ok(ordering) => HiiValue::Boolean(match opcode {
                        Op::Equal => ordering == Ordering::Equal,
                        Op::NotEqual => ordering != Ordering::Equal,
                        Op::GreaterThan => ordering == Ordering::Greater,
                        Op::GreaterEqual => ordering != Ordering::Less,
                        Op::LessThan => ordering == Ordering::Less,
                        _ => ordering != Ordering::Greater,
                    }),
                    Err(err) => {
                        log::warn!(target: "hii_eval", "cannot compare {data1:?} with {data2:?}: {err}");
                        HiiValue::Undefined
                    }
                }
            }
            Op::BitwiseAnd
            | Op::BitwiseOr
            | Op::ShiftLeft
            | Op::ShiftRight
            | Op::Add
            | Op::Subtract
            | Op::Multiply
            | Op::Divide
            | Op::Modulo => {
                let data2 = stack.pop()?;
                let data1 = stack.pop()?;
                let (Some(a), Some(b)) = (data1.to_u64(), data2.to_u64()) else {
                    return Ok(HiiValue::Undefined);
                };
                let result = match opcode {
                    Op::BitwiseAnd => Some(a & b),
                    Op::BitwiseOr => Some(a | b),
                    Op::ShiftLeft => Some(if b >= 64 { 0 } else { a << b }),
                    Op::ShiftRight => Some(if b >= 64 { 0 } else { a >> b }),
                    Op::Add => Some(a.wrapping_add(b)),
                    Op::Subtract => Some(a.wrapping_sub(b)),
                    Op::Multiply => Some(a.wrapping_mul(b)),
                    Op::Divide => a.checked_div(b),
                    _ => a.checked_rem(b),
                };
                result.map_or(HiiValue::Undefined, HiiValue::U64)
            }
            Op::Catenate => {
                let data2 = stack.pop()?;
                let data1 = stack.pop()?;
                match (&data1, &data2) {
                    (HiiValue::Buffer(a), HiiValue::Buffer(b)) => HiiValue::Buffer([a.as_slice(), b.as_slice()].concat()),
                    _ => match (self.text(&data1), self.text(&data2)) {
                        (Some(a), Some(b)) => self.new_string(&(a + &b)),
                        _ => HiiValue::Undefined,
                    },
                }
            }
            Op::Match | Op::Match2(_) => {
                let string = stack.pop()?;
                let pattern = stack.pop()?;
                let (Some(string), Some(pattern)) = (self.text(&string), self.text(&pattern)) else {
                    return Ok(HiiValue::Undefined);
                };
                let matched = match opcode {
                    Op::Match2(syntax) => self
                        .services
                        .regex_matchers
                        .iter()
                        .find(|matcher| matcher.supports(syntax))
                        .and_then(|matcher| matcher.is_match(&string, &pattern, syntax).ok()),
                    _ => self.services.text_matcher.map(|matcher| matcher.meta_match(&string, &pattern)),
                };
                matched.map_or(HiiValue::Undefined, HiiValue::Boolean)
            }

            Op::Conditional => {
                let if_true = stack.pop()?;
                let if_false = stack.pop()?;
                match stack.pop()? {
                    HiiValue::Boolean(true) => if_true,
                    HiiValue::Boolean(false) => if_false,
                    _ => HiiValue::Undefined,
                }
            }
            Op::Mid => {
                let length = stack.pop()?.to_u64();
                let base = stack.pop()?.to_u64();
                let source = stack.pop()?;
                let (Some(length), Some(base)) = (length, base) else {
                    return Ok(HiiValue::Undefined);
                };
                match source {
                    HiiValue::Buffer(buffer) => HiiValue::Buffer(window(&buffer, base, length).to_vec()),
                    source => match self.units(&source) {
                        Some(units) => self.new_string(&String::from_utf16_lossy(window(&units, base, length))),
                        None => HiiValue::Undefined,
                    },
                }
            }
            Op::Find(mode) => {
                let index = stack.pop()?.to_u64();
                let substring = stack.pop()?;
                let string = stack.pop()?;
                if *mode > format::FF_CASE_INSENSITIVE {
                    return Ok(HiiValue::Undefined);
                }
                let (Some(index), Some(mut string), Some(mut substring)) =
                    (index, self.text(&string), self.text(&substring))
                else {
                    return Ok(HiiValue::Undefined);
                };
                if *mode == format::FF_CASE_INSENSITIVE {
                    string.make_ascii_uppercase();
                    substring.make_ascii_uppercase();
                }
                let string: Vec<u16> = string.encode_utf16().collect();
                let substring: Vec<u16> = substring.encode_utf16().collect();
                HiiValue::U64(find_units(&string, &substring, index))
            }
            Op::Token => {
                let index = stack.pop()?.to_u64();
                let delimiters = stack.pop()?;
                let string = stack.pop()?;
                let (Some(index), Some(string), Some(delimiters)) = (index, self.units(&string), self.units(&delimiters))
                else {
                    return Ok(HiiValue::Undefined);
                };
                let token = usize::try_from(index)
                    .ok()
                    .and_then(|index| string.split(|unit| delimiters.contains(unit)).nth(index))
                    .unwrap_or(&[]);
                self.new_string(&String::from_utf16_lossy(token))
            }
            Op::Span(flags) => {
                let index = stack.pop()?.to_u64();
                let charset = stack.pop()?;
                let string = stack.pop()?;
                if *flags > format::FLAGS_FIRST_NON_MATCHING {
                    return Ok(HiiValue::Undefined);
                }
                let (Some(index), Some(string), Some(charset)) = (index, self.units(&string), self.units(&charset))
                else {
                    return Ok(HiiValue::Undefined);
                };
                let in_charset =
                    |unit: u16| charset.chunks_exact(2).any(|range| (range[0]..=range[1]).contains(&unit));
                let want_match = *flags == format::FLAGS_FIRST_MATCHING;
                let start = usize::try_from(index).unwrap_or(usize::MAX).min(string.len());
                let position = string[start..]
                    .iter()
                    .position(|&unit| in_charset(unit) == want_match)
                    .map_or(string.len(), |position| start + position);
                HiiValue::U64(position as u64)
            }

            Op::Map(pairs) => {
                let key = stack.pop()?;
                for pair in pairs {
                    let candidate = self.evaluate(&pair.match_expression)?;
                    if key.compare(&candidate, self.services.strings).is_ok_and(|ordering| ordering == Ordering::Equal) {
                        return self.evaluate(&pair.result_expression);
                    }
                }
                log::debug!(target: "hii_eval", "no map entry for {key:?}");
                HiiValue::Undefined
            }
        })
    }

    /// The current value of a question, or undefined if it does not exist or its storage cannot be read.
    fn question(&mut self, question_id: QuestionId) -> HiiValue {
        let Some((form, statement)) = self.form_set.find_question(self.form, question_id) else {
            log::warn!(target: "hii_eval", "question {question_id:#x} not found");
            return HiiValue::Undefined;
        };
        self.form_set.question_value(form, statement, self.services).unwrap_or_else(|err| {
            log::warn!(target: "hii_eval", "question {question_id:#x} value unavailable: {err}");
            HiiValue::Undefined
        })
    }

    fn equals(&self, a: &HiiValue, b: &HiiValue) -> HiiValue {
        match a.compare(b, self.services.strings) {
            Ok(ordering) => HiiValue::Boolean(ordering == Ordering::Equal),
            Err(_) => HiiValue::Undefined,
        }
    }

    fn text(&self, value: &HiiValue) -> Option<String> {
        match value {
            HiiValue::String(id) => self.services.strings.get_string(*id),
            _ => None,
        }
    }

    fn units(&self, value: &HiiValue) -> Option<Vec<u16>> {
        self.text(value).map(|text| text.encode_utf16().collect())
    }

    fn new_string(&self, text: &str) -> HiiValue {
        self.services.strings.new_string(text).map_or(HiiValue::Undefined, HiiValue::String)
    }

    fn to_boolean(&self, value: HiiValue) -> HiiValue {
        match value {
            HiiValue::Boolean(_) => value,
            HiiValue::Buffer(buffer) => HiiValue::Boolean(buffer.iter().any(|&byte| byte != 0)),
            HiiValue::String(_) => match self.text(&value) {
                Some(text) if text.eq_ignore_ascii_case("true") => HiiValue::Boolean(true),
                Some(text) if text.eq_ignore_ascii_case("false") => HiiValue::Boolean(false),
                _ => HiiValue::Undefined,
            },
            value => value.to_u64().map_or(HiiValue::Undefined, |number| HiiValue::Boolean(number != 0)),
        }
    }

    fn to_uint(&self, value: HiiValue) -> HiiValue {
        match value {
            HiiValue::Buffer(buffer) if buffer.len() <= 8 => {
                let mut raw = [0u8; 8];
                raw[..buffer.len()].copy_from_slice(&buffer);
                HiiValue::U64(u64::from_le_bytes(raw))
            }
            HiiValue::String(_) => {
                let Some(text) = self.text(&value) else {
                    return HiiValue::Undefined;
                };
                let text = text.trim();
                let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => text.parse::<u64>(),
                };
                parsed.map_or(HiiValue::Undefined, HiiValue::U64)
            }
            value => value.to_u64().map_or(HiiValue::Undefined, HiiValue::U64),
        }
    }

    fn to_string(&self, value: HiiValue, mode: u8) -> HiiValue {
        let text = match value {
            HiiValue::String(_) => return value,
            HiiValue::Boolean(true) => String::from("True"),
            HiiValue::Boolean(false) => String::from("False"),
            HiiValue::Buffer(buffer) if mode & format::STRING_UNICODE != 0 => {
                let units: Vec<u16> = buffer
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .take_while(|&unit| unit != 0)
                    .collect();
                String::from_utf16_lossy(&units)
            }
            HiiValue::Buffer(buffer) => {
                buffer.iter().take_while(|&&byte| byte != 0).map(|&byte| char::from(byte)).collect()
            }
            value => {
                let Some(number) = value.to_u64() else {
                    return HiiValue::Undefined;
                };
                match mode & 0x03 {
                    format::STRING_UNSIGNED_DEC => number.to_string(),
                    format::STRING_SIGNED_DEC => (number as i64).to_string(),
                    format::STRING_LOWERCASE_HEX => format!("{number:x}"),
                    _ => format!("{number:X}"),
                }
            }
        };
        self.new_string(&text)
    }

    fn get(&mut self, access: &VarAccess) -> HiiValue {
        if matches!(access.value_type, ValueType::String | ValueType::Buffer) {
            return HiiValue::Undefined;
        }
        let Some(index) = self.form_set.storage_index(access.var_store_id) else {
            return HiiValue::Undefined;
        };
        let width = access.value_type.width();
        let storage = &self.form_set.storages[index];
        let bytes = match storage.kind {
            StorageKind::Buffer | StorageKind::EfiVariableBuffer => {
                let start = access.var_store_info as usize;
                storage.edit_buffer.get(start..start + width).map(<[u8]>::to_vec)
            }
            StorageKind::NameValue => self
                .services
                .strings
                .get_string(access.var_store_info)
                .and_then(|name| storage.name_value(&name).and_then(|hex| config_string::hex_to_bytes(hex, width).ok())),
            StorageKind::EfiVariable => {
                let name = self.services.strings.get_string(access.var_store_info);
                match (name, self.services.variables) {
                    (Some(name), Some(variables)) => variables.get_variable(&name, &storage.guid).ok(),
                    _ => None,
                }
            }
        };
        bytes.and_then(|bytes| HiiValue::from_bytes(access.value_type, &bytes)).unwrap_or_else(|| {
            log::warn!(target: "hii_eval", "get from varstore {:#x} failed", access.var_store_id);
            HiiValue::Undefined
        })
    }

    fn set(&mut self, access: &VarAccess, value: &HiiValue) -> bool {
        let Some(index) = self.form_set.storage_index(access.var_store_id) else {
            return false;
        };
        let bytes = match value.to_u64() {
            Some(number) if access.value_type.is_integer() || access.value_type == ValueType::Boolean => {
                HiiValue::from_u64(access.value_type, number).to_bytes()
            }
            _ if value.value_type() == access.value_type => value.to_bytes(),
            _ => return false,
        };
        let name = self.services.strings.get_string(access.var_store_info);
        let storage = &mut self.form_set.storages[index];
        match storage.kind {
            StorageKind::Buffer | StorageKind::EfiVariableBuffer => {
                let start = access.var_store_info as usize;
                match storage.edit_buffer.get_mut(start..start + bytes.len()) {
                    Some(target) => {
                        target.copy_from_slice(&bytes);
                        true
                    }
                    None => false,
                }
            }
            StorageKind::NameValue => match name {
                Some(name) => {
                    storage.set_name_value(&name, &config_string::bytes_to_hex(&bytes));
                    true
                }
                None => false,
            },
            StorageKind::EfiVariable => match (name, self.services.variables) {
                (Some(name), Some(variables)) => {
                    variables.set_variable(&name, &storage.guid, storage.attributes, &bytes).is_ok()
                }
                _ => false,
            },
        }
    }
}

/// The part of `items` starting at `base` and at most `length` long.
fn window<T>(items: &[T], base: u64, length: u64) -> &[T] {
    let start = usize::try_from(base).unwrap_or(usize::MAX).min(items.len());
    let end = start.saturating_add(usize::try_from(length).unwrap_or(usize::MAX)).min(items.len());
    &items[start..end]
}

fn find_units(string: &[u16], substring: &[u16], index: u64) -> u64 {
    let Ok(start) = usize::try_from(index) else {
        return NOT_FOUND;
    };
    if start > string.len() {
        return NOT_FOUND;
    }
    if substring.is_empty() {
        return index;
    }
    string[start..]
        .windows(substring.len())
        .position(|candidate| candidate == substring)
        .map_or(NOT_FOUND, |position| (start + position) as u64)
}
