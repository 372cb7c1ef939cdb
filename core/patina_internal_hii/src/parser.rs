//! IFR parser.
//!
//! Builds a [`FormSet`] in one forward pass over the opcode stream. A scope stack mirrors the IFR nesting: every
//! record with the scope bit pushes a [`Scope`] and every `END` pops one and closes the matching construct.
//!
//! Expression records accumulate into the expression opened by the most recent owner (a conditional, `VALUE`,
//! `READ`, `WRITE`, `RULE` or question check). The expression is complete when a non-expression record arrives or
//! the scope enclosing it ends. `MAP` parks the enclosing expression on a stack while its child expressions are
//! collected.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{rc::Rc, vec::Vec};

use uuid::Uuid;

use crate::{
    config::FormBrowserConfiguration,
    evaluator,
    expression::{Expression, ExpressionKind, ExpressionOpcode, ExpressionRef, MapPair},
    error::{HiiError, Result},
    form::{DefaultStore, Form, FormSet, QuestionDefault, QuestionOption, Statement, StatementKind},
    ifr::{
        is_expression_opcode, opcode, PayloadReader, QuestionHeader, Record, RecordIter, StatementHeader,
        MAX_KNOWN_OPCODE,
    },
    services::HiiServices,
    stack::Stack,
    storage::Storage,
    value::{HiiRef, HiiValue, QuestionId, ValueType},
};

/// Where a conditional applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConditionLevel {
    /// Opened at form set scope, applies to the forms that follow.
    Form,
    /// Opened inside a form, applies to the statements that follow.
    Statement,
    /// Opened inside a one-of or ordered list, applies to the options that follow.
    Option,
}

/// The construct an open scope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    FormSet,
    Form,
    Statement(usize),
    Option,
    Default,
    Condition(ConditionLevel),
    /// A form set level `DISABLE_IF`, evaluated while parsing.
    FormSetDisable,
    ExpressionOwner,
    Map,
    /// A map child whose first record opened a scope.
    MapChild,
    /// A scoped record inside an expression.
    Expression,
    Other,
}

/// A slot on a question that receives an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuestionSlot {
    NoSubmit,
    Inconsistent,
    Warning,
    Value,
    Read,
    Write,
    Default(usize),
}

/// Where a completed expression goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Condition(ConditionLevel),
    FormSetDisable,
    Rule { form: usize },
    Question { form: usize, statement: usize, slot: QuestionSlot },
    MapChild,
}

/// The expression under construction.
#[derive(Debug)]
struct Pending {
    expression: Expression,
    owner: Owner,
    /// The expression is a map child that began with `MAP`; it completes when that map closes.
    close_with_map: bool,
}

/// A `MAP` being collected.
#[derive(Debug)]
struct MapFrame {
    parent: Pending,
    children: Vec<Expression>,
}

/// A region skipped without interpretation.
#[derive(Debug, Clone, Copy)]
struct SkipRegion {
    /// Open scopes inside the region, including the one that started it.
    depth: usize,
    /// The region is the body of a scope on the scope stack that must be popped when the region ends.
    closes_scope: bool,
}

pub(crate) struct Parser<'p, 's> {
    opcodes: &'p [u8],
    services: HiiServices<'s>,
    form_set: FormSet,
    seen_form_set: bool,
    scopes: Stack<Scope>,
    current_form: Option<usize>,
    current_default: Option<usize>,
    form_conditions: Vec<ExpressionRef>,
    statement_conditions: Vec<ExpressionRef>,
    option_conditions: Vec<ExpressionRef>,
    pending: Option<Pending>,
    maps: Stack<MapFrame>,
    skip: Option<SkipRegion>,
}

impl<'p, 's> Parser<'p, 's> {
    pub(crate) fn new(opcodes: &'p [u8], config: &FormBrowserConfiguration, services: &HiiServices<'s>) -> Self {
        Self {
            opcodes,
            services: *services,
            form_set: FormSet::new(opcodes, config),
            seen_form_set: false,
            scopes: Stack::new(),
            current_form: None,
            current_default: None,
            form_conditions: Vec::new(),
            statement_conditions: Vec::new(),
            option_conditions: Vec::new(),
            pending: None,
            maps: Stack::new(),
            skip: None,
        }
    }

    pub(crate) fn parse(mut self) -> Result<FormSet> {
        match self.parse_records() {
            Ok(()) => {
                log::debug!(
                    target: "hii_parse",
                    "parsed form set {}: {} form(s), {} varstore(s)",
                    Uuid::from_bytes_le(*self.form_set.guid.as_bytes()),
                    self.form_set.forms.len(),
                    self.form_set.storages.len()
                );
                Ok(self.form_set)
            }
            Err(err) => {
                log::error!(target: "hii_parse", "IFR decode failed: {err}");
                Err(err)
            }
        }
    }

    fn parse_records(&mut self) -> Result<()> {
        let opcodes = self.opcodes;
        for record in RecordIter::new(opcodes) {
            self.step(&record?)?;
        }
        if !self.seen_form_set {
            return Err(HiiError::MissingFormSet);
        }
        let open = self.scopes.len() + self.skip.map_or(0, |region| region.depth);
        if open != 0 {
            return Err(HiiError::UnbalancedScope { open });
        }
        if !self.maps.is_empty() {
            return Err(HiiError::MalformedMap);
        }
        self.finish_expression(true)
    }

    fn step(&mut self, record: &Record<'_>) -> Result<()> {
        if self.skip.is_some() {
            self.skip_record(record);
            return Ok(());
        }
        log::trace!(
            target: "hii_parse",
            "{:#06x}: opcode {:#04x}{}",
            record.offset,
            record.opcode,
            if record.scope { " (scope)" } else { "" }
        );
        if !self.seen_form_set && record.opcode != opcode::FORM_SET {
            return Err(HiiError::MissingFormSet);
        }
        if record.opcode == opcode::END {
            return self.end_scope();
        }
        if is_expression_opcode(record.opcode) {
            return self.expression_record(record);
        }
        if !self.maps.is_empty() {
            return Err(HiiError::MalformedMap);
        }
        self.finish_expression(false)?;
        if self.skip.is_some() {
            self.skip_record(record);
            return Ok(());
        }
        self.dispatch(record)
    }

    fn skip_record(&mut self, record: &Record<'_>) {
        let Some(region) = self.skip.as_mut() else {
            return;
        };
        if record.opcode == opcode::END {
            region.depth -= 1;
            if region.depth == 0 {
                let closes_scope = region.closes_scope;
                self.skip = None;
                log::trace!(target: "hii_parse", "{:#06x}: end of skipped region", record.offset);
                if closes_scope {
                    let _ = self.scopes.pop();
                }
            }
        } else if record.scope {
            region.depth += 1;
        }
    }

    /// Index of the innermost open statement in the current form.
    fn current_statement(&self) -> Option<usize> {
        self.scopes.iter().rev().find_map(|scope| match scope {
            Scope::Statement(index) => Some(*index),
            _ => None,
        })
    }

    fn current_question(&self, record: &Record<'_>) -> Result<(usize, usize)> {
        match (self.current_form, self.current_statement()) {
            (Some(form), Some(statement)) => Ok((form, statement)),
            _ => Err(unexpected(record)),
        }
    }

    fn current_question_id(&self) -> Option<QuestionId> {
        let statement = self.current_statement()?;
        let form = self.form_set.forms.get(self.current_form?)?;
        form.statements.get(statement).map(|statement| statement.question_id)
    }

    fn condition_level(&self) -> ConditionLevel {
        let Some(form) = self.current_form else {
            return ConditionLevel::Form;
        };
        let has_options = self
            .current_statement()
            .and_then(|index| self.form_set.forms[form].statements.get(index))
            .is_some_and(|statement| statement.kind.has_options());
        if has_options {
            ConditionLevel::Option
        } else {
            ConditionLevel::Statement
        }
    }

    fn conditions_mut(&mut self, level: ConditionLevel) -> &mut Vec<ExpressionRef> {
        match level {
            ConditionLevel::Form => &mut self.form_conditions,
            ConditionLevel::Statement => &mut self.statement_conditions,
            ConditionLevel::Option => &mut self.option_conditions,
        }
    }

    fn end_scope(&mut self) -> Result<()> {
        let scope = self.scopes.pop().map_err(|_| HiiError::UnbalancedScope { open: 0 })?;
        log::trace!(target: "hii_parse", "close {scope:?}");
        match scope {
            Scope::Expression => return Ok(()),
            Scope::MapChild => return self.finish_expression(true),
            Scope::Map => return self.close_map(),
            _ => {}
        }
        self.finish_expression(true)?;
        match scope {
            Scope::Form => self.current_form = None,
            Scope::Statement(_) => self.current_default = None,
            Scope::Default => self.current_default = None,
            Scope::Condition(level) => {
                self.conditions_mut(level).pop();
            }
            _ => {}
        }
        Ok(())
    }

    fn begin_expression(&mut self, kind: ExpressionKind, owner: Owner) {
        self.pending = Some(Pending { expression: Expression::new(kind), owner, close_with_map: false });
    }

    /// Hands the expression under construction to its owner. `closing` is true when the owner's scope is ending.
    fn finish_expression(&mut self, closing: bool) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let expression = pending.expression;
        match pending.owner {
            Owner::Condition(level) => self.conditions_mut(level).push(Rc::new(expression)),
            Owner::FormSetDisable => {
                let value = evaluator::evaluate_expression(&mut self.form_set, None, &expression, &self.services);
                let disabled = match value {
                    Ok(value) => value.is_true(),
                    Err(err) => {
                        log::warn!(target: "hii_parse", "form set disable-if failed to evaluate: {err}");
                        false
                    }
                };
                if disabled && !closing {
                    log::debug!(target: "hii_parse", "form set disable-if is true, skipping its body");
                    self.skip = Some(SkipRegion { depth: 1, closes_scope: true });
                }
            }
            Owner::Rule { form } => self.form_set.forms[form].rules.push(Rc::new(expression)),
            Owner::Question { form, statement, slot } => {
                let statement = &mut self.form_set.forms[form].statements[statement];
                let expression = Rc::new(expression);
                match slot {
                    QuestionSlot::NoSubmit => statement.no_submit.push(expression),
                    QuestionSlot::Inconsistent => statement.inconsistent.push(expression),
                    QuestionSlot::Warning => statement.warning.push(expression),
                    QuestionSlot::Value => statement.value_expression = Some(expression),
                    QuestionSlot::Read => statement.read_expression = Some(expression),
                    QuestionSlot::Write => statement.write_expression = Some(expression),
                    QuestionSlot::Default(index) => {
                        if let Some(default) = statement.defaults.get_mut(index) {
                            default.expression = Some(expression);
                        }
                    }
                }
            }
            Owner::MapChild => {
                self.maps.peek_mut().map_err(|_| HiiError::MalformedMap)?.children.push(expression);
            }
        }
        Ok(())
    }

    fn expression_record(&mut self, record: &Record<'_>) -> Result<()> {
        let opcode = ExpressionOpcode::decode(record, self.current_question_id())?;
        let starts_child = self.pending.is_none();
        if starts_child {
            if self.maps.is_empty() {
                return Err(unexpected(record));
            }
            self.pending =
                Some(Pending { expression: Expression::new(ExpressionKind::MapChild), owner: Owner::MapChild, close_with_map: false });
        }
        if matches!(opcode, ExpressionOpcode::Map(_)) && record.scope {
            let mut parent = self.pending.take().ok_or(HiiError::MalformedMap)?;
            parent.close_with_map = starts_child;
            self.maps.push(MapFrame { parent, children: Vec::new() })?;
            return self.scopes.push(Scope::Map);
        }
        self.pending.as_mut().ok_or(HiiError::MalformedMap)?.expression.opcodes.push(opcode);
        match (starts_child, record.scope) {
            (true, false) => self.finish_expression(false),
            (true, true) => self.scopes.push(Scope::MapChild),
            (false, true) => self.scopes.push(Scope::Expression),
            (false, false) => Ok(()),
        }
    }

    fn close_map(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Err(HiiError::MalformedMap);
        }
        let frame = self.maps.pop().map_err(|_| HiiError::MalformedMap)?;
        if frame.children.len() % 2 != 0 {
            return Err(HiiError::MalformedMap);
        }
        let mut pairs = Vec::with_capacity(frame.children.len() / 2);
        let mut children = frame.children.into_iter();
        while let (Some(match_expression), Some(result_expression)) = (children.next(), children.next()) {
            pairs.push(MapPair { match_expression, result_expression });
        }
        let mut parent = frame.parent;
        parent.expression.opcodes.push(ExpressionOpcode::Map(pairs));
        let complete = parent.close_with_map;
        self.pending = Some(parent);
        if complete {
            self.finish_expression(false)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, record: &Record<'_>) -> Result<()> {
        let mut reader = record.reader();
        let scope = match record.opcode {
            opcode::FORM_SET => self.form_set_record(record, &mut reader)?,
            opcode::FORM => {
                let form_id = reader.u16()?;
                let title = reader.u16()?;
                self.open_form(record, form_id, title)?
            }
            opcode::FORM_MAP => {
                let form_id = reader.u16()?;
                let title = if reader.remaining() >= 2 { reader.u16()? } else { 0 };
                self.open_form(record, form_id, title)?
            }
            opcode::DEFAULTSTORE => {
                let name = reader.u16()?;
                let default_id = reader.u16()?;
                self.form_set.add_default_store(DefaultStore { default_id, name });
                Scope::Other
            }
            opcode::VARSTORE | opcode::VARSTORE_NAME_VALUE | opcode::VARSTORE_EFI => {
                self.storage_record(record, &mut reader)?;
                Scope::Other
            }
            opcode::SUBTITLE => {
                let header = StatementHeader::read(&mut reader)?;
                let flags = reader.u8()?;
                self.add_statement(record, StatementKind::Subtitle { flags }, header)?
            }
            opcode::TEXT => {
                let header = StatementHeader::read(&mut reader)?;
                let text_two = reader.u16()?;
                self.add_statement(record, StatementKind::Text { text_two }, header)?
            }
            opcode::RESET_BUTTON => {
                let header = StatementHeader::read(&mut reader)?;
                let default_id = reader.u16()?;
                self.add_statement(record, StatementKind::ResetButton { default_id }, header)?
            }
            opcode::ACTION => {
                let header = QuestionHeader::read(&mut reader)?;
                let config = if reader.remaining() >= 2 { reader.u16()? } else { 0 };
                let scope = self.add_question(record, StatementKind::Action { config }, header, ValueType::Action, 2)?;
                if let (Some(form), Scope::Statement(index)) = (self.current_form, scope) {
                    self.form_set.forms[form].statements[index].value = HiiValue::Action(config);
                }
                scope
            }
            opcode::REF => {
                let header = QuestionHeader::read(&mut reader)?;
                let form_id = if reader.remaining() >= 2 { reader.u16()? } else { 0 };
                let question_id = if reader.remaining() >= 2 { reader.u16()? } else { 0 };
                let form_set_guid = if reader.remaining() >= 16 { Some(reader.guid()?) } else { None };
                let device_path = if reader.remaining() >= 2 { reader.u16()? } else { 0 };
                let kind = StatementKind::Ref { form_id, question_id, form_set_guid, device_path };
                self.add_question(record, kind, header, ValueType::Ref, HiiRef::SIZE)?
            }
            opcode::CHECKBOX => {
                let header = QuestionHeader::read(&mut reader)?;
                let flags = reader.u8()?;
                self.add_question(record, StatementKind::Checkbox { flags }, header, ValueType::Boolean, 1)?
            }
            opcode::NUMERIC | opcode::ONE_OF => {
                let header = QuestionHeader::read(&mut reader)?;
                let flags = reader.u8()?;
                let value_type = ValueType::from_numeric_size(flags);
                let mut bound = || -> Result<u64> {
                    Ok(match value_type {
                        ValueType::U8 => reader.u8()? as u64,
                        ValueType::U16 => reader.u16()? as u64,
                        ValueType::U32 => reader.u32()? as u64,
                        _ => reader.u64()?,
                    })
                };
                let (minimum, maximum, step) = (bound()?, bound()?, bound()?);
                let kind = if record.opcode == opcode::NUMERIC {
                    StatementKind::Numeric { flags, minimum, maximum, step }
                } else {
                    StatementKind::OneOf { flags, minimum, maximum, step }
                };
                self.add_question(record, kind, header, value_type, value_type.width())?
            }
            opcode::ORDERED_LIST => {
                let header = QuestionHeader::read(&mut reader)?;
                let max_containers = reader.u8()?;
                let flags = reader.u8()?;
                let kind = StatementKind::OrderedList { max_containers, flags, element_type: None };
                self.add_question(record, kind, header, ValueType::Buffer, 0)?
            }
            opcode::STRING => {
                let header = QuestionHeader::read(&mut reader)?;
                let min_size = reader.u8()?;
                let max_size = reader.u8()?;
                let flags = reader.u8()?;
                let kind = StatementKind::String { min_size, max_size, flags };
                self.add_question(record, kind, header, ValueType::String, max_size as usize * 2)?
            }
            opcode::PASSWORD => {
                let header = QuestionHeader::read(&mut reader)?;
                let min_size = reader.u16()?;
                let max_size = reader.u16()?;
                let kind = StatementKind::Password { min_size, max_size };
                self.add_question(record, kind, header, ValueType::String, max_size as usize * 2)?
            }
            opcode::DATE => {
                let header = QuestionHeader::read(&mut reader)?;
                let flags = reader.u8()?;
                self.add_question(record, StatementKind::Date { flags }, header, ValueType::Date, 4)?
            }
            opcode::TIME => {
                let header = QuestionHeader::read(&mut reader)?;
                let flags = reader.u8()?;
                self.add_question(record, StatementKind::Time { flags }, header, ValueType::Time, 3)?
            }
            opcode::ONE_OF_OPTION => self.option_record(record, &mut reader)?,
            opcode::DEFAULT => self.default_record(record, &mut reader)?,
            opcode::VALUE | opcode::READ | opcode::WRITE => {
                let (form, statement) = self.current_question(record)?;
                let (kind, slot) = match record.opcode {
                    opcode::READ => (ExpressionKind::Read, QuestionSlot::Read),
                    opcode::WRITE => (ExpressionKind::Write, QuestionSlot::Write),
                    _ => match (self.scopes.peek(), self.current_default) {
                        (Ok(Scope::Default), Some(index)) => (ExpressionKind::Value, QuestionSlot::Default(index)),
                        _ => (ExpressionKind::Value, QuestionSlot::Value),
                    },
                };
                self.begin_expression(kind, Owner::Question { form, statement, slot });
                Scope::ExpressionOwner
            }
            opcode::RULE => {
                let form = self.current_form.ok_or_else(|| unexpected(record))?;
                let rule_id = reader.u8()?;
                self.begin_expression(ExpressionKind::Rule(rule_id), Owner::Rule { form });
                Scope::ExpressionOwner
            }
            opcode::NO_SUBMIT_IF | opcode::INCONSISTENT_IF | opcode::WARNING_IF => {
                let (form, statement) = self.current_question(record)?;
                let message = reader.u16()?;
                let (kind, slot) = match record.opcode {
                    opcode::NO_SUBMIT_IF => (ExpressionKind::NoSubmitIf { error: message }, QuestionSlot::NoSubmit),
                    opcode::INCONSISTENT_IF => {
                        (ExpressionKind::InconsistentIf { error: message }, QuestionSlot::Inconsistent)
                    }
                    _ => {
                        let timeout = if reader.remaining() > 0 { reader.u8()? } else { 0 };
                        (ExpressionKind::WarningIf { warning: message, timeout }, QuestionSlot::Warning)
                    }
                };
                self.begin_expression(kind, Owner::Question { form, statement, slot });
                Scope::ExpressionOwner
            }
            opcode::SUPPRESS_IF | opcode::GRAY_OUT_IF | opcode::DISABLE_IF => {
                if !record.scope {
                    return Err(unexpected(record));
                }
                let kind = match record.opcode {
                    opcode::SUPPRESS_IF => ExpressionKind::SuppressIf,
                    opcode::GRAY_OUT_IF => ExpressionKind::GrayOutIf,
                    _ => ExpressionKind::DisableIf,
                };
                let level = self.condition_level();
                if kind == ExpressionKind::DisableIf && level == ConditionLevel::Form {
                    self.begin_expression(kind, Owner::FormSetDisable);
                    Scope::FormSetDisable
                } else {
                    self.begin_expression(kind, Owner::Condition(level));
                    Scope::Condition(level)
                }
            }
            opcode::REFRESH => {
                let (form, statement) = self.current_question(record)?;
                self.form_set.forms[form].statements[statement].refresh_interval = reader.u8()?;
                Scope::Other
            }
            opcode::REFRESH_ID => {
                let (form, statement) = self.current_question(record)?;
                self.form_set.forms[form].statements[statement].refresh_event = Some(reader.guid()?);
                Scope::Other
            }
            opcode::LOCKED => {
                match (self.current_form, self.current_statement()) {
                    (Some(form), Some(statement)) => self.form_set.forms[form].statements[statement].locked = true,
                    (Some(form), None) => self.form_set.forms[form].locked = true,
                    _ => {}
                }
                Scope::Other
            }
            opcode::MODAL_TAG => {
                if let Some(form) = self.current_form {
                    self.form_set.forms[form].modal = true;
                }
                Scope::Other
            }
            opcode::IMAGE | opcode::ANIMATION | opcode::GUID | opcode::VARSTORE_DEVICE => Scope::Other,
            unknown => {
                if unknown == 0 || unknown > MAX_KNOWN_OPCODE {
                    log::debug!(target: "hii_parse", "{:#06x}: skipping unknown opcode {unknown:#04x}", record.offset);
                    if record.scope {
                        self.skip = Some(SkipRegion { depth: 1, closes_scope: false });
                    }
                    return Ok(());
                }
                return Err(unexpected(record));
            }
        };
        if record.scope {
            self.scopes.push(scope)?;
        }
        Ok(())
    }

    fn form_set_record(&mut self, record: &Record<'_>, reader: &mut PayloadReader<'_>) -> Result<Scope> {
        if self.seen_form_set {
            return Err(unexpected(record));
        }
        self.seen_form_set = true;
        self.form_set.guid = reader.guid()?;
        self.form_set.title = reader.u16()?;
        self.form_set.help = reader.u16()?;
        let flags = if reader.remaining() > 0 { reader.u8()? } else { 0 };
        for _ in 0..(flags & 0x03) {
            let guid = reader.guid()?;
            self.form_set.class_guids.push(guid);
        }
        log::debug!(target: "hii_parse", "form set {}", Uuid::from_bytes_le(*self.form_set.guid.as_bytes()));
        Ok(Scope::FormSet)
    }

    fn open_form(&mut self, record: &Record<'_>, form_id: u16, title: u16) -> Result<Scope> {
        if self.current_form.is_some() {
            return Err(unexpected(record));
        }
        let form = Form { form_id, title, conditions: self.form_conditions.clone(), ..Default::default() };
        self.form_set.forms.push(form);
        self.current_form = Some(self.form_set.forms.len() - 1);
        log::trace!(target: "hii_parse", "open form {form_id:#x}");
        Ok(Scope::Form)
    }

    fn storage_record(&mut self, record: &Record<'_>, reader: &mut PayloadReader<'_>) -> Result<()> {
        let device_path = self.form_set.config.device_path.clone();
        let storage = match record.opcode {
            opcode::VARSTORE => {
                let guid = reader.guid()?;
                let var_store_id = reader.u16()?;
                let size = reader.u16()? as usize;
                let name = reader.ascii_string()?;
                Storage::buffer(var_store_id, guid, &name, size, &device_path)
            }
            opcode::VARSTORE_NAME_VALUE => {
                let var_store_id = reader.u16()?;
                let guid = reader.guid()?;
                Storage::new_name_value(var_store_id, guid, &device_path)
            }
            _ => {
                let var_store_id = reader.u16()?;
                let guid = reader.guid()?;
                let attributes = reader.u32()?;
                if reader.remaining() >= 3 {
                    let size = reader.u16()? as usize;
                    let name = reader.ascii_string()?;
                    Storage::efi_variable_buffer(var_store_id, guid, attributes, &name, size, &device_path)
                } else {
                    Storage::efi_variable(var_store_id, guid, attributes, &device_path)
                }
            }
        };
        if self.form_set.storage_index(storage.var_store_id).is_some() {
            log::warn!(target: "hii_parse", "duplicate varstore {:#x} ignored", storage.var_store_id);
            return Ok(());
        }
        log::trace!(target: "hii_parse", "varstore {:#x} ({:?})", storage.var_store_id, storage.kind);
        self.form_set.storages.push(storage);
        Ok(())
    }

    fn add_statement(&mut self, record: &Record<'_>, kind: StatementKind, header: StatementHeader) -> Result<Scope> {
        let form = self.current_form.ok_or_else(|| unexpected(record))?;
        let mut statement = Statement::new(kind, header.prompt, header.help);
        statement.conditions = self.statement_conditions.clone();
        statement.parent = self.current_statement();
        let statements = &mut self.form_set.forms[form].statements;
        statements.push(statement);
        self.current_default = None;
        Ok(Scope::Statement(statements.len() - 1))
    }

    fn add_question(
        &mut self,
        record: &Record<'_>,
        kind: StatementKind,
        header: QuestionHeader,
        value_type: ValueType,
        width: usize,
    ) -> Result<Scope> {
        let scope = self.add_statement(record, kind, header.statement)?;
        let (Some(form), Scope::Statement(index)) = (self.current_form, scope) else {
            return Err(unexpected(record));
        };
        let storage = match header.var_store_id {
            0 => None,
            id => Some(self.form_set.storage_index(id).ok_or(HiiError::UnknownStorage(id))?),
        };
        let variable_name = match storage {
            Some(storage) if !self.form_set.storages[storage].is_buffer() => {
                let name = self.services.strings.get_string(header.var_store_info);
                if name.is_none() {
                    log::error!(target: "hii_parse", "varstore name string {:#x} not found", header.var_store_info);
                }
                Some(name.ok_or(HiiError::NotFound)?)
            }
            _ => None,
        };

        let statement = &mut self.form_set.forms[form].statements[index];
        statement.question_id = header.question_id;
        statement.var_store_id = header.var_store_id;
        statement.var_store_info = header.var_store_info;
        statement.flags = header.flags;
        statement.value_type = value_type;
        statement.storage_width = width;
        statement.storage = storage;
        statement.variable_name = variable_name;
        if storage.is_none() {
            statement.value = HiiValue::zero(value_type, width);
        }
        self.register_request(form, index);
        Ok(scope)
    }

    fn register_request(&mut self, form: usize, statement: usize) {
        let statement = &self.form_set.forms[form].statements[statement];
        let (Some(storage), Some(element)) = (statement.storage, statement.request_element()) else {
            return;
        };
        let var_store_id = statement.var_store_id;
        self.form_set.storages[storage].add_request_element(element.clone());
        self.form_set.forms[form].add_config_request(var_store_id, storage, element);
    }

    fn option_record(&mut self, record: &Record<'_>, reader: &mut PayloadReader<'_>) -> Result<Scope> {
        let (form, index) = self.current_question(record)?;
        let text = reader.u16()?;
        let flags = reader.u8()?;
        let raw_type = reader.u8()?;
        let option_type = ValueType::from_raw(raw_type).ok_or_else(|| unexpected(record))?;
        let value = decode_literal(record, option_type, reader)?;

        let statement = &mut self.form_set.forms[form].statements[index];
        let value = value.into_type(statement.value_type);
        statement.options.push(QuestionOption { text, flags, value, conditions: self.option_conditions.clone() });

        if let StatementKind::OrderedList { max_containers, element_type: element_type @ None, .. } = &mut statement.kind {
            *element_type = Some(option_type);
            statement.storage_width = *max_containers as usize * option_type.width();
            if statement.storage.is_none() {
                statement.value = HiiValue::zero(ValueType::Buffer, statement.storage_width);
            }
            self.register_request(form, index);
        }
        Ok(Scope::Option)
    }

    fn default_record(&mut self, record: &Record<'_>, reader: &mut PayloadReader<'_>) -> Result<Scope> {
        let (form, index) = self.current_question(record)?;
        let default_id = reader.u16()?;
        let raw_type = reader.u8()?;
        let value_type = ValueType::from_raw(raw_type).ok_or_else(|| unexpected(record))?;
        let value = if record.scope { HiiValue::Undefined } else { decode_literal(record, value_type, reader)? };
        let defaults = &mut self.form_set.forms[form].statements[index].defaults;
        defaults.push(QuestionDefault { default_id, value, expression: None });
        self.current_default = Some(defaults.len() - 1);
        Ok(Scope::Default)
    }
}

fn unexpected(record: &Record<'_>) -> HiiError {
    HiiError::UnexpectedOpcode { opcode: record.opcode, offset: record.offset }
}

/// Decodes the typed value that ends `ONE_OF_OPTION` and `DEFAULT` records.
fn decode_literal(record: &Record<'_>, value_type: ValueType, reader: &mut PayloadReader<'_>) -> Result<HiiValue> {
    let rest = reader.rest();
    match value_type {
        ValueType::Buffer => Ok(HiiValue::Buffer(rest.to_vec())),
        ValueType::Other | ValueType::Undefined => Ok(HiiValue::Undefined),
        value_type => HiiValue::from_bytes(value_type, rest)
            .ok_or(HiiError::PayloadTooShort { opcode: record.opcode, offset: record.offset }),
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::{
        ifr::encode_record,
        services::MockStringTable,
        storage::RequestElement,
    };
    use alloc::{string::ToString, vec, vec::Vec};

    const GUID: [u8; 16] = [0x11; 16];

    fn rec(op: u8, payload: &[u8], scope: bool) -> Vec<u8> {
        encode_record(op, payload, scope)
    }

    fn end() -> Vec<u8> {
        rec(opcode::END, &[], false)
    }

    fn form_set(body: Vec<Vec<u8>>) -> Vec<u8> {
        let mut payload = GUID.to_vec();
        payload.extend_from_slice(&[1, 0, 2, 0, 0]);
        let mut stream = rec(opcode::FORM_SET, &payload, true);
        stream.extend(body.into_iter().flatten());
        stream.extend(end());
        stream
    }

    fn varstore(id: u16, size: u16) -> Vec<u8> {
        let mut payload = GUID.to_vec();
        payload.extend_from_slice(&id.to_le_bytes());
        payload.extend_from_slice(&size.to_le_bytes());
        payload.extend_from_slice(b"Setup\0");
        rec(opcode::VARSTORE, &payload, false)
    }

    fn question_header(question_id: u16, var_store_id: u16, info: u16) -> Vec<u8> {
        let mut header = vec![1, 0, 2, 0];
        header.extend_from_slice(&question_id.to_le_bytes());
        header.extend_from_slice(&var_store_id.to_le_bytes());
        header.extend_from_slice(&info.to_le_bytes());
        header.push(0);
        header
    }

    fn form(id: u16, body: Vec<Vec<u8>>) -> Vec<u8> {
        let mut stream = rec(opcode::FORM, &[id as u8, (id >> 8) as u8, 3, 0], true);
        stream.extend(body.into_iter().flatten());
        stream.extend(end());
        stream
    }

    fn numeric_u8(question_id: u16, var_store_id: u16, offset: u16, scope: bool) -> Vec<u8> {
        let mut payload = question_header(question_id, var_store_id, offset);
        payload.extend_from_slice(&[0x00, 0, 100, 1]);
        rec(opcode::NUMERIC, &payload, scope)
    }

    fn parse(stream: &[u8]) -> Result<FormSet> {
        let strings = MockStringTable::new();
        FormSet::parse(stream, &FormBrowserConfiguration::default(), &HiiServices::new(&strings))
    }

    #[test]
    fn questions_register_request_elements() {
        let stream = form_set(vec![varstore(1, 8), form(1, vec![numeric_u8(5, 1, 3, false)])]);
        let form_set = parse(&stream).unwrap();
        assert_eq!(form_set.guid.as_bytes(), &GUID);
        let statement = &form_set.forms[0].statements[0];
        assert_eq!(statement.question_id, 5);
        assert_eq!(statement.storage, Some(0));
        assert_eq!(statement.kind, StatementKind::Numeric { flags: 0, minimum: 0, maximum: 100, step: 1 });
        assert_eq!(form_set.storages[0].elements(), &[RequestElement::Block { offset: 3, width: 1 }]);
        assert_eq!(form_set.forms[0].config_requests[0].elements, vec![RequestElement::Block { offset: 3, width: 1 }]);
        assert_eq!(form_set.opcodes, stream);
    }

    #[test]
    fn structural_errors_abort_the_parse() {
        assert_eq!(parse(&rec(opcode::FORM, &[1, 0, 3, 0], true)).err(), Some(HiiError::MissingFormSet));
        assert_eq!(parse(&[]).err(), Some(HiiError::MissingFormSet));

        let mut unbalanced = form_set(vec![form(1, vec![])]);
        unbalanced.truncate(unbalanced.len() - 2);
        assert_eq!(parse(&unbalanced).err(), Some(HiiError::UnbalancedScope { open: 1 }));

        let mut extra_end = form_set(vec![]);
        extra_end.extend(end());
        assert_eq!(parse(&extra_end).err(), Some(HiiError::UnbalancedScope { open: 0 }));

        let dangling = form_set(vec![form(1, vec![numeric_u8(5, 9, 0, false)])]);
        assert_eq!(parse(&dangling).err(), Some(HiiError::UnknownStorage(9)));

        let mut truncated = form_set(vec![]);
        truncated.push(opcode::FORM);
        assert!(parse(&truncated).is_err());
    }

    #[test]
    fn unknown_opcodes_are_skipped_with_their_scope() {
        let unknown = vec![rec(0x7E, &[1, 2, 3], true), rec(opcode::FORM, &[9, 0, 0, 0], true), end(), end()];
        let stream = form_set(vec![unknown.concat(), form(1, vec![])]);
        let form_set = parse(&stream).unwrap();
        assert_eq!(form_set.forms.len(), 1);
        assert_eq!(form_set.forms[0].form_id, 1);
    }

    #[test]
    fn form_set_disable_if_skips_its_body() {
        let disabled = vec![
            rec(opcode::DISABLE_IF, &[], true),
            rec(opcode::TRUE, &[], false),
            form(2, vec![numeric_u8(5, 0, 0, false)]),
            end(),
        ];
        let enabled = vec![rec(opcode::DISABLE_IF, &[], true), rec(opcode::FALSE, &[], false), form(3, vec![]), end()];
        let non_zero =
            vec![rec(opcode::DISABLE_IF, &[], true), rec(opcode::UINT8, &[2], false), form(4, vec![]), end()];
        let stream = form_set(vec![disabled.concat(), enabled.concat(), non_zero.concat(), form(1, vec![])]);
        let form_set = parse(&stream).unwrap();
        let ids: Vec<_> = form_set.forms.iter().map(|form| form.form_id).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn questions_without_storage_start_at_zero() {
        let mut checkbox = question_header(6, 0, 0);
        checkbox.push(0);
        let mut date = question_header(7, 0, 0);
        date.push(0);
        let mut list = question_header(8, 0, 0);
        list.extend_from_slice(&[2, 0]);
        let body = vec![
            numeric_u8(5, 0, 0, false),
            rec(opcode::CHECKBOX, &checkbox, false),
            rec(opcode::DATE, &date, false),
            rec(opcode::ORDERED_LIST, &list, true),
            rec(opcode::ONE_OF_OPTION, &[0, 0, 0, 0x01, 1, 0], false),
            end(),
        ];
        let form_set = parse(&form_set(vec![form(1, body)])).unwrap();
        let values: Vec<_> = form_set.forms[0].statements.iter().map(|statement| statement.value.clone()).collect();
        assert_eq!(
            values,
            vec![
                HiiValue::U8(0),
                HiiValue::Boolean(false),
                HiiValue::Date(Default::default()),
                HiiValue::Buffer(vec![0; 4]),
            ]
        );
    }

    #[test]
    fn conditionals_attach_to_the_enclosing_level() {
        let mut one_of = question_header(7, 0, 0);
        one_of.extend_from_slice(&[0x00, 0, 10, 1]);
        let option = |value: u8| rec(opcode::ONE_OF_OPTION, &[0, 0, 0, 0x00, value], false);
        let body = vec![
            rec(opcode::SUPPRESS_IF, &[], true),
            rec(opcode::EQ_ID_VAL, &[7, 0, 1, 0], false),
            numeric_u8(5, 0, 0, false),
            end(),
            rec(opcode::ONE_OF, &one_of, true),
            option(1),
            rec(opcode::GRAY_OUT_IF, &[], true),
            rec(opcode::FALSE, &[], false),
            option(2),
            end(),
            end(),
        ];
        let suppressed_form =
            vec![rec(opcode::SUPPRESS_IF, &[], true), rec(opcode::TRUE, &[], false), form(1, body), end()];
        let form_set = parse(&form_set(vec![suppressed_form.concat()])).unwrap();
        let form = &form_set.forms[0];
        assert_eq!(form.conditions.len(), 1);
        assert_eq!(form.conditions[0].kind, ExpressionKind::SuppressIf);

        let numeric = &form.statements[0];
        assert_eq!(numeric.conditions.len(), 1);
        assert_eq!(numeric.conditions[0].opcodes.len(), 1);

        let one_of = &form.statements[1];
        assert!(one_of.conditions.is_empty());
        assert!(one_of.options[0].conditions.is_empty());
        assert_eq!(one_of.options[1].conditions.len(), 1);
        assert_eq!(one_of.options[1].conditions[0].kind, ExpressionKind::GrayOutIf);
        assert_eq!(one_of.options[1].value, HiiValue::U8(2));
    }

    #[test]
    fn map_children_are_paired() {
        let value = vec![
            rec(opcode::VALUE, &[], true),
            rec(opcode::UINT8, &[2], false),
            rec(opcode::MAP, &[], true),
            rec(opcode::UINT8, &[1], false),
            rec(opcode::STRING_REF1, &[0x10, 0], false),
            rec(opcode::EQUAL, &[], true),
            rec(opcode::UINT8, &[2], false),
            rec(opcode::UINT8, &[2], false),
            end(),
            rec(opcode::STRING_REF1, &[0x11, 0], false),
            end(),
            end(),
        ];
        let question = vec![numeric_u8(5, 0, 0, true), value.concat(), end()];
        let form_set = parse(&form_set(vec![form(1, vec![question.concat()])])).unwrap();
        let expression = form_set.forms[0].statements[0].value_expression.clone().unwrap();
        assert_eq!(expression.opcodes.len(), 2);
        let ExpressionOpcode::Map(pairs) = &expression.opcodes[1] else {
            panic!("expected a map, found {:?}", expression.opcodes[1]);
        };
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].match_expression.opcodes.len(), 3);
        assert!(matches!(pairs[1].result_expression.opcodes[0], ExpressionOpcode::StringRef1(0x11)));
    }

    #[test]
    fn odd_map_children_are_malformed() {
        let value = vec![
            rec(opcode::VALUE, &[], true),
            rec(opcode::UINT8, &[2], false),
            rec(opcode::MAP, &[], true),
            rec(opcode::UINT8, &[1], false),
            end(),
            end(),
        ];
        let question = vec![numeric_u8(5, 0, 0, true), value.concat(), end()];
        assert_eq!(parse(&form_set(vec![form(1, vec![question.concat()])])).err(), Some(HiiError::MalformedMap));
    }

    #[test]
    fn ordered_list_width_comes_from_first_option() {
        let mut payload = question_header(9, 1, 2);
        payload.extend_from_slice(&[3, 0]);
        let list = vec![
            rec(opcode::ORDERED_LIST, &payload, true),
            rec(opcode::ONE_OF_OPTION, &[0, 0, 0, 0x01, 1, 0], false),
            rec(opcode::ONE_OF_OPTION, &[0, 0, 0, 0x01, 2, 0], false),
            end(),
        ];
        let form_set = parse(&form_set(vec![varstore(1, 16), form(1, vec![list.concat()])])).unwrap();
        let statement = &form_set.forms[0].statements[0];
        assert_eq!(statement.storage_width, 6);
        assert_eq!(form_set.storages[0].elements(), &[RequestElement::Block { offset: 2, width: 6 }]);
    }

    #[test]
    fn defaults_rules_and_checks_are_collected() {
        let question = vec![
            numeric_u8(5, 0, 0, true),
            rec(opcode::DEFAULT, &[0, 0, 0x00, 7], false),
            rec(opcode::DEFAULT, &[1, 0, 0x00, 0], true),
            rec(opcode::VALUE, &[], true),
            rec(opcode::UINT8, &[9], false),
            end(),
            end(),
            rec(opcode::INCONSISTENT_IF, &[0x20, 0], true),
            rec(opcode::THIS, &[], false),
            rec(opcode::UINT8, &[50], false),
            rec(opcode::GREATER_THAN, &[], false),
            end(),
            end(),
        ];
        let rule = vec![rec(opcode::RULE, &[4], true), rec(opcode::TRUE, &[], false), end()];
        let form_set = parse(&form_set(vec![form(1, vec![question.concat(), rule.concat()])])).unwrap();
        let form = &form_set.forms[0];
        let statement = &form.statements[0];
        assert_eq!(statement.defaults.len(), 2);
        assert_eq!(statement.defaults[0].value, HiiValue::U8(7));
        assert!(statement.defaults[1].expression.is_some());
        assert!(statement.value_expression.is_none());
        assert_eq!(statement.inconsistent.len(), 1);
        assert!(matches!(statement.inconsistent[0].opcodes[0], ExpressionOpcode::This(5)));
        assert!(form.rule(4).is_some());
    }

    #[test]
    fn name_value_questions_resolve_entry_names() {
        let mut store = 2u16.to_le_bytes().to_vec();
        store.extend_from_slice(&GUID);
        let stream = form_set(vec![rec(opcode::VARSTORE_NAME_VALUE, &store, false), form(1, vec![numeric_u8(5, 2, 0x30, false)])]);
        let mut strings = MockStringTable::new();
        strings.expect_get_string().withf(|id| *id == 0x30).returning(|_| Some("Speed".to_string()));
        let form_set = FormSet::parse(&stream, &FormBrowserConfiguration::default(), &HiiServices::new(&strings)).unwrap();
        assert_eq!(form_set.forms[0].statements[0].variable_name.as_deref(), Some("Speed"));
        assert_eq!(form_set.storages[0].name_value("Speed"), Some(crate::config_string::NAME_VALUE_PLACEHOLDER));
    }
}
