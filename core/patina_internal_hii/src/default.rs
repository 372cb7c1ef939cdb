//! Question default resolution.
//!
//! A default for class `default_id` comes from the first source that has one:
//!
//! 1. the driver callback, for callback questions that are not strings,
//! 2. the alternate configuration fetched from the config routing service,
//! 3. a `DEFAULT` record of the question for that class, literal or computed,
//! 4. a one-of option flagged as the standard or manufacturing default,
//! 5. the checkbox default flags.
//!
//! When the requested class has no default, every other declared class is tried in ascending id order before the
//! per-construct fallback is used.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

use crate::{
    condition, evaluator,
    error::{HiiError, Result},
    form::{checkbox_flags, option_flags, FormSet, QuestionOption, Statement, StatementKind},
    services::HiiServices,
    value::{DefaultId, HiiValue, ValueType, DEFAULT_CLASS_MANUFACTURING, DEFAULT_CLASS_STANDARD},
};

/// Resolves the default value of a question for class `default_id`.
///
/// Returns [`HiiError::NotFound`] when neither any default class nor the fallback for the question's kind yields a
/// value, as for strings, dates and times without defaults.
pub fn question_default(
    form_set: &mut FormSet,
    form: usize,
    statement: usize,
    default_id: DefaultId,
    services: &HiiServices<'_>,
) -> Result<HiiValue> {
    let question =
        form_set.forms.get(form).and_then(|f| f.statements.get(statement)).ok_or(HiiError::NotFound)?.clone();

    if let Some(value) = class_default(form_set, form, statement, &question, default_id, services) {
        return Ok(value);
    }
    let others: Vec<DefaultId> =
        form_set.default_stores.iter().map(|store| store.default_id).filter(|&id| id != default_id).collect();
    for other in others {
        if let Some(value) = class_default(form_set, form, statement, &question, other, services) {
            log::debug!(
                target: "hii_default",
                "question {:#x} has no default {default_id:#x}, using class {other:#x}",
                question.question_id
            );
            return Ok(value);
        }
    }
    fallback(form_set, form, &question, services)
}

/// Sets every question of form `form` to its default for class `default_id`, as a reset button does.
///
/// Questions without any default keep their value. Returns the number of questions updated.
pub fn apply_form_defaults(
    form_set: &mut FormSet,
    form: usize,
    default_id: DefaultId,
    services: &HiiServices<'_>,
) -> Result<usize> {
    let count = form_set.forms.get(form).ok_or(HiiError::NotFound)?.statements.len();
    let mut applied = 0;
    for statement in 0..count {
        let question = &form_set.forms[form].statements[statement];
        if !question.is_question() || matches!(question.kind, StatementKind::Action { .. } | StatementKind::Ref { .. })
        {
            continue;
        }
        match question_default(form_set, form, statement, default_id, services) {
            Ok(value) => {
                form_set.set_question_value(form, statement, value, services)?;
                applied += 1;
            }
            Err(HiiError::NotFound) => {}
            Err(err) => return Err(err),
        }
    }
    log::debug!(target: "hii_default", "applied default {default_id:#x} to {applied} question(s) of form {form}");
    Ok(applied)
}

fn class_default(
    form_set: &mut FormSet,
    form: usize,
    statement: usize,
    question: &Statement,
    default_id: DefaultId,
    services: &HiiServices<'_>,
) -> Option<HiiValue> {
    // Asking the driver for a string default writes the string, so strings skip the callback.
    if question.is_callback() && question.value_type != ValueType::String {
        if let Some(access) = services.config_access {
            match access.default_value(default_id, question.question_id, question.value_type) {
                Ok(value) if !value.is_undefined() => return Some(value.into_type(question.value_type)),
                Ok(_) => {}
                Err(err) => log::debug!(
                    target: "hii_default",
                    "callback has no default {default_id:#x} for question {:#x}: {err}",
                    question.question_id
                ),
            }
        }
    }

    if let Some(value) = form_set.alt_config_value(form, statement, default_id, services) {
        return Some(value);
    }

    for default in question.defaults.iter().filter(|default| default.default_id == default_id) {
        match &default.expression {
            Some(expression) => match evaluator::evaluate_expression(form_set, Some(form), expression, services) {
                Ok(value) if !value.is_undefined() => return Some(value.into_type(question.value_type)),
                Ok(_) => {}
                Err(err) => log::warn!(
                    target: "hii_default",
                    "default {default_id:#x} of question {:#x} failed to evaluate: {err}",
                    question.question_id
                ),
            },
            None if !default.value.is_undefined() => return Some(default.value.clone().into_type(question.value_type)),
            None => {}
        }
    }

    if let StatementKind::OneOf { .. } = question.kind {
        let flag = match default_id {
            DEFAULT_CLASS_STANDARD => Some(option_flags::DEFAULT),
            DEFAULT_CLASS_MANUFACTURING => Some(option_flags::DEFAULT_MFG),
            _ => None,
        };
        if let Some(flag) = flag {
            let flagged = question.options.iter().filter(|option| option.flags & flag != 0);
            if let Some(option) = first_visible(form_set, form, flagged, services) {
                return Some(option.value.clone());
            }
        }
    }

    if let StatementKind::Checkbox { flags } = question.kind {
        let flag = match default_id {
            DEFAULT_CLASS_STANDARD => checkbox_flags::DEFAULT,
            DEFAULT_CLASS_MANUFACTURING => checkbox_flags::DEFAULT_MFG,
            _ => 0,
        };
        if flags & flag != 0 {
            return Some(HiiValue::Boolean(true));
        }
    }
    None
}

fn fallback(form_set: &mut FormSet, form: usize, question: &Statement, services: &HiiServices<'_>) -> Result<HiiValue> {
    let value = match &question.kind {
        StatementKind::Checkbox { .. } => HiiValue::Boolean(false),
        StatementKind::Numeric { minimum, .. } => HiiValue::from_u64(question.value_type, *minimum),
        StatementKind::OneOf { .. } => first_visible(form_set, form, question.options.iter(), services)
            .map(|option| option.value.clone())
            .ok_or(HiiError::NotFound)?,
        StatementKind::OrderedList { max_containers, .. } => {
            let mut buffer = Vec::with_capacity(question.storage_width);
            let mut taken = 0;
            for option in &question.options {
                if taken == *max_containers as usize {
                    break;
                }
                if !is_hidden(form_set, form, option, services) {
                    buffer.extend_from_slice(&option.value.to_bytes());
                    taken += 1;
                }
            }
            if buffer.len() < question.storage_width {
                buffer.resize(question.storage_width, 0);
            }
            HiiValue::Buffer(buffer)
        }
        _ => return Err(HiiError::NotFound),
    };
    log::debug!(target: "hii_default", "question {:#x} falls back to {value:?}", question.question_id);
    Ok(value)
}

fn first_visible<'q>(
    form_set: &mut FormSet,
    form: usize,
    mut options: impl Iterator<Item = &'q QuestionOption>,
    services: &HiiServices<'_>,
) -> Option<&'q QuestionOption> {
    options.find(|option| !is_hidden(form_set, form, option, services))
}

fn is_hidden(form_set: &mut FormSet, form: usize, option: &QuestionOption, services: &HiiServices<'_>) -> bool {
    !option.conditions.is_empty()
        && condition::evaluate_expression_list(form_set, Some(form), &option.conditions, services).is_hidden()
}
