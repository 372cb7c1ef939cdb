//! Visibility and editability of forms, statements and options.
//!
//! Each object snapshots the conditional expressions (`SUPPRESS_IF`, `GRAY_OUT_IF`, `DISABLE_IF`) that enclosed
//! it. Evaluating the list reduces it to the strongest outcome among the conditionals that hold.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

use crate::{
    error::{HiiError, Result},
    evaluator,
    expression::{ExpressionKind, ExpressionRef},
    form::FormSet,
    services::HiiServices,
};

/// Outcome of a conditional list, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ExpressResult {
    /// No conditional holds: visible and editable.
    #[default]
    False = 0,
    GrayOut = 1,
    Suppress = 2,
    Disable = 3,
}

impl ExpressResult {
    /// The outcome a conditional of `kind` produces when it holds. Non-conditional kinds produce nothing.
    pub fn from_kind(kind: ExpressionKind) -> Option<Self> {
        match kind {
            ExpressionKind::GrayOutIf => Some(Self::GrayOut),
            ExpressionKind::SuppressIf => Some(Self::Suppress),
            ExpressionKind::DisableIf => Some(Self::Disable),
            _ => None,
        }
    }

    /// True when the object is hidden.
    pub fn is_hidden(&self) -> bool {
        *self >= Self::Suppress
    }
}

/// Reduces already evaluated conditionals using their cached results. Undefined results count as false.
pub fn reduce(list: &[ExpressionRef]) -> ExpressResult {
    list.iter()
        .filter(|expression| expression.result().is_true())
        .filter_map(|expression| ExpressResult::from_kind(expression.kind))
        .max()
        .unwrap_or_default()
}

/// Evaluates every conditional in `list` and reduces the results.
///
/// A conditional that fails to evaluate counts as false; the failure is logged and the rest of the list is still
/// evaluated.
pub fn evaluate_expression_list(
    form_set: &mut FormSet,
    form: Option<usize>,
    list: &[ExpressionRef],
    services: &HiiServices<'_>,
) -> ExpressResult {
    for expression in list {
        if let Err(err) = evaluator::evaluate_expression(form_set, form, expression, services) {
            log::warn!(target: "hii_eval", "{:?} treated as false: {err}", expression.kind);
        }
    }
    reduce(list)
}

/// The outcome of the conditionals enclosing form `form`.
pub fn form_condition(form_set: &mut FormSet, form: usize, services: &HiiServices<'_>) -> Result<ExpressResult> {
    let list = form_set.forms.get(form).ok_or(HiiError::NotFound)?.conditions.clone();
    Ok(evaluate_expression_list(form_set, Some(form), &list, services))
}

/// The outcome of the conditionals enclosing statement `statement` of form `form`.
///
/// Only the statement's own list is considered; the enclosing form's outcome is [`form_condition`].
pub fn statement_condition(
    form_set: &mut FormSet,
    form: usize,
    statement: usize,
    services: &HiiServices<'_>,
) -> Result<ExpressResult> {
    let list = statement_lists(form_set, form, statement)?.0;
    Ok(evaluate_expression_list(form_set, Some(form), &list, services))
}

/// The outcome of the conditionals enclosing option `option` of a question.
pub fn option_condition(
    form_set: &mut FormSet,
    form: usize,
    statement: usize,
    option: usize,
    services: &HiiServices<'_>,
) -> Result<ExpressResult> {
    let list = statement_lists(form_set, form, statement)?.1.into_iter().nth(option).ok_or(HiiError::NotFound)?;
    Ok(evaluate_expression_list(form_set, Some(form), &list, services))
}

/// The statement's condition list and the condition list of each of its options.
fn statement_lists(
    form_set: &FormSet,
    form: usize,
    statement: usize,
) -> Result<(Vec<ExpressionRef>, Vec<Vec<ExpressionRef>>)> {
    let statement = form_set.forms.get(form).and_then(|f| f.statements.get(statement)).ok_or(HiiError::NotFound)?;
    let options = statement.options.iter().map(|option| option.conditions.clone()).collect();
    Ok((statement.conditions.clone(), options))
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::{
        config::FormBrowserConfiguration,
        expression::{Expression, ExpressionOpcode},
        form::{Form, QuestionOption, Statement, StatementKind},
        services::MockStringTable,
        value::HiiValue,
    };
    use alloc::{rc::Rc, vec};

    fn conditional(kind: ExpressionKind, holds: bool) -> ExpressionRef {
        let opcode = if holds { ExpressionOpcode::True } else { ExpressionOpcode::False };
        Rc::new(Expression::with_opcodes(kind, vec![opcode]))
    }

    fn evaluate(list: &[ExpressionRef]) -> ExpressResult {
        let strings = MockStringTable::new();
        let mut form_set = FormSet::new(&[], &FormBrowserConfiguration::default());
        evaluate_expression_list(&mut form_set, None, list, &HiiServices::new(&strings))
    }

    #[test]
    fn empty_list_is_visible() {
        assert_eq!(evaluate(&[]), ExpressResult::False);
        assert!(!ExpressResult::GrayOut.is_hidden());
        assert!(ExpressResult::Suppress.is_hidden());
    }

    #[test]
    fn strongest_true_conditional_wins() {
        let list = [
            conditional(ExpressionKind::GrayOutIf, true),
            conditional(ExpressionKind::DisableIf, false),
            conditional(ExpressionKind::SuppressIf, true),
        ];
        assert_eq!(evaluate(&list), ExpressResult::Suppress);
        assert_eq!(evaluate(&list[..2]), ExpressResult::GrayOut);
        assert_eq!(evaluate(&[conditional(ExpressionKind::DisableIf, true), list[2].clone()]), ExpressResult::Disable);
    }

    #[test]
    fn undefined_and_failed_conditionals_are_false() {
        let undefined =
            Rc::new(Expression::with_opcodes(ExpressionKind::SuppressIf, vec![ExpressionOpcode::Undefined]));
        let unbalanced = Rc::new(Expression::with_opcodes(
            ExpressionKind::SuppressIf,
            vec![ExpressionOpcode::True, ExpressionOpcode::True],
        ));
        let gray = conditional(ExpressionKind::GrayOutIf, true);
        assert_eq!(evaluate(&[undefined, unbalanced, gray]), ExpressResult::GrayOut);
    }

    #[test]
    fn reduce_uses_cached_results() {
        let suppress = conditional(ExpressionKind::SuppressIf, true);
        assert_eq!(reduce(&[suppress.clone()]), ExpressResult::False);
        suppress.set_result(HiiValue::Boolean(true));
        assert_eq!(reduce(&[suppress]), ExpressResult::Suppress);
    }

    #[test]
    fn object_lists_are_evaluated_independently() {
        let strings = MockStringTable::new();
        let services = HiiServices::new(&strings);
        let mut form_set = FormSet::new(&[], &FormBrowserConfiguration::default());
        let mut statement = Statement::new(StatementKind::OneOf { flags: 0, minimum: 0, maximum: 3, step: 0 }, 0, 0);
        statement.conditions = vec![conditional(ExpressionKind::GrayOutIf, true)];
        statement.options.push(QuestionOption {
            text: 0,
            flags: 0,
            value: HiiValue::U8(1),
            conditions: vec![conditional(ExpressionKind::SuppressIf, true)],
        });
        form_set.forms.push(Form {
            form_id: 1,
            statements: vec![statement],
            conditions: vec![conditional(ExpressionKind::SuppressIf, true)],
            ..Default::default()
        });

        assert_eq!(form_condition(&mut form_set, 0, &services), Ok(ExpressResult::Suppress));
        assert_eq!(statement_condition(&mut form_set, 0, 0, &services), Ok(ExpressResult::GrayOut));
        assert_eq!(option_condition(&mut form_set, 0, 0, 0, &services), Ok(ExpressResult::Suppress));
        assert_eq!(option_condition(&mut form_set, 0, 0, 1, &services), Err(HiiError::NotFound));
    }
}
