//! HII Form Interpreter
//!
//! This crate decodes the IFR (Internal Forms Representation) opcode stream of an HII forms package into a
//! [`FormSet`] and interprets it: it evaluates the stack-machine expressions attached to forms, questions and
//! options, resolves question defaults, and aggregates conditionals into visibility and editability outcomes.
//!
//! Everything outside the form set is reached through the collaborator traits in [`services`]: string packages,
//! config routing, variables, authorization and text matching. No firmware protocol is touched directly.
//!
//! ## Example
//!
//! ```ignore
//! use patina_internal_hii::{condition, FormBrowserConfiguration, FormSet, HiiServices};
//!
//! let services = HiiServices::new(&strings).with_config_routing(&routing);
//! let mut form_set = FormSet::from_package(package, &FormBrowserConfiguration::default(), &services)?;
//! form_set.load_storages(&services)?;
//!
//! if !condition::form_condition(&mut form_set, 0, &services)?.is_hidden() {
//!     let value = form_set.question_value(0, 0, &services)?;
//! }
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test), not(feature = "mockall")), no_std)]

extern crate alloc;

pub mod condition;
pub mod config;
pub mod config_string;
pub mod default;
pub mod error;
pub mod evaluator;
pub mod expression;
pub mod form;
pub mod ifr;
pub mod services;
pub mod stack;
pub mod storage;
pub mod value;

mod parser;

pub use condition::ExpressResult;
pub use config::FormBrowserConfiguration;
pub use error::{HiiError, Result};
pub use expression::{Expression, ExpressionKind, ExpressionOpcode, ExpressionRef, ExpressionTree};
pub use form::{Form, FormSet, Statement, StatementKind};
pub use services::HiiServices;
pub use storage::{Storage, StorageKind};
pub use value::{HiiValue, ValueType};
