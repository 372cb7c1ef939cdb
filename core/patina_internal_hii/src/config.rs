//! Form Interpreter Configuration
//!
//! Defines the platform-provided settings the parser and evaluator consult. The configuration is expected to be
//! created once by whatever hosts the forms browser and passed by reference into [`FormSet::parse`] and the
//! evaluation entry points.
//!
//! [`FormSet::parse`]: crate::form::FormSet::parse
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

/// The initial capacity of an evaluation stack, in values.
pub const STACK_SIZE_INCREMENT: usize = 0x100;

/// The default limit on nested rule, map, and default evaluations.
pub const MAX_RECURSION_DEPTH: usize = 32;

/// Form interpreter configuration.
#[derive(Debug, Clone)]
pub struct FormBrowserConfiguration {
    /// Device path of the driver that published the forms package, emitted as `PATH=` in config headers.
    pub device_path: Vec<u8>,
    /// Initial capacity of each evaluation value stack.
    pub stack_size_increment: usize,
    /// Maximum depth of nested expression evaluation.
    pub max_recursion_depth: usize,
}

impl Default for FormBrowserConfiguration {
    fn default() -> Self {
        FormBrowserConfiguration {
            device_path: Vec::new(),
            stack_size_increment: STACK_SIZE_INCREMENT,
            max_recursion_depth: MAX_RECURSION_DEPTH,
        }
    }
}

impl FormBrowserConfiguration {
    /// Creates a configuration for a driver identified by `device_path`.
    pub fn with_device_path(device_path: &[u8]) -> Self {
        Self { device_path: device_path.to_vec(), ..Default::default() }
    }
}
