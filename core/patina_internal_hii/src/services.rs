//! Collaborator interfaces consumed by the form interpreter.
//!
//! The interpreter never talks to firmware directly. String lookups, config routing, variable access,
//! authorization and text matching are delegated to the traits in this module, bundled for a call in
//! [`HiiServices`]. A missing optional collaborator is never fatal: operators that need it yield
//! "undefined", except authorization which defaults to permitted.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{string::String, vec::Vec};

use r_efi::efi;

use crate::{
    error::Result,
    value::{DefaultId, HiiValue, QuestionId, StringId, ValueType},
};

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// String package access for the HII handle the form set was published under.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait StringTable {
    /// Returns the text of string `id`, if it exists.
    fn get_string(&self, id: StringId) -> Option<String>;

    /// Adds `value` to the string package and returns its new id.
    fn new_string(&self, value: &str) -> Option<StringId>;
}

/// Config routing (`EFI_HII_CONFIG_ROUTING_PROTOCOL`) access.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait ConfigRouting {
    /// Extracts the current configuration for a `<ConfigRequest>` and returns the `<ConfigResp>`.
    fn extract_config(&self, request: &str) -> Result<String>;

    /// Routes a `<ConfigResp>` back to the driver that owns it.
    fn route_config(&self, configuration: &str) -> Result<()>;
}

/// Platform variable access.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait VariableServices {
    /// Reads variable `name` in `namespace`.
    fn get_variable(&self, name: &str, namespace: &efi::Guid) -> Result<Vec<u8>>;

    /// Writes variable `name` in `namespace`.
    fn set_variable(&self, name: &str, namespace: &efi::Guid, attributes: u32, data: &[u8]) -> Result<()>;
}

/// User identity / permission checks used by the `SECURITY` opcode.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait Authorization {
    /// Returns true if the current user holds the permission set identified by `permissions`.
    fn has_permission(&self, permissions: &efi::Guid) -> bool;
}

/// Case-insensitive wildcard matching used by the `MATCH` opcode.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait TextMatcher {
    /// Returns true if `string` matches `pattern`.
    fn meta_match(&self, string: &str, pattern: &str) -> bool;
}

/// Regular expression matching used by the `MATCH2` opcode.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait RegularExpressionMatcher {
    /// Returns true if this matcher implements the syntax identified by `syntax`.
    fn supports(&self, syntax: &efi::Guid) -> bool;

    /// Matches `string` against `pattern` using `syntax`.
    fn is_match(&self, string: &str, pattern: &str, syntax: &efi::Guid) -> Result<bool>;
}

/// Driver callback (`EFI_HII_CONFIG_ACCESS_PROTOCOL`) used for callback-driven defaults.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait ConfigAccess {
    /// Asks the driver for the default of `question_id` in class `default_id`.
    fn default_value(&self, default_id: DefaultId, question_id: QuestionId, value_type: ValueType) -> Result<HiiValue>;
}

/// The collaborators available to one parse or evaluation.
#[derive(Clone, Copy)]
pub struct HiiServices<'a> {
    pub strings: &'a dyn StringTable,
    pub config_routing: Option<&'a dyn ConfigRouting>,
    pub variables: Option<&'a dyn VariableServices>,
    pub authorization: Option<&'a dyn Authorization>,
    pub text_matcher: Option<&'a dyn TextMatcher>,
    pub regex_matchers: &'a [&'a dyn RegularExpressionMatcher],
    pub config_access: Option<&'a dyn ConfigAccess>,
}

impl<'a> HiiServices<'a> {
    /// Creates a service bundle with only a string table.
    pub fn new(strings: &'a dyn StringTable) -> Self {
        Self {
            strings,
            config_routing: None,
            variables: None,
            authorization: None,
            text_matcher: None,
            regex_matchers: &[],
            config_access: None,
        }
    }

    pub fn with_config_routing(mut self, config_routing: &'a dyn ConfigRouting) -> Self {
        self.config_routing = Some(config_routing);
        self
    }

    pub fn with_variables(mut self, variables: &'a dyn VariableServices) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_authorization(mut self, authorization: &'a dyn Authorization) -> Self {
        self.authorization = Some(authorization);
        self
    }

    pub fn with_text_matcher(mut self, text_matcher: &'a dyn TextMatcher) -> Self {
        self.text_matcher = Some(text_matcher);
        self
    }

    pub fn with_regex_matchers(mut self, regex_matchers: &'a [&'a dyn RegularExpressionMatcher]) -> Self {
        self.regex_matchers = regex_matchers;
        self
    }

    pub fn with_config_access(mut self, config_access: &'a dyn ConfigAccess) -> Self {
        self.config_access = Some(config_access);
        self
    }
}

/// A [`TextMatcher`] implementing the unicode collation `MetaiMatch` rules.
///
/// `*` matches any run of characters, `?` matches one character, and `[...]` matches one character from a set
/// that may contain `a-z` style ranges. Comparison is case-insensitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetaiMatcher;

impl MetaiMatcher {
    fn matches(string: &[char], pattern: &[char]) -> bool {
        let Some((&first, rest)) = pattern.split_first() else {
            return string.is_empty();
        };
        match first {
            '*' => (0..=string.len()).any(|skip| Self::matches(&string[skip..], rest)),
            '?' => !string.is_empty() && Self::matches(&string[1..], rest),
            '[' => {
                let Some(close) = rest.iter().position(|&c| c == ']') else {
                    return false;
                };
                let Some(&c) = string.first() else {
                    return false;
                };
                let set = &rest[..close];
                let mut hit = false;
                let mut index = 0;
                while index < set.len() {
                    if index + 2 < set.len() && set[index + 1] == '-' {
                        hit |= set[index] <= c && c <= set[index + 2];
                        index += 3;
                    } else {
                        hit |= set[index] == c;
                        index += 1;
                    }
                }
                hit && Self::matches(&string[1..], &rest[close + 1..])
            }
            literal => string.first() == Some(&literal) && Self::matches(&string[1..], rest),
        }
    }
}

impl TextMatcher for MetaiMatcher {
    fn meta_match(&self, string: &str, pattern: &str) -> bool {
        let string: Vec<char> = string.chars().flat_map(char::to_uppercase).collect();
        let pattern: Vec<char> = pattern.chars().flat_map(char::to_uppercase).collect();
        Self::matches(&string, &pattern)
    }
}
