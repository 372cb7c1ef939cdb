//! Form set object model.
//!
//! [`FormSet::parse`] turns an IFR opcode stream into a [`FormSet`] owning its [`Form`]s, [`Storage`]s and
//! [`DefaultStore`]s. Forms own their [`Statement`]s; questions own their options, defaults and expressions.
//! Conditional expressions that apply to several objects are shared through [`ExpressionRef`].
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
    config::FormBrowserConfiguration,
    config_string::{self, AltConfigElement},
    error::{HiiError, Result},
    expression::ExpressionRef,
    ifr::question_flags,
    parser::Parser,
    services::HiiServices,
    storage::{RequestElement, Storage},
    value::{DefaultId, FormId, HiiValue, QuestionId, StringId, ValueType, VarStoreId},
};

/// HII package type of a forms package.
pub const HII_PACKAGE_FORMS: u8 = 0x02;
/// Size of `EFI_HII_PACKAGE_HEADER`.
pub const HII_PACKAGE_HEADER_SIZE: usize = 4;

/// `EFI_IFR_ONE_OF_OPTION` flags.
pub mod option_flags {
    pub const DEFAULT: u8 = 0x10;
    pub const DEFAULT_MFG: u8 = 0x20;
}

/// `EFI_IFR_CHECKBOX` flags.
pub mod checkbox_flags {
    pub const DEFAULT: u8 = 0x01;
    pub const DEFAULT_MFG: u8 = 0x02;
}

/// A declared default class (`EFI_IFR_DEFAULTSTORE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultStore {
    pub default_id: DefaultId,
    /// Display name of the class.
    pub name: StringId,
}

/// A default attached to a question (`EFI_IFR_DEFAULT`).
#[derive(Debug, Clone)]
pub struct QuestionDefault {
    pub default_id: DefaultId,
    /// The literal value, undefined when the default is computed.
    pub value: HiiValue,
    /// The expression computing the default, if the record carried one.
    pub expression: Option<ExpressionRef>,
}

/// One selectable value of a one-of or ordered list question.
#[derive(Debug, Clone)]
pub struct QuestionOption {
    pub text: StringId,
    /// Default flags, see [`option_flags`].
    pub flags: u8,
    pub value: HiiValue,
    /// Conditionals gating the option, outermost first.
    pub conditions: Vec<ExpressionRef>,
}

/// What a statement is, with the fields specific to its opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// A section heading.
    Subtitle {
        /// `EFI_IFR_FLAGS_HORIZONTAL`.
        flags: u8,
    },
    /// Static text, with an optional second column.
    Text {
        /// The right-hand text, zero for none.
        text_two: StringId,
    },
    /// A button that applies the defaults of one class.
    ResetButton {
        /// The default class applied.
        default_id: DefaultId,
    },
    /// A button that sends a configuration request.
    Action {
        /// String id of the request, zero for none.
        config: StringId,
    },
    /// A link to another form or question (`REF` through `REF5`).
    Ref {
        /// The target form, zero to stay on the current one.
        form_id: FormId,
        /// The target question, zero for none.
        question_id: QuestionId,
        /// The target form set, when it is another one.
        form_set_guid: Option<efi::Guid>,
        /// String id of the target driver's device path, zero for the current one.
        device_path: StringId,
    },
    /// A boolean question.
    Checkbox {
        /// Default and reset flags, see [`checkbox_flags`].
        flags: u8,
    },
    /// An integer question with a range.
    Numeric {
        /// Size and display flags; the low two bits select the width.
        flags: u8,
        minimum: u64,
        maximum: u64,
        /// Increment used by the browser, zero for free entry.
        step: u64,
    },
    /// An integer question that selects one of its options.
    OneOf {
        /// Size and display flags; the low two bits select the width.
        flags: u8,
        minimum: u64,
        maximum: u64,
        step: u64,
    },
    /// A question whose value is an ordered array of option values.
    OrderedList {
        /// The number of array slots.
        max_containers: u8,
        flags: u8,
        /// The element type, taken from the first option.
        element_type: Option<ValueType>,
    },
    /// A free text question.
    String {
        /// Minimum length in characters.
        min_size: u8,
        /// Maximum length in characters.
        max_size: u8,
        flags: u8,
    },
    /// A password question.
    Password {
        /// Minimum length in characters.
        min_size: u16,
        /// Maximum length in characters.
        max_size: u16,
    },
    /// A calendar date question.
    Date {
        /// Which fields are stored and how.
        flags: u8,
    },
    /// A time of day question.
    Time {
        /// Which fields are stored and how.
        flags: u8,
    },
}

impl StatementKind {
    /// True for statements that carry a question header.
    pub fn is_question(&self) -> bool {
        !matches!(self, StatementKind::Subtitle { .. } | StatementKind::Text { .. } | StatementKind::ResetButton { .. })
    }

    /// True for questions that own an option list.
    pub fn has_options(&self) -> bool {
        matches!(self, StatementKind::OneOf { .. } | StatementKind::OrderedList { .. })
    }
}

/// A statement or question.
#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub prompt: StringId,
    pub help: StringId,
    /// Zero for statements that are not questions.
    pub question_id: QuestionId,
    /// Zero when the question has no storage.
    pub var_store_id: VarStoreId,
    /// Offset into a buffer storage, or the string id naming the entry.
    pub var_store_info: u16,
    pub flags: u8,
    pub value_type: ValueType,
    /// Bytes the value occupies in storage.
    pub storage_width: usize,
    /// Index of the storage in [`FormSet::storages`].
    pub storage: Option<usize>,
    /// Entry name for name/value and per-question variable storages.
    pub variable_name: Option<String>,
    /// The value of a question without storage.
    pub value: HiiValue,
    pub options: Vec<QuestionOption>,
    pub defaults: Vec<QuestionDefault>,
    pub no_submit: Vec<ExpressionRef>,
    pub inconsistent: Vec<ExpressionRef>,
    pub warning: Vec<ExpressionRef>,
    pub value_expression: Option<ExpressionRef>,
    pub read_expression: Option<ExpressionRef>,
    pub write_expression: Option<ExpressionRef>,
    /// Refresh interval in seconds, zero for none.
    pub refresh_interval: u8,
    pub refresh_event: Option<efi::Guid>,
    pub locked: bool,
    /// Conditionals gating the statement, outermost first.
    pub conditions: Vec<ExpressionRef>,
    /// Index of the enclosing statement in the same form.
    pub parent: Option<usize>,
}

impl Statement {
    pub(crate) fn new(kind: StatementKind, prompt: StringId, help: StringId) -> Self {
        Self {
            kind,
            prompt,
            help,
            question_id: 0,
            var_store_id: 0,
            var_store_info: 0,
            flags: 0,
            value_type: ValueType::Undefined,
            storage_width: 0,
            storage: None,
            variable_name: None,
            value: HiiValue::Undefined,
            options: Vec::new(),
            defaults: Vec::new(),
            no_submit: Vec::new(),
            inconsistent: Vec::new(),
            warning: Vec::new(),
            value_expression: None,
            read_expression: None,
            write_expression: None,
            refresh_interval: 0,
            refresh_event: None,
            locked: false,
            conditions: Vec::new(),
            parent: None,
        }
    }

    pub fn is_question(&self) -> bool {
        self.kind.is_question()
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & question_flags::READ_ONLY != 0
    }

    pub fn is_callback(&self) -> bool {
        self.flags & question_flags::CALLBACK != 0
    }

    /// The request element this question registers against its storage.
    pub fn request_element(&self) -> Option<RequestElement> {
        if self.storage.is_none() || self.storage_width == 0 {
            return None;
        }
        Some(match &self.variable_name {
            Some(name) => RequestElement::Name(name.clone()),
            None => RequestElement::Block { offset: self.var_store_info, width: self.storage_width as u16 },
        })
    }
}

/// The storage elements one form references, used to build per-form config requests.
#[derive(Debug, Clone)]
pub struct FormConfigRequest {
    pub var_store_id: VarStoreId,
    pub storage: usize,
    pub elements: Vec<RequestElement>,
}

/// One form (page).
#[derive(Debug, Clone, Default)]
pub struct Form {
    pub form_id: FormId,
    pub title: StringId,
    pub statements: Vec<Statement>,
    pub config_requests: Vec<FormConfigRequest>,
    /// Form local rules referenced by `RULE_REF`.
    pub rules: Vec<ExpressionRef>,
    /// Form set level conditionals gating the whole form.
    pub conditions: Vec<ExpressionRef>,
    pub modal: bool,
    pub locked: bool,
}

impl Form {
    /// Index of the statement for `question_id`.
    pub fn question_index(&self, question_id: QuestionId) -> Option<usize> {
        if question_id == 0 {
            return None;
        }
        self.statements.iter().position(|statement| statement.question_id == question_id)
    }

    /// The rule with id `rule_id`.
    pub fn rule(&self, rule_id: u8) -> Option<ExpressionRef> {
        self.rules.iter().find(|rule| rule.rule_id() == Some(rule_id)).cloned()
    }

    /// Records that this form uses `element` of storage `storage`.
    pub fn add_config_request(&mut self, var_store_id: VarStoreId, storage: usize, element: RequestElement) {
        let index = match self.config_requests.iter().position(|request| request.storage == storage) {
            Some(index) => index,
            None => {
                self.config_requests.push(FormConfigRequest { var_store_id, storage, elements: Vec::new() });
                self.config_requests.len() - 1
            }
        };
        let request = &mut self.config_requests[index];
        if !request.elements.contains(&element) {
            request.elements.push(element);
        }
    }
}

/// An alternate configuration response for one storage and default class.
#[derive(Debug, Clone)]
pub struct AltConfig {
    pub storage: usize,
    pub default_id: DefaultId,
    pub response: String,
}

/// A parsed form set.
#[derive(Debug, Clone)]
pub struct FormSet {
    pub guid: efi::Guid,
    pub title: StringId,
    pub help: StringId,
    pub class_guids: Vec<efi::Guid>,
    /// The opcode stream the form set was parsed from.
    pub opcodes: Vec<u8>,
    pub forms: Vec<Form>,
    pub storages: Vec<Storage>,
    /// Declared default classes, ascending by id.
    pub default_stores: Vec<DefaultStore>,
    pub alt_configs: Vec<AltConfig>,
    pub config: FormBrowserConfiguration,
}

impl FormSet {
    pub(crate) fn new(opcodes: &[u8], config: &FormBrowserConfiguration) -> Self {
        Self {
            guid: efi::Guid::from_bytes(&[0; 16]),
            title: 0,
            help: 0,
            class_guids: Vec::new(),
            opcodes: opcodes.to_vec(),
            forms: Vec::new(),
            storages: Vec::new(),
            default_stores: Vec::new(),
            alt_configs: Vec::new(),
            config: config.clone(),
        }
    }

    /// Parses an IFR opcode stream.
    pub fn parse(opcodes: &[u8], config: &FormBrowserConfiguration, services: &HiiServices<'_>) -> Result<Self> {
        Parser::new(opcodes, config, services).parse()
    }

    /// Parses the IFR carried by a forms package (`EFI_HII_FORM_PACKAGE_HDR`).
    pub fn from_package(
        package: &[u8],
        config: &FormBrowserConfiguration,
        services: &HiiServices<'_>,
    ) -> Result<Self> {
        let header = package.pread_with::<u32>(0, scroll::LE).map_err(|_| HiiError::InvalidPackage)?;
        let length = (header & 0x00FF_FFFF) as usize;
        let package_type = (header >> 24) as u8;
        if package_type != HII_PACKAGE_FORMS || length < HII_PACKAGE_HEADER_SIZE || length > package.len() {
            log::error!(target: "hii_parse", "invalid forms package: type {package_type:#x}, length {length:#x}");
            return Err(HiiError::InvalidPackage);
        }
        Self::parse(&package[HII_PACKAGE_HEADER_SIZE..length], config, services)
    }

    /// Index of the storage declared with `var_store_id`.
    pub fn storage_index(&self, var_store_id: VarStoreId) -> Option<usize> {
        self.storages.iter().position(|storage| storage.var_store_id == var_store_id)
    }

    /// Index of the form with `form_id`.
    pub fn form_index(&self, form_id: FormId) -> Option<usize> {
        self.forms.iter().position(|form| form.form_id == form_id)
    }

    /// Locates a question, searching `preferred_form` first and then every form.
    pub fn find_question(&self, preferred_form: Option<usize>, question_id: QuestionId) -> Option<(usize, usize)> {
        if let Some(form) = preferred_form {
            if let Some(index) = self.forms.get(form).and_then(|f| f.question_index(question_id)) {
                return Some((form, index));
            }
        }
        self.forms
            .iter()
            .enumerate()
            .find_map(|(form, f)| f.question_index(question_id).map(|index| (form, index)))
    }

    /// Adds a default class, keeping the list sorted by id.
    pub(crate) fn add_default_store(&mut self, store: DefaultStore) {
        match self.default_stores.binary_search_by_key(&store.default_id, |s| s.default_id) {
            Ok(_) => log::warn!(target: "hii_parse", "duplicate default store {:#x} ignored", store.default_id),
            Err(position) => self.default_stores.insert(position, store),
        }
    }

    fn statement(&self, form: usize, statement: usize) -> Result<&Statement> {
        self.forms.get(form).and_then(|f| f.statements.get(statement)).ok_or(HiiError::NotFound)
    }

    /// Loads every storage from its backing store.
    ///
    /// Every storage is attempted; the first failure is returned.
    pub fn load_storages(&mut self, services: &HiiServices<'_>) -> Result<()> {
        let mut result = Ok(());
        for storage in self.storages.iter_mut() {
            if let Err(err) = storage.load(services) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Fetches the alternate configuration of every storage for every declared default class.
    ///
    /// Failures are logged and skipped; a storage without alternate configuration falls back to the other default
    /// sources.
    pub fn fetch_alt_config(&mut self, services: &HiiServices<'_>) -> Result<()> {
        let routing = services.config_routing.ok_or(HiiError::Unsupported)?;
        self.alt_configs.clear();
        for (index, storage) in self.storages.iter().enumerate() {
            if storage.elements().is_empty() {
                continue;
            }
            for store in &self.default_stores {
                let request = config_string::alt_config_request(&storage.config_header, store.default_id);
                match routing.extract_config(&request) {
                    Ok(response) => {
                        self.alt_configs.push(AltConfig { storage: index, default_id: store.default_id, response })
                    }
                    Err(err) => log::warn!(
                        target: "hii_storage",
                        "no alternate config {:#x} for varstore {:#x}: {err}",
                        store.default_id,
                        storage.var_store_id
                    ),
                }
            }
        }
        Ok(())
    }

    /// Looks up a question's value for `default_id` in the fetched alternate configurations.
    pub fn alt_config_value(
        &self,
        form: usize,
        statement: usize,
        default_id: DefaultId,
        services: &HiiServices<'_>,
    ) -> Option<HiiValue> {
        let statement = self.statement(form, statement).ok()?;
        let storage_index = statement.storage?;
        let storage = self.storages.get(storage_index)?;
        let element = statement.request_element()?;
        let lookup = match &element {
            RequestElement::Block { offset, width } => AltConfigElement::Block { offset: *offset, width: *width },
            RequestElement::Name(name) => AltConfigElement::Name(name),
        };
        let hex = self
            .alt_configs
            .iter()
            .filter(|alt| alt.storage == storage_index && alt.default_id == default_id)
            .find_map(|alt| config_string::find_alt_config(&alt.response, &storage.config_header, default_id, lookup))?;
        let bytes = config_string::hex_to_bytes(&hex, statement.storage_width).ok()?;
        decode_question_bytes(statement.value_type, &bytes, services).ok()
    }

    /// Reads the current value of a question.
    ///
    /// Values come from the storage edit copy, loading the storage on first use. Questions without storage return
    /// their own value.
    pub fn question_value(&mut self, form: usize, statement: usize, services: &HiiServices<'_>) -> Result<HiiValue> {
        let question = self.statement(form, statement)?;
        let Some(storage_index) = question.storage else {
            return Ok(question.value.clone());
        };
        let (value_type, width, offset) = (question.value_type, question.storage_width, question.var_store_info);
        let name = question.variable_name.clone();
        let var_store_id = question.var_store_id;

        let storage = self.storages.get_mut(storage_index).ok_or(HiiError::UnknownStorage(var_store_id))?;
        if !storage.is_loaded() {
            storage.load(services)?;
        }
        let bytes = match (&name, storage.is_buffer()) {
            (None, true) => {
                let start = offset as usize;
                storage.edit_buffer.get(start..start + width).ok_or(HiiError::BufferTooSmall)?.to_vec()
            }
            (Some(name), false) => {
                let hex = storage.name_value(name).ok_or(HiiError::NotFound)?;
                config_string::hex_to_bytes(hex, width)?
            }
            _ => return Err(HiiError::InvalidParameter),
        };
        decode_question_bytes(value_type, &bytes, services)
    }

    /// Writes a question's value into its storage edit copy, or into the question itself when it has no storage.
    pub fn set_question_value(
        &mut self,
        form: usize,
        statement: usize,
        value: HiiValue,
        services: &HiiServices<'_>,
    ) -> Result<()> {
        let question = self.statement(form, statement)?;
        let Some(storage_index) = question.storage else {
            self.forms[form].statements[statement].value = value;
            return Ok(());
        };
        let (value_type, width, offset) = (question.value_type, question.storage_width, question.var_store_info);
        let name = question.variable_name.clone();
        let bytes = encode_question_bytes(value_type, width, &value, services)?;

        let storage = self.storages.get_mut(storage_index).ok_or(HiiError::NotFound)?;
        if !storage.is_loaded() {
            if let Err(err) = storage.load(services) {
                log::debug!(target: "hii_storage", "writing to unloaded varstore {:#x}: {err}", storage.var_store_id);
            }
        }
        match (&name, storage.is_buffer()) {
            (None, true) => {
                let start = offset as usize;
                let target = storage.edit_buffer.get_mut(start..start + width).ok_or(HiiError::BufferTooSmall)?;
                target.copy_from_slice(&bytes);
            }
            (Some(name), false) => storage.set_name_value(name, &config_string::bytes_to_hex(&bytes)),
            _ => return Err(HiiError::InvalidParameter),
        }
        self.forms[form].statements[statement].value = value;
        Ok(())
    }

    /// Commits the edit copy of every loaded storage.
    pub fn commit_storages(&mut self, services: &HiiServices<'_>) -> Result<()> {
        for storage in self.storages.iter_mut().filter(|storage| storage.is_loaded()) {
            storage.commit(services)?;
        }
        Ok(())
    }
}

/// Decodes storage bytes into a question value. Strings are stored as UTF-16 text and surface as new string ids.
pub(crate) fn decode_question_bytes(value_type: ValueType, bytes: &[u8], services: &HiiServices<'_>) -> Result<HiiValue> {
    match value_type {
        ValueType::String => {
            let text: String = char::decode_utf16(
                bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).take_while(|&unit| unit != 0),
            )
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
            services.strings.new_string(&text).map(HiiValue::String).ok_or(HiiError::OutOfResources)
        }
        ValueType::Buffer => Ok(HiiValue::Buffer(bytes.to_vec())),
        value_type => HiiValue::from_bytes(value_type, bytes).ok_or(HiiError::BufferTooSmall),
    }
}

/// Encodes a question value into exactly `width` storage bytes.
pub(crate) fn encode_question_bytes(
    value_type: ValueType,
    width: usize,
    value: &HiiValue,
    services: &HiiServices<'_>,
) -> Result<Vec<u8>> {
    let mut bytes = match (value_type, value) {
        (ValueType::String, HiiValue::String(id)) => {
            let text = services.strings.get_string(*id).ok_or(HiiError::NotFound)?;
            text.encode_utf16().flat_map(u16::to_le_bytes).collect()
        }
        (ValueType::Buffer, HiiValue::Buffer(buffer)) => buffer.clone(),
        (value_type, value) if value_type.is_integer() || value_type == ValueType::Boolean => {
            let number = value.to_u64().ok_or(HiiError::InvalidParameter)?;
            HiiValue::from_u64(value_type, number).to_bytes()
        }
        (value_type, value) if value.value_type() == value_type => value.to_bytes(),
        _ => return Err(HiiError::InvalidParameter),
    };
    bytes.resize(width, 0);
    Ok(bytes)
}

impl core::fmt::Display for Form {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "form {:#x} ({} statements)", self.form_id, self.statements.len())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::services::{MockConfigRouting, MockStringTable};
    use alloc::{format, string::ToString, vec};

    fn numeric(var_store_info: u16, value_type: ValueType) -> Statement {
        let mut statement =
            Statement::new(StatementKind::Numeric { flags: 0, minimum: 0, maximum: 10, step: 0 }, 1, 2);
        statement.question_id = 1;
        statement.var_store_id = 1;
        statement.var_store_info = var_store_info;
        statement.value_type = value_type;
        statement.storage_width = value_type.width();
        statement.storage = Some(0);
        statement
    }

    fn form_set_with(statement: Statement, storage: Storage) -> FormSet {
        let mut form_set = FormSet::new(&[], &FormBrowserConfiguration::default());
        form_set.storages.push(storage);
        form_set.forms.push(Form { form_id: 1, statements: vec![statement], ..Default::default() });
        form_set
    }

    fn guid() -> efi::Guid {
        efi::Guid::from_fields(1, 2, 3, 4, 5, &[6; 6])
    }

    fn loaded(mut storage: Storage) -> Storage {
        let strings = MockStringTable::new();
        let mut routing = MockConfigRouting::new();
        routing.expect_extract_config().returning(|request| Ok(request.to_string()));
        storage.load(&HiiServices::new(&strings).with_config_routing(&routing)).unwrap();
        storage
    }

    #[test]
    fn buffer_question_value_round_trips_through_edit_copy() {
        let mut storage = Storage::buffer(1, guid(), "Setup", 8, &[]);
        storage.add_request_element(RequestElement::Block { offset: 2, width: 2 });
        let mut form_set = form_set_with(numeric(2, ValueType::U16), loaded(storage));
        let strings = MockStringTable::new();
        let services = HiiServices::new(&strings);

        form_set.set_question_value(0, 0, HiiValue::U64(0x1234), &services).unwrap();
        assert_eq!(form_set.storages[0].edit_buffer, vec![0, 0, 0x34, 0x12, 0, 0, 0, 0]);
        assert_eq!(form_set.question_value(0, 0, &services), Ok(HiiValue::U16(0x1234)));
    }

    #[test]
    fn name_value_question_uses_named_entry() {
        let mut storage = Storage::new_name_value(1, guid(), &[]);
        storage.add_request_element(RequestElement::Name("Speed".into()));
        let mut statement = numeric(7, ValueType::U8);
        statement.variable_name = Some("Speed".into());
        let mut form_set = form_set_with(statement, loaded(storage));
        let strings = MockStringTable::new();
        let services = HiiServices::new(&strings);

        assert_eq!(form_set.question_value(0, 0, &services), Ok(HiiValue::U8(0)));
        form_set.set_question_value(0, 0, HiiValue::U8(3), &services).unwrap();
        assert_eq!(form_set.storages[0].name_value("Speed"), Some("03"));
        assert_eq!(form_set.storages[0].name_values.len(), 1);
    }

    #[test]
    fn string_question_stores_utf16_text() {
        let mut storage = Storage::buffer(1, guid(), "Setup", 8, &[]);
        storage.add_request_element(RequestElement::Block { offset: 0, width: 8 });
        let mut statement = numeric(0, ValueType::String);
        statement.kind = StatementKind::String { min_size: 0, max_size: 4, flags: 0 };
        statement.storage_width = 8;
        let mut form_set = form_set_with(statement, loaded(storage));

        let mut strings = MockStringTable::new();
        strings.expect_get_string().returning(|_| Some("Hi".to_string()));
        strings.expect_new_string().withf(|text| text == "Hi").returning(|_| Some(0x40));
        let services = HiiServices::new(&strings);

        form_set.set_question_value(0, 0, HiiValue::String(0x20), &services).unwrap();
        assert_eq!(form_set.storages[0].edit_buffer, vec![b'H', 0, b'i', 0, 0, 0, 0, 0]);
        assert_eq!(form_set.question_value(0, 0, &services), Ok(HiiValue::String(0x40)));
    }

    #[test]
    fn question_without_storage_keeps_its_own_value() {
        let mut statement = numeric(0, ValueType::U8);
        statement.storage = None;
        let mut form_set = form_set_with(statement, Storage::new_name_value(9, guid(), &[]));
        let strings = MockStringTable::new();
        let services = HiiServices::new(&strings);
        form_set.set_question_value(0, 0, HiiValue::U8(4), &services).unwrap();
        assert_eq!(form_set.question_value(0, 0, &services), Ok(HiiValue::U8(4)));
    }

    #[test]
    fn default_stores_stay_sorted() {
        let mut form_set = FormSet::new(&[], &FormBrowserConfiguration::default());
        form_set.add_default_store(DefaultStore { default_id: 1, name: 0 });
        form_set.add_default_store(DefaultStore { default_id: 0, name: 0 });
        form_set.add_default_store(DefaultStore { default_id: 1, name: 5 });
        let ids: Vec<_> = form_set.default_stores.iter().map(|s| s.default_id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn alternate_config_supplies_question_value() {
        let mut storage = Storage::buffer(1, guid(), "Setup", 8, &[]);
        storage.add_request_element(RequestElement::Block { offset: 2, width: 2 });
        let header = storage.config_header.clone();
        let mut form_set = form_set_with(numeric(2, ValueType::U16), storage);
        form_set.add_default_store(DefaultStore { default_id: 0, name: 0 });

        let mut routing = MockConfigRouting::new();
        routing.expect_extract_config().returning(move |request| {
            Ok(format!("{request}&OFFSET=0002&WIDTH=0002&VALUE=0007").replace(&header, &header.to_uppercase()))
        });
        let strings = MockStringTable::new();
        form_set.fetch_alt_config(&HiiServices::new(&strings).with_config_routing(&routing)).unwrap();
        assert_eq!(form_set.alt_configs.len(), 1);
        let services = HiiServices::new(&strings);
        assert_eq!(form_set.alt_config_value(0, 0, 0, &services), Some(HiiValue::U16(7)));
        assert_eq!(form_set.alt_config_value(0, 0, 1, &services), None);
    }

    #[test]
    fn package_header_is_validated() {
        let strings = MockStringTable::new();
        let services = HiiServices::new(&strings);
        let config = FormBrowserConfiguration::default();
        assert_eq!(FormSet::from_package(&[4, 0, 0, 0x04], &config, &services).err(), Some(HiiError::InvalidPackage));
        assert_eq!(FormSet::from_package(&[9, 0, 0, 0x02], &config, &services).err(), Some(HiiError::InvalidPackage));
        assert_eq!(FormSet::from_package(&[4, 0], &config, &services).err(), Some(HiiError::InvalidPackage));
        assert_eq!(FormSet::from_package(&[4, 0, 0, 0x02], &config, &services).err(), Some(HiiError::MissingFormSet));
    }
}
