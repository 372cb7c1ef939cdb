//! End-to-end tests driving parsed IFR through evaluation, storage and default resolution.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use std::cell::RefCell;

use patina_internal_hii::{
    condition::{self, ExpressResult},
    config_string,
    default::{apply_form_defaults, question_default},
    evaluator,
    ifr::{encode_record, opcode},
    services::{ConfigRouting, StringTable},
    storage::{RequestElement, Storage},
    value::{DEFAULT_CLASS_MANUFACTURING, DEFAULT_CLASS_STANDARD},
    FormBrowserConfiguration, FormSet, HiiError, HiiServices, HiiValue, Result,
};
use r_efi::efi;
use uuid::Uuid;

const FORM_SET_GUID: Uuid = Uuid::from_u128(0x8c6f_4c4e_2f0a_4d2b_9c65_0d0d_2a5e_8f11);
const STORE_GUID: Uuid = Uuid::from_u128(0x1d2c_3b4a_5f6e_4788_99aa_bbcc_ddee_ff00);

fn guid_bytes(guid: Uuid) -> [u8; 16] {
    guid.to_bytes_le()
}

/// String package fake. Ids are 1-based positions.
#[derive(Default)]
struct Strings(RefCell<Vec<String>>);

impl Strings {
    fn with(values: &[&str]) -> Self {
        Self(RefCell::new(values.iter().map(|value| value.to_string()).collect()))
    }

    fn text(&self, value: &HiiValue) -> Option<String> {
        match value {
            HiiValue::String(id) => self.get_string(*id),
            _ => None,
        }
    }
}

impl StringTable for Strings {
    fn get_string(&self, id: u16) -> Option<String> {
        self.0.borrow().get((id as usize).checked_sub(1)?).cloned()
    }

    fn new_string(&self, value: &str) -> Option<u16> {
        let mut strings = self.0.borrow_mut();
        strings.push(value.to_string());
        u16::try_from(strings.len()).ok()
    }
}

/// Config routing fake holding a single buffer storage.
struct Routing {
    buffer: RefCell<Vec<u8>>,
    routed: RefCell<Vec<String>>,
}

impl Routing {
    fn new(buffer: &[u8]) -> Self {
        Self { buffer: RefCell::new(buffer.to_vec()), routed: RefCell::new(Vec::new()) }
    }
}

impl ConfigRouting for Routing {
    fn extract_config(&self, request: &str) -> Result<String> {
        let header_end = request.find("&OFFSET=").ok_or(HiiError::NotFound)?;
        let mut spans = Vec::new();
        let mut offset = None;
        for element in request[header_end..].split('&').filter(|element| !element.is_empty()) {
            let (key, value) = element.split_once('=').ok_or(HiiError::InvalidConfigString)?;
            let number = u16::from_str_radix(value, 16).map_err(|_| HiiError::InvalidConfigString)?;
            match key {
                "OFFSET" => offset = Some(number),
                "WIDTH" => spans.push((offset.take().ok_or(HiiError::InvalidConfigString)?, number)),
                _ => return Err(HiiError::InvalidConfigString),
            }
        }
        config_string::block_to_config(&request[..header_end], &spans, &self.buffer.borrow())
    }

    fn route_config(&self, configuration: &str) -> Result<()> {
        config_string::config_to_block(configuration, &mut self.buffer.borrow_mut())?;
        self.routed.borrow_mut().push(configuration.to_string());
        Ok(())
    }
}

fn rec(op: u8, payload: &[u8], scope: bool) -> Vec<u8> {
    encode_record(op, payload, scope)
}

fn end() -> Vec<u8> {
    rec(opcode::END, &[], false)
}

fn form_set(body: Vec<Vec<u8>>) -> Vec<u8> {
    let mut payload = guid_bytes(FORM_SET_GUID).to_vec();
    payload.extend_from_slice(&[1, 0, 2, 0, 0]);
    let mut stream = rec(opcode::FORM_SET, &payload, true);
    stream.extend(body.into_iter().flatten());
    stream.extend(end());
    stream
}

fn default_store(default_id: u16) -> Vec<u8> {
    let mut payload = vec![0x40, 0];
    payload.extend_from_slice(&default_id.to_le_bytes());
    rec(opcode::DEFAULTSTORE, &payload, false)
}

fn varstore(id: u16, size: u16) -> Vec<u8> {
    let mut payload = guid_bytes(STORE_GUID).to_vec();
    payload.extend_from_slice(&id.to_le_bytes());
    payload.extend_from_slice(&size.to_le_bytes());
    payload.extend_from_slice(b"Setup\0");
    rec(opcode::VARSTORE, &payload, false)
}

fn form(id: u16, body: Vec<Vec<u8>>) -> Vec<u8> {
    let mut payload = id.to_le_bytes().to_vec();
    payload.extend_from_slice(&[3, 0]);
    let mut stream = rec(opcode::FORM, &payload, true);
    stream.extend(body.into_iter().flatten());
    stream.extend(end());
    stream
}

fn question_header(question_id: u16, var_store_id: u16, info: u16) -> Vec<u8> {
    let mut header = vec![1, 0, 2, 0];
    header.extend_from_slice(&question_id.to_le_bytes());
    header.extend_from_slice(&var_store_id.to_le_bytes());
    header.extend_from_slice(&info.to_le_bytes());
    header.push(0);
    header
}

fn numeric_u16(question_id: u16, var_store_id: u16, offset: u16, minimum: u16, maximum: u16) -> Vec<u8> {
    let mut payload = question_header(question_id, var_store_id, offset);
    payload.push(0x01);
    for bound in [minimum, maximum, 1] {
        payload.extend_from_slice(&bound.to_le_bytes());
    }
    rec(opcode::NUMERIC, &payload, true)
}

fn numeric_u8(question_id: u16) -> Vec<u8> {
    let mut payload = question_header(question_id, 0, 0);
    payload.extend_from_slice(&[0x00, 0, 100, 1]);
    rec(opcode::NUMERIC, &payload, true)
}

fn checkbox(question_id: u16) -> Vec<u8> {
    let mut payload = question_header(question_id, 0, 0);
    payload.push(0);
    rec(opcode::CHECKBOX, &payload, false)
}

fn package(stream: &[u8]) -> Vec<u8> {
    let header = (stream.len() as u32 + 4) | 0x02 << 24;
    let mut package = header.to_le_bytes().to_vec();
    package.extend_from_slice(stream);
    package
}

fn parse(stream: &[u8], services: &HiiServices<'_>) -> FormSet {
    FormSet::parse(stream, &FormBrowserConfiguration::default(), services).unwrap()
}

#[test]
fn forms_package_is_validated_before_parsing() {
    let strings = Strings::default();
    let services = HiiServices::new(&strings);
    let config = FormBrowserConfiguration::default();
    let stream = form_set(vec![form(1, vec![])]);

    let form_set = FormSet::from_package(&package(&stream), &config, &services).unwrap();
    assert_eq!(form_set.guid, efi::Guid::from_bytes(&guid_bytes(FORM_SET_GUID)));
    assert_eq!(form_set.forms.len(), 1);

    let mut strings_package = package(&stream);
    strings_package[3] = 0x04;
    assert_eq!(FormSet::from_package(&strings_package, &config, &services).err(), Some(HiiError::InvalidPackage));
    assert_eq!(FormSet::from_package(&[0x08, 0, 0], &config, &services).err(), Some(HiiError::InvalidPackage));
}

#[test]
fn numeric_without_defaults_resolves_to_its_minimum() {
    let strings = Strings::default();
    let services = HiiServices::new(&strings);
    let question = vec![numeric_u16(0x10, 0, 0, 5, 10), end()];
    let mut form_set = parse(&form_set(vec![default_store(0), form(1, vec![question.concat()])]), &services);

    let value = question_default(&mut form_set, 0, 0, DEFAULT_CLASS_STANDARD, &services);
    assert_eq!(value, Ok(HiiValue::U16(5)));
}

#[test]
fn defaults_cascade_to_other_declared_classes() {
    let strings = Strings::default();
    let services = HiiServices::new(&strings);
    let question = vec![
        numeric_u16(0x10, 0, 0, 5, 10),
        rec(opcode::DEFAULT, &[1, 0, 0x01, 8, 0], false),
        end(),
    ];
    let stream = form_set(vec![default_store(1), default_store(0), form(1, vec![question.concat()])]);
    let mut form_set = parse(&stream, &services);
    assert_eq!(form_set.default_stores.iter().map(|store| store.default_id).collect::<Vec<_>>(), vec![0, 1]);

    assert_eq!(question_default(&mut form_set, 0, 0, DEFAULT_CLASS_MANUFACTURING, &services), Ok(HiiValue::U16(8)));
    assert_eq!(question_default(&mut form_set, 0, 0, DEFAULT_CLASS_STANDARD, &services), Ok(HiiValue::U16(8)));
}

#[test]
fn computed_defaults_run_their_value_expression() {
    let strings = Strings::default();
    let services = HiiServices::new(&strings);
    let question = vec![
        numeric_u16(0x10, 0, 0, 5, 10),
        rec(opcode::DEFAULT, &[0, 0, 0x01], true),
        rec(opcode::VALUE, &[], true),
        rec(opcode::UINT8, &[3], false),
        rec(opcode::UINT8, &[2], false),
        rec(opcode::MULTIPLY, &[], false),
        end(),
        end(),
        end(),
    ];
    let mut form_set = parse(&form_set(vec![default_store(0), form(1, vec![question.concat()])]), &services);
    assert_eq!(question_default(&mut form_set, 0, 0, DEFAULT_CLASS_STANDARD, &services), Ok(HiiValue::U16(6)));
}

#[test]
fn buffer_storage_round_trips_through_config_routing() {
    let strings = Strings::default();
    let routing = Routing::new(&[0, 0, 6, 0, 0, 0, 0, 0]);
    let services = HiiServices::new(&strings).with_config_routing(&routing);
    let question = vec![
        numeric_u16(0x10, 1, 2, 5, 10),
        rec(opcode::DEFAULT, &[0, 0, 0x01, 9, 0], false),
        end(),
    ];
    let stream = form_set(vec![default_store(0), varstore(1, 8), form(1, vec![question.concat()])]);
    let mut form_set = parse(&stream, &services);

    form_set.load_storages(&services).unwrap();
    assert_eq!(form_set.question_value(0, 0, &services), Ok(HiiValue::U16(6)));

    assert_eq!(apply_form_defaults(&mut form_set, 0, DEFAULT_CLASS_STANDARD, &services), Ok(1));
    assert_eq!(form_set.question_value(0, 0, &services), Ok(HiiValue::U16(9)));
    assert_eq!(routing.buffer.borrow()[2], 6);

    form_set.commit_storages(&services).unwrap();
    assert_eq!(*routing.buffer.borrow(), vec![0, 0, 9, 0, 0, 0, 0, 0]);
    assert!(routing.routed.borrow()[0].ends_with("&OFFSET=0002&WIDTH=0002&VALUE=0009"));
}

#[test]
fn form_and_statement_conditions_are_reported_separately() {
    let strings = Strings::default();
    let services = HiiServices::new(&strings);
    let body = vec![
        vec![numeric_u8(5), end()].concat(),
        rec(opcode::GRAY_OUT_IF, &[], true),
        rec(opcode::TRUE, &[], false),
        checkbox(6),
        end(),
    ];
    let suppressed_form = vec![
        rec(opcode::SUPPRESS_IF, &[], true),
        rec(opcode::EQ_ID_VAL, &[5, 0, 1, 0], false),
        form(1, body),
        end(),
    ];
    let mut form_set = parse(&form_set(vec![suppressed_form.concat()]), &services);

    // Questions without storage start at zero, so the suppression does not hold yet.
    assert_eq!(form_set.question_value(0, 0, &services), Ok(HiiValue::U8(0)));
    assert_eq!(form_set.question_value(0, 1, &services), Ok(HiiValue::Boolean(false)));
    assert_eq!(condition::form_condition(&mut form_set, 0, &services), Ok(ExpressResult::False));
    assert_eq!(condition::statement_condition(&mut form_set, 0, 1, &services), Ok(ExpressResult::GrayOut));

    form_set.set_question_value(0, 0, HiiValue::U8(1), &services).unwrap();
    assert_eq!(condition::form_condition(&mut form_set, 0, &services), Ok(ExpressResult::Suppress));
    assert_eq!(condition::statement_condition(&mut form_set, 0, 0, &services), Ok(ExpressResult::False));
    assert_eq!(condition::statement_condition(&mut form_set, 0, 1, &services), Ok(ExpressResult::GrayOut));
}

#[test]
fn questions_without_storage_compare_as_zero() {
    let strings = Strings::default();
    let services = HiiServices::new(&strings);
    let body = vec![
        vec![numeric_u8(5), end()].concat(),
        checkbox(6),
        rec(opcode::SUPPRESS_IF, &[], true),
        rec(opcode::EQ_ID_VAL, &[5, 0, 0, 0], false),
        checkbox(7),
        end(),
        rec(opcode::GRAY_OUT_IF, &[], true),
        rec(opcode::QUESTION_REF1, &[6, 0], false),
        rec(opcode::NOT, &[], false),
        checkbox(8),
        end(),
    ];
    let mut form_set = parse(&form_set(vec![form(1, body)]), &services);

    assert_eq!(condition::statement_condition(&mut form_set, 0, 2, &services), Ok(ExpressResult::Suppress));
    assert_eq!(condition::statement_condition(&mut form_set, 0, 3, &services), Ok(ExpressResult::GrayOut));

    form_set.set_question_value(0, 1, HiiValue::Boolean(true), &services).unwrap();
    assert_eq!(condition::statement_condition(&mut form_set, 0, 3, &services), Ok(ExpressResult::False));
}

#[test]
fn map_value_expressions_select_by_key() {
    let strings = Strings::with(&["one", "two"]);
    let services = HiiServices::new(&strings);
    let question = |key: u8| {
        vec![
            numeric_u8(5),
            rec(opcode::VALUE, &[], true),
            rec(opcode::UINT8, &[key], false),
            rec(opcode::MAP, &[], true),
            rec(opcode::UINT8, &[1], false),
            rec(opcode::STRING_REF1, &[1, 0], false),
            rec(opcode::UINT8, &[2], false),
            rec(opcode::STRING_REF1, &[2, 0], false),
            end(),
            end(),
            end(),
        ]
        .concat()
    };

    let mut hit = parse(&form_set(vec![form(1, vec![question(2)])]), &services);
    let value = evaluator::evaluate_value_expression(&mut hit, 0, 0, &services).unwrap();
    assert_eq!(value.and_then(|value| strings.text(&value)).as_deref(), Some("two"));

    let mut miss = parse(&form_set(vec![form(1, vec![question(3)])]), &services);
    assert_eq!(evaluator::evaluate_value_expression(&mut miss, 0, 0, &services), Ok(Some(HiiValue::Undefined)));
}

#[test]
fn comparisons_break_ties_by_length_and_case() {
    let strings = Strings::with(&["ABC", "abc"]);
    let shorter = HiiValue::Buffer(vec![1, 2, 3]);
    let longer = HiiValue::Buffer(vec![1, 2, 3, 0, 0]);
    assert_eq!(shorter.compare(&longer, &strings), Ok(core::cmp::Ordering::Less));
    assert_ne!(HiiValue::String(1).compare(&HiiValue::String(2), &strings), Ok(core::cmp::Ordering::Equal));
}

#[test]
fn block_config_round_trips_requested_spans() {
    let guid = efi::Guid::from_bytes(&guid_bytes(STORE_GUID));
    let mut storage = Storage::buffer(1, guid, "Setup", 12, &[]);
    storage.edit_buffer = (1..=12).collect();
    storage.add_request_element(RequestElement::Block { offset: 0, width: 2 });
    storage.add_request_element(RequestElement::Block { offset: 5, width: 4 });
    let config = storage.to_config().unwrap();

    let mut copy = Storage::buffer(1, guid, "Setup", 12, &[]);
    copy.from_config(&config.to_ascii_lowercase()).unwrap();
    assert_eq!(copy.edit_buffer[0..2], storage.edit_buffer[0..2]);
    assert_eq!(copy.edit_buffer[5..9], storage.edit_buffer[5..9]);
    assert_eq!(copy.edit_buffer[2..5], [0, 0, 0]);
    assert_eq!(copy.edit_buffer[9..], [0, 0, 0]);
}

#[test]
fn name_value_updates_replace_in_place() {
    let mut storage = Storage::new_name_value(2, efi::Guid::from_bytes(&guid_bytes(STORE_GUID)), &[]);
    storage.set_name_value("Speed", "0010");
    storage.set_name_value("Mode", "01");
    storage.set_name_value("Speed", "0020");
    assert_eq!(storage.name_values.len(), 2);
    assert_eq!(storage.name_value("Speed"), Some("0020"));
    assert_eq!(storage.name_values[0].name, "Speed");
}
