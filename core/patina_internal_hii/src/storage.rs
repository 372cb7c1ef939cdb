//! Question storage.
//!
//! A [`Storage`] is one varstore declared by the form set. Every storage keeps two copies of its contents: the
//! current copy, last loaded from or committed to the backing store, and the edit copy that question accesses and
//! `SET` expressions modify. Questions register the spans or names they use as [`RequestElement`]s so loads and
//! commits only move what the form set actually references.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{
    string::{String, ToString},
    vec::Vec,
};

use r_efi::efi;

use crate::{
    config_string::{self, NAME_VALUE_PLACEHOLDER},
    error::{HiiError, Result},
    services::HiiServices,
    value::VarStoreId,
};

/// The backing store behind a [`Storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// A driver owned byte buffer reached through config routing (`EFI_IFR_VARSTORE`).
    Buffer,
    /// Named hex values reached through config routing (`EFI_IFR_VARSTORE_NAME_VALUE`).
    NameValue,
    /// One platform variable per question, named by the question (`EFI_IFR_VARSTORE_EFI`).
    EfiVariable,
    /// A single platform variable holding a byte buffer (`EFI_IFR_VARSTORE_EFI` with a size and name).
    EfiVariableBuffer,
}

/// A span or name a question reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestElement {
    Block { offset: u16, width: u16 },
    Name(String),
}

/// One entry of a name/value storage, or one variable of an EFI variable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameValueEntry {
    pub name: String,
    /// Current value, hex encoded last byte first.
    pub value: String,
    /// Edit value, hex encoded last byte first.
    pub edit_value: String,
}

/// A varstore and its contents.
#[derive(Debug, Clone)]
pub struct Storage {
    pub kind: StorageKind,
    pub var_store_id: VarStoreId,
    pub guid: efi::Guid,
    /// Buffer and variable name; name/value and per-question variable storages have none.
    pub name: Option<String>,
    /// Variable attributes, for EFI variable storages.
    pub attributes: u32,
    /// Current contents of a buffer storage.
    pub buffer: Vec<u8>,
    /// Edit contents of a buffer storage.
    pub edit_buffer: Vec<u8>,
    /// Entries of a name/value or per-question variable storage, in first-reference order.
    pub name_values: Vec<NameValueEntry>,
    /// The `<ConfigHdr>` identifying the storage on the config routing wire.
    pub config_header: String,
    elements: Vec<RequestElement>,
    loaded: bool,
}

impl Storage {
    fn new(kind: StorageKind, var_store_id: VarStoreId, guid: efi::Guid, name: Option<String>, size: usize) -> Self {
        Self {
            kind,
            var_store_id,
            guid,
            name,
            attributes: 0,
            buffer: alloc::vec![0; size],
            edit_buffer: alloc::vec![0; size],
            name_values: Vec::new(),
            config_header: String::new(),
            elements: Vec::new(),
            loaded: false,
        }
    }

    /// Creates a buffer storage of `size` bytes.
    pub fn buffer(var_store_id: VarStoreId, guid: efi::Guid, name: &str, size: usize, device_path: &[u8]) -> Self {
        let mut storage = Self::new(StorageKind::Buffer, var_store_id, guid, Some(name.to_string()), size);
        storage.config_header = config_string::config_header(&guid, Some(name), device_path);
        storage
    }

    /// Creates a name/value storage.
    pub fn new_name_value(var_store_id: VarStoreId, guid: efi::Guid, device_path: &[u8]) -> Self {
        let mut storage = Self::new(StorageKind::NameValue, var_store_id, guid, None, 0);
        storage.config_header = config_string::config_header(&guid, None, device_path);
        storage
    }

    /// Creates a per-question EFI variable storage.
    pub fn efi_variable(var_store_id: VarStoreId, guid: efi::Guid, attributes: u32, device_path: &[u8]) -> Self {
        let mut storage = Self::new(StorageKind::EfiVariable, var_store_id, guid, None, 0);
        storage.attributes = attributes;
        storage.config_header = config_string::config_header(&guid, None, device_path);
        storage
    }

    /// Creates an EFI variable storage holding a `size` byte buffer in variable `name`.
    pub fn efi_variable_buffer(
        var_store_id: VarStoreId,
        guid: efi::Guid,
        attributes: u32,
        name: &str,
        size: usize,
        device_path: &[u8],
    ) -> Self {
        let mut storage = Self::new(StorageKind::EfiVariableBuffer, var_store_id, guid, Some(name.to_string()), size);
        storage.attributes = attributes;
        storage.config_header = config_string::config_header(&guid, Some(name), device_path);
        storage
    }

    /// True for storages whose contents are one byte buffer.
    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, StorageKind::Buffer | StorageKind::EfiVariableBuffer)
    }

    /// True once the storage has been loaded from its backing store.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The registered request elements, in registration order.
    pub fn elements(&self) -> &[RequestElement] {
        &self.elements
    }

    /// Registers a span or name a question uses. Returns false if it was already registered.
    ///
    /// Names are also added to the entry list with a placeholder value.
    pub fn add_request_element(&mut self, element: RequestElement) -> bool {
        if self.elements.contains(&element) {
            return false;
        }
        if let RequestElement::Name(name) = &element {
            self.name_value_entry(name);
        }
        self.elements.push(element);
        true
    }

    /// The `<ConfigRequest>` for every registered element.
    pub fn config_request(&self) -> String {
        request_string(&self.config_header, &self.elements)
    }

    /// Returns the entry for `name`, inserting a placeholder entry on first reference.
    pub fn name_value_entry(&mut self, name: &str) -> &mut NameValueEntry {
        let index = match self.name_values.iter().position(|entry| entry.name == name) {
            Some(index) => index,
            None => {
                self.name_values.push(NameValueEntry {
                    name: name.to_string(),
                    value: NAME_VALUE_PLACEHOLDER.to_string(),
                    edit_value: NAME_VALUE_PLACEHOLDER.to_string(),
                });
                self.name_values.len() - 1
            }
        };
        &mut self.name_values[index]
    }

    /// The edit value of `name`, if the entry exists.
    pub fn name_value(&self, name: &str) -> Option<&str> {
        self.name_values.iter().find(|entry| entry.name == name).map(|entry| entry.edit_value.as_str())
    }

    /// Sets the edit value of `name`. Repeated updates replace the value in place.
    pub fn set_name_value(&mut self, name: &str, value: &str) {
        self.name_value_entry(name).edit_value = value.to_string();
    }

    /// Serializes the edit copy of every registered element.
    pub fn to_config(&self) -> Result<String> {
        let spans: Vec<(u16, u16)> = self
            .elements
            .iter()
            .filter_map(|element| match element {
                RequestElement::Block { offset, width } => Some((*offset, *width)),
                RequestElement::Name(_) => None,
            })
            .collect();
        if self.is_buffer() {
            return config_string::block_to_config(&self.config_header, &spans, &self.edit_buffer);
        }
        let pairs = self.elements.iter().filter_map(|element| match element {
            RequestElement::Name(name) => self.name_value(name).map(|value| (name.as_str(), value)),
            RequestElement::Block { .. } => None,
        });
        Ok(config_string::name_value_to_config(&self.config_header, pairs))
    }

    /// Parses a `<ConfigResp>` into the edit copy.
    pub fn from_config(&mut self, config: &str) -> Result<()> {
        if self.is_buffer() {
            config_string::config_to_block(config, &mut self.edit_buffer)?;
        } else {
            for (name, value) in config_string::config_to_name_values(config) {
                self.set_name_value(&name, &value);
            }
        }
        Ok(())
    }

    /// Fetches the registered elements from the backing store into both copies.
    pub fn load(&mut self, services: &HiiServices<'_>) -> Result<()> {
        let result = match self.kind {
            StorageKind::Buffer | StorageKind::NameValue => self.load_from_routing(services),
            StorageKind::EfiVariableBuffer => match services.config_routing {
                Some(_) => self.load_from_routing(services),
                None => self.load_variable_buffer(services),
            },
            StorageKind::EfiVariable => self.load_variables(services),
        };
        match result {
            Ok(()) => {
                self.buffer.clone_from(&self.edit_buffer);
                for entry in self.name_values.iter_mut() {
                    entry.value.clone_from(&entry.edit_value);
                }
                self.loaded = true;
                log::debug!(target: "hii_storage", "loaded varstore {:#x} ({:?})", self.var_store_id, self.kind);
                Ok(())
            }
            Err(err) => {
                log::warn!(target: "hii_storage", "failed to load varstore {:#x}: {err}", self.var_store_id);
                Err(err)
            }
        }
    }

    fn load_from_routing(&mut self, services: &HiiServices<'_>) -> Result<()> {
        let routing = services.config_routing.ok_or(HiiError::Unsupported)?;
        if self.elements.is_empty() {
            return Ok(());
        }
        let response = routing.extract_config(&self.config_request())?;
        self.from_config(&response)
    }

    fn load_variable_buffer(&mut self, services: &HiiServices<'_>) -> Result<()> {
        let variables = services.variables.ok_or(HiiError::Unsupported)?;
        let name = self.name.as_deref().ok_or(HiiError::InvalidParameter)?;
        let data = variables.get_variable(name, &self.guid)?;
        let len = data.len().min(self.edit_buffer.len());
        self.edit_buffer[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    fn load_variables(&mut self, services: &HiiServices<'_>) -> Result<()> {
        let variables = services.variables.ok_or(HiiError::Unsupported)?;
        for entry in self.name_values.iter_mut() {
            match variables.get_variable(&entry.name, &self.guid) {
                Ok(data) => entry.edit_value = config_string::bytes_to_hex(&data),
                Err(HiiError::NotFound) => {
                    log::debug!(target: "hii_storage", "variable {} not present, keeping placeholder", entry.name)
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Writes the edit copy back to the backing store and makes it the current copy.
    pub fn commit(&mut self, services: &HiiServices<'_>) -> Result<()> {
        match self.kind {
            StorageKind::Buffer | StorageKind::NameValue => {
                let routing = services.config_routing.ok_or(HiiError::Unsupported)?;
                routing.route_config(&self.to_config()?)?;
            }
            StorageKind::EfiVariableBuffer => match (services.config_routing, services.variables) {
                (Some(routing), _) => routing.route_config(&self.to_config()?)?,
                (None, Some(variables)) => {
                    let name = self.name.as_deref().ok_or(HiiError::InvalidParameter)?;
                    variables.set_variable(name, &self.guid, self.attributes, &self.edit_buffer)?;
                }
                (None, None) => return Err(HiiError::Unsupported),
            },
            StorageKind::EfiVariable => {
                let variables = services.variables.ok_or(HiiError::Unsupported)?;
                for entry in self.name_values.iter().filter(|entry| entry.edit_value != entry.value) {
                    let width = entry.edit_value.len().div_ceil(2);
                    let data = config_string::hex_to_bytes(&entry.edit_value, width)?;
                    variables.set_variable(&entry.name, &self.guid, self.attributes, &data)?;
                }
            }
        }
        self.buffer.clone_from(&self.edit_buffer);
        for entry in self.name_values.iter_mut() {
            entry.value.clone_from(&entry.edit_value);
        }
        log::debug!(target: "hii_storage", "committed varstore {:#x}", self.var_store_id);
        Ok(())
    }

    /// Throws away edits, restoring the edit copy from the current copy.
    pub fn discard(&mut self) {
        self.edit_buffer.clone_from(&self.buffer);
        for entry in self.name_values.iter_mut() {
            entry.edit_value.clone_from(&entry.value);
        }
    }
}

/// Builds a `<ConfigRequest>` from a header and a list of elements.
pub fn request_string(header: &str, elements: &[RequestElement]) -> String {
    let mut request = String::from(header);
    for element in elements {
        match element {
            RequestElement::Block { offset, width } => {
                request.push_str(&alloc::format!("&OFFSET={offset:04x}&WIDTH={width:04x}"));
            }
            RequestElement::Name(name) => {
                request.push('&');
                request.push_str(name);
            }
        }
    }
    request
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::services::{MockConfigRouting, MockStringTable, MockVariableServices};
    use alloc::vec;

    fn guid() -> efi::Guid {
        efi::Guid::from_fields(0xA1B2C3D4, 0, 0, 0, 0, &[0; 6])
    }

    #[test]
    fn request_elements_are_registered_once() {
        let mut storage = Storage::buffer(1, guid(), "Setup", 8, &[]);
        assert!(storage.add_request_element(RequestElement::Block { offset: 2, width: 2 }));
        assert!(!storage.add_request_element(RequestElement::Block { offset: 2, width: 2 }));
        assert!(storage.add_request_element(RequestElement::Block { offset: 4, width: 1 }));
        assert!(storage.config_request().ends_with("&OFFSET=0002&WIDTH=0002&OFFSET=0004&WIDTH=0001"));
    }

    #[test]
    fn name_value_updates_are_idempotent() {
        let mut storage = Storage::new_name_value(2, guid(), &[]);
        storage.add_request_element(RequestElement::Name("Speed".into()));
        assert_eq!(storage.name_value("Speed"), Some(NAME_VALUE_PLACEHOLDER));
        storage.set_name_value("Speed", "0001");
        storage.set_name_value("Speed", "0002");
        assert_eq!(storage.name_values.len(), 1);
        assert_eq!(storage.name_value("Speed"), Some("0002"));
        assert!(storage.to_config().unwrap().ends_with("&Speed=0002"));
    }

    #[test]
    fn buffer_storage_loads_and_commits_through_routing() {
        let mut storage = Storage::buffer(1, guid(), "Setup", 4, &[]);
        storage.add_request_element(RequestElement::Block { offset: 1, width: 2 });
        let header = storage.config_header.clone();

        let mut routing = MockConfigRouting::new();
        let expected_request = storage.config_request();
        let response = alloc::format!("{header}&OFFSET=0001&WIDTH=0002&VALUE=BEEF");
        routing.expect_extract_config().withf(move |request| request == expected_request).returning(move |_| Ok(response.clone()));
        let expected_commit = alloc::format!("{header}&OFFSET=0001&WIDTH=0002&VALUE=cafe");
        routing.expect_route_config().withf(move |config| config == expected_commit).times(1).returning(|_| Ok(()));

        let strings = MockStringTable::new();
        let services = HiiServices::new(&strings).with_config_routing(&routing);
        storage.load(&services).unwrap();
        assert!(storage.is_loaded());
        assert_eq!(storage.buffer, vec![0, 0xEF, 0xBE, 0]);

        storage.edit_buffer[1..3].copy_from_slice(&[0xFE, 0xCA]);
        storage.commit(&services).unwrap();
        assert_eq!(storage.buffer, vec![0, 0xFE, 0xCA, 0]);
    }

    #[test]
    fn variable_storage_reads_each_variable() {
        let mut storage = Storage::efi_variable(3, guid(), 0x7, &[]);
        storage.add_request_element(RequestElement::Name("BootTimeout".into()));
        storage.add_request_element(RequestElement::Name("Missing".into()));

        let mut variables = MockVariableServices::new();
        variables.expect_get_variable().returning(|name, _| match name {
            "BootTimeout" => Ok(vec![0x05, 0x00]),
            _ => Err(HiiError::NotFound),
        });
        variables
            .expect_set_variable()
            .withf(|name, _, attributes, data| name == "BootTimeout" && *attributes == 0x7 && data == [0x0A, 0x00])
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let strings = MockStringTable::new();
        let services = HiiServices::new(&strings).with_variables(&variables);
        storage.load(&services).unwrap();
        assert_eq!(storage.name_value("BootTimeout"), Some("0005"));
        assert_eq!(storage.name_value("Missing"), Some(NAME_VALUE_PLACEHOLDER));

        storage.set_name_value("BootTimeout", "000a");
        storage.commit(&services).unwrap();
    }

    #[test]
    fn load_without_routing_is_unsupported() {
        let mut storage = Storage::buffer(1, guid(), "Setup", 4, &[]);
        storage.add_request_element(RequestElement::Block { offset: 0, width: 1 });
        let strings = MockStringTable::new();
        assert_eq!(storage.load(&HiiServices::new(&strings)), Err(HiiError::Unsupported));
        assert!(!storage.is_loaded());
    }

    #[test]
    fn discard_restores_current_copy() {
        let mut storage = Storage::buffer(1, guid(), "Setup", 2, &[]);
        storage.edit_buffer[0] = 9;
        storage.discard();
        assert_eq!(storage.edit_buffer, vec![0, 0]);
    }
}
