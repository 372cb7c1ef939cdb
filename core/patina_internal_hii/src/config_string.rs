//! Config string codec.
//!
//! Storage contents travel to and from the config routing collaborator as `<ConfigHdr>` prefixed text:
//!
//! ```text
//! GUID=<32 hex>&NAME=<4 hex per UTF-16 unit>&PATH=<hex device path>&OFFSET=0004&WIDTH=0002&VALUE=1234
//! GUID=<32 hex>&NAME=<4 hex per UTF-16 unit>&PATH=<hex device path>&Speed=0005
//! ```
//!
//! Buffer storage uses `OFFSET/WIDTH/VALUE` blocks; `VALUE` is the block bytes in reverse order, so a little endian
//! integer reads naturally. Name/value storage uses `&<name>=<hex>` pairs with the same byte order.
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
use r_efi::efi;

use crate::{
    error::{HiiError, Result},
    value::DefaultId,
};

/// Keys reserved by the config string grammar. Anything else is a name/value name.
const RESERVED_KEYS: [&str; 7] = ["GUID", "NAME", "PATH", "OFFSET", "WIDTH", "VALUE", "ALTCFG"];

/// Placeholder value given to a name/value entry before it is loaded.
pub const NAME_VALUE_PLACEHOLDER: &str = "0000000000000000";

/// Appends `bytes` to `out` as lowercase hex, first byte first.
fn push_hex(out: &mut String, bytes: impl IntoIterator<Item = u8>) {
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
}

/// Builds a `<ConfigHdr>` for a storage.
///
/// `name` is omitted (`NAME=` left empty) for storages that have none, such as name/value storage.
pub fn config_header(guid: &efi::Guid, name: Option<&str>, device_path: &[u8]) -> String {
    let mut header = String::from("GUID=");
    push_hex(&mut header, guid.as_bytes().iter().copied());
    header.push_str("&NAME=");
    if let Some(name) = name {
        for unit in name.encode_utf16() {
            header.push_str(&format!("{unit:04x}"));
        }
    }
    header.push_str("&PATH=");
    push_hex(&mut header, device_path.iter().copied());
    header
}

/// Encodes `bytes` in config `VALUE` order: last byte first.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    push_hex(&mut hex, bytes.iter().rev().copied());
    hex
}

/// Decodes a config `VALUE` into `width` little endian bytes.
///
/// Hex digits are case-insensitive. Values with fewer digits than `width` needs are zero extended; extra leading
/// digits must be zero.
pub fn hex_to_bytes(hex: &str, width: usize) -> Result<Vec<u8>> {
    let digits: Vec<u8> = hex
        .chars()
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<_>>()
        .ok_or(HiiError::InvalidConfigString)?;
    let excess = digits.len().saturating_sub(width.checked_mul(2).ok_or(HiiError::InvalidParameter)?);
    if digits[..excess].iter().any(|&digit| digit != 0) {
        return Err(HiiError::InvalidConfigString);
    }
    let mut bytes = alloc::vec![0u8; width];
    for (index, digit) in digits[excess..].iter().rev().enumerate() {
        bytes[index / 2] |= digit << ((index % 2) * 4);
    }
    Ok(bytes)
}

/// Splits a config string into its `key=value` elements, skipping empty segments.
fn elements(config: &str) -> impl Iterator<Item = (&str, &str)> {
    config.split('&').filter(|segment| !segment.is_empty()).map(|segment| match segment.split_once('=') {
        Some((key, value)) => (key, value),
        None => (segment, ""),
    })
}

fn parse_number(hex: &str) -> Result<usize> {
    usize::from_str_radix(hex, 16).map_err(|_| HiiError::InvalidConfigString)
}

/// Serializes the requested blocks of `buffer`.
///
/// Each `(offset, width)` span becomes one `&OFFSET=&WIDTH=&VALUE=` element. Spans past the end of `buffer` are an
/// error.
pub fn block_to_config(header: &str, spans: &[(u16, u16)], buffer: &[u8]) -> Result<String> {
    let mut config = String::from(header);
    for &(offset, width) in spans {
        let start = offset as usize;
        let bytes = buffer.get(start..start + usize::from(width)).ok_or(HiiError::BufferTooSmall)?;
        config.push_str(&format!("&OFFSET={offset:04x}&WIDTH={width:04x}&VALUE={}", bytes_to_hex(bytes)));
    }
    Ok(config)
}

/// Writes the `OFFSET/WIDTH/VALUE` blocks of `config` into `buffer`.
///
/// Parsing stops at the first `ALTCFG` section so alternate configurations do not overwrite current values.
/// A span whose end overflows is [`HiiError::InvalidParameter`]; one past the end of `buffer` is
/// [`HiiError::BufferTooSmall`].
/// Returns the number of blocks written.
pub fn config_to_block(config: &str, buffer: &mut [u8]) -> Result<usize> {
    let mut offset = None;
    let mut width = None;
    let mut written = 0;
    for (key, value) in elements(config) {
        match key.to_ascii_uppercase().as_str() {
            "ALTCFG" => break,
            "OFFSET" => offset = Some(parse_number(value)?),
            "WIDTH" => width = Some(parse_number(value)?),
            "VALUE" => {
                let (Some(start), Some(len)) = (offset.take(), width.take()) else {
                    return Err(HiiError::InvalidConfigString);
                };
                let end = start.checked_add(len).ok_or(HiiError::InvalidParameter)?;
                let target = buffer.get_mut(start..end).ok_or(HiiError::BufferTooSmall)?;
                target.copy_from_slice(&hex_to_bytes(value, len)?);
                written += 1;
            }
            _ => {}
        }
    }
    Ok(written)
}

/// Serializes name/value pairs as `&<name>=<value>` elements after `header`.
pub fn name_value_to_config<'a>(header: &str, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut config = String::from(header);
    for (name, value) in pairs {
        config.push_str(&format!("&{name}={value}"));
    }
    config
}

/// Extracts the `&<name>=<value>` pairs of `config`, stopping at the first `ALTCFG` section.
pub fn config_to_name_values(config: &str) -> Vec<(String, String)> {
    elements(config)
        .take_while(|(key, _)| !key.eq_ignore_ascii_case("ALTCFG"))
        .filter(|(key, _)| !RESERVED_KEYS.iter().any(|reserved| key.eq_ignore_ascii_case(reserved)))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Builds the `<ConfigHdr>&ALTCFG=<id>` request used to fetch the alternate configuration of one default class.
pub fn alt_config_request(header: &str, default_id: DefaultId) -> String {
    format!("{header}&ALTCFG={default_id:04x}")
}

/// What to look up in an alternate configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltConfigElement<'a> {
    /// A buffer block.
    Block { offset: u16, width: u16 },
    /// A name/value entry.
    Name(&'a str),
}

/// Finds a value in an alternate configuration response.
///
/// The response may hold several `<ConfigHdr>&ALTCFG=` sections. Only the section for `header` and `default_id` is
/// searched. Hex digits and names are compared after lowercasing both sides. Returns the raw hex value.
pub fn find_alt_config(
    response: &str,
    header: &str,
    default_id: DefaultId,
    element: AltConfigElement<'_>,
) -> Option<String> {
    let response = response.to_ascii_lowercase();
    let section_start = format!("{}&altcfg={default_id:04x}", header.to_ascii_lowercase());
    let start = response.find(&section_start)? + section_start.len();
    let section = &response[start..];
    let section = match section.find("&guid=") {
        Some(end) => &section[..end],
        None => section,
    };
    let key = match element {
        AltConfigElement::Block { offset, width } => format!("&offset={offset:04x}&width={width:04x}&value="),
        AltConfigElement::Name(name) => format!("&{}=", name.to_ascii_lowercase()),
    };
    let value_start = section.find(&key)? + key.len();
    let value = &section[value_start..];
    let value = match value.find('&') {
        Some(end) => &value[..end],
        None => value,
    };
    Some(value.to_string())
}
