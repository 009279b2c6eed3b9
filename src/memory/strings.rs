//! Narrow and wide C string encoding

use serde::{Deserialize, Serialize};

/// Size in bytes of the platform `wchar_t`
#[cfg(windows)]
pub const WCHAR_SIZE: usize = 2;
#[cfg(not(windows))]
pub const WCHAR_SIZE: usize = 4;

/// Which C character type a string is stored as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringFlavor {
    /// `char*`
    Narrow,
    /// `wchar_t*`
    Wide,
}

impl StringFlavor {
    /// Width of one code unit, including the terminator unit.
    pub fn unit_size(self) -> usize {
        match self {
            StringFlavor::Narrow => 1,
            StringFlavor::Wide => WCHAR_SIZE,
        }
    }
}

/// Byte encoding used for narrow strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NarrowEncoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "latin-1")]
    Latin1,
}

/// Encode a string as a NUL-terminated native byte sequence.
pub fn encode(s: &str, flavor: StringFlavor, encoding: NarrowEncoding) -> Vec<u8> {
    match flavor {
        StringFlavor::Narrow => encode_narrow(s, encoding),
        StringFlavor::Wide => encode_wide(s),
    }
}

fn encode_narrow(s: &str, encoding: NarrowEncoding) -> Vec<u8> {
    let mut bytes = match encoding {
        NarrowEncoding::Utf8 => s.as_bytes().to_vec(),
        NarrowEncoding::Latin1 => s
            .chars()
            .map(|c| if (c as u32) <= 0xFF { c as u32 as u8 } else { b'?' })
            .collect(),
    };
    bytes.push(0);
    bytes
}

#[cfg(windows)]
fn encode_wide(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_ne_bytes)
        .collect()
}

#[cfg(not(windows))]
fn encode_wide(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| c as u32)
        .chain(std::iter::once(0))
        .flat_map(u32::to_ne_bytes)
        .collect()
}

/// Decode narrow bytes (without terminator).
pub fn decode_narrow(bytes: &[u8], encoding: NarrowEncoding) -> String {
    match encoding {
        NarrowEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        NarrowEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Decode wide code units (without terminator) given as raw native bytes.
#[cfg(windows)]
pub fn decode_wide(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_ne_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(not(windows))]
pub fn decode_wide(bytes: &[u8]) -> String {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .map(|u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}
