// Copyright 2024 Gravitational, Inc
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tag-length-value codec with the ISO 7816 BER/DER length rules.
//!
//! The PIV data objects mix BER-TLV containers with SIMPLE-TLV style tags
//! (0x30, 0xFE, ...) that off-the-shelf BER libraries reject when nesting, so
//! both directions are implemented here. [`Writer`] assembles a tree in
//! memory and serializes it depth-first; [`Reader`] streams elements out of a
//! borrowed buffer without copying.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::{NestedScope, Writer};

use crate::errors::{unsupported_length, unsupported_tag, TlvResult};

/// Largest tag either side of the codec will touch: tags are one or two
/// bytes on the wire.
pub const MAX_TAG: u32 = 0xFFFF;

/// Largest value length the DER forms up to `0x83` can carry.
pub const MAX_VALUE_LENGTH: usize = 0x00FF_FFFF;

/// Text encodings understood by `write_string`/`read_string`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Ascii,
    Utf8,
}

/// Number of bytes the tag occupies on the wire: tags up to 0xFF are one
/// byte, up to 0xFFFF two. Zero and anything wider is rejected.
pub(crate) fn tag_width(tag: u32) -> TlvResult<usize> {
    if tag == 0 || tag > MAX_TAG {
        return Err(unsupported_tag(format!("tag {tag:#x} out of range")));
    }
    Ok(if tag <= 0xFF { 1 } else { 2 })
}

/// Number of bytes the DER length prefix occupies for a value of `len` bytes.
pub(crate) fn length_width(len: usize) -> TlvResult<usize> {
    match len {
        0..=0x7F => Ok(1),
        0x80..=0xFF => Ok(2),
        0x100..=0xFFFF => Ok(3),
        0x1_0000..=MAX_VALUE_LENGTH => Ok(4),
        _ => Err(unsupported_length(format!("value length {len:#x} out of range"))),
    }
}

pub(crate) fn put_tag(out: &mut Vec<u8>, tag: u32) {
    if tag > 0xFF {
        out.push((tag >> 8) as u8);
    }
    out.push(tag as u8);
}

pub(crate) fn put_length(out: &mut Vec<u8>, len: usize) {
    match len {
        0..=0x7F => out.push(len as u8),
        0x80..=0xFF => {
            out.push(0x81);
            out.push(len as u8);
        }
        0x100..=0xFFFF => {
            out.push(0x82);
            out.push((len >> 8) as u8);
            out.push(len as u8);
        }
        _ => {
            out.push(0x83);
            out.push((len >> 16) as u8);
            out.push((len >> 8) as u8);
            out.push(len as u8);
        }
    }
}
