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

use crate::errors::{TlvError, TlvErrorKind, TlvResult};

/// Outer container tag shared by every PIV data object.
pub(crate) const TAG_DATA_FIELD: u32 = 0x53;

/// Common surface of the stored PIV data objects (CHUID, CCC).
///
/// Objects are constructed empty, populated through their setters, and
/// encode to `53 00` while empty. `try_decode` validates the fixed schema
/// exactly and leaves the object empty on any deviation.
pub trait DataObject {
    /// The storage locator this instance answers to.
    fn data_tag(&self) -> u32;

    /// The locator assigned to this object type by SP 800-73.
    fn defined_data_tag(&self) -> u32;

    /// Moves the object to an alternate storage locator. The tag must be the
    /// defined one or fall in the vendor-free window (see
    /// [`validate_data_tag`]).
    fn set_data_tag(&mut self, tag: u32) -> TlvResult<()>;

    fn is_empty(&self) -> bool;

    fn encode(&self) -> TlvResult<Vec<u8>>;

    /// Parses and validates an encoded object. Returns false (and resets the
    /// object to empty) when the input deviates from the schema.
    fn try_decode(&mut self, raw: &[u8]) -> bool;
}

// Storage locators live in the 0x5FXXXX window. The PIV-defined and
// Yubico-reserved ranges are off limits for relocation.
const DATA_TAG_WINDOW: std::ops::RangeInclusive<u32> = 0x005F_0000..=0x005F_FFFF;
const PIV_RESERVED: std::ops::RangeInclusive<u32> = 0x005F_C101..=0x005F_C123;
const YUBICO_RESERVED: std::ops::RangeInclusive<u32> = 0x005F_FF00..=0x005F_FF15;

/// Checks that `tag` is a legal storage locator for an object whose defined
/// locator is `defined`.
pub(crate) fn validate_data_tag(tag: u32, defined: u32) -> TlvResult<()> {
    if tag == defined {
        return Ok(());
    }
    if !DATA_TAG_WINDOW.contains(&tag)
        || PIV_RESERVED.contains(&tag)
        || YUBICO_RESERVED.contains(&tag)
    {
        return Err(TlvError::new(
            TlvErrorKind::InvalidDataTag,
            format!("{tag:#08x} is not a usable data object tag"),
        ));
    }
    Ok(())
}
