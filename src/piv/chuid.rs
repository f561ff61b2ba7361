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

use super::object::{validate_data_tag, DataObject, TAG_DATA_FIELD};
use crate::errors::TlvResult;
use crate::tlv::{Reader, StringEncoding, Writer};
use rand::RngCore;
use zeroize::Zeroize;

const TAG_FASC_N: u32 = 0x30;
const TAG_GUID: u32 = 0x34;
const TAG_EXPIRATION_DATE: u32 = 0x35;
const TAG_ISSUER_ASYMMETRIC_SIGNATURE: u32 = 0x3E;
const TAG_ERROR_DETECTION_CODE: u32 = 0xFE;

/// FASC-N for a non-federal issuer: S9999F9999F999999F0F1F0000000000300001E
/// in the BCD encoding from the TIG SCEPACS spec, section 6.
const FASC_N: [u8; 25] = [
    0xD4, 0xE7, 0x39, 0xDA, 0x73, 0x9C, 0xED, 0x39, 0xCE, 0x73, 0x9D, 0x83, 0x68, 0x58, 0x21,
    0x08, 0x42, 0x10, 0x84, 0x21, 0xC8, 0x42, 0x10, 0xC3, 0xEB,
];

const EXPIRATION_DATE: &str = "20300101";

pub(crate) const CHUID_DATA_TAG: u32 = 0x005F_C102;

/// Card Holder Unique Identifier, SP 800-73-4 part 1, table 9.
///
/// Every field except the 16-byte GUID is fixed: the non-federal FASC-N, a
/// far-future expiration date, and empty issuer signature / error detection
/// elements. In federal deployments the whole object would be unique per
/// cardholder and signed by the issuer; this card only needs the GUID to
/// differ between instances.
#[derive(Debug, Default)]
pub struct Chuid {
    data_tag: Option<u32>,
    guid: Option<[u8; 16]>,
}

impl Chuid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guid(&self) -> Option<&[u8; 16]> {
        self.guid.as_ref()
    }

    pub fn set_guid(&mut self, guid: [u8; 16]) {
        self.guid = Some(guid);
    }

    pub fn set_random_guid(&mut self, rng: &mut dyn RngCore) {
        let mut guid = [0u8; 16];
        rng.fill_bytes(&mut guid);
        self.guid = Some(guid);
    }

    fn parse(raw: &[u8]) -> TlvResult<Option<[u8; 16]>> {
        let mut outer = Reader::new(raw);
        let mut obj = outer.read_nested(TAG_DATA_FIELD)?;
        if outer.has_data() {
            return Err(trailing(TAG_DATA_FIELD));
        }
        if !obj.has_data() {
            return Ok(None);
        }
        if obj.read_value(TAG_FASC_N)? != FASC_N {
            return Err(crate::errors::unexpected_encoding("FASC-N mismatch"));
        }
        let guid: [u8; 16] = obj
            .read_value(TAG_GUID)?
            .try_into()
            .map_err(|_| crate::errors::unexpected_encoding("GUID is not 16 bytes"))?;
        if obj.read_string(TAG_EXPIRATION_DATE, StringEncoding::Ascii)? != EXPIRATION_DATE {
            return Err(crate::errors::unexpected_encoding("expiration date mismatch"));
        }
        if !obj.read_value(TAG_ISSUER_ASYMMETRIC_SIGNATURE)?.is_empty() {
            return Err(crate::errors::unexpected_encoding(
                "issuer signature must be empty",
            ));
        }
        if !obj.read_value(TAG_ERROR_DETECTION_CODE)?.is_empty() {
            return Err(crate::errors::unexpected_encoding("LRC must be empty"));
        }
        if obj.has_data() {
            return Err(trailing(TAG_DATA_FIELD));
        }
        Ok(Some(guid))
    }
}

impl DataObject for Chuid {
    fn data_tag(&self) -> u32 {
        self.data_tag.unwrap_or(CHUID_DATA_TAG)
    }

    fn defined_data_tag(&self) -> u32 {
        CHUID_DATA_TAG
    }

    fn set_data_tag(&mut self, tag: u32) -> TlvResult<()> {
        validate_data_tag(tag, CHUID_DATA_TAG)?;
        self.data_tag = Some(tag);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.guid.is_none()
    }

    fn encode(&self) -> TlvResult<Vec<u8>> {
        let mut w = Writer::new();
        {
            let mut obj = w.open_nested(TAG_DATA_FIELD)?;
            if let Some(guid) = &self.guid {
                obj.write_value(TAG_FASC_N, &FASC_N)?;
                obj.write_value(TAG_GUID, guid)?;
                obj.write_string(TAG_EXPIRATION_DATE, EXPIRATION_DATE, StringEncoding::Ascii)?;
                obj.write_value(TAG_ISSUER_ASYMMETRIC_SIGNATURE, &[])?;
                obj.write_value(TAG_ERROR_DETECTION_CODE, &[])?;
            }
        }
        w.encode()
    }

    fn try_decode(&mut self, raw: &[u8]) -> bool {
        self.guid = None;
        match Self::parse(raw) {
            Ok(guid) => {
                self.guid = guid;
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for Chuid {
    fn drop(&mut self) {
        if let Some(guid) = &mut self.guid {
            guid.zeroize();
        }
    }
}

fn trailing(tag: u32) -> crate::errors::TlvError {
    crate::errors::unexpected_encoding(format!("trailing data after tag {tag:#x} content"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn empty_encodes_to_bare_container() {
        let chuid = Chuid::new();
        assert!(chuid.is_empty());
        assert_eq!(chuid.encode().unwrap(), vec![0x53, 0x00]);
    }

    #[test]
    fn encode_layout() {
        let mut chuid = Chuid::new();
        chuid.set_guid([0x11; 16]);
        let raw = chuid.encode().unwrap();
        assert_eq!(raw[0], 0x53);
        assert_eq!(raw[1] as usize, raw.len() - 2);
        // FASC-N right behind the container header.
        assert_eq!(raw[2], 0x30);
        assert_eq!(raw[3], 0x19);
        assert_eq!(&raw[4..29], &FASC_N);
        // GUID, expiration, empty signature and LRC.
        assert_eq!(&raw[29..31], &[0x34, 0x10]);
        assert_eq!(&raw[31..47], &[0x11; 16]);
        assert_eq!(&raw[47..49], &[0x35, 0x08]);
        assert_eq!(&raw[49..57], b"20300101");
        assert_eq!(&raw[57..], &[0x3E, 0x00, 0xFE, 0x00]);
    }

    #[test]
    fn decode_round_trip() {
        let mut chuid = Chuid::new();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        chuid.set_random_guid(&mut rng);
        let guid = *chuid.guid().unwrap();
        let raw = chuid.encode().unwrap();

        let mut decoded = Chuid::new();
        assert!(decoded.try_decode(&raw));
        assert_eq!(decoded.guid(), Some(&guid));
    }

    #[test]
    fn decode_rejects_field_deviations() {
        let mut chuid = Chuid::new();
        chuid.set_guid([0x22; 16]);
        let good = chuid.encode().unwrap();

        let mut wrong_fascn = good.clone();
        wrong_fascn[4] ^= 0x01;
        let mut wrong_expiry = good.clone();
        wrong_expiry[49] = b'1';
        let mut trailing = good.clone();
        trailing.push(0x00);
        let mut truncated = good.clone();
        truncated.truncate(good.len() - 1);
        truncated[1] -= 1; // still a well-formed container, missing the LRC

        for bad in [wrong_fascn, wrong_expiry, trailing, truncated] {
            let mut decoded = Chuid::new();
            assert!(!decoded.try_decode(&bad));
            assert!(decoded.is_empty());
        }
    }

    #[test]
    fn decode_rejects_wrong_guid_length() {
        // Hand-build a CHUID whose GUID is 15 bytes.
        let mut w = Writer::new();
        {
            let mut obj = w.open_nested(0x53).unwrap();
            obj.write_value(0x30, &FASC_N).unwrap();
            obj.write_value(0x34, &[0x33; 15]).unwrap();
            obj.write_string(0x35, EXPIRATION_DATE, StringEncoding::Ascii)
                .unwrap();
            obj.write_value(0x3E, &[]).unwrap();
            obj.write_value(0xFE, &[]).unwrap();
        }
        let mut decoded = Chuid::new();
        assert!(!decoded.try_decode(&w.encode().unwrap()));
        assert!(decoded.is_empty());
    }

    #[test]
    fn alternate_data_tags() {
        let mut chuid = Chuid::new();
        assert_eq!(chuid.data_tag(), CHUID_DATA_TAG);
        chuid.set_data_tag(0x005F_B000).unwrap();
        assert_eq!(chuid.data_tag(), 0x005F_B000);
        assert_eq!(chuid.defined_data_tag(), CHUID_DATA_TAG);
        assert!(chuid.set_data_tag(0x005F_C105).is_err());
        assert_eq!(chuid.data_tag(), 0x005F_B000);
    }
}
