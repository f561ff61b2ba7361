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
use crate::errors::{unexpected_encoding, TlvResult};
use crate::tlv::{Reader, Writer};
use rand::RngCore;
use zeroize::Zeroize;

const TAG_CARD_IDENTIFIER: u32 = 0xF0;
const TAG_CONTAINER_VERSION: u32 = 0xF1;
const TAG_GRAMMAR_VERSION: u32 = 0xF2;
const TAG_APPLICATION_CARD_URL: u32 = 0xF3;
const TAG_PKCS15_VERSION: u32 = 0xF4;
const TAG_DATA_MODEL: u32 = 0xF5;
// Placeholder elements the GSC-IS data model requires to be present but
// empty on a PIV card.
const EMPTY_TAGS: [u32; 7] = [0xF6, 0xF7, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE];

// GSC-RID || manufacturer ID, the fixed prefix of the unique card
// identifier; the remaining 14 bytes are the per-card ID.
const CARD_IDENTIFIER_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x01, 0x16, 0xFF, 0x02];

const CONTAINER_VERSION: u8 = 0x21;
const GRAMMAR_VERSION: u8 = 0x21;
const PKCS15_VERSION: u8 = 0x00;
const DATA_MODEL_NUMBER: u8 = 0x10;

pub(crate) const CCC_DATA_TAG: u32 = 0x005F_C107;

/// Card Capability Container, GSC-IS 2.1 via SP 800-73-4 part 1, table 8.
///
/// Everything is fixed except the 14-byte CardID inside the unique card
/// identifier.
#[derive(Debug, Default)]
pub struct Ccc {
    data_tag: Option<u32>,
    card_id: Option<[u8; 14]>,
}

impl Ccc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn card_id(&self) -> Option<&[u8; 14]> {
        self.card_id.as_ref()
    }

    pub fn set_card_id(&mut self, card_id: [u8; 14]) {
        self.card_id = Some(card_id);
    }

    pub fn set_random_card_id(&mut self, rng: &mut dyn RngCore) {
        let mut card_id = [0u8; 14];
        rng.fill_bytes(&mut card_id);
        self.card_id = Some(card_id);
    }

    fn parse(raw: &[u8]) -> TlvResult<Option<[u8; 14]>> {
        let mut outer = Reader::new(raw);
        let mut obj = outer.read_nested(TAG_DATA_FIELD)?;
        if outer.has_data() {
            return Err(unexpected_encoding("trailing data after container"));
        }
        if !obj.has_data() {
            return Ok(None);
        }
        let identifier = obj.read_value(TAG_CARD_IDENTIFIER)?;
        if identifier.len() != 0x15 || identifier[..7] != CARD_IDENTIFIER_AID {
            return Err(unexpected_encoding("unique card identifier mismatch"));
        }
        let card_id: [u8; 14] = identifier[7..]
            .try_into()
            .map_err(|_| unexpected_encoding("unique card identifier mismatch"))?;
        for (tag, want) in [
            (TAG_CONTAINER_VERSION, CONTAINER_VERSION),
            (TAG_GRAMMAR_VERSION, GRAMMAR_VERSION),
        ] {
            if obj.read_byte(tag)? != want {
                return Err(unexpected_encoding(format!("tag {tag:#x} version mismatch")));
            }
        }
        if !obj.read_value(TAG_APPLICATION_CARD_URL)?.is_empty() {
            return Err(unexpected_encoding("card URL must be empty"));
        }
        if obj.read_byte(TAG_PKCS15_VERSION)? != PKCS15_VERSION {
            return Err(unexpected_encoding("PKCS#15 version mismatch"));
        }
        if obj.read_byte(TAG_DATA_MODEL)? != DATA_MODEL_NUMBER {
            return Err(unexpected_encoding("data model mismatch"));
        }
        for tag in EMPTY_TAGS {
            if !obj.read_value(tag)?.is_empty() {
                return Err(unexpected_encoding(format!("tag {tag:#x} must be empty")));
            }
        }
        if obj.has_data() {
            return Err(unexpected_encoding("trailing data after container"));
        }
        Ok(Some(card_id))
    }
}

impl DataObject for Ccc {
    fn data_tag(&self) -> u32 {
        self.data_tag.unwrap_or(CCC_DATA_TAG)
    }

    fn defined_data_tag(&self) -> u32 {
        CCC_DATA_TAG
    }

    fn set_data_tag(&mut self, tag: u32) -> TlvResult<()> {
        validate_data_tag(tag, CCC_DATA_TAG)?;
        self.data_tag = Some(tag);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.card_id.is_none()
    }

    fn encode(&self) -> TlvResult<Vec<u8>> {
        let mut w = Writer::new();
        {
            let mut obj = w.open_nested(TAG_DATA_FIELD)?;
            if let Some(card_id) = &self.card_id {
                let mut identifier = [0u8; 0x15];
                identifier[..7].copy_from_slice(&CARD_IDENTIFIER_AID);
                identifier[7..].copy_from_slice(card_id);
                obj.write_value(TAG_CARD_IDENTIFIER, &identifier)?;
                obj.write_byte(TAG_CONTAINER_VERSION, CONTAINER_VERSION)?;
                obj.write_byte(TAG_GRAMMAR_VERSION, GRAMMAR_VERSION)?;
                obj.write_value(TAG_APPLICATION_CARD_URL, &[])?;
                obj.write_byte(TAG_PKCS15_VERSION, PKCS15_VERSION)?;
                obj.write_byte(TAG_DATA_MODEL, DATA_MODEL_NUMBER)?;
                for tag in EMPTY_TAGS {
                    obj.write_value(tag, &[])?;
                }
                identifier.zeroize();
            }
        }
        w.encode()
    }

    fn try_decode(&mut self, raw: &[u8]) -> bool {
        self.card_id = None;
        match Self::parse(raw) {
            Ok(card_id) => {
                self.card_id = card_id;
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for Ccc {
    fn drop(&mut self) {
        if let Some(card_id) = &mut self.card_id {
            card_id.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn empty_encodes_to_bare_container() {
        assert_eq!(Ccc::new().encode().unwrap(), vec![0x53, 0x00]);
    }

    #[test]
    fn encode_layout() {
        let mut ccc = Ccc::new();
        ccc.set_card_id([0x42; 14]);
        let raw = ccc.encode().unwrap();
        assert_eq!(raw[0], 0x53);
        assert_eq!(raw[1] as usize, raw.len() - 2);
        assert_eq!(&raw[2..4], &[0xF0, 0x15]);
        assert_eq!(&raw[4..11], &CARD_IDENTIFIER_AID);
        assert_eq!(&raw[11..25], &[0x42; 14]);
        assert_eq!(
            &raw[25..],
            &[
                0xF1, 0x01, 0x21, //
                0xF2, 0x01, 0x21, //
                0xF3, 0x00, //
                0xF4, 0x01, 0x00, //
                0xF5, 0x01, 0x10, //
                0xF6, 0x00, 0xF7, 0x00, 0xFA, 0x00, 0xFB, 0x00, 0xFC, 0x00, 0xFD, 0x00, 0xFE,
                0x00,
            ]
        );
    }

    #[test]
    fn decode_round_trip() {
        let mut ccc = Ccc::new();
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        ccc.set_random_card_id(&mut rng);
        let card_id = *ccc.card_id().unwrap();

        let mut decoded = Ccc::new();
        assert!(decoded.try_decode(&ccc.encode().unwrap()));
        assert_eq!(decoded.card_id(), Some(&card_id));
    }

    #[test]
    fn decode_rejects_deviations() {
        let mut ccc = Ccc::new();
        ccc.set_card_id([0x42; 14]);
        let good = ccc.encode().unwrap();

        let mut wrong_aid = good.clone();
        wrong_aid[4] ^= 0xFF;
        let mut wrong_version = good.clone();
        wrong_version[27] = 0x22; // container version byte
        let mut truncated = good.clone();
        truncated.truncate(good.len() - 2); // drop the trailing FE element
        truncated[1] -= 2;

        for bad in [wrong_aid, wrong_version, truncated, vec![0x54, 0x00]] {
            let mut decoded = Ccc::new();
            assert!(!decoded.try_decode(&bad), "accepted {bad:02X?}");
            assert!(decoded.is_empty());
        }
    }

    #[test]
    fn alternate_data_tags() {
        let mut ccc = Ccc::new();
        assert_eq!(ccc.data_tag(), CCC_DATA_TAG);
        ccc.set_data_tag(0x005F_0001).unwrap();
        assert_eq!(ccc.data_tag(), 0x005F_0001);
        assert!(ccc.set_data_tag(0x005F_FF10).is_err());
    }
}
