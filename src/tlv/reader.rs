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

use super::{StringEncoding, MAX_TAG};
use crate::errors::{
    unexpected_encoding, unexpected_end, unsupported_length, unsupported_tag, TlvResult,
};
use byteorder::ByteOrder;

/// Streams TLV elements out of a borrowed buffer without copying.
///
/// Every returned value is a sub-slice of the input, so the buffer must
/// outlive the reader and any slices read from it. The cursor only advances
/// on success: a failed operation (throwing or `try_`) leaves the reader
/// where it was.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// True while there are unread bytes left.
    pub fn has_data(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Returns the next tag without advancing. `tag_length` selects how many
    /// bytes of tag to read and must be 1 or 2.
    pub fn peek_tag(&self, tag_length: usize) -> TlvResult<u32> {
        let rest = &self.buf[self.pos..];
        match tag_length {
            1 => match rest.first() {
                Some(&b) => Ok(u32::from(b)),
                None => Err(unexpected_end("no tag byte left")),
            },
            2 => {
                if rest.len() < 2 {
                    return Err(unexpected_end("two-byte tag truncated"));
                }
                Ok(u32::from(rest[0]) << 8 | u32::from(rest[1]))
            }
            n => Err(unsupported_tag(format!("tag length {n} not in {{1, 2}}"))),
        }
    }

    /// Returns the length of the next TLV without advancing, skipping over a
    /// tag of `tag_length` bytes.
    pub fn peek_length(&self, tag_length: usize) -> TlvResult<usize> {
        self.peek_tag(tag_length)?;
        let (length, _) = decode_length(&self.buf[self.pos + tag_length..])?;
        Ok(length)
    }

    /// Reads the next TLV, which must carry `expected_tag`, and returns a
    /// view of its value. The expected tag decides the tag width on the
    /// wire: one byte up to 0xFF, two bytes up to 0xFFFF.
    pub fn read_value(&mut self, expected_tag: u32) -> TlvResult<&'a [u8]> {
        let header = self.expect_header(expected_tag)?;
        self.pos = header.end;
        Ok(&self.buf[header.value_start..header.end])
    }

    /// Reads the next TLV and returns the whole encoded element, tag and
    /// length included.
    pub fn read_encoded(&mut self, expected_tag: u32) -> TlvResult<&'a [u8]> {
        let header = self.expect_header(expected_tag)?;
        let start = self.pos;
        self.pos = header.end;
        Ok(&self.buf[start..header.end])
    }

    /// Reads the next TLV and returns a reader over its value, for walking
    /// nested structures.
    pub fn read_nested(&mut self, expected_tag: u32) -> TlvResult<Reader<'a>> {
        self.read_value(expected_tag).map(Reader::new)
    }

    pub fn read_byte(&mut self, expected_tag: u32) -> TlvResult<u8> {
        Ok(self.read_fixed(expected_tag, 1)?[0])
    }

    pub fn read_i16<E: ByteOrder>(&mut self, expected_tag: u32) -> TlvResult<i16> {
        Ok(E::read_i16(self.read_fixed(expected_tag, 2)?))
    }

    pub fn read_u16<E: ByteOrder>(&mut self, expected_tag: u32) -> TlvResult<u16> {
        Ok(E::read_u16(self.read_fixed(expected_tag, 2)?))
    }

    pub fn read_i32<E: ByteOrder>(&mut self, expected_tag: u32) -> TlvResult<i32> {
        Ok(E::read_i32(self.read_fixed(expected_tag, 4)?))
    }

    pub fn read_string(&mut self, expected_tag: u32, encoding: StringEncoding) -> TlvResult<String> {
        let header = self.expect_header(expected_tag)?;
        let raw = &self.buf[header.value_start..header.end];
        let text = match encoding {
            StringEncoding::Ascii => {
                if !raw.is_ascii() {
                    return Err(unexpected_encoding(format!(
                        "value of tag {expected_tag:#x} is not ASCII"
                    )));
                }
                String::from_utf8_lossy(raw).into_owned()
            }
            StringEncoding::Utf8 => match std::str::from_utf8(raw) {
                Ok(s) => s.to_owned(),
                Err(_) => {
                    return Err(unexpected_encoding(format!(
                        "value of tag {expected_tag:#x} is not UTF-8"
                    )))
                }
            },
        };
        self.pos = header.end;
        Ok(text)
    }

    // Non-throwing variants: same contracts, but failures come back as None
    // and never move the cursor.

    pub fn try_peek_tag(&self, tag_length: usize) -> Option<u32> {
        self.peek_tag(tag_length).ok()
    }

    pub fn try_peek_length(&self, tag_length: usize) -> Option<usize> {
        self.peek_length(tag_length).ok()
    }

    pub fn try_read_value(&mut self, expected_tag: u32) -> Option<&'a [u8]> {
        self.read_value(expected_tag).ok()
    }

    pub fn try_read_encoded(&mut self, expected_tag: u32) -> Option<&'a [u8]> {
        self.read_encoded(expected_tag).ok()
    }

    pub fn try_read_nested(&mut self, expected_tag: u32) -> Option<Reader<'a>> {
        self.read_nested(expected_tag).ok()
    }

    pub fn try_read_byte(&mut self, expected_tag: u32) -> Option<u8> {
        self.read_byte(expected_tag).ok()
    }

    pub fn try_read_i16<E: ByteOrder>(&mut self, expected_tag: u32) -> Option<i16> {
        self.read_i16::<E>(expected_tag).ok()
    }

    pub fn try_read_u16<E: ByteOrder>(&mut self, expected_tag: u32) -> Option<u16> {
        self.read_u16::<E>(expected_tag).ok()
    }

    pub fn try_read_i32<E: ByteOrder>(&mut self, expected_tag: u32) -> Option<i32> {
        self.read_i32::<E>(expected_tag).ok()
    }

    pub fn try_read_string(
        &mut self,
        expected_tag: u32,
        encoding: StringEncoding,
    ) -> Option<String> {
        self.read_string(expected_tag, encoding).ok()
    }

    fn read_fixed(&mut self, expected_tag: u32, want: usize) -> TlvResult<&'a [u8]> {
        let header = self.expect_header(expected_tag)?;
        let value = &self.buf[header.value_start..header.end];
        if value.len() != want {
            return Err(unexpected_encoding(format!(
                "tag {expected_tag:#x}: want a {want}-byte value, have {}",
                value.len()
            )));
        }
        self.pos = header.end;
        Ok(value)
    }

    // Decodes the tag and length at the cursor without committing. The tag
    // width is derived from the expected tag.
    fn expect_header(&self, expected_tag: u32) -> TlvResult<Header> {
        if expected_tag == 0 || expected_tag > MAX_TAG {
            return Err(unsupported_tag(format!("tag {expected_tag:#x} out of range")));
        }
        let tag_length = if expected_tag <= 0xFF { 1 } else { 2 };
        let actual = self.peek_tag(tag_length)?;
        if actual != expected_tag {
            return Err(unexpected_encoding(format!(
                "want tag {expected_tag:#x}, have {actual:#x}"
            )));
        }
        let (length, length_of_length) = decode_length(&self.buf[self.pos + tag_length..])?;
        let value_start = self.pos + tag_length + length_of_length;
        let end = value_start + length;
        if end > self.buf.len() {
            return Err(unexpected_end(format!(
                "tag {expected_tag:#x}: value of {length} bytes exceeds input"
            )));
        }
        Ok(Header { value_start, end })
    }
}

struct Header {
    value_start: usize,
    end: usize,
}

// DER length forms: one byte up to 0x7F, then 0x81/0x82/0x83 prefixes. The
// BER indefinite form (0x80) and anything past three length bytes are
// rejected. Returns (length, length-of-length).
fn decode_length(buf: &[u8]) -> TlvResult<(usize, usize)> {
    let first = *buf.first().ok_or_else(|| unexpected_end("no length byte"))?;
    let (extra, limit_name) = match first {
        0..=0x7F => return Ok((usize::from(first), 1)),
        0x81 => (1, "one"),
        0x82 => (2, "two"),
        0x83 => (3, "three"),
        _ => {
            return Err(unsupported_length(format!(
                "initial length byte {first:#04x}"
            )))
        }
    };
    if buf.len() < 1 + extra {
        return Err(unexpected_end(format!("{limit_name}-byte length truncated")));
    }
    let mut length = 0usize;
    for b in &buf[1..=extra] {
        length = length << 8 | usize::from(*b);
    }
    Ok((length, 1 + extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TlvErrorKind;
    use crate::tlv::Writer;
    use byteorder::BigEndian;
    use rand::{Rng, RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn reads_leaf_values() {
        let mut r = Reader::new(&[0x34, 0x02, 0xAA, 0xBB, 0xFE, 0x00]);
        assert!(r.has_data());
        assert_eq!(r.peek_tag(1).unwrap(), 0x34);
        assert_eq!(r.peek_length(1).unwrap(), 2);
        assert_eq!(r.read_value(0x34).unwrap(), &[0xAA, 0xBB]);
        assert_eq!(r.read_value(0xFE).unwrap(), &[] as &[u8]);
        assert!(!r.has_data());
    }

    #[test]
    fn two_byte_tags() {
        let mut r = Reader::new(&[0x5F, 0x2F, 0x02, 0x40, 0x00]);
        assert_eq!(r.peek_tag(2).unwrap(), 0x5F2F);
        assert_eq!(r.peek_length(2).unwrap(), 2);
        assert_eq!(r.read_value(0x5F2F).unwrap(), &[0x40, 0x00]);
    }

    #[test]
    fn tag_mismatch_keeps_position() {
        let mut r = Reader::new(&[0x34, 0x01, 0xAA]);
        let err = r.read_value(0x35).unwrap_err();
        assert_eq!(err.kind, TlvErrorKind::UnexpectedEncoding);
        assert_eq!(r.read_value(0x34).unwrap(), &[0xAA]);
    }

    #[test]
    fn rejects_unsupported_length_bytes_without_advancing() {
        for first in [0x80u8, 0x84, 0x85, 0xFF] {
            let buf = [0x34, first, 0x01, 0x00, 0x00];
            let mut r = Reader::new(&buf);
            let err = r.read_value(0x34).unwrap_err();
            assert_eq!(err.kind, TlvErrorKind::UnsupportedLength, "byte {first:#x}");
            assert_eq!(r.peek_tag(1).unwrap(), 0x34, "cursor moved for {first:#x}");
        }
    }

    #[test]
    fn rejects_out_of_range_expected_tags() {
        let mut r = Reader::new(&[0x34, 0x00]);
        assert_eq!(
            r.read_value(0).unwrap_err().kind,
            TlvErrorKind::UnsupportedTag
        );
        assert_eq!(
            r.read_value(0x1_0000).unwrap_err().kind,
            TlvErrorKind::UnsupportedTag
        );
        assert_eq!(
            r.peek_tag(3).unwrap_err().kind,
            TlvErrorKind::UnsupportedTag
        );
    }

    #[test]
    fn truncated_value_is_unexpected_end() {
        let mut r = Reader::new(&[0x34, 0x05, 0x01, 0x02]);
        assert_eq!(
            r.read_value(0x34).unwrap_err().kind,
            TlvErrorKind::UnexpectedEnd
        );
        let mut r = Reader::new(&[0x34]);
        assert_eq!(
            r.read_value(0x34).unwrap_err().kind,
            TlvErrorKind::UnexpectedEnd
        );
    }

    #[test]
    fn fixed_width_reads() {
        let mut r = Reader::new(&[
            0xF1, 0x01, 0x21, //
            0xF2, 0x02, 0x12, 0x34, //
            0xF3, 0x04, 0x0A, 0x0B, 0x0C, 0x0D,
        ]);
        assert_eq!(r.read_byte(0xF1).unwrap(), 0x21);
        assert_eq!(r.read_u16::<BigEndian>(0xF2).unwrap(), 0x1234);
        assert_eq!(r.read_i32::<BigEndian>(0xF3).unwrap(), 0x0A0B0C0D);
    }

    #[test]
    fn fixed_width_mismatch_keeps_position() {
        let mut r = Reader::new(&[0xF1, 0x02, 0x21, 0x22]);
        let err = r.read_byte(0xF1).unwrap_err();
        assert_eq!(err.kind, TlvErrorKind::UnexpectedEncoding);
        assert_eq!(r.read_u16::<BigEndian>(0xF1).unwrap(), 0x2122);
    }

    #[test]
    fn nested_and_encoded_views() {
        let buf = [0x7C, 0x06, 0x82, 0x00, 0x81, 0x02, 0xCA, 0xFE];
        let mut outer = Reader::new(&buf);
        let mut inner = outer.read_nested(0x7C).unwrap();
        assert!(!outer.has_data());
        assert_eq!(inner.read_encoded(0x82).unwrap(), &[0x82, 0x00]);
        assert_eq!(inner.read_value(0x81).unwrap(), &[0xCA, 0xFE]);
        assert!(!inner.has_data());
    }

    #[test]
    fn string_reads() {
        let buf = [&[0x35, 0x08][..], b"20300101"].concat();
        let mut r = Reader::new(&buf);
        assert_eq!(
            r.read_string(0x35, StringEncoding::Ascii).unwrap(),
            "20300101"
        );

        let buf = [0x50, 0x02, 0xC3, 0xA9];
        let mut r = Reader::new(&buf);
        let err = r.read_string(0x50, StringEncoding::Ascii).unwrap_err();
        assert_eq!(err.kind, TlvErrorKind::UnexpectedEncoding);
        assert_eq!(r.read_string(0x50, StringEncoding::Utf8).unwrap(), "\u{e9}");
    }

    #[test]
    fn try_variants_return_none_and_keep_position() {
        let mut r = Reader::new(&[0x34, 0x01, 0xAA]);
        assert_eq!(r.try_read_value(0x35), None);
        assert_eq!(r.try_read_byte(0x35), None);
        assert_eq!(r.try_peek_tag(5), None);
        assert_eq!(r.try_read_value(0x34).unwrap(), &[0xAA]);
        assert_eq!(r.try_read_value(0x34), None);
    }

    // Randomized round-trip: encode a random tree with the writer, walk it
    // back with the reader and compare every element.
    enum GenNode {
        Leaf(u32, Vec<u8>),
        Nested(u32, Vec<GenNode>),
    }

    fn gen_tree(rng: &mut ChaCha20Rng, depth: u32) -> Vec<GenNode> {
        let count = rng.gen_range(1..=4);
        (0..count)
            .map(|_| {
                let tag = rng.gen_range(1..=0xFFFFu32);
                if depth < 4 && rng.gen_bool(0.4) {
                    GenNode::Nested(tag, gen_tree(rng, depth + 1))
                } else {
                    let mut value = vec![0u8; rng.gen_range(0..40)];
                    rng.fill_bytes(&mut value);
                    GenNode::Leaf(tag, value)
                }
            })
            .collect()
    }

    fn write_tree(w: &mut Writer, nodes: &[GenNode]) {
        for node in nodes {
            match node {
                GenNode::Leaf(tag, value) => w.write_value(*tag, value).unwrap(),
                GenNode::Nested(tag, children) => {
                    let mut scope = w.open_nested(*tag).unwrap();
                    write_tree(&mut scope, children);
                }
            }
        }
    }

    fn check_tree(r: &mut Reader<'_>, nodes: &[GenNode]) {
        for node in nodes {
            match node {
                GenNode::Leaf(tag, value) => assert_eq!(r.read_value(*tag).unwrap(), value),
                GenNode::Nested(tag, children) => {
                    let mut inner = r.read_nested(*tag).unwrap();
                    check_tree(&mut inner, children);
                    assert!(!inner.has_data());
                }
            }
        }
    }

    #[test]
    fn random_tree_round_trip() {
        let mut rng = ChaCha20Rng::seed_from_u64(0x5F2F);
        for _ in 0..200 {
            let tree = gen_tree(&mut rng, 0);
            let mut w = Writer::new();
            write_tree(&mut w, &tree);
            let encoded = w.encode().unwrap();
            assert_eq!(encoded.len(), w.encoded_length().unwrap());
            let mut r = Reader::new(&encoded);
            check_tree(&mut r, &tree);
            assert!(!r.has_data());
        }
    }
}
