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

//! ISO 7816-4 APDU codec: command parsing and serialization with both the
//! short and extended Nc/Ne forms, plus the response/status-word types.

use crate::errors::{unexpected_encoding, unexpected_end, TlvError, TlvErrorKind, TlvResult};

/// CLA bit marking command chaining: more command data follows in
/// subsequent APDUs.
pub const CLA_COMMAND_CHAINING: u8 = 0x10;

/// Sentinel for "request as many response bytes as the encoding allows":
/// serialized as 256 in the short form and 65 536 in the extended form.
pub const NE_MAX: u32 = u32::MAX;

/// Which Nc/Ne encoding `Command::encode` should emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApduEncoding {
    /// Short if both Nc and Ne fit, extended otherwise.
    Automatic,
    Short,
    Extended,
}

/// A command APDU. `ne` is the number of expected response bytes; zero
/// means no Le field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub ne: u32,
}

impl Command {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            ne: 0,
        }
    }

    /// True when the command carries the CLA command-chaining bit.
    pub fn is_chained(&self) -> bool {
        self.cla & CLA_COMMAND_CHAINING != 0
    }

    /// Parses a raw command APDU. The body layout is inferred from the
    /// total length, per ISO 7816-4: a leading zero Lc byte switches to the
    /// extended form.
    pub fn decode(raw: &[u8]) -> TlvResult<Self> {
        if raw.len() < 4 {
            return Err(unexpected_end(format!(
                "APDU of {} bytes is shorter than a header",
                raw.len()
            )));
        }
        let mut cmd = Command::new(raw[0], raw[1], raw[2], raw[3]);
        let body = &raw[4..];
        match body {
            [] => {}
            [le] => cmd.ne = short_ne(*le),
            [lc, rest @ ..] if *lc != 0 => {
                let nc = usize::from(*lc);
                if rest.len() == nc {
                    cmd.data = rest.to_vec();
                } else if rest.len() == nc + 1 {
                    cmd.data = rest[..nc].to_vec();
                    cmd.ne = short_ne(rest[nc]);
                } else {
                    return Err(unexpected_encoding(format!(
                        "short APDU: Lc {nc} does not match {} body bytes",
                        rest.len()
                    )));
                }
            }
            [0, hi, lo] => cmd.ne = extended_ne(*hi, *lo),
            [0, hi, lo, rest @ ..] => {
                let nc = match usize::from(*hi) << 8 | usize::from(*lo) {
                    // A zero extended Lc mirrors the zero extended Le: the
                    // maximum the two-byte field can express.
                    0 => 0x1_0000,
                    n => n,
                };
                if rest.len() == nc {
                    cmd.data = rest.to_vec();
                } else if rest.len() == nc + 2 {
                    cmd.data = rest[..nc].to_vec();
                    cmd.ne = extended_ne(rest[nc], rest[nc + 1]);
                } else {
                    return Err(unexpected_encoding(format!(
                        "extended APDU: Lc {nc} does not match {} body bytes",
                        rest.len()
                    )));
                }
            }
            _ => {
                return Err(unexpected_end(
                    "extended APDU truncated inside the Lc field",
                ))
            }
        }
        Ok(cmd)
    }

    /// Serializes the command in the requested encoding.
    pub fn encode(&self, encoding: ApduEncoding) -> TlvResult<Vec<u8>> {
        let encoding = match encoding {
            ApduEncoding::Automatic => {
                if self.fits_short() {
                    ApduEncoding::Short
                } else {
                    ApduEncoding::Extended
                }
            }
            other => other,
        };
        let mut out = vec![self.cla, self.ins, self.p1, self.p2];
        match encoding {
            ApduEncoding::Short => {
                if !self.fits_short() {
                    return Err(no_valid_encoding("short", self));
                }
                if !self.data.is_empty() {
                    out.push(self.data.len() as u8);
                    out.extend_from_slice(&self.data);
                }
                if self.ne != 0 {
                    // 256 is encoded as zero in the short form.
                    let le = if self.ne == NE_MAX || self.ne == 256 {
                        0
                    } else {
                        self.ne as u8
                    };
                    out.push(le);
                }
            }
            ApduEncoding::Extended => {
                if self.data.len() > 0x1_0000 || (self.ne > 0x1_0000 && self.ne != NE_MAX) {
                    return Err(no_valid_encoding("extended", self));
                }
                if !self.data.is_empty() {
                    out.push(0);
                    // 65 536 becomes a zero two-byte Lc, symmetric with Le.
                    out.push((self.data.len() >> 8) as u8);
                    out.push(self.data.len() as u8);
                    out.extend_from_slice(&self.data);
                }
                if self.ne != 0 {
                    if self.data.is_empty() {
                        out.push(0);
                    }
                    let le = if self.ne == NE_MAX || self.ne == 0x1_0000 {
                        0
                    } else {
                        self.ne
                    };
                    out.push((le >> 8) as u8);
                    out.push(le as u8);
                }
            }
            ApduEncoding::Automatic => unreachable!(),
        }
        Ok(out)
    }

    fn fits_short(&self) -> bool {
        self.data.len() <= 0xFF && (self.ne <= 256 || self.ne == NE_MAX)
    }
}

fn short_ne(le: u8) -> u32 {
    match le {
        0 => 256,
        n => u32::from(n),
    }
}

fn extended_ne(hi: u8, lo: u8) -> u32 {
    match u32::from(hi) << 8 | u32::from(lo) {
        0 => 0x1_0000,
        n => n,
    }
}

fn no_valid_encoding(form: &str, cmd: &Command) -> TlvError {
    TlvError::new(
        TlvErrorKind::NoValidEncoding,
        format!(
            "{form} form cannot carry Nc {} / Ne {}",
            cmd.data.len(),
            cmd.ne
        ),
    )
}

/// Response status words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 90 00
    Success,
    /// 61 XX: XX more response bytes can be fetched with GET RESPONSE.
    MoreAvailable(u8),
    /// 6A 82: data object or application not found.
    NotFound,
    /// 6D 00
    InstructionNotSupportedOrInvalid,
}

impl From<Status> for [u8; 2] {
    fn from(status: Status) -> [u8; 2] {
        match status {
            Status::Success => [0x90, 0x00],
            Status::MoreAvailable(n) => [0x61, n],
            Status::NotFound => [0x6A, 0x82],
            Status::InstructionNotSupportedOrInvalid => [0x6D, 0x00],
        }
    }
}

/// A response APDU: optional body followed by the status word.
#[derive(Debug)]
pub struct Response {
    data: Option<Vec<u8>>,
    status: Status,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self { data: None, status }
    }

    pub fn with_data(status: Status, data: Vec<u8>) -> Self {
        Self {
            data: Some(data),
            status,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(data) = &self.data {
            buf.extend_from_slice(data);
        }
        let status: [u8; 2] = self.status.into();
        buf.extend_from_slice(&status);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_only() {
        let cmd = Command::decode(&[0x00, 0x20, 0x00, 0x80]).unwrap();
        assert_eq!((cmd.cla, cmd.ins, cmd.p1, cmd.p2), (0x00, 0x20, 0x00, 0x80));
        assert!(cmd.data.is_empty());
        assert_eq!(cmd.ne, 0);
    }

    #[test]
    fn short_select_apdu() {
        let raw = [
            0x00, 0xA4, 0x04, 0x00, 0x09, 0xA0, 0x00, 0x00, 0x03, 0x08, 0x00, 0x00, 0x10, 0x00,
            0x00,
        ];
        let cmd = Command::decode(&raw).unwrap();
        assert_eq!(cmd.data.len(), 9);
        assert_eq!(cmd.ne, 256);
        assert_eq!(cmd.encode(ApduEncoding::Automatic).unwrap(), raw);
    }

    #[test]
    fn lone_le_byte() {
        let cmd = Command::decode(&[0x00, 0xC0, 0x00, 0x00, 0x09]).unwrap();
        assert!(cmd.data.is_empty());
        assert_eq!(cmd.ne, 9);
        let cmd = Command::decode(&[0x00, 0xC0, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(cmd.ne, 256);
    }

    #[test]
    fn extended_le_only() {
        let cmd = Command::decode(&[0x00, 0xCB, 0x3F, 0xFF, 0x00, 0x12, 0x34]).unwrap();
        assert!(cmd.data.is_empty());
        assert_eq!(cmd.ne, 0x1234);
        let cmd = Command::decode(&[0x00, 0xCB, 0x3F, 0xFF, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(cmd.ne, 0x1_0000);
    }

    #[test]
    fn extended_data_and_le() {
        let mut raw = vec![0x10, 0x87, 0x07, 0x9A, 0x00, 0x01, 0x04];
        raw.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        raw.extend_from_slice(&[0x02, 0x00]);
        // 0x104 bytes of data claimed but only 4 present: inconsistent.
        assert_eq!(
            Command::decode(&raw).unwrap_err().kind,
            TlvErrorKind::UnexpectedEncoding
        );

        let mut raw = vec![0x00, 0x87, 0x07, 0x9A, 0x00, 0x01, 0x04];
        raw.extend_from_slice(&vec![0xAB; 0x104]);
        raw.extend_from_slice(&[0x02, 0x00]);
        let cmd = Command::decode(&raw).unwrap();
        assert_eq!(cmd.data.len(), 0x104);
        assert_eq!(cmd.ne, 0x200);
        assert_eq!(cmd.encode(ApduEncoding::Automatic).unwrap(), raw);
    }

    #[test]
    fn inconsistent_short_length_is_rejected() {
        assert_eq!(
            Command::decode(&[0x00, 0xCB, 0x3F, 0xFF, 0x05, 0x5C, 0x01]).unwrap_err().kind,
            TlvErrorKind::UnexpectedEncoding
        );
        assert_eq!(
            Command::decode(&[0x00, 0xCB]).unwrap_err().kind,
            TlvErrorKind::UnexpectedEnd
        );
        assert_eq!(
            Command::decode(&[0x00, 0xCB, 0x3F, 0xFF, 0x00, 0x01]).unwrap_err().kind,
            TlvErrorKind::UnexpectedEnd
        );
    }

    #[test]
    fn forced_short_rejects_large_fields() {
        let mut cmd = Command::new(0, 0x87, 0, 0);
        cmd.data = vec![0; 300];
        assert_eq!(
            cmd.encode(ApduEncoding::Short).unwrap_err().kind,
            TlvErrorKind::NoValidEncoding
        );
        let mut cmd = Command::new(0, 0x87, 0, 0);
        cmd.ne = 70_000;
        assert_eq!(
            cmd.encode(ApduEncoding::Automatic).unwrap_err().kind,
            TlvErrorKind::NoValidEncoding
        );
        let mut cmd = Command::new(0, 0x87, 0, 0);
        cmd.data = vec![0; 0x1_0001];
        assert_eq!(
            cmd.encode(ApduEncoding::Extended).unwrap_err().kind,
            TlvErrorKind::NoValidEncoding
        );
    }

    // The serialize-then-parse grid over the interesting Nc and Ne corners.
    #[test]
    fn nc_ne_round_trip_grid() {
        let headers = [(0x00u8, 0xA4u8, 0x04u8, 0x00u8), (0x10, 0x87, 0x07, 0x9A), (0xFF, 0x00, 0x01, 0xFE)];
        let ncs = [0usize, 1, 255, 256, 0xFFFF, 0x1_0000];
        let nes = [0u32, 1, 256, 0x1_0000, NE_MAX];
        for (cla, ins, p1, p2) in headers {
            for &nc in &ncs {
                for &ne in &nes {
                    let mut cmd = Command::new(cla, ins, p1, p2);
                    cmd.data = vec![0x5A; nc];
                    cmd.ne = ne;
                    let short = nc <= 255 && (ne <= 256 || ne == NE_MAX);
                    let raw = cmd.encode(ApduEncoding::Automatic).unwrap();
                    let parsed = Command::decode(&raw).unwrap();
                    assert_eq!(
                        (parsed.cla, parsed.ins, parsed.p1, parsed.p2),
                        (cla, ins, p1, p2)
                    );
                    assert_eq!(parsed.data, cmd.data, "nc {nc} ne {ne}");
                    // The "maximum" sentinel resolves to the largest value
                    // the chosen form can express.
                    let want_ne = match ne {
                        NE_MAX if short => 256,
                        NE_MAX => 0x1_0000,
                        other => other,
                    };
                    assert_eq!(parsed.ne, want_ne, "nc {nc} ne {ne}");
                }
            }
        }
    }

    #[test]
    fn status_words() {
        assert_eq!(<[u8; 2]>::from(Status::Success), [0x90, 0x00]);
        assert_eq!(<[u8; 2]>::from(Status::MoreAvailable(0xFF)), [0x61, 0xFF]);
        assert_eq!(<[u8; 2]>::from(Status::MoreAvailable(0)), [0x61, 0x00]);
        assert_eq!(<[u8; 2]>::from(Status::NotFound), [0x6A, 0x82]);
        assert_eq!(
            <[u8; 2]>::from(Status::InstructionNotSupportedOrInvalid),
            [0x6D, 0x00]
        );
    }

    #[test]
    fn response_encoding() {
        assert_eq!(Response::new(Status::Success).encode(), vec![0x90, 0x00]);
        assert_eq!(
            Response::with_data(Status::MoreAvailable(0x09), vec![0xAA, 0xBB]).encode(),
            vec![0xAA, 0xBB, 0x61, 0x09]
        );
    }
}
