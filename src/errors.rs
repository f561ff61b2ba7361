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

use std::fmt;

/// Failure classes shared by the TLV and APDU codecs and the PIV data
/// objects. Each kind has its own diagnostic; the message carries the
/// offending detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvErrorKind {
    /// Tag is zero, above 0xFFFF, or a tag width outside {1, 2} was requested.
    UnsupportedTag,
    /// Length field uses the BER indefinite form (0x80) or more than three
    /// length bytes (0x84+), or a value exceeds 0x00FFFFFF bytes.
    UnsupportedLength,
    /// Tag mismatch, fixed-width value of the wrong size, or a string value
    /// that does not decode in the requested encoding.
    UnexpectedEncoding,
    /// Ran out of input mid-element.
    UnexpectedEnd,
    /// APDU fields do not fit any of the requested encoding forms.
    NoValidEncoding,
    /// Writer used while a nested scope is still open.
    InvalidSchema,
    /// Data object tag outside the permitted alternate ranges.
    InvalidDataTag,
}

impl fmt::Display for TlvErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TlvErrorKind::UnsupportedTag => "unsupported tag",
            TlvErrorKind::UnsupportedLength => "unsupported length encoding",
            TlvErrorKind::UnexpectedEncoding => "unexpected encoding",
            TlvErrorKind::UnexpectedEnd => "unexpected end of data",
            TlvErrorKind::NoValidEncoding => "no valid encoding",
            TlvErrorKind::InvalidSchema => "invalid schema",
            TlvErrorKind::InvalidDataTag => "invalid data object tag",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvError {
    pub kind: TlvErrorKind,
    message: String,
}

impl TlvError {
    pub fn new(kind: TlvErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TlvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TlvError {}

pub type TlvResult<T> = std::result::Result<T, TlvError>;

// Helper constructors for the kinds the codecs raise most often.
pub fn unsupported_tag(msg: impl Into<String>) -> TlvError {
    TlvError::new(TlvErrorKind::UnsupportedTag, msg)
}

pub fn unsupported_length(msg: impl Into<String>) -> TlvError {
    TlvError::new(TlvErrorKind::UnsupportedLength, msg)
}

pub fn unexpected_encoding(msg: impl Into<String>) -> TlvError {
    TlvError::new(TlvErrorKind::UnexpectedEncoding, msg)
}

pub fn unexpected_end(msg: impl Into<String>) -> TlvError {
    TlvError::new(TlvErrorKind::UnexpectedEnd, msg)
}

/// Top-level error for everything outside the card handler: bundle loading,
/// signing backends and the reader transport. The card handler itself never
/// surfaces errors; it reduces every failure to a response status word.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tlv: {0}")]
    Tlv(#[from] TlvError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("pkcs#12: {0}")]
    Pkcs12(String),
    #[error("crypto: {0}")]
    Crypto(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("{0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;
