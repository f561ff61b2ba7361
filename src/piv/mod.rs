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

//! PIV application state machine, per
//! https://nvlpubs.nist.gov/nistpubs/SpecialPublications/NIST.SP.800-73-4.pdf
//!
//! [`Card`] consumes raw command APDUs and produces complete responses; it
//! never errors towards the transport. Anything it cannot make sense of
//! comes back as a status word.

mod ccc;
mod chuid;
mod object;

pub use ccc::Ccc;
pub use chuid::Chuid;
pub use object::DataObject;

use crate::apdu::{Command, Response, Status, CLA_COMMAND_CHAINING};
use crate::crypto::{CryptoConfig, RsaSigner};
use crate::errors::{unexpected_encoding, TlvResult};
use crate::tlv::{Reader, StringEncoding, Writer};
use crate::util::to_hex;
use log::{debug, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::cmp::min;
use std::io::Cursor;
use uuid::Uuid;
use zeroize::Zeroize;

/// AID of the PIV application, SP 800-73-4 section 2.2.
pub const PIV_AID: [u8; 9] = [0xA0, 0x00, 0x00, 0x03, 0x08, 0x00, 0x00, 0x10, 0x00];

// Application PIX plus the two version bytes, as reported in the SELECT
// application property template and the discovery object.
const PIV_APP_VERSION: [u8; 2] = [0x01, 0x00];
const PIV_PIX_WITH_VERSION: [u8; 6] = [0x00, 0x00, 0x10, 0x00, 0x01, 0x00];

/// Answer-To-Reset the emulated card presents: T=1, bogus historical bytes
/// borrowed from a common PIV profile.
pub const PIV_ATR: [u8; 24] = [
    0x3B, 0x9F, 0x95, 0x81, 0x31, 0xFE, 0x9F, 0x00, 0x66, 0x46, 0x53, 0x05, 0x10, 0x00, 0x11,
    0x71, 0xDF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02,
];

const APPLET_LABEL: &str = "PIVert PIV Applet";

// SELECT response tags, SP 800-73-4 section 3.1.1.
const TAG_APPLICATION_PROPERTY_TEMPLATE: u32 = 0x61;
const TAG_AID: u32 = 0x4F;
const TAG_COEXISTENT_TAG_ALLOCATION_AUTHORITY: u32 = 0x79;
const TAG_APPLICATION_LABEL: u32 = 0x50;
const TAG_SUPPORTED_ALGORITHMS: u32 = 0xAC;
const TAG_ALGORITHM_IDENTIFIER: u32 = 0x80;
const TAG_OBJECT_IDENTIFIER: u32 = 0x06;

// GET DATA request/response tags.
const TAG_TAG_LIST: u32 = 0x5C;
const TAG_DISCOVERY_OBJECT: u32 = 0x7E;
const TAG_PIN_USAGE_POLICY: u32 = 0x5F2F;
const TAG_CERTIFICATE: u32 = 0x70;
const TAG_CERT_INFO: u32 = 0x71;
const TAG_ERROR_DETECTION_CODE: u32 = 0xFE;
const TAG_DATA_FIELD: u32 = 0x53;

// GENERAL AUTHENTICATE template tags, SP 800-73-4 section 3.2.4.
const TAG_DYNAMIC_AUTHENTICATION_TEMPLATE: u32 = 0x7C;
const TAG_CHALLENGE: u32 = 0x81;
const TAG_RESPONSE: u32 = 0x82;

// Storage locators the host can ask for. All three certificate slots hand
// out the one operator credential.
const OBJECT_TAG_CHUID: u32 = 0x005F_C102;
const OBJECT_TAG_CCC: u32 = 0x005F_C107;
const OBJECT_TAG_CERT_PIV_AUTH: u32 = 0x005F_C105;
const OBJECT_TAG_CERT_CARD_AUTH: u32 = 0x005F_C101;
const OBJECT_TAG_CERT_DIGITAL_SIGNATURE: u32 = 0x005F_C10A;

// Algorithm identifiers advertised in the SELECT response, SP 800-78-4
// table 6-2: 3DES, AES-128/192/256, RSA-1024/2048, ECC-P256/P384.
const SUPPORTED_ALGORITHMS: [u8; 8] = [0x03, 0x08, 0x0A, 0x0C, 0x06, 0x07, 0x11, 0x14];

/// Largest response body that fits a plain `90 00` response; longer bodies
/// are drained through GET RESPONSE in windows of this size.
const CHUNK_SIZE: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
enum Instruction {
    Verify = 0x20,
    GeneralAuthenticate = 0x87,
    Select = 0xA4,
    GetResponse = 0xC0,
    GetData = 0xCB,
}

/// An emulated PIV smartcard bound to one operator credential.
///
/// The handler is single threaded per card session: the transport hands one
/// APDU in and awaits the response before the next. Chaining state never
/// leaves the instance.
pub struct Card {
    chuid: Chuid,
    ccc: Ccc,
    cert_der: Vec<u8>,
    signer: Box<dyn RsaSigner>,
    // Payload being assembled from chained commands, and response being
    // drained by GET RESPONSE. At most one of each at any time.
    pending_command: Option<Vec<u8>>,
    pending_response: Option<Cursor<Vec<u8>>>,
}

impl Card {
    /// Builds a card around a DER certificate and the signing key inside
    /// `crypto`. `uuid` becomes the CHUID GUID; the CCC CardID is drawn from
    /// the configured RNG.
    pub fn new(uuid: Uuid, cert_der: Vec<u8>, mut crypto: CryptoConfig) -> Self {
        let mut chuid = Chuid::new();
        chuid.set_guid(*uuid.as_bytes());
        let mut ccc = Ccc::new();
        ccc.set_random_card_id(crypto.rng.as_mut());
        Self {
            chuid,
            ccc,
            cert_der,
            signer: crypto.rsa,
            pending_command: None,
            pending_response: None,
        }
    }

    /// The ATR bytes the virtual reader presents for this card.
    pub fn atr(&self) -> &'static [u8] {
        &PIV_ATR
    }

    /// Resets the card: chaining state is dropped, the ATR is returned.
    /// Warm and cold resets behave identically for an emulated card.
    pub fn reset(&mut self, warm: bool) -> &'static [u8] {
        debug!("card reset (warm: {warm})");
        self.pending_command = None;
        self.pending_response = None;
        &PIV_ATR
    }

    /// Processes one command APDU and returns the complete response,
    /// trailing status word included. Never fails: malformed input maps to
    /// an error status word.
    pub fn process_apdu(&mut self, raw: &[u8]) -> Vec<u8> {
        debug!("got APDU: {}", to_hex(raw));
        let resp = match Command::decode(raw) {
            Ok(cmd) => self.handle(cmd).unwrap_or_else(|e| {
                // TLV-level failures while picking a command apart mean the
                // host asked for something that is not there.
                debug!("command data did not parse: {e}");
                Response::new(Status::NotFound)
            }),
            Err(e) => {
                warn!("dropping malformed APDU: {e}");
                Response::new(Status::InstructionNotSupportedOrInvalid)
            }
        };
        let encoded = resp.encode();
        debug!("send response: {}", to_hex(&encoded));
        encoded
    }

    fn handle(&mut self, cmd: Command) -> TlvResult<Response> {
        if cmd.cla & !CLA_COMMAND_CHAINING != 0 {
            warn!("unsupported class byte {:#04x}", cmd.cla);
            return Ok(Response::new(Status::InstructionNotSupportedOrInvalid));
        }
        let ins = Instruction::from_u8(cmd.ins);

        // A response is only drained by consecutive GET RESPONSE commands;
        // any other traffic abandons it.
        if self.pending_response.is_some() && ins != Some(Instruction::GetResponse) {
            debug!("abandoning partially drained response");
            self.pending_response = None;
        }

        if cmd.is_chained() {
            // More command data follows; stash this fragment and ack.
            self.pending_command
                .get_or_insert_with(Vec::new)
                .extend_from_slice(&cmd.data);
            return Ok(Response::new(Status::Success));
        }

        match ins {
            Some(Instruction::Select) => self.handle_select(&cmd),
            Some(Instruction::Verify) => self.handle_verify(&cmd),
            Some(Instruction::GeneralAuthenticate) => self.handle_general_authenticate(&cmd),
            Some(Instruction::GetResponse) => self.handle_get_response(&cmd),
            Some(Instruction::GetData) => self.handle_get_data(&cmd),
            None => {
                warn!("unimplemented instruction {:#04x}", cmd.ins);
                Ok(Response::new(Status::InstructionNotSupportedOrInvalid))
            }
        }
    }

    // SELECT, section 3.1.1: only selection of the PIV application by its
    // full AID is supported.
    fn handle_select(&mut self, cmd: &Command) -> TlvResult<Response> {
        if cmd.p1 != 0x04 {
            return Ok(Response::new(Status::NotFound));
        }
        if cmd.data != PIV_AID {
            debug!("SELECT of unknown application {}", to_hex(&cmd.data));
            return Ok(Response::new(Status::NotFound));
        }
        let body = self.build_application_property_template()?;
        Ok(self.send(body))
    }

    // VERIFY, section 3.2.1. The emulator does not hold a real PIN: any
    // value satisfies it. The host only needs the success path to unlock
    // the private key operations it is about to request.
    fn handle_verify(&mut self, _cmd: &Command) -> TlvResult<Response> {
        Ok(Response::new(Status::Success))
    }

    // GET DATA, section 3.1.2: a tag list with a single storage locator
    // selects which stored object comes back.
    fn handle_get_data(&mut self, cmd: &Command) -> TlvResult<Response> {
        if cmd.p1 != 0x3F || cmd.p2 != 0xFF {
            return Ok(Response::new(Status::NotFound));
        }
        let mut r = Reader::new(&cmd.data);
        let locator = r.read_value(TAG_TAG_LIST)?;
        if locator.is_empty() || locator.len() > 4 {
            return Ok(Response::new(Status::NotFound));
        }
        let object_tag = locator
            .iter()
            .fold(0u32, |acc, b| acc << 8 | u32::from(*b));
        let body = match object_tag {
            TAG_DISCOVERY_OBJECT => self.build_discovery_object()?,
            OBJECT_TAG_CHUID => self.chuid.encode()?,
            OBJECT_TAG_CCC => self.ccc.encode()?,
            OBJECT_TAG_CERT_PIV_AUTH
            | OBJECT_TAG_CERT_CARD_AUTH
            | OBJECT_TAG_CERT_DIGITAL_SIGNATURE => self.build_certificate_object()?,
            other => {
                warn!("unimplemented data object {other:#08x}");
                return Ok(Response::new(Status::NotFound));
            }
        };
        Ok(self.send(body))
    }

    // GET RESPONSE drains the pending response in 255-byte windows.
    fn handle_get_response(&mut self, cmd: &Command) -> TlvResult<Response> {
        if cmd.p1 != 0 || cmd.p2 != 0 {
            return Ok(Response::new(Status::InstructionNotSupportedOrInvalid));
        }
        Ok(self.drain_pending_response())
    }

    // GENERAL AUTHENTICATE, section 3.2.4: the assembled dynamic
    // authentication template carries a pre-padded block under the
    // challenge tag; the card applies the bare private key to it. P1/P2
    // carry the algorithm and key reference, which this card ignores: it
    // holds exactly one RSA key.
    fn handle_general_authenticate(&mut self, cmd: &Command) -> TlvResult<Response> {
        let mut payload = self.pending_command.take().unwrap_or_default();
        payload.extend_from_slice(&cmd.data);

        let mut outer = Reader::new(&payload);
        let mut template = outer.read_nested(TAG_DYNAMIC_AUTHENTICATION_TEMPLATE)?;
        let mut challenge = None;
        while template.has_data() {
            let tag = template.peek_tag(1)?;
            let value = template.read_value(tag)?;
            if tag == TAG_CHALLENGE {
                challenge = Some(value);
            }
        }
        let challenge = challenge.ok_or_else(|| {
            unexpected_encoding("dynamic authentication template without a challenge")
        })?;

        if challenge.len() != self.signer.modulus_len() {
            warn!(
                "challenge is {} bytes, need the modulus length {}",
                challenge.len(),
                self.signer.modulus_len()
            );
            return Ok(Response::new(Status::InstructionNotSupportedOrInvalid));
        }
        let mut signature = match self.signer.sign_raw(challenge) {
            Ok(signature) => signature,
            Err(e) => {
                warn!("signing failed: {e}");
                return Ok(Response::new(Status::InstructionNotSupportedOrInvalid));
            }
        };

        let mut w = Writer::new();
        {
            let mut template = w.open_nested(TAG_DYNAMIC_AUTHENTICATION_TEMPLATE)?;
            template.write_value(TAG_RESPONSE, &signature)?;
        }
        signature.zeroize();
        let body = w.encode()?;
        w.clear();
        Ok(self.send(body))
    }

    // Queues a response body, draining the first window immediately. Bodies
    // that fit a single response skip the pending machinery.
    fn send(&mut self, body: Vec<u8>) -> Response {
        if body.len() <= CHUNK_SIZE {
            return Response::with_data(Status::Success, body);
        }
        self.pending_response = Some(Cursor::new(body));
        self.drain_pending_response()
    }

    fn drain_pending_response(&mut self) -> Response {
        let Some(cursor) = self.pending_response.as_mut() else {
            // Nothing pending: zero bytes available.
            return Response::new(Status::MoreAvailable(0));
        };
        let pos = cursor.position() as usize;
        let remaining = cursor.get_ref().len() - pos;
        let take = min(remaining, CHUNK_SIZE);
        let chunk = cursor.get_ref()[pos..pos + take].to_vec();
        cursor.set_position((pos + take) as u64);
        if remaining > CHUNK_SIZE {
            Response::with_data(Status::MoreAvailable(min(remaining, 0xFF) as u8), chunk)
        } else {
            self.pending_response = None;
            Response::with_data(Status::Success, chunk)
        }
    }

    // Application property template returned by SELECT, section 3.1.1
    // table 3.
    fn build_application_property_template(&self) -> TlvResult<Vec<u8>> {
        let mut w = Writer::new();
        {
            let mut template = w.open_nested(TAG_APPLICATION_PROPERTY_TEMPLATE)?;
            template.write_value(TAG_AID, &PIV_PIX_WITH_VERSION)?;
            {
                let mut authority =
                    template.open_nested(TAG_COEXISTENT_TAG_ALLOCATION_AUTHORITY)?;
                authority.write_value(TAG_AID, &PIV_AID)?;
            }
            template.write_string(TAG_APPLICATION_LABEL, APPLET_LABEL, StringEncoding::Ascii)?;
            {
                let mut algorithms = template.open_nested(TAG_SUPPORTED_ALGORITHMS)?;
                for alg in SUPPORTED_ALGORITHMS {
                    algorithms.write_byte(TAG_ALGORITHM_IDENTIFIER, alg)?;
                }
                algorithms.write_value(TAG_OBJECT_IDENTIFIER, &[])?;
            }
        }
        w.encode()
    }

    // Discovery object, section 3.3.2: the PIV AID and a PIN usage policy
    // of "PIV application PIN only".
    fn build_discovery_object(&self) -> TlvResult<Vec<u8>> {
        let mut aid = [0u8; 11];
        aid[..9].copy_from_slice(&PIV_AID);
        aid[9..].copy_from_slice(&PIV_APP_VERSION);
        let mut w = Writer::new();
        {
            let mut discovery = w.open_nested(TAG_DISCOVERY_OBJECT)?;
            discovery.write_value(TAG_AID, &aid)?;
            discovery.write_value(TAG_PIN_USAGE_POLICY, &[0x40, 0x00])?;
        }
        w.encode()
    }

    // Certificate objects all wrap the operator certificate: the DER
    // certificate, a CertInfo of 0 (uncompressed) and an empty error
    // detection code.
    fn build_certificate_object(&self) -> TlvResult<Vec<u8>> {
        let mut w = Writer::new();
        {
            let mut object = w.open_nested(TAG_DATA_FIELD)?;
            object.write_value(TAG_CERTIFICATE, &self.cert_der)?;
            object.write_byte(TAG_CERT_INFO, 0x00)?;
            object.write_value(TAG_ERROR_DETECTION_CODE, &[])?;
        }
        w.encode()
    }
}
