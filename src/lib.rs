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

//! Software emulation of a NIST SP 800-73 PIV smartcard.
//!
//! The emulator answers APDUs from a host smartcard stack, relayed through a
//! virtual reader driver, so the host sees a PIV card carrying an
//! operator-supplied certificate and RSA key. [`piv::Card`] is the protocol
//! state machine; [`tlv`] and [`apdu`] are the codecs underneath it;
//! [`transport`] speaks the virtual reader's framing.

pub mod apdu;
pub mod crypto;
pub mod errors;
pub mod pfx;
pub mod piv;
pub mod tlv;
pub mod transport;
mod util;

pub use errors::{Error, Result, TlvError, TlvErrorKind, TlvResult};
pub use piv::Card;
