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

//! Pluggable cryptographic primitives for the card handler.
//!
//! The card only needs two primitives: a random source for GUID/CardID
//! generation and a raw-RSA signer for GENERAL AUTHENTICATE. Each is a
//! trait behind [`CryptoConfig`], so deployments can swap in a hardware
//! backend; [`CryptoConfig::software`] wires up the platform defaults.

use crate::errors::Error;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use zeroize::Zeroize;

/// Raw-RSA signing primitive.
///
/// The host presents a fully padded block, so the card applies the private
/// exponent directly: `signature = input^d mod n`. No padding is added or
/// stripped.
pub trait RsaSigner: Send {
    /// RSA modulus length in bytes; inputs and signatures are exactly this
    /// long.
    fn modulus_len(&self) -> usize;

    /// Signs a pre-padded block of `modulus_len` bytes.
    fn sign_raw(&self, input: &[u8]) -> Result<Vec<u8>, Error>;
}

/// In-process signer over an operator-supplied private key.
pub struct SoftwareRsa {
    key: RsaPrivateKey,
}

impl SoftwareRsa {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }
}

impl RsaSigner for SoftwareRsa {
    fn modulus_len(&self) -> usize {
        self.key.size()
    }

    fn sign_raw(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let size = self.key.size();
        if input.len() != size {
            return Err(Error::Crypto(format!(
                "sign input is {} bytes, modulus is {size}",
                input.len()
            )));
        }
        let block = BigUint::from_bytes_be(input);
        let mut raw = block
            .modpow(self.key.d(), self.key.n())
            .to_bytes_be();
        // to_bytes_be drops leading zeros; the signature must span the full
        // modulus width.
        let mut signature = vec![0u8; size];
        signature[size - raw.len()..].copy_from_slice(&raw);
        raw.zeroize();
        Ok(signature)
    }
}

/// The primitives injected into a [`crate::piv::Card`]. No process-wide
/// state: each card owns its configuration.
pub struct CryptoConfig {
    pub rng: Box<dyn RngCore + Send>,
    pub rsa: Box<dyn RsaSigner>,
}

impl CryptoConfig {
    /// Platform defaults: OS entropy and the in-process signer.
    pub fn software(key: RsaPrivateKey) -> Self {
        Self {
            rng: Box::new(OsRng),
            rsa: Box::new(SoftwareRsa::new(key)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TEST_RSA_KEY;
    use super::*;

    #[test]
    fn raw_signature_is_modular_exponentiation() {
        let signer = SoftwareRsa::new(TEST_RSA_KEY.clone());
        assert_eq!(signer.modulus_len(), 256);

        let mut input = vec![0xA5u8; 256];
        input[0] = 0x00; // keep the block below the modulus
        let signature = signer.sign_raw(&input).unwrap();
        assert_eq!(signature.len(), 256);

        let expected = BigUint::from_bytes_be(&input)
            .modpow(TEST_RSA_KEY.d(), TEST_RSA_KEY.n())
            .to_bytes_be();
        assert_eq!(&signature[256 - expected.len()..], &expected[..]);
        assert!(signature[..256 - expected.len()].iter().all(|&b| b == 0));

        // And the public exponent round-trips it.
        let recovered = BigUint::from_bytes_be(&signature).modpow(
            &BigUint::from(65_537u32),
            TEST_RSA_KEY.n(),
        );
        assert_eq!(recovered, BigUint::from_bytes_be(&input));
    }

    #[test]
    fn rejects_input_shorter_than_modulus() {
        let signer = SoftwareRsa::new(TEST_RSA_KEY.clone());
        assert!(signer.sign_raw(&[0u8; 32]).is_err());
        assert!(signer.sign_raw(&[0u8; 257]).is_err());
    }
}
