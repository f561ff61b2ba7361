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

//! Loads the operator credential from a PKCS#12 bundle.

use crate::errors::{Error, Result};
use log::{info, warn};
use p12::PFX;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use std::path::Path;
use x509_parser::parse_x509_certificate;
use zeroize::Zeroizing;

/// The credential the card exposes: the certificate stays DER so the card
/// can serve it byte for byte; the key is parsed for signing.
#[derive(Debug)]
pub struct Identity {
    pub cert_der: Vec<u8>,
    pub key: RsaPrivateKey,
}

/// Reads a PKCS#12 bundle, checks its MAC against `password` and pulls out
/// the first private key and X.509 certificate.
pub fn load(path: &Path, password: &str) -> Result<Identity> {
    let raw = std::fs::read(path)?;
    let pfx = PFX::parse(&raw)
        .map_err(|e| Error::Pkcs12(format!("{} is not a PKCS#12 bundle: {e:?}", path.display())))?;
    if !pfx.verify_mac(password) {
        return Err(Error::Pkcs12(
            "MAC verification failed; wrong password?".into(),
        ));
    }

    let key_der = Zeroizing::new(
        pfx.key_bags(password)
            .map_err(|e| Error::Pkcs12(format!("could not decrypt key bags: {e:?}")))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Pkcs12("bundle holds no private key".into()))?,
    );
    let key = RsaPrivateKey::from_pkcs8_der(&key_der)
        .map_err(|e| Error::Pkcs12(format!("private key is not an RSA PKCS#8 key: {e}")))?;

    let cert_der = pfx
        .cert_x509_bags(password)
        .map_err(|e| Error::Pkcs12(format!("could not decrypt certificate bags: {e:?}")))?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Pkcs12("bundle holds no certificate".into()))?;

    match parse_x509_certificate(&cert_der) {
        Ok((_, cert)) => info!(
            "loaded certificate: subject [{}], expires {}",
            cert.subject(),
            cert.validity().not_after
        ),
        // The card serves whatever the operator packed; a cert the host
        // cannot chew on is the operator's problem, not ours.
        Err(e) => warn!("certificate in bundle does not parse as X.509: {e}"),
    }

    Ok(Identity { cert_der, key })
}
