// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Verification of the metadata signature that covers the payload header and
//! manifest. The signature arrives either out-of-band (base64-encoded, from
//! the transport) or embedded in the payload as a `Signatures` protobuf
//! directly after the manifest.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine};
use num_traits::ToPrimitive;
use ring::digest;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, error, info};
use x509_cert::{der::referenced::OwnedToRef, Certificate};

use crate::{
    errorcode::ErrorCode,
    payload::metadata::PayloadMetadata,
    protobuf::chromeos_update_engine::Signatures,
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("No RSA public keys available for verification")]
    NoKeys,
    #[error("SPKI error")]
    Spki(#[from] x509_cert::spki::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The two verification capabilities the metadata check needs. Implementations
/// must be safe to call from any thread.
pub trait PayloadVerifier: Send + Sync {
    /// Verify a raw signature against a SHA-256 digest.
    fn verify_raw_signature(&self, signature: &[u8], digest: &[u8]) -> bool;

    /// Verify a serialized `Signatures` container against a SHA-256 digest.
    fn verify_signatures_container(&self, container: &[u8], digest: &[u8]) -> bool;
}

/// Validate the metadata signature over the leading `total_signed_size` bytes
/// of the payload. `metadata_signature_b64` is the optional transport-supplied
/// signature; when empty, the signature embedded in the payload is used.
pub fn validate_metadata_signature(
    metadata: &PayloadMetadata,
    payload: &[u8],
    metadata_signature_b64: &str,
    verifier: &dyn PayloadVerifier,
) -> ErrorCode {
    let Some(metadata_size) = metadata.metadata_size().to_usize() else {
        return ErrorCode::DownloadMetadataSignatureError;
    };
    let Some(total_signed_size) = metadata.total_signed_size().to_usize() else {
        return ErrorCode::DownloadMetadataSignatureError;
    };

    if payload.len() < total_signed_size {
        return ErrorCode::DownloadMetadataSignatureError;
    }

    // A single signature in raw bytes.
    let mut raw_signature = vec![];
    // The serialized Signatures message embedded in the payload, which may
    // contain multiple signatures.
    let mut container: &[u8] = &[];

    if !metadata_signature_b64.is_empty() {
        match STANDARD.decode(metadata_signature_b64) {
            Ok(decoded) => raw_signature = decoded,
            Err(e) => {
                error!("Unable to decode base64 metadata signature: {e}");
                return ErrorCode::DownloadMetadataSignatureError;
            }
        }
    } else {
        container = &payload[metadata_size..total_signed_size];
    }

    if raw_signature.is_empty() && container.is_empty() {
        error!("Missing mandatory metadata signature in both the transport response and the payload");
        return ErrorCode::DownloadMetadataSignatureMissingError;
    }

    let metadata_hash = digest::digest(&digest::SHA256, &payload[..metadata_size]);
    if metadata_hash.as_ref().len() != digest::SHA256_OUTPUT_LEN {
        error!(
            "Computed hash of metadata has incorrect size: {}",
            metadata_hash.as_ref().len(),
        );
        return ErrorCode::DownloadMetadataSignatureVerificationError;
    }

    let matches = if !raw_signature.is_empty() {
        verifier.verify_raw_signature(&raw_signature, metadata_hash.as_ref())
    } else {
        verifier.verify_signatures_container(container, metadata_hash.as_ref())
    };

    if !matches {
        error!(
            "Metadata hash signature verification failed; calculated hash = {}",
            hex::encode(metadata_hash),
        );
        return ErrorCode::DownloadMetadataSignatureMismatch;
    }

    info!("Metadata hash signature matches the expected value");
    ErrorCode::Success
}

/// [`PayloadVerifier`] backed by the RSA public keys of one or more trusted
/// certificates. A signature is accepted if any key verifies it.
pub struct CertVerifier {
    public_keys: Vec<RsaPublicKey>,
}

impl CertVerifier {
    pub fn new(public_keys: Vec<RsaPublicKey>) -> Result<Self> {
        if public_keys.is_empty() {
            return Err(Error::NoKeys);
        }

        Ok(Self { public_keys })
    }

    pub fn from_certs(certs: &[Certificate]) -> Result<Self> {
        let public_keys = certs
            .iter()
            .map(|cert| {
                RsaPublicKey::try_from(
                    cert.tbs_certificate.subject_public_key_info.owned_to_ref(),
                )
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Self::new(public_keys)
    }

    pub fn from_pem_cert_file(path: &Path) -> Result<Self> {
        use x509_cert::der::DecodePem;

        let data = std::fs::read(path)?;
        let cert = Certificate::from_pem(data).map_err(x509_cert::spki::Error::from)?;

        Self::from_certs(&[cert])
    }

    fn verify_with_any_key(&self, signature: &[u8], digest: &[u8]) -> bool {
        let scheme = Pkcs1v15Sign::new::<Sha256>();

        self.public_keys.iter().any(|key| {
            key.verify(scheme.clone(), digest, signature)
                .map_err(|e| debug!("Signature did not verify against key: {e}"))
                .is_ok()
        })
    }
}

impl PayloadVerifier for CertVerifier {
    fn verify_raw_signature(&self, signature: &[u8], digest: &[u8]) -> bool {
        self.verify_with_any_key(signature, digest)
    }

    fn verify_signatures_container(&self, container: &[u8], digest: &[u8]) -> bool {
        let signatures: Signatures = match util::read_protobuf(container) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to decode signatures container: {e}");
                return false;
            }
        };

        for signature in &signatures.signatures {
            let Some(data) = &signature.data else {
                continue;
            };
            let without_padding = match signature.unpadded_signature_size {
                Some(size) if (size as usize) <= data.len() => &data[..size as usize],
                _ => data.as_slice(),
            };

            if self.verify_with_any_key(without_padding, digest) {
                return true;
            }
        }

        false
    }
}
