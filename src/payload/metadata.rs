// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Parser for the fixed payload header that precedes the manifest. All
//! multi-byte integers are big-endian on the wire regardless of the host, and
//! every size computation is overflow-checked: a hostile manifest size must be
//! rejected, never wrapped.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use byteorder::{BigEndian, ByteOrder};
use num_traits::ToPrimitive;
use thiserror::Error;
use tracing::error;

use crate::{
    errorcode::ErrorCode, protobuf::chromeos_update_engine::DeltaArchiveManifest, util,
};

pub const MAGIC: &[u8; 4] = b"CrAU";

const MAJOR_VERSION_OFFSET: usize = 4;
const MANIFEST_SIZE_OFFSET: usize = 12;
const METADATA_SIGNATURE_SIZE_OFFSET: usize = 20;

/// Size of the fixed header. The manifest starts immediately after.
pub const MANIFEST_OFFSET: usize = 24;

pub const MIN_SUPPORTED_MAJOR_VERSION: u64 = 2;
pub const MAX_SUPPORTED_MAJOR_VERSION: u64 = 2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid payload magic: {}", hex::encode(.0))]
    InvalidMagic([u8; 4]),
    #[error("Unsupported major payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("Metadata size overflow: {0} + {1}")]
    MetadataSizeOverflow(u64, u64),
    #[error("Payload ends before the metadata does")]
    Truncated,
    #[error("Invalid metadata size: {0}")]
    InvalidMetadataSize(u64),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Failed to decode payload manifest")]
    Protobuf(#[from] quick_protobuf::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    /// The externally reported code for this parse failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidMagic(_) => ErrorCode::DownloadInvalidMetadataMagicString,
            Self::UnsupportedVersion(_) => ErrorCode::UnsupportedMajorPayloadVersion,
            Self::MetadataSizeOverflow(..) => ErrorCode::DownloadInvalidMetadataSize,
            _ => ErrorCode::DownloadManifestParseError,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Outcome of [`PayloadMetadata::parse_header`] when the input is not
/// malformed. A short input is not an error because headers arrive in chunks
/// over the transport; the caller retries with more data.
#[derive(Debug)]
pub enum ParseResult {
    InsufficientData,
    Success(PayloadMetadata),
}

/// The parsed fixed header of an update payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadMetadata {
    major_version: u64,
    manifest_size: u64,
    metadata_signature_size: u32,
    metadata_size: u64,
}

impl PayloadMetadata {
    pub fn parse_header(payload: &[u8]) -> Result<ParseResult> {
        if payload.len() < METADATA_SIGNATURE_SIZE_OFFSET {
            return Ok(ParseResult::InsufficientData);
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&payload[..MAGIC.len()]);
        if magic != *MAGIC {
            error!(
                "Bad payload format -- invalid delta magic: {} expected: {}",
                hex::encode(magic),
                hex::encode(MAGIC),
            );
            return Err(Error::InvalidMagic(magic));
        }

        if payload.len() < MANIFEST_OFFSET {
            return Ok(ParseResult::InsufficientData);
        }

        let major_version =
            BigEndian::read_u64(&payload[MAJOR_VERSION_OFFSET..MANIFEST_SIZE_OFFSET]);
        if !(MIN_SUPPORTED_MAJOR_VERSION..=MAX_SUPPORTED_MAJOR_VERSION)
            .contains(&major_version)
        {
            error!("Bad payload format -- unsupported payload version: {major_version}");
            return Err(Error::UnsupportedVersion(major_version));
        }

        let manifest_size =
            BigEndian::read_u64(&payload[MANIFEST_SIZE_OFFSET..METADATA_SIGNATURE_SIZE_OFFSET]);
        let metadata_size = (MANIFEST_OFFSET as u64)
            .checked_add(manifest_size)
            .ok_or_else(|| {
                error!("Overflow detected on manifest size");
                Error::MetadataSizeOverflow(MANIFEST_OFFSET as u64, manifest_size)
            })?;

        let metadata_signature_size =
            BigEndian::read_u32(&payload[METADATA_SIGNATURE_SIZE_OFFSET..MANIFEST_OFFSET]);
        metadata_size
            .checked_add(u64::from(metadata_signature_size))
            .ok_or_else(|| {
                error!("Overflow detected on metadata and signature size");
                Error::MetadataSizeOverflow(metadata_size, u64::from(metadata_signature_size))
            })?;

        Ok(ParseResult::Success(Self {
            major_version,
            manifest_size,
            metadata_signature_size,
            metadata_size,
        }))
    }

    pub fn major_version(&self) -> u64 {
        self.major_version
    }

    pub fn manifest_size(&self) -> u64 {
        self.manifest_size
    }

    pub fn metadata_signature_size(&self) -> u32 {
        self.metadata_signature_size
    }

    /// Size of the signed region: the fixed header plus the manifest.
    pub fn metadata_size(&self) -> u64 {
        self.metadata_size
    }

    /// Offset of the first byte past the metadata signature. Guaranteed not to
    /// wrap by [`Self::parse_header`].
    pub fn total_signed_size(&self) -> u64 {
        self.metadata_size + u64::from(self.metadata_signature_size)
    }

    /// The raw manifest region of `payload`.
    pub fn manifest_bytes<'a>(&self, payload: &'a [u8]) -> Result<&'a [u8]> {
        let size = self
            .manifest_size
            .to_usize()
            .ok_or(Error::IntegerTooLarge("manifest_size"))?;
        let end = MANIFEST_OFFSET
            .checked_add(size)
            .ok_or(Error::IntegerTooLarge("manifest_size"))?;

        if payload.len() < end {
            return Err(Error::Truncated);
        }

        Ok(&payload[MANIFEST_OFFSET..end])
    }

    /// The embedded metadata signature region of `payload`.
    pub fn signature_bytes<'a>(&self, payload: &'a [u8]) -> Result<&'a [u8]> {
        let start = self
            .metadata_size
            .to_usize()
            .ok_or(Error::IntegerTooLarge("metadata_size"))?;
        let end = self
            .total_signed_size()
            .to_usize()
            .ok_or(Error::IntegerTooLarge("metadata_signature_size"))?;

        if payload.len() < end {
            return Err(Error::Truncated);
        }

        Ok(&payload[start..end])
    }

    /// Decode the manifest. Only valid after [`Self::parse_header`] returned
    /// [`ParseResult::Success`], which produced `self`.
    pub fn get_manifest(&self, payload: &[u8]) -> Result<DeltaArchiveManifest> {
        let manifest = util::read_protobuf(self.manifest_bytes(payload)?)?;
        Ok(manifest)
    }

    /// Read and parse the metadata region (header + manifest + metadata
    /// signature) from the beginning of a payload file. Returns the parsed
    /// header and the raw region bytes for signature verification.
    pub fn read_from_file(path: &Path) -> Result<(Self, Vec<u8>)> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let mut data = vec![0u8; MANIFEST_OFFSET];
        file.read_exact(&mut data)?;

        let metadata = match Self::parse_header(&data)? {
            ParseResult::Success(m) => m,
            ParseResult::InsufficientData => return Err(Error::Truncated),
        };

        let total = metadata.total_signed_size();
        if total < MANIFEST_OFFSET as u64 || total > file_size {
            return Err(Error::InvalidMetadataSize(total));
        }

        let total = total
            .to_usize()
            .ok_or(Error::IntegerTooLarge("metadata_size"))?;
        data.resize(total, 0);
        file.read_exact(&mut data[MANIFEST_OFFSET..])?;

        Ok((metadata, data))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{protobuf::chromeos_update_engine::PartitionUpdate, util};

    use super::*;

    fn header(version: u64, manifest_size: u64, sig_size: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&version.to_be_bytes());
        data.extend_from_slice(&manifest_size.to_be_bytes());
        data.extend_from_slice(&sig_size.to_be_bytes());
        data
    }

    #[test]
    fn insufficient_data() {
        assert_matches!(
            PayloadMetadata::parse_header(b""),
            Ok(ParseResult::InsufficientData),
        );
        assert_matches!(
            PayloadMetadata::parse_header(&header(2, 0, 0)[..19]),
            Ok(ParseResult::InsufficientData),
        );
        // Enough for the magic check, but not for the signature size field.
        assert_matches!(
            PayloadMetadata::parse_header(&header(2, 0, 0)[..20]),
            Ok(ParseResult::InsufficientData),
        );
    }

    #[test]
    fn invalid_magic() {
        let mut data = header(2, 0, 0);
        data[..4].copy_from_slice(b"XXXX");

        assert_matches!(
            PayloadMetadata::parse_header(&data),
            Err(Error::InvalidMagic(m)) if &m == b"XXXX",
        );
    }

    #[test]
    fn unsupported_version() {
        assert_matches!(
            PayloadMetadata::parse_header(&header(1, 0, 0)),
            Err(Error::UnsupportedVersion(1)),
        );
        assert_matches!(
            PayloadMetadata::parse_header(&header(3, 0, 0)),
            Err(Error::UnsupportedVersion(3)),
        );
    }

    #[test]
    fn manifest_size_overflow() {
        assert_matches!(
            PayloadMetadata::parse_header(&header(2, 0xffff_ffff_ffff_fff0, 0)),
            Err(Error::MetadataSizeOverflow(..)),
        );
    }

    #[test]
    fn signature_size_overflow() {
        assert_matches!(
            PayloadMetadata::parse_header(&header(2, u64::MAX - 24, u32::MAX)),
            Err(Error::MetadataSizeOverflow(..)),
        );
    }

    #[test]
    fn big_endian_fields() {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 2]);
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        data.extend_from_slice(&[0, 0, 0x03, 0x04]);

        let metadata = match PayloadMetadata::parse_header(&data).unwrap() {
            ParseResult::Success(m) => m,
            r => panic!("Unexpected parse result: {r:?}"),
        };

        assert_eq!(metadata.major_version(), 2);
        assert_eq!(metadata.manifest_size(), 0x0102);
        assert_eq!(metadata.metadata_signature_size(), 0x0304);
        assert_eq!(metadata.metadata_size(), 24 + 0x0102);
        assert_eq!(metadata.total_signed_size(), 24 + 0x0102 + 0x0304);
    }

    #[test]
    fn manifest_round_trip() {
        let manifest = DeltaArchiveManifest {
            partitions: vec![PartitionUpdate {
                partition_name: "system".to_owned(),
                run_postinstall: Some(true),
                postinstall_path: Some("bin/postinst".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let manifest_raw = util::write_protobuf(&manifest).unwrap();

        let mut data = header(2, manifest_raw.len() as u64, 0);
        data.extend_from_slice(&manifest_raw);

        let metadata = match PayloadMetadata::parse_header(&data).unwrap() {
            ParseResult::Success(m) => m,
            r => panic!("Unexpected parse result: {r:?}"),
        };

        let decoded = metadata.get_manifest(&data).unwrap();
        assert_eq!(decoded, manifest);

        // The manifest accessor must notice a truncated buffer.
        assert_matches!(
            metadata.get_manifest(&data[..data.len() - 1]),
            Err(Error::Truncated),
        );
    }
}
