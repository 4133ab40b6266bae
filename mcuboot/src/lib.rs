//! MCUboot image decoding and local verification
//!
//! Decodes the fixed image header and the TLV trailer of an MCUboot image
//! and checks the SHA-256 TLV against the hash of the header, the body and
//! the protected TLV area. Signature TLVs are skipped: only the hash is
//! verified here.
//!
//! The digest produced by [verify] is the one `mcumgr image confirm`
//! expects.

pub use tlv::*;

mod tlv;

use std::{fmt, fs, path::Path};

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const IMAGE_MAGIC: u32 = 0x96f3b83d;
pub const IMAGE_HEADER_SIZE: usize = 32;

pub const TLV_INFO_MAGIC: u16 = 0x6907;
pub const TLV_PROT_INFO_MAGIC: u16 = 0x6908;
pub const TLV_INFO_SIZE: usize = 4;
pub const TLV_SIZE: usize = 4;

pub const TLV_SHA256: u16 = 0x10;
pub const SHA256_DIGEST_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("bad image magic 0x{0:08x}")]
    InvalidMagic(u32),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build: u32,
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}+{}",
            self.major, self.minor, self.revision, self.build
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub load_address: u32,
    pub header_size: u16,
    pub protected_tlv_size: u16,
    pub image_size: u32,
    pub flags: u32,
    pub version: ImageVersion,
}

impl ImageHeader {
    pub fn decode(data: &[u8]) -> Result<ImageHeader, ImageError> {
        if data.len() < IMAGE_HEADER_SIZE {
            return Err(ImageError::Truncated {
                needed: IMAGE_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let magic = extract_u32(data, 0);
        if magic != IMAGE_MAGIC {
            return Err(ImageError::InvalidMagic(magic));
        }

        Ok(ImageHeader {
            load_address: extract_u32(data, 4),
            header_size: extract_u16(data, 8),
            protected_tlv_size: extract_u16(data, 10),
            image_size: extract_u32(data, 12),
            flags: extract_u32(data, 16),
            version: ImageVersion {
                major: data[20],
                minor: data[21],
                revision: extract_u16(data, 22),
                build: extract_u32(data, 24),
            },
        })
    }

    /// Offset of the first TLV info header (protected or not).
    pub fn tlv_offset(&self) -> usize {
        self.header_size as usize + self.image_size as usize
    }
}

/// Outcome of a local image check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyResult {
    Ok,
    InvalidMagic,
    InvalidTlvInfoMagic,
    InvalidHash,
    MissingHash,
    Truncated,
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerifyResult::Ok => "OK",
            VerifyResult::InvalidMagic => "INVALID_MAGIC",
            VerifyResult::InvalidTlvInfoMagic => "INVALID_TLV_INFO_MAGIC",
            VerifyResult::InvalidHash => "INVALID_HASH",
            VerifyResult::MissingHash => "MISSING_HASH",
            VerifyResult::Truncated => "TRUNCATED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct Verification {
    pub result: VerifyResult,
    pub version: Option<ImageVersion>,
    pub digest: Option<[u8; SHA256_DIGEST_SIZE]>,
}

impl Verification {
    fn failed(result: VerifyResult) -> Self {
        Verification {
            result,
            version: None,
            digest: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == VerifyResult::Ok
    }

    /// Lower-case hex form of the digest, as `mcumgr` takes it.
    pub fn digest_hex(&self) -> Option<String> {
        self.digest
            .map(|d| d.iter().map(|b| format!("{b:02x}")).collect())
    }
}

/// Verify the SHA-256 TLV of an in-memory image.
pub fn verify(data: &[u8]) -> Verification {
    let header = match ImageHeader::decode(data) {
        Ok(header) => header,
        Err(ImageError::InvalidMagic(_)) => {
            return Verification::failed(VerifyResult::InvalidMagic);
        }
        Err(_) => return Verification::failed(VerifyResult::Truncated),
    };

    let area = match TlvArea::locate(data, &header) {
        Ok(area) => area,
        Err(result) => return Verification::failed(result),
    };

    for tlv in area.iter(data) {
        if tlv.kind != TLV_SHA256 {
            continue;
        }
        let digest: [u8; SHA256_DIGEST_SIZE] =
            Sha256::digest(&data[..area.hashed_len()]).into();
        if tlv.payload != digest {
            return Verification::failed(VerifyResult::InvalidHash);
        }
        return Verification {
            result: VerifyResult::Ok,
            version: Some(header.version),
            digest: Some(digest),
        };
    }

    Verification::failed(VerifyResult::MissingHash)
}

pub fn verify_file<P: AsRef<Path>>(path: P) -> Result<Verification, ImageError> {
    let data = fs::read(path)?;
    Ok(verify(&data))
}

pub(crate) fn extract_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn extract_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
