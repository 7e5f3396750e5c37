//! Player identity encoding and self-verification.
//!
//! # Identity Structure
//! A client identity (`uuid`) is the base64 encoding of 16 bytes:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │ random id (8 bytes)          │ CRC32 of the id, big-endian  │
//! │                              │ u64 (8 bytes)                │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! A uuid whose trailing checksum does not match its leading bytes came
//! from a corrupted or hostile client. The secondary signature (`usid`)
//! is opaque and only compared for equality.

use base64::{engine::general_purpose, Engine as _};

/// Decoded identity length in bytes.
pub const IDENTITY_LEN: usize = 16;

/// Computes the checksum stored in the trailing half of an identity.
pub fn identity_checksum(id: &[u8; 8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(id);
    hasher.finalize() as u64
}

/// Encodes raw id bytes into a self-verifying uuid string.
pub fn encode_identity(id: [u8; 8]) -> String {
    let mut raw = [0u8; IDENTITY_LEN];
    raw[..8].copy_from_slice(&id);
    raw[8..].copy_from_slice(&identity_checksum(&id).to_be_bytes());
    general_purpose::STANDARD.encode(raw)
}

/// Returns true if `uuid` decodes to 16 bytes whose embedded checksum matches.
pub fn verify_identity(uuid: &str) -> bool {
    let Ok(raw) = general_purpose::STANDARD.decode(uuid) else {
        return false;
    };
    if raw.len() != IDENTITY_LEN {
        return false;
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&raw[..8]);
    let mut sum = [0u8; 8];
    sum.copy_from_slice(&raw[8..]);
    identity_checksum(&id) == u64::from_be_bytes(sum)
}
