//! Checksums over checkpoint files
//!
//! A checkpoint body carries a CRC32C that is checked when the file is
//! read back. Whole files are compared across replicas by their xxHash64.

use crate::error::{Error, Result};

/// CRC32C stored in a checkpoint header
#[must_use]
pub fn body_crc(body: &[u8]) -> u32 {
    crc32c::crc32c(body)
}

/// Check `body` against the CRC32C recorded for it
pub fn verify_body(body: &[u8], expected: u32) -> Result<()> {
    let actual = body_crc(body);
    if actual != expected {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// xxHash64 of a whole file
#[must_use]
pub fn fingerprint(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, 0)
}
