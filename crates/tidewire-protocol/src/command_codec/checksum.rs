//! CRC32 trailer for datagram integrity.

use crc32fast::Hasher;

use tidewire_core::error::{ErrorKind, Result};

/// Size of the checksum trailer.
pub const CHECKSUM_SIZE: usize = 4;

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Appends a CRC32 of the buffer's current contents to the buffer.
pub fn append_checksum_in_place(data: &mut Vec<u8>) {
    let checksum = crc32(data);
    data.extend_from_slice(&checksum.to_be_bytes());
}

/// Validates the trailing CRC32 and returns the length of the data before it.
pub fn validate_checksum(data: &[u8]) -> Result<usize> {
    if data.len() < CHECKSUM_SIZE {
        return Err(ErrorKind::ChecksumMismatch);
    }

    let (payload, trailer) = data.split_at(data.len() - CHECKSUM_SIZE);
    let received = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32(payload);

    if received != computed {
        tracing::debug!(received, computed, "datagram checksum mismatch");
        return Err(ErrorKind::ChecksumMismatch);
    }

    Ok(payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_append_and_validate() {
        let mut buffer = b"Hello, world!".to_vec();
        append_checksum_in_place(&mut buffer);
        assert_eq!(buffer.len(), 13 + CHECKSUM_SIZE);
        assert_eq!(validate_checksum(&buffer).unwrap(), 13);
    }

    #[test]
    fn test_checksum_validation_fails_on_corruption() {
        let mut buffer = b"Hello, world!".to_vec();
        append_checksum_in_place(&mut buffer);
        buffer[3] ^= 0x01;
        assert!(matches!(validate_checksum(&buffer), Err(ErrorKind::ChecksumMismatch)));
    }

    #[test]
    fn test_checksum_rejects_short_data() {
        assert!(validate_checksum(b"Hi").is_err());
    }

    #[test]
    fn test_checksum_with_empty_data() {
        let mut buffer = Vec::new();
        append_checksum_in_place(&mut buffer);
        assert_eq!(validate_checksum(&buffer).unwrap(), 0);
    }
}
