//! Command serialization and deserialization.
//!
//! # Module Organization
//!
//! - [`header`] - datagram header (peer id, session, sent time)
//! - [`encoder`] - command encoding to binary format
//! - [`decoder`] - command decoding and the per-datagram [`CommandReader`]
//! - [`checksum`] - optional CRC32 trailer

pub mod checksum;
pub mod decoder;
pub mod encoder;
pub mod header;

#[cfg(test)]
mod tests;

pub use checksum::{append_checksum_in_place, validate_checksum, CHECKSUM_SIZE};
pub use decoder::{CommandDecoder, CommandReader};
pub use encoder::CommandEncoder;
pub use header::{DatagramHeader, MAXIMUM_HEADER_SIZE};
