//! Forward error correction: block framing, the block decoder seam, and
//! the reader that restores lost source packets from repair packets.

pub mod block_reader;
pub mod decoder;
pub mod framing;

pub use block_reader::{BlockReader, BlockReaderConfig};
pub use decoder::{BlockDecoder, XorDecoder};
pub use framing::FecScheme;
