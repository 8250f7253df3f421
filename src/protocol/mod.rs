//! The Janus wire protocol
//!
//! Every message on the wire is a frame: a 16-byte header
//! (`MAGIC ‖ TYPE:u32 ‖ BODY_LEN:u64`, all big-endian) followed by a
//! type-specific body. The message registry is the [`MessageType`] enum;
//! the compiler enforces that every registered type has a codec.

pub mod message;
pub mod pool;

pub use message::{Message, MessageType};

/// Frame magic, first four bytes of every message
pub const MAGIC: [u8; 4] = *b"jANu";

/// Frame header size in bytes
pub const HEADER_LEN: usize = 16;

/// Upper bound on a message body; larger declared lengths abort the connection
pub const MAX_BODY_LEN: u64 = 1 << 30;

/// The only protocol version this implementation speaks
pub const PROTOCOL_VERSION: u64 = 1;

/// Payload ceiling for a single DataBlock
pub const DATA_BLOCK_SIZE: usize = 2 * 1024 * 1024;

// vim: ts=4
