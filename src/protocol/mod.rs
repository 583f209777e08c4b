//! Protocol module - Defines the loopwire wire protocol
//!
//! Every frame on the wire is:
//! - 1 byte protocol version
//! - 1 byte opcode (packet type)
//! - 4 bytes payload length (big-endian, signed)
//! - Tagged field values in schema order

mod buffer;
mod codec;
mod packet;

pub use buffer::*;
pub use codec::*;
pub use packet::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port for TCP loopback servers
pub const DEFAULT_PORT: u16 = 4862;

/// Metadata header: version(1) + opcode(1) + length(4)
pub const HEADER_SIZE: usize = 6;

/// Header of the legacy short form used by zero-field packets: version(1) + opcode(1)
pub const LEGACY_HEADER_SIZE: usize = 2;

/// Maximum payload size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Platform identifier advertised in DISCOVERY_CONFIRM replies
pub const DEFAULT_PLATFORM: &str = "rust-tokio";
