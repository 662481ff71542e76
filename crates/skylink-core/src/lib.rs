//! Skylink Core - Frame codec, error taxonomy, path jail and configuration
//!
//! This crate contains the foundational pieces of the Skylink file-transfer
//! protocol. It has no dependencies on networking or async runtimes: frames
//! are plain byte buffers handed to whatever transport carries them.

pub mod config;
pub mod crc;
pub mod error;
pub mod path;
pub mod protocol;
pub mod types;

pub use config::{ClientConfig, Config, ConfigError, LinkConfig, ServerConfig};
pub use crc::{file_crc32, Crc32};
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Size of the fixed frame header in bytes
pub const HEADER_LEN: usize = 12;

/// Maximum payload bytes carried by one frame
pub const MAX_DATA_LEN: usize = 239;

/// Maximum encoded frame length (header + payload)
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_DATA_LEN;

/// Maximum protocol path length in bytes (must fit in one payload)
pub const MAX_PATH_LEN: usize = MAX_DATA_LEN;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;
