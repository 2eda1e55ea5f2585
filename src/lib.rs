pub mod bitfield;
pub mod client;
pub mod error;
pub mod message;
pub mod metainfo;
pub mod server;
pub mod storage;
pub mod torrent;
pub mod utils;

/// The maximum size of a block. Every block except possibly the last one has
/// exactly this size.
pub const BLOCK_SIZE: usize = 0x10000;
