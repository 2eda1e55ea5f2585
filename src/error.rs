use std::io;

use thiserror::Error;

/// Errors surfaced by the torrent library.
///
/// Peer-level faults (a refused connection, a protocol violation, an I/O
/// error on a peer socket) are recovered locally by the client and server
/// engines and never reach callers through this type.
#[derive(Debug, Error)]
pub enum Error {
    /// The metainfo document could not be parsed.
    #[error("bad metainfo: {0}")]
    BadMetainfo(String),

    /// A block failed SHA-256 verification on store; the data file was left
    /// untouched.
    #[error("block {0} does not match its expected hash")]
    InvalidBlock(u64),

    /// The server found its own bookkeeping in an impossible state.
    #[error("internal invariant violated at {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
