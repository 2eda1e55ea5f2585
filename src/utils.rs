use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Extension carried by metainfo documents.
pub const METAINFO_EXTENSION: &str = ".ttorrent";

/// Writes the whole buffer, retrying until every byte has been handed to the
/// socket. A sink that stops accepting data is reported as `WriteZero`;
/// `WouldBlock` on a non-blocking socket propagates to the caller.
pub fn send_all<W: Write>(stream: &mut W, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match stream.write(&buf[sent..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting data",
                ));
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads exactly `buf.len()` bytes, retrying over partial reads. Returns the
/// number of bytes read; 0 means end-of-stream was observed instead.
pub fn recv_all<R: Read>(stream: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut received = 0;
    while received < buf.len() {
        match stream.read(&mut buf[received..]) {
            Ok(0) => return Ok(0),
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(received)
}

/// Strips the `.ttorrent` extension to recover the downloaded file's name.
pub fn original_file_name(metainfo: &Path) -> Result<PathBuf> {
    let name = metainfo
        .to_str()
        .ok_or_else(|| Error::BadMetainfo("metainfo path is not valid UTF-8".to_string()))?;
    match name.strip_suffix(METAINFO_EXTENSION) {
        Some(stem) if !stem.is_empty() => Ok(PathBuf::from(stem)),
        _ => Err(Error::BadMetainfo(format!(
            "`{name}` does not end in {METAINFO_EXTENSION}"
        ))),
    }
}

/// Appends the `.ttorrent` extension to a file name.
pub fn metainfo_file_name(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(METAINFO_EXTENSION);
    PathBuf::from(name)
}
