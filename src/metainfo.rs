//! Metainfo codec.
//!
//! A metainfo document is line-oriented text: a whole-file SHA-256, the file
//! size, a peer count, one hash per block and one `host:port` line per peer,
//! with `#` comment lines allowed anywhere between records. Peers are
//! resolved to IPv4 addresses while parsing.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::utils;
use crate::BLOCK_SIZE;

/// Number of peers written into a created metainfo document.
const CREATED_PEER_COUNT: u16 = 20;

/// First port of the created peer range.
const CREATED_PEER_PORT: u16 = 8080;

/// Longest line a metainfo document may contain.
const MAX_LINE_LEN: usize = 1023;

#[derive(Debug)]
pub struct Metainfo {
    /// SHA-256 of the whole downloaded file. Currently informational.
    pub file_hash: [u8; 32],
    /// The size, in bytes, of the downloaded file.
    pub file_size: u64,
    /// Expected SHA-256 of each block of the downloaded file.
    pub block_hashes: Vec<[u8; 32]>,
    /// The peers serving this file, in document order.
    pub peers: Vec<SocketAddrV4>,
}

impl Metainfo {
    pub fn load(path: &Path) -> Result<Metainfo> {
        log::debug!("loading metainfo file {}", path.display());
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Metainfo> {
        let mut records = Records::new(reader);

        let file_hash = parse_hash(&records.next_record()?)?;
        let file_size = parse_number(&records.next_record()?, "file size")?;
        let peer_count = parse_number(&records.next_record()?, "peer count")?;
        if !(1..=0xffff).contains(&peer_count) {
            return Err(Error::BadMetainfo(format!(
                "peer count {peer_count} is out of range"
            )));
        }

        let block_count = file_size.div_ceil(BLOCK_SIZE as u64);
        if block_count > u64::MAX / BLOCK_SIZE as u64 {
            return Err(Error::BadMetainfo(
                "file size overflows the block address space".to_string(),
            ));
        }
        log::debug!("file size {file_size}, {block_count} blocks, {peer_count} peers");

        let mut block_hashes = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            block_hashes.push(parse_hash(&records.next_record()?)?);
        }

        let mut peers = Vec::with_capacity(peer_count as usize);
        for _ in 0..peer_count {
            peers.push(parse_peer(&records.next_record()?)?);
        }

        Ok(Metainfo {
            file_hash,
            file_size,
            block_hashes,
            peers,
        })
    }

    pub fn block_count(&self) -> u64 {
        self.block_hashes.len() as u64
    }
}

/// Iterates the records of a metainfo document, skipping comments and blank
/// lines and rejecting overlong ones.
struct Records<R> {
    lines: io::Lines<R>,
}

impl<R: BufRead> Records<R> {
    fn new(reader: R) -> Records<R> {
        Records {
            lines: reader.lines(),
        }
    }

    fn next_record(&mut self) -> Result<String> {
        for line in &mut self.lines {
            let line = line?;
            if line.len() > MAX_LINE_LEN {
                return Err(Error::BadMetainfo(format!(
                    "line exceeds {MAX_LINE_LEN} bytes"
                )));
            }
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            return Ok(line.to_string());
        }
        Err(Error::BadMetainfo("unexpected end of document".to_string()))
    }
}

fn parse_hash(record: &str) -> Result<[u8; 32]> {
    if record.len() != 64 {
        return Err(Error::BadMetainfo(format!(
            "expected 64 hex characters, got {}",
            record.len()
        )));
    }
    let bytes = hex::decode(record)
        .map_err(|e| Error::BadMetainfo(format!("malformed hash `{record}`: {e}")))?;
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

fn parse_number(record: &str, what: &str) -> Result<u64> {
    record
        .parse()
        .map_err(|_| Error::BadMetainfo(format!("invalid {what} `{record}`")))
}

/// Splits a `host:port` record at the right-most colon and resolves the host
/// to an IPv4 address.
fn parse_peer(record: &str) -> Result<SocketAddrV4> {
    let (host, port) = record
        .rsplit_once(':')
        .ok_or_else(|| Error::BadMetainfo(format!("peer `{record}` is missing a port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::BadMetainfo(format!("peer `{record}` has an invalid port")))?;
    log::debug!("resolving {host} {port}");
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::BadMetainfo(format!("cannot resolve peer `{record}`: {e}")))?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::BadMetainfo(format!("peer `{record}` has no IPv4 address")))
}

/// Computes the whole-file and per-block hashes of `file_name`, streaming in
/// block-sized chunks, and writes the companion `.ttorrent` document next to
/// it. Returns the path of the created document.
pub fn create(file_name: &Path) -> Result<PathBuf> {
    log::debug!("creating metainfo for {}", file_name.display());
    let mut file = File::open(file_name)?;
    let file_size = file.metadata()?.len();

    let mut whole_file = Sha256::new();
    let mut block_hashes: Vec<[u8; 32]> = Vec::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let read = read_chunk(&mut file, &mut buf)?;
        if read == 0 {
            break;
        }
        whole_file.update(&buf[..read]);
        block_hashes.push(Sha256::digest(&buf[..read]).into());
        log::debug!("hashed block {} ({read} bytes)", block_hashes.len() - 1);
        if read < BLOCK_SIZE {
            break;
        }
    }
    let file_hash: [u8; 32] = whole_file.finalize().into();
    log::debug!(
        "file hash is {}, {} blocks",
        hex::encode(file_hash),
        block_hashes.len()
    );

    let metainfo_name = utils::metainfo_file_name(file_name);
    let out = File::create(&metainfo_name)?;
    let mut out = BufWriter::new(out);
    writeln!(out, "#SHA-256 of the file is")?;
    writeln!(out, "{}", hex::encode(file_hash))?;
    writeln!(out, "#Size")?;
    writeln!(out, "{file_size}")?;
    writeln!(out, "#Peer count is")?;
    writeln!(out, "{CREATED_PEER_COUNT}")?;
    writeln!(out, "#SHA-256, number of blocks is {}", block_hashes.len())?;
    for hash in &block_hashes {
        writeln!(out, "{}", hex::encode(hash))?;
    }
    writeln!(out, "#Peers")?;
    for i in 0..CREATED_PEER_COUNT {
        writeln!(out, "localhost:{}", CREATED_PEER_PORT + i)?;
    }
    out.flush()?;
    Ok(metainfo_name)
}

/// Reads up to `buf.len()` bytes, stopping early only at end-of-file.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
