//! Download engine.
//!
//! Peers are tried in metainfo order over blocking sockets. A peer that
//! cannot be reached or that breaks the protocol is abandoned in favour of
//! the next one; a peer that serves a block failing verification only loses
//! that block, not the connection.

use std::io::{self, ErrorKind};
use std::net::{SocketAddrV4, TcpStream};

use crate::error::{Error, Result};
use crate::message::{Message, RAW_MESSAGE_SIZE};
use crate::torrent::Torrent;
use crate::utils;

/// Fetches every missing block of `torrent` from its peers. Returns once the
/// file is complete or the peer list is exhausted; only metainfo or data
/// file faults are errors.
pub fn download(torrent: &mut Torrent) -> Result<()> {
    if torrent.file_size() == 0 {
        log::info!("nothing to download, file size is 0");
        return Ok(());
    }
    if torrent.is_complete() {
        log::info!("file is already complete");
        return Ok(());
    }

    let peers = torrent.peers().to_vec();
    for peer in peers {
        log::debug!("connecting to {peer}");
        let mut stream = match TcpStream::connect(peer) {
            Ok(stream) => stream,
            Err(e) => {
                log::info!("connection to {peer} failed ({e}), trying next peer");
                continue;
            }
        };
        log::debug!("connected to {peer}");
        handle_connection(torrent, &mut stream, peer)?;
        if torrent.is_complete() {
            log::info!("file is complete");
            return Ok(());
        }
    }
    log::info!(
        "peer list exhausted, {}/{} blocks present",
        torrent.block_map().count_set(),
        torrent.block_count()
    );
    Ok(())
}

/// Requests every still-missing block over one connection, in ascending
/// index order. Peer faults end the session and are not errors; storage
/// faults other than a failed verification propagate.
fn handle_connection(
    torrent: &mut Torrent,
    stream: &mut TcpStream,
    peer: SocketAddrV4,
) -> Result<()> {
    for block_number in 0..torrent.block_count() {
        if torrent.has_block(block_number) {
            continue;
        }

        let size = torrent.block_size(block_number);
        let data = match request_block(stream, block_number, size) {
            Ok(data) => data,
            Err(e) => {
                log::info!("peer {peer}: {e}, trying next peer");
                return Ok(());
            }
        };

        match torrent.store_block(block_number, &data) {
            Ok(()) => log::debug!("stored block {block_number}"),
            Err(Error::InvalidBlock(n)) => {
                log::info!("block {n} failed verification, requesting the next block");
            }
            Err(e) => return Err(e),
        }
        if torrent.is_complete() {
            break;
        }
    }
    Ok(())
}

/// One request/response round-trip: sends a request for `block_number` and
/// reads back the header and, on success, `size` payload bytes.
fn request_block(stream: &mut TcpStream, block_number: u64, size: u64) -> io::Result<Vec<u8>> {
    log::info!("requesting block {block_number}");
    utils::send_all(stream, &Message::Request(block_number).serialize())?;

    let mut header = [0u8; RAW_MESSAGE_SIZE];
    if utils::recv_all(stream, &mut header)? == 0 {
        return Err(connection_closed());
    }
    match Message::deserialize(&header)? {
        Message::ResponseOk(n) if n == block_number => {}
        other => {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("got {other:?} in response to a request for block {block_number}"),
            ));
        }
    }

    let mut data = vec![0u8; size as usize];
    if utils::recv_all(stream, &mut data)? == 0 {
        return Err(connection_closed());
    }
    Ok(data)
}

fn connection_closed() -> io::Error {
    io::Error::new(ErrorKind::UnexpectedEof, "peer closed the connection")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server;
    use crate::BLOCK_SIZE;
    use std::fs;
    use std::net::TcpListener;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    const HASH_100_A: &str = "2816597888e4a0d3a36b82b83316ab32680eb8f00f8cd3b904d681246d285a0e";
    const HASH_BLOCK_X: &str = "1f8745f0d2d1387ec1af2211a3cf417b2e9e885e853472649c1d979d0e9370e3";
    const HASH_Y: &str = "a1fce4363854ff888cff4b8e7875d600c2682390412a8cf79b37d0b11148b0fa";
    const HASH_EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn wait_for_port(port: u16) {
        for _ in 0..100 {
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("server did not come up on port {port}");
    }

    fn start_server(dir: &Path, port: u16, content: &[u8], document: &str) {
        let metainfo = dir.join("seed.ttorrent");
        fs::write(&metainfo, document).unwrap();
        let data = dir.join("seed");
        fs::write(&data, content).unwrap();
        let mut seed = Torrent::open_with_file(&metainfo, &data).unwrap();
        assert!(seed.is_complete());
        thread::spawn(move || {
            let _ = server::serve(&mut seed, port);
        });
        wait_for_port(port);
    }

    fn open_empty_copy(dir: &Path, document: &str) -> Torrent {
        let metainfo = dir.join("copy.ttorrent");
        fs::write(&metainfo, document).unwrap();
        Torrent::open_with_file(&metainfo, &dir.join("copy")).unwrap()
    }

    #[test]
    fn test_download_single_block() {
        let dir = tempfile::tempdir().unwrap();
        let document =
            format!("{HASH_100_A}\n100\n1\n{HASH_100_A}\n127.0.0.1:17401\n");
        start_server(dir.path(), 17401, &[b'a'; 100], &document);

        let mut torrent = open_empty_copy(dir.path(), &document);
        assert!(!torrent.is_complete());
        download(&mut torrent).unwrap();
        assert!(torrent.is_complete());
        assert_eq!(fs::read(dir.path().join("copy")).unwrap(), vec![b'a'; 100]);
    }

    #[test]
    fn test_skips_unreachable_peer() {
        let dir = tempfile::tempdir().unwrap();
        let seed_document =
            format!("{HASH_100_A}\n100\n1\n{HASH_100_A}\n127.0.0.1:17402\n");
        start_server(dir.path(), 17402, &[b'a'; 100], &seed_document);

        // nobody listens on the first peer's port
        let document =
            format!("{HASH_100_A}\n100\n2\n{HASH_100_A}\n127.0.0.1:17999\n127.0.0.1:17402\n");
        let mut torrent = open_empty_copy(dir.path(), &document);
        download(&mut torrent).unwrap();
        assert!(torrent.is_complete());
    }

    #[test]
    fn test_nothing_to_download() {
        let dir = tempfile::tempdir().unwrap();
        let document = format!("{HASH_EMPTY}\n0\n1\n127.0.0.1:17999\n");
        let mut torrent = open_empty_copy(dir.path(), &document);
        download(&mut torrent).unwrap();
        assert!(torrent.is_complete());
        assert_eq!(fs::metadata(dir.path().join("copy")).unwrap().len(), 0);
    }

    #[test]
    fn test_already_complete_without_peers_listening() {
        let dir = tempfile::tempdir().unwrap();
        let document = format!("{HASH_100_A}\n100\n1\n{HASH_100_A}\n127.0.0.1:17999\n");
        let metainfo = dir.path().join("copy.ttorrent");
        fs::write(&metainfo, &document).unwrap();
        fs::write(dir.path().join("copy"), [b'a'; 100]).unwrap();
        let mut torrent =
            Torrent::open_with_file(&metainfo, &dir.path().join("copy")).unwrap();
        download(&mut torrent).unwrap();
        assert!(torrent.is_complete());
    }

    #[test]
    fn test_lying_peer_keeps_the_connection() {
        // the peer answers block 0 with bytes that do not hash to the
        // expected digest and block 1 honestly
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let responder = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; RAW_MESSAGE_SIZE];
            utils::recv_all(&mut stream, &mut header).unwrap();
            assert_eq!(Message::deserialize(&header).unwrap(), Message::Request(0));
            let mut frame = Message::ResponseOk(0).serialize().to_vec();
            frame.extend_from_slice(&vec![b'w'; BLOCK_SIZE]);
            utils::send_all(&mut stream, &frame).unwrap();

            utils::recv_all(&mut stream, &mut header).unwrap();
            assert_eq!(Message::deserialize(&header).unwrap(), Message::Request(1));
            let mut frame = Message::ResponseOk(1).serialize().to_vec();
            frame.push(b'y');
            utils::send_all(&mut stream, &frame).unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let document = format!(
            "8eb0d57cc018f433102fb7415b365a68955d379b046a1b462005e8a71730ce4a\n\
             65537\n1\n{HASH_BLOCK_X}\n{HASH_Y}\n127.0.0.1:{port}\n"
        );
        let mut torrent = open_empty_copy(dir.path(), &document);
        download(&mut torrent).unwrap();
        responder.join().unwrap();

        assert!(!torrent.has_block(0));
        assert!(torrent.has_block(1));
        assert!(!torrent.is_complete());
        let on_disk = fs::read(dir.path().join("copy")).unwrap();
        assert_eq!(on_disk[BLOCK_SIZE], b'y');
        // the lie never reached the file
        assert_eq!(on_disk[..BLOCK_SIZE], vec![0u8; BLOCK_SIZE][..]);
    }

    #[test]
    fn test_response_na_abandons_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let responder = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; RAW_MESSAGE_SIZE];
            utils::recv_all(&mut stream, &mut header).unwrap();
            assert_eq!(Message::deserialize(&header).unwrap(), Message::Request(0));
            utils::send_all(&mut stream, &Message::ResponseNa(0).serialize()).unwrap();
            // the client must give up on us instead of asking for block 1
            assert_eq!(utils::recv_all(&mut stream, &mut header).unwrap(), 0);
        });

        let dir = tempfile::tempdir().unwrap();
        let document = format!(
            "8eb0d57cc018f433102fb7415b365a68955d379b046a1b462005e8a71730ce4a\n\
             65537\n1\n{HASH_BLOCK_X}\n{HASH_Y}\n127.0.0.1:{port}\n"
        );
        let mut torrent = open_empty_copy(dir.path(), &document);
        download(&mut torrent).unwrap();
        responder.join().unwrap();
        assert!(!torrent.has_block(0));
        assert!(!torrent.has_block(1));
    }
}
