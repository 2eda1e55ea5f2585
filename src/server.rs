//! Serve engine.
//!
//! A single thread multiplexes the listener and every client socket through
//! a readiness poll with an unbounded timeout. Each client starts with read
//! interest; once its 13-byte request has been buffered the interest flips
//! to write, and flips back after the response has been sent. No client can
//! stall the loop: all sockets are non-blocking and a client that errors is
//! dropped on the spot.

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use crate::error::{Error, Result};
use crate::message::{Message, RAW_MESSAGE_SIZE};
use crate::torrent::Torrent;
use crate::utils;

/// Token reserved for the listening socket.
const LISTENER: Token = Token(0);

/// Per-client state: the socket and the last request header received from
/// it, kept until the socket becomes writable.
struct Connection {
    token: Token,
    stream: TcpStream,
    addr: SocketAddr,
    pending: Option<[u8; RAW_MESSAGE_SIZE]>,
}

/// Listens on `port` and serves blocks of `torrent` until the process is
/// terminated. Only a poll failure, a listener failure or a broken internal
/// invariant makes this function return.
pub fn serve(torrent: &mut Torrent, port: u16) -> Result<()> {
    if torrent.file_size() == 0 {
        log::info!("nothing to serve, file size is 0");
        return Ok(());
    }

    let mut listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;
    let mut events = Events::with_capacity(128);
    let mut connections: Vec<Connection> = Vec::with_capacity(4);
    let mut next_token = 1;
    log::info!("listening on port {port}");

    loop {
        poll.poll(&mut events, None)?;
        let registry = poll.registry();
        for event in events.iter() {
            let token = event.token();
            if token == LISTENER {
                accept_clients(&mut listener, registry, &mut connections, &mut next_token);
            } else if event.is_readable() {
                handle_readable(registry, &mut connections, token)?;
            } else if event.is_writable() {
                handle_writable(registry, &mut connections, torrent, token)?;
            }
        }
    }
}

/// Accepts every pending connection, registering each new socket for read
/// interest. Accept errors only cost the one connection.
fn accept_clients(
    listener: &mut TcpListener,
    registry: &Registry,
    connections: &mut Vec<Connection>,
    next_token: &mut usize,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                let token = Token(*next_token);
                *next_token += 1;
                if let Err(e) = registry.register(&mut stream, token, Interest::READABLE) {
                    log::info!("cannot register client {addr} ({e}), ignoring connection");
                    continue;
                }
                log::info!("got a connection from {addr}");
                connections.push(Connection {
                    token,
                    stream,
                    addr,
                    pending: None,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::info!("error while accepting a connection ({e}), ignoring connection");
            }
        }
    }
}

/// Reads one request header from a readable client and re-arms the socket
/// for writing. End-of-stream and read errors both remove the client.
fn handle_readable(
    registry: &Registry,
    connections: &mut Vec<Connection>,
    token: Token,
) -> Result<()> {
    let connection = find_connection(connections, token)
        .ok_or_else(|| invariant_violated("readable dispatch", token))?;

    let mut header = [0u8; RAW_MESSAGE_SIZE];
    let drop_reason = match utils::recv_all(&mut connection.stream, &mut header) {
        Ok(0) => Some(format!("connection closed by {}", connection.addr)),
        Ok(_) => {
            log::debug!("got a request from {}", connection.addr);
            match registry.reregister(&mut connection.stream, token, Interest::WRITABLE) {
                Ok(()) => {
                    connection.pending = Some(header);
                    None
                }
                Err(e) => Some(format!(
                    "cannot re-arm {} for writing ({e})",
                    connection.addr
                )),
            }
        }
        Err(e) => Some(format!("error while reading from {} ({e})", connection.addr)),
    };

    match drop_reason {
        Some(reason) => {
            log::info!("{reason}, dropping client");
            remove_client(registry, connections, token)
        }
        None => Ok(()),
    }
}

/// Answers the buffered request of a writable client and re-arms the socket
/// for reading. An invalid request or a failure to respond drops the client.
fn handle_writable(
    registry: &Registry,
    connections: &mut Vec<Connection>,
    torrent: &mut Torrent,
    token: Token,
) -> Result<()> {
    let (header, addr) = {
        let connection = find_connection(connections, token)
            .ok_or_else(|| invariant_violated("writable dispatch", token))?;
        let header = connection
            .pending
            .take()
            .ok_or_else(|| invariant_violated("writable socket with no buffered request", token))?;
        (header, connection.addr)
    };

    let block_number = match Message::deserialize(&header) {
        Ok(Message::Request(block_number)) if block_number < torrent.block_count() => {
            block_number
        }
        Ok(other) => {
            log::info!("unexpected {other:?} from {addr}, dropping client");
            return remove_client(registry, connections, token);
        }
        Err(e) => {
            log::info!("malformed request from {addr} ({e}), dropping client");
            return remove_client(registry, connections, token);
        }
    };

    let frame = if torrent.has_block(block_number) {
        let data = match torrent.load_block(block_number) {
            Ok(data) => data,
            Err(e) => {
                log::info!("cannot load block {block_number} ({e}), dropping client");
                return remove_client(registry, connections, token);
            }
        };
        log::info!("sending block {block_number} to {addr}");
        let mut frame = Vec::with_capacity(RAW_MESSAGE_SIZE + data.len());
        frame.extend_from_slice(&Message::ResponseOk(block_number).serialize());
        frame.extend_from_slice(&data);
        frame
    } else {
        log::info!("block {block_number} is not here, sending RESPONSE_NA to {addr}");
        Message::ResponseNa(block_number).serialize().to_vec()
    };

    let connection = find_connection(connections, token)
        .ok_or_else(|| invariant_violated("response dispatch", token))?;
    match utils::send_all(&mut connection.stream, &frame) {
        Ok(()) => {
            log::debug!("response for block {block_number} sent to {addr}");
            if let Err(e) =
                registry.reregister(&mut connection.stream, token, Interest::READABLE)
            {
                log::info!("cannot re-arm {addr} for reading ({e}), dropping client");
                return remove_client(registry, connections, token);
            }
            Ok(())
        }
        Err(e) => {
            log::info!("error while sending to {addr} ({e}), dropping client");
            remove_client(registry, connections, token)
        }
    }
}

fn find_connection(connections: &mut [Connection], token: Token) -> Option<&mut Connection> {
    connections.iter_mut().find(|c| c.token == token)
}

/// Deregisters and closes a client socket and forgets its state. A token
/// with no table entry means the loop's bookkeeping is broken.
fn remove_client(
    registry: &Registry,
    connections: &mut Vec<Connection>,
    token: Token,
) -> Result<()> {
    let position = connections
        .iter()
        .position(|c| c.token == token)
        .ok_or_else(|| invariant_violated("client removal", token))?;
    let mut connection = connections.remove(position);
    if let Err(e) = registry.deregister(&mut connection.stream) {
        log::debug!("could not deregister {} ({e})", connection.addr);
    }
    log::debug!("removed client {}", connection.addr);
    Ok(())
}

fn invariant_violated(site: &str, token: Token) -> Error {
    Error::Internal(format!("server.rs, {site} (socket token {})", token.0))
}
