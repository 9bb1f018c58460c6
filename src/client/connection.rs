//! Blocking TCP connection to the tuning server
//!
//! One connection per session. Inbound bytes accumulate in an owned buffer
//! and frames are decoded incrementally, so the non-blocking drain used by
//! the hybrid update mode can never split a frame: incomplete frames stay
//! buffered until more bytes arrive.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::config::ServerAddress;
use crate::utils::error::{ConnectionError, Result, TuningError};
use crate::utils::wire::Message;

const READ_CHUNK: usize = 4096;

pub(crate) struct ServerConnection {
    stream: TcpStream,
    rbuf: Vec<u8>,
    peer_closed: bool,
}

impl ServerConnection {
    pub fn connect(
        address: &ServerAddress,
        connect_timeout: Duration,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> std::result::Result<Self, ConnectionError> {
        let addr = address
            .to_string()
            .to_socket_addrs()
            .map_err(|e| ConnectionError::ConnectFailed {
                host: address.host.clone(),
                port: address.port,
                source: e,
            })?
            .next()
            .ok_or_else(|| ConnectionError::ConnectFailed {
                host: address.host.clone(),
                port: address.port,
                source: io::Error::new(io::ErrorKind::NotFound, "No addresses found"),
            })?;

        let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock {
                ConnectionError::Timeout
            } else {
                ConnectionError::ConnectFailed {
                    host: address.host.clone(),
                    port: address.port,
                    source: e,
                }
            }
        })?;

        // Protocol messages are small; do not batch them behind Nagle
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(read_timeout).ok();
        stream.set_write_timeout(write_timeout).ok();

        debug!("connected to {}", address);
        Ok(Self {
            stream,
            rbuf: Vec::with_capacity(READ_CHUNK),
            peer_closed: false,
        })
    }

    /// Encode and write one message, flushed immediately.
    pub fn send(&mut self, msg: &Message) -> std::result::Result<(), ConnectionError> {
        let bytes = msg.encode();
        self.stream.write_all(&bytes).map_err(map_io)?;
        self.stream.flush().map_err(map_io)
    }

    /// Blocking read of the next message.
    pub fn recv(&mut self) -> Result<Message> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some((msg, n)) = Message::decode_frame(&self.rbuf)? {
                self.rbuf.drain(..n);
                return Ok(msg);
            }
            if self.peer_closed {
                return Err(ConnectionError::Closed.into());
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => self.peer_closed = true,
                Ok(n) => self.rbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TuningError::Connection(map_io(e))),
            }
        }
    }

    /// Non-blocking read: returns a message only if one is already complete
    /// in the buffer or completes from bytes the kernel has ready.
    pub fn try_recv(&mut self) -> Result<Option<Message>> {
        if let Some((msg, n)) = Message::decode_frame(&self.rbuf)? {
            self.rbuf.drain(..n);
            return Ok(Some(msg));
        }
        if self.peer_closed {
            return Err(ConnectionError::Closed.into());
        }

        self.stream
            .set_nonblocking(true)
            .map_err(|e| TuningError::Connection(ConnectionError::Socket(e)))?;
        let mut fill_error = None;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => self.rbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    fill_error = Some(e);
                    break;
                }
            }
        }
        self.stream
            .set_nonblocking(false)
            .map_err(|e| TuningError::Connection(ConnectionError::Socket(e)))?;
        if let Some(e) = fill_error {
            return Err(TuningError::Connection(map_io(e)));
        }

        if let Some((msg, n)) = Message::decode_frame(&self.rbuf)? {
            self.rbuf.drain(..n);
            return Ok(Some(msg));
        }
        if self.peer_closed {
            return Err(ConnectionError::Closed.into());
        }
        Ok(None)
    }

    /// Hand the read side to a signal-mode listener: a cloned stream plus
    /// whatever inbound bytes are already buffered. After this the session
    /// only writes through the connection.
    pub fn split_reader(&mut self) -> std::result::Result<(TcpStream, Vec<u8>), ConnectionError> {
        let stream = self.stream.try_clone().map_err(ConnectionError::Socket)?;
        Ok((stream, std::mem::take(&mut self.rbuf)))
    }

    pub fn shutdown(&self) {
        self.stream.shutdown(Shutdown::Both).ok();
    }
}

fn map_io(e: io::Error) -> ConnectionError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ConnectionError::Timeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ConnectionError::Closed,
        _ => ConnectionError::Socket(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn local_address(listener: &TcpListener) -> ServerAddress {
        let addr = listener.local_addr().unwrap();
        ServerAddress {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    #[test]
    fn test_recv_reassembles_split_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = local_address(&listener);

        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let bytes = Message::Ack { code: 42 }.encode();
            // Dribble the frame one byte at a time
            for b in bytes {
                peer.write_all(&[b]).unwrap();
                peer.flush().unwrap();
            }
        });

        let mut conn = ServerConnection::connect(
            &address,
            Duration::from_secs(5),
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        let msg = conn.recv().unwrap();
        assert_eq!(msg, Message::Ack { code: 42 });
        server.join().unwrap();
    }

    #[test]
    fn test_try_recv_returns_none_when_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = local_address(&listener);

        let server = thread::spawn(move || {
            let (peer, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(200));
            drop(peer);
        });

        let mut conn = ServerConnection::connect(
            &address,
            Duration::from_secs(5),
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert!(conn.try_recv().unwrap().is_none());
        server.join().unwrap();
    }

    #[test]
    fn test_recv_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = local_address(&listener);

        let server = thread::spawn(move || {
            let (peer, _) = listener.accept().unwrap();
            drop(peer);
        });

        let mut conn = ServerConnection::connect(
            &address,
            Duration::from_secs(5),
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        server.join().unwrap();
        match conn.recv() {
            Err(TuningError::Connection(ConnectionError::Closed)) => {}
            other => panic!("expected Closed, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = local_address(&listener);
        drop(listener);

        let result = ServerConnection::connect(&address, Duration::from_secs(1), None, None);
        assert!(matches!(
            result,
            Err(ConnectionError::ConnectFailed { .. }) | Err(ConnectionError::Timeout)
        ));
    }
}
