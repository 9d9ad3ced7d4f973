// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! TCP transport: connect, then exchange messages framed by a two-byte
//! big-endian length prefix. A stream carries one message for an ordinary
//! query and many for a zone transfer; the caller keeps reading until the
//! transfer consumer says the stream is complete.

use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// Failures while reading one length-prefixed message.
#[derive(Debug, Error)]
pub(crate) enum TcpReadError {
    /// The length prefix announced more than the receive buffer holds.
    /// The engine treats this as fatal; it cannot grow the buffer.
    #[error("length of {length:#06X} was longer than the receive buffer ({limit} bytes)")]
    TooLong {
        /// announced length
        length: u16,
        /// buffer ceiling
        limit: usize,
    },

    /// The stream ended or failed mid-message.
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// A connected TCP dialog with one server.
pub(crate) struct TcpConn {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpConn {
    /// Connects to `dst`, optionally from a configured source address.
    /// Timeouts are the caller's business; this future runs until the
    /// kernel reports success or failure.
    pub(crate) async fn connect(dst: SocketAddr, source: Option<IpAddr>) -> io::Result<Self> {
        let stream = match source {
            None => TcpStream::connect(dst).await?,
            Some(ip) => {
                let socket = if dst.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(SocketAddr::new(ip, 0))?;
                socket.connect(dst).await?
            }
        };
        debug!("TCP connection established to: {}", dst);
        Ok(Self { stream, peer: dst })
    }

    /// The address of the peer connection.
    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one message: two length bytes, network order, then the body.
    pub(crate) async fn send_message(&mut self, bytes: &[u8]) -> io::Result<()> {
        debug_assert!(bytes.len() <= usize::from(u16::MAX));
        let len = u16::to_be_bytes(bytes.len() as u16);
        debug!("sending message len: {} to: {}", bytes.len(), self.peer);
        self.stream.write_all(&len).await?;
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Reads one message: the two length bytes, then exactly that many body
    /// bytes. A declared length above `limit` is unrecoverable.
    pub(crate) async fn read_message(&mut self, limit: usize) -> Result<Vec<u8>, TcpReadError> {
        let mut length_prefix = [0u8; 2];
        self.stream.read_exact(&mut length_prefix).await?;
        let length = u16::from_be_bytes(length_prefix);
        if usize::from(length) > limit {
            return Err(TcpReadError::TooLong { length, limit });
        }

        let mut bytes = vec![0u8; usize::from(length)];
        self.stream.read_exact(&mut bytes).await?;
        debug!("read message of {} bytes from {}", bytes.len(), self.peer);
        Ok(bytes)
    }
}
