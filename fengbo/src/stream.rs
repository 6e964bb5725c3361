// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Error;

/// Duplex socket connection to one peer.
#[derive(Debug)]
pub struct Stream {
    tcp_stream: TcpStream,
}

impl Stream {
    #[must_use]
    pub fn new(tcp_stream: TcpStream) -> Self {
        Self { tcp_stream }
    }

    /// Read available bytes from stream into `buf`.
    ///
    /// Returns the number of bytes read; zero means the peer closed the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns error if the socket gets an error.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
        Ok(self.tcp_stream.read_buf(buf).await?)
    }

    /// Write the whole buffer to stream.
    ///
    /// # Errors
    ///
    /// Returns error if the socket gets an error.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.tcp_stream.write_all(buf).await?;
        Ok(buf.len())
    }
}
