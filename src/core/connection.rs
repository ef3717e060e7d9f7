use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::proto::codec::{Decoder, Encoder};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// A framed connection to a single node.
///
/// Wraps a TCP stream and handles frame encoding and decoding. Splitting
/// the connection yields independent read and write halves, which the
/// multiplexed client uses to pipeline requests.
pub struct Connection {
    stream: TcpStream,
    decoder: Decoder,
    encoder: Encoder,
}

/// Read half of a split connection.
pub struct ConnectionReader {
    stream: OwnedReadHalf,
    decoder: Decoder,
}

/// Write half of a split connection.
pub struct ConnectionWriter {
    stream: OwnedWriteHalf,
    encoder: Encoder,
}

/// Opens a TCP connection to `host:port`, bounded by `connect_timeout`.
pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Connection> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addr = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::Io {
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"),
        })??;
    stream.set_nodelay(true)?;
    Ok(Connection::new(stream))
}

impl Connection {
    /// Creates a new connection over an established stream.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    /// Writes a frame to the connection.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.encoder.encode(frame);
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        Ok(())
    }

    /// Reads the next frame from the connection.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self
                .decoder
                .decode()
                .map_err(|message| Error::Protocol { message })?
            {
                return Ok(frame);
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.decoder.append(&buf[..n]);
        }
    }

    /// Splits the connection into independent read and write halves.
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            ConnectionReader {
                stream: read_half,
                decoder: self.decoder,
            },
            ConnectionWriter {
                stream: write_half,
                encoder: self.encoder,
            },
        )
    }
}

impl ConnectionReader {
    /// Reads the next frame from the connection.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self
                .decoder
                .decode()
                .map_err(|message| Error::Protocol { message })?
            {
                return Ok(frame);
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.decoder.append(&buf[..n]);
        }
    }
}

impl ConnectionWriter {
    /// Writes a frame to the connection.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.encoder.encode(frame);
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let frame = conn.read_frame().await.unwrap();
            assert_eq!(
                frame,
                Frame::Array(vec![Frame::BulkString(Some("PING".into()))])
            );
            conn.write_frame(&Frame::SimpleString(b"PONG".to_vec()))
                .await
                .unwrap();
        };

        let client = async {
            let stream = TcpStream::connect(addr).await.unwrap();
            let conn = Connection::new(stream);
            let (mut reader, mut writer) = conn.into_split();

            writer
                .write_frame(&Frame::Array(vec![Frame::BulkString(Some("PING".into()))]))
                .await
                .unwrap();

            let frame = reader.read_frame().await.unwrap();
            assert_eq!(frame, Frame::SimpleString(b"PONG".to_vec()));
        };

        tokio::join!(server, client);
    }

    #[tokio::test]
    async fn read_after_peer_close_reports_connection_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        };

        let client = async {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut conn = Connection::new(stream);
            let err = conn.read_frame().await.unwrap_err();
            assert!(matches!(err, Error::ConnectionClosed));
        };

        tokio::join!(server, client);
    }
}
