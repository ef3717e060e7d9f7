use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::trace;

use crate::core::connection::{Connection, ConnectionReader, ConnectionWriter};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Response to a single request.
pub type Response = Result<Frame>;

struct Request {
    frames: Vec<Frame>,
    responders: Vec<oneshot::Sender<Response>>,
}

/// A pipelined client over one connection.
///
/// Requests are written in submission order and answered strictly first-in
/// first-out, so many tasks can share a clone of this handle without any
/// per-request correlation ids. When the connection drops, every pending
/// request fails with a connection-closed error and the handle latches
/// into the closed state.
///
/// Out-of-band push frames (pub/sub messages) are delivered to an optional
/// push channel instead of the FIFO.
#[derive(Clone, Debug)]
pub struct MultiplexedConnection {
    sender: mpsc::UnboundedSender<Request>,
    closed_rx: watch::Receiver<bool>,
}

impl MultiplexedConnection {
    /// Creates a new multiplexed client over an established connection.
    pub fn new(connection: Connection) -> Self {
        Self::with_push(connection, None)
    }

    /// Creates a new multiplexed client that forwards push frames.
    ///
    /// Subscriber-mode connections receive `message` and `pmessage` arrays
    /// that answer no request; those are sent to `push_tx`.
    pub fn with_push(
        connection: Connection,
        push_tx: Option<mpsc::UnboundedSender<Frame>>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let (reader, writer) = connection.into_split();

        tokio::spawn(drive(reader, writer, receiver, closed_tx, push_tx));

        Self { sender, closed_rx }
    }

    /// Sends one command and waits for its reply.
    ///
    /// A server error reply is returned as `Ok(Frame::Error(..))`; only
    /// transport failures produce `Err`.
    pub async fn send(&self, frame: Frame) -> Response {
        let mut replies = self.send_batch(vec![frame]).await?;
        Ok(replies.pop().expect("one reply per request"))
    }

    /// Sends several commands back to back and waits for all replies.
    ///
    /// The frames are enqueued as one unit, so no other request on this
    /// handle can be interleaved between them on the wire.
    pub async fn send_batch(&self, frames: Vec<Frame>) -> Result<Vec<Frame>> {
        let mut receivers = Vec::with_capacity(frames.len());
        let mut responders = Vec::with_capacity(frames.len());
        for _ in 0..frames.len() {
            let (tx, rx) = oneshot::channel();
            responders.push(tx);
            receivers.push(rx);
        }

        self.sender
            .send(Request { frames, responders })
            .map_err(|_| Error::ConnectionClosed)?;

        let mut replies = Vec::with_capacity(receivers.len());
        for rx in receivers {
            replies.push(rx.await.map_err(|_| Error::ConnectionClosed)??);
        }
        Ok(replies)
    }

    /// Returns true once the underlying connection is gone.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Waits until the underlying connection is gone.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        // Err means the driver is gone, which is the same outcome.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

fn is_push(frame: &Frame) -> bool {
    let kind = match frame {
        Frame::Array(items) => match items.first() {
            Some(Frame::BulkString(Some(kind))) => kind.as_ref(),
            _ => return false,
        },
        _ => return false,
    };
    matches!(kind, b"message" | b"pmessage" | b"smessage")
}

async fn drive(
    mut reader: ConnectionReader,
    mut writer: ConnectionWriter,
    mut receiver: mpsc::UnboundedReceiver<Request>,
    closed_tx: watch::Sender<bool>,
    push_tx: Option<mpsc::UnboundedSender<Frame>>,
) {
    let mut pending: VecDeque<oneshot::Sender<Response>> = VecDeque::new();
    let mut requests_open = true;

    loop {
        tokio::select! {
            request = receiver.recv(), if requests_open => {
                match request {
                    Some(Request { frames, responders }) => {
                        let mut failed = false;
                        for frame in &frames {
                            if let Err(e) = writer.write_frame(frame).await {
                                trace!("write failed: {}", e);
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            for tx in responders {
                                let _ = tx.send(Err(Error::ConnectionClosed));
                            }
                            break;
                        }
                        pending.extend(responders);
                    }
                    None => {
                        // All handles dropped. Keep reading until the
                        // in-flight replies have drained.
                        requests_open = false;
                        if pending.is_empty() {
                            break;
                        }
                    }
                }
            }
            result = reader.read_frame() => {
                match result {
                    Ok(frame) => {
                        if is_push(&frame) {
                            if let Some(tx) = &push_tx {
                                let _ = tx.send(frame);
                            }
                            continue;
                        }
                        match pending.pop_front() {
                            Some(tx) => {
                                let _ = tx.send(Ok(frame));
                            }
                            None => {
                                // Unsolicited reply; only meaningful on
                                // subscriber connections.
                                if let Some(tx) = &push_tx {
                                    let _ = tx.send(frame);
                                }
                            }
                        }
                        if !requests_open && pending.is_empty() {
                            break;
                        }
                    }
                    Err(e) => {
                        trace!("read failed: {}", e);
                        for tx in pending.drain(..) {
                            let _ = tx.send(Err(Error::ConnectionClosed));
                        }
                        break;
                    }
                }
            }
        }
    }

    let _ = closed_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::Connection;
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_pair() -> (MultiplexedConnection, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            while let Ok(frame) = conn.read_frame().await {
                conn.write_frame(&frame).await.unwrap();
            }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let conn = MultiplexedConnection::new(Connection::new(stream));
        (conn, server)
    }

    #[tokio::test]
    async fn send_receives_matching_reply() {
        let (conn, _server) = echo_pair().await;
        let reply = conn.send(Frame::Integer(7)).await.unwrap();
        assert_eq!(reply, Frame::Integer(7));
    }

    #[tokio::test]
    async fn replies_are_fifo_across_tasks() {
        let (conn, _server) = echo_pair().await;

        let mut handles = Vec::new();
        for i in 0..16i64 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                conn.send(Frame::Integer(i)).await.unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Frame::Integer(i as i64));
        }
    }

    #[tokio::test]
    async fn batch_replies_stay_adjacent() {
        let (conn, _server) = echo_pair().await;
        let replies = conn
            .send_batch(vec![Frame::Integer(1), Frame::Integer(2)])
            .await
            .unwrap();
        assert_eq!(replies, vec![Frame::Integer(1), Frame::Integer(2)]);
    }

    #[tokio::test]
    async fn pending_requests_fail_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            // Swallow one request, then drop the socket without replying.
            let _ = conn.read_frame().await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let conn = MultiplexedConnection::new(Connection::new(stream));
        let err = conn.send(Frame::Integer(1)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));

        conn.closed().await;
        assert!(conn.is_closed());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn push_frames_bypass_the_fifo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let _ = conn.read_frame().await.unwrap();
            // Push arrives before the actual reply.
            conn.write_frame(&Frame::Array(vec![
                Frame::BulkString(Some("message".into())),
                Frame::BulkString(Some("ch".into())),
                Frame::BulkString(Some("payload".into())),
            ]))
            .await
            .unwrap();
            conn.write_frame(&Frame::ok()).await.unwrap();
        });

        let (push_tx, mut push_rx) = mpsc::unbounded_channel();
        let stream = TcpStream::connect(addr).await.unwrap();
        let conn = MultiplexedConnection::with_push(Connection::new(stream), Some(push_tx));

        let reply = conn.send(Frame::Integer(1)).await.unwrap();
        assert_eq!(reply, Frame::ok());

        let push = push_rx.recv().await.unwrap();
        assert!(is_push(&push));
        server.await.unwrap();
    }
}
