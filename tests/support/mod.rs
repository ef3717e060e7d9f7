//! In-process scripted node used by the integration tests.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::TcpListener;

use shoal::core::connection::Connection;
use shoal::proto::frame::Frame;

#[derive(Default)]
struct State {
    scripted: Mutex<HashMap<String, VecDeque<Frame>>>,
    defaults: Mutex<HashMap<String, Frame>>,
    cluster_state: Mutex<String>,
    received: Mutex<Vec<Vec<String>>>,
}

/// A fake cluster node.
///
/// Replies are resolved per command name: scripted replies are consumed
/// first-in first-out, then the sticky default, then a built-in. `CLUSTER`
/// subcommands are keyed as `"CLUSTER SLOTS"` and `"CLUSTER INFO"`.
pub struct MockNode {
    pub addr: SocketAddr,
    state: Arc<State>,
}

impl MockNode {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State {
            cluster_state: Mutex::new("ok".to_string()),
            ..State::default()
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let mut conn = Connection::new(stream);
                    while let Ok(frame) = conn.read_frame().await {
                        let args = frame_to_args(&frame);
                        if args.is_empty() {
                            continue;
                        }
                        state.received.lock().unwrap().push(args.clone());

                        let name = args[0].to_uppercase();
                        if name == "SUBSCRIBE" || name == "PSUBSCRIBE" {
                            // Ack each channel, then push one message so
                            // the push path is exercised.
                            for channel in &args[1..] {
                                let ack = Frame::Array(vec![
                                    bulk(&name.to_lowercase()),
                                    bulk(channel),
                                    Frame::Integer(1),
                                ]);
                                if conn.write_frame(&ack).await.is_err() {
                                    return;
                                }
                            }
                            if let Some(channel) = args.get(1) {
                                let push = Frame::Array(vec![
                                    bulk("message"),
                                    bulk(channel),
                                    bulk("hello"),
                                ]);
                                if conn.write_frame(&push).await.is_err() {
                                    return;
                                }
                            }
                            continue;
                        }

                        let reply = state.reply_for(&name, &args);
                        if conn.write_frame(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self { addr, state }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn key(&self) -> String {
        format!("127.0.0.1:{}", self.port())
    }

    /// Queues one reply for a command; consumed in order.
    pub fn push_reply(&self, name: &str, frame: Frame) {
        self.state
            .scripted
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(frame);
    }

    /// Sets the sticky reply used once the scripted queue is empty.
    pub fn set_default(&self, name: &str, frame: Frame) {
        self.state
            .defaults
            .lock()
            .unwrap()
            .insert(name.to_string(), frame);
    }

    /// Sets the sticky slot layout reply, each range served from
    /// `127.0.0.1` ports (first port is the primary).
    pub fn set_slots(&self, ranges: &[(u16, u16, Vec<u16>)]) {
        self.set_default("CLUSTER SLOTS", slots_frame(ranges));
    }

    /// Sets the health value reported by the ready check.
    pub fn set_cluster_state(&self, value: &str) {
        *self.state.cluster_state.lock().unwrap() = value.to_string();
    }

    /// Every command received so far, as raw argument lists.
    pub fn received(&self) -> Vec<Vec<String>> {
        self.state.received.lock().unwrap().clone()
    }

    /// Number of received commands whose joined form starts with
    /// `prefix`, e.g. `"GET"` or `"CLUSTER SLOTS"`.
    pub fn count(&self, prefix: &str) -> usize {
        self.received()
            .iter()
            .filter(|args| args.join(" ").starts_with(prefix))
            .count()
    }
}

impl State {
    fn reply_for(&self, name: &str, args: &[String]) -> Frame {
        let lookup = if name == "CLUSTER" && args.len() > 1 {
            format!("CLUSTER {}", args[1].to_uppercase())
        } else {
            name.to_string()
        };

        if let Some(queue) = self.scripted.lock().unwrap().get_mut(&lookup) {
            if let Some(frame) = queue.pop_front() {
                return frame;
            }
        }
        if let Some(frame) = self.defaults.lock().unwrap().get(&lookup) {
            return frame.clone();
        }

        match lookup.as_str() {
            "PING" => Frame::SimpleString(b"PONG".to_vec()),
            "CLUSTER INFO" => {
                let state = self.cluster_state.lock().unwrap().clone();
                Frame::BulkString(Some(Bytes::from(format!(
                    "cluster_state:{}\r\ncluster_known_nodes:1\r\n",
                    state
                ))))
            }
            "CLUSTER SLOTS" => Frame::Array(Vec::new()),
            _ => Frame::ok(),
        }
    }
}

/// Builds a slot layout reply for ranges served from `127.0.0.1` ports.
pub fn slots_frame(ranges: &[(u16, u16, Vec<u16>)]) -> Frame {
    let rows = ranges
        .iter()
        .map(|(start, end, ports)| {
            let mut row = vec![
                Frame::Integer(i64::from(*start)),
                Frame::Integer(i64::from(*end)),
            ];
            for port in ports {
                row.push(Frame::Array(vec![
                    bulk("127.0.0.1"),
                    Frame::Integer(i64::from(*port)),
                    bulk("mock-node-id"),
                ]));
            }
            Frame::Array(row)
        })
        .collect();
    Frame::Array(rows)
}

pub fn bulk(value: &str) -> Frame {
    Frame::BulkString(Some(Bytes::copy_from_slice(value.as_bytes())))
}

fn frame_to_args(frame: &Frame) -> Vec<String> {
    match frame {
        Frame::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Frame::BulkString(Some(data)) => {
                    Some(String::from_utf8_lossy(data).into_owned())
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
