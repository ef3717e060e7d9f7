//! Cluster-wide pub/sub subscriber.
//!
//! Subscriber mode poisons a connection for request/response traffic, so
//! the cluster keeps exactly one dedicated subscriber connection to some
//! node. When that node is lost or removed from the pool, another one is
//! selected and every active subscription is replayed onto it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::cluster::errors::split_address;
use crate::cluster::events::ClusterEvent;
use crate::cluster::options::NodeOptions;
use crate::cluster::pool::{ConnectionPool, NodeRole};
use crate::core::command;
use crate::core::connection;
use crate::core::multiplexed::MultiplexedConnection;
use crate::proto::error::Result;
use crate::proto::frame::Frame;

const RESELECT_DELAY: Duration = Duration::from_millis(500);

/// A pub/sub message received over the subscriber connection.
#[derive(Debug, Clone)]
pub struct PushMessage {
    /// The channel the message was published to.
    pub channel: Bytes,
    /// The pattern that matched, for pattern subscriptions.
    pub pattern: Option<Bytes>,
    /// The message payload.
    pub payload: Bytes,
}

#[derive(Default)]
struct Subscriptions {
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
}

struct Instance {
    key: String,
    conn: MultiplexedConnection,
}

pub(crate) struct ClusterSubscriber {
    pool: Arc<ConnectionPool>,
    node_options: NodeOptions,
    messages: broadcast::Sender<PushMessage>,
    instance: Mutex<Option<Instance>>,
    subs: Mutex<Subscriptions>,
    stopped: AtomicBool,
    generation: AtomicU64,
}

impl ClusterSubscriber {
    pub(crate) fn new(pool: Arc<ConnectionPool>, node_options: NodeOptions) -> Arc<Self> {
        let (messages, _) = broadcast::channel(1024);
        Arc::new(Self {
            pool,
            node_options,
            messages,
            instance: Mutex::new(None),
            subs: Mutex::new(Subscriptions::default()),
            stopped: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    /// Receiver for pub/sub messages.
    pub(crate) fn messages(&self) -> broadcast::Receiver<PushMessage> {
        self.messages.subscribe()
    }

    /// The current subscriber client, if one is established.
    pub(crate) fn instance(&self) -> Option<MultiplexedConnection> {
        self.instance
            .lock()
            .unwrap()
            .as_ref()
            .map(|instance| instance.conn.clone())
    }

    /// Starts the subscriber and keeps it alive across node changes.
    ///
    /// `events` is watched for removals of the node currently hosting the
    /// subscription connection.
    pub(crate) fn start(self: &Arc<Self>, events: broadcast::Receiver<ClusterEvent>) {
        self.stopped.store(false, Ordering::SeqCst);
        self.spawn_select();
        self.spawn_event_watch(events);
    }

    /// Stops the subscriber and drops its connection.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.instance.lock().unwrap() = None;
    }

    /// Sends a subscription command over the subscriber connection and
    /// tracks the channels it affects so they survive reselection.
    pub(crate) async fn send(&self, name: &str, frame: Frame) -> Result<Frame> {
        let conn = self
            .instance()
            .ok_or(crate::proto::error::Error::NoSubscriber)?;
        let args = frame_args(&frame);
        let reply = conn.send(frame).await?;
        if !matches!(reply, Frame::Error(_)) {
            self.track(name, &args);
        }
        Ok(reply)
    }

    fn track(&self, name: &str, args: &[Bytes]) {
        let mut subs = self.subs.lock().unwrap();
        match name {
            "SUBSCRIBE" => subs.channels.extend(args.iter().cloned()),
            "PSUBSCRIBE" => subs.patterns.extend(args.iter().cloned()),
            "UNSUBSCRIBE" => {
                if args.is_empty() {
                    subs.channels.clear();
                } else {
                    for arg in args {
                        subs.channels.remove(arg);
                    }
                }
            }
            "PUNSUBSCRIBE" => {
                if args.is_empty() {
                    subs.patterns.clear();
                } else {
                    for arg in args {
                        subs.patterns.remove(arg);
                    }
                }
            }
            _ => {}
        }
    }

    fn spawn_select(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(subscriber) = weak.upgrade() else { return };
                if subscriber.stopped.load(Ordering::SeqCst) {
                    return;
                }
                if subscriber.instance().is_some() {
                    return;
                }
                if subscriber.select().await {
                    return;
                }
                drop(subscriber);
                tokio::time::sleep(RESELECT_DELAY).await;
            }
        });
    }

    fn spawn_event_watch(self: &Arc<Self>, mut events: broadcast::Receiver<ClusterEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(subscriber) = weak.upgrade() else { return };
                if subscriber.stopped.load(Ordering::SeqCst) {
                    return;
                }
                if let ClusterEvent::NodeRemoved(key) = event {
                    let lost = {
                        let mut instance = subscriber.instance.lock().unwrap();
                        match instance.as_ref() {
                            Some(current) if current.key == key => {
                                *instance = None;
                                true
                            }
                            _ => false,
                        }
                    };
                    if lost {
                        debug!("subscriber node {} removed, reselecting", key);
                        subscriber.generation.fetch_add(1, Ordering::SeqCst);
                        subscriber.spawn_select();
                    }
                }
            }
        });
    }

    /// Picks a pool node and establishes a fresh subscriber connection.
    /// Returns true on success.
    async fn select(self: &Arc<Self>) -> bool {
        let mut keys: Vec<String> = self
            .pool
            .nodes(NodeRole::All)
            .iter()
            .map(|node| node.key().to_string())
            .collect();
        keys.shuffle(&mut thread_rng());

        for key in keys {
            let Some((host, port)) = split_address(&key) else {
                continue;
            };
            match self.open(&host, port).await {
                Ok(conn) => {
                    debug!("subscriber connected to {}", key);
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    *self.instance.lock().unwrap() = Some(Instance {
                        key: key.clone(),
                        conn: conn.clone(),
                    });
                    if let Err(e) = self.replay(&conn).await {
                        warn!("failed to replay subscriptions on {}: {}", key, e);
                    }
                    self.spawn_watch(conn, generation);
                    return true;
                }
                Err(e) => {
                    trace!("subscriber candidate {} failed: {}", key, e);
                }
            }
        }
        false
    }

    async fn open(&self, host: &str, port: u16) -> Result<MultiplexedConnection> {
        let mut raw = connection::connect(host, port, self.node_options.connect_timeout).await?;
        if let Some(password) = &self.node_options.password {
            raw.write_frame(&command::auth(password.clone()).into_frame())
                .await?;
            let _ = raw.read_frame().await?;
        }

        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let conn = MultiplexedConnection::with_push(raw, Some(push_tx));
        self.spawn_forward(push_rx);
        Ok(conn)
    }

    /// Re-issues the active subscriptions onto a fresh connection.
    async fn replay(&self, conn: &MultiplexedConnection) -> Result<()> {
        let (channels, patterns) = {
            let subs = self.subs.lock().unwrap();
            (
                subs.channels.iter().cloned().collect::<Vec<_>>(),
                subs.patterns.iter().cloned().collect::<Vec<_>>(),
            )
        };

        if !channels.is_empty() {
            let mut cmd = command::Cmd::new("SUBSCRIBE");
            for channel in channels {
                cmd = cmd.arg(channel);
            }
            conn.send(cmd.into_frame()).await?;
        }
        if !patterns.is_empty() {
            let mut cmd = command::Cmd::new("PSUBSCRIBE");
            for pattern in patterns {
                cmd = cmd.arg(pattern);
            }
            conn.send(cmd.into_frame()).await?;
        }
        Ok(())
    }

    fn spawn_watch(self: &Arc<Self>, conn: MultiplexedConnection, generation: u64) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            conn.closed().await;
            let Some(subscriber) = weak.upgrade() else { return };
            if subscriber.stopped.load(Ordering::SeqCst) {
                return;
            }
            if subscriber.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            debug!("subscriber connection lost, reselecting");
            *subscriber.instance.lock().unwrap() = None;
            subscriber.spawn_select();
        });
    }

    fn spawn_forward(&self, mut push_rx: mpsc::UnboundedReceiver<Frame>) {
        let messages = self.messages.clone();
        tokio::spawn(async move {
            while let Some(frame) = push_rx.recv().await {
                if let Some(message) = parse_push(&frame) {
                    let _ = messages.send(message);
                }
            }
        });
    }
}

fn frame_args(frame: &Frame) -> Vec<Bytes> {
    match frame {
        Frame::Array(items) => items
            .iter()
            .skip(1)
            .filter_map(|item| item.as_bulk().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_push(frame: &Frame) -> Option<PushMessage> {
    let items = frame.as_array()?;
    let kind = items.first()?.as_bulk()?;
    match kind.as_ref() {
        b"message" => Some(PushMessage {
            channel: items.get(1)?.as_bulk()?.clone(),
            pattern: None,
            payload: items.get(2)?.as_bulk()?.clone(),
        }),
        b"pmessage" => Some(PushMessage {
            pattern: Some(items.get(1)?.as_bulk()?.clone()),
            channel: items.get(2)?.as_bulk()?.clone(),
            payload: items.get(3)?.as_bulk()?.clone(),
        }),
        _ => None,
    }
}
