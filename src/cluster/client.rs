//! The cluster client and its command router.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cluster::delay_queue::DelayQueue;
use crate::cluster::errors::{classify_server_error, split_address};
use crate::cluster::events::ClusterEvent;
use crate::cluster::offline::OfflineQueue;
use crate::cluster::options::{ClusterOptions, ScaleReads};
use crate::cluster::pool::{ConnectionPool, Node, NodeRole, NodeSpec};
use crate::cluster::slots::SlotMap;
use crate::cluster::status::{ClusterStatus, StatusMachine};
use crate::cluster::subscriber::{ClusterSubscriber, PushMessage};
use crate::cluster::topology::TopologyRefresher;
use crate::core::command::{self, Cmd, SubscriberMode};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

const EVENT_CHANNEL_CAPACITY: usize = 512;

/// A command target fixed by the caller rather than resolved per key.
///
/// Carries an optional pre-resolved slot. The first node the router picks
/// for it stays bound, so every retry of the command lands on the same
/// client.
#[derive(Debug)]
pub struct PinnedNode {
    slot: Option<u16>,
    bound: Mutex<Option<Arc<Node>>>,
}

impl PinnedNode {
    /// Creates an unbound pin with no slot; the router resolves a node on
    /// first use.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: None,
            bound: Mutex::new(None),
        })
    }

    /// Creates an unbound pin carrying a pre-resolved slot.
    pub fn with_slot(slot: u16) -> Arc<Self> {
        Arc::new(Self {
            slot: Some(slot),
            bound: Mutex::new(None),
        })
    }

    /// The pre-resolved slot, if one was supplied.
    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    fn bound(&self) -> Option<Arc<Node>> {
        self.bound.lock().unwrap().clone()
    }

    fn bind(&self, node: Arc<Node>) {
        let mut bound = self.bound.lock().unwrap();
        if bound.is_none() {
            *bound = Some(node);
        }
    }
}

/// A command in flight through the router.
///
/// Owns the caller's result channel; `finish` consumes it, so every
/// command reaches exactly one terminal state.
pub(crate) struct RoutedCommand {
    name: String,
    frame: Frame,
    slot: Option<u16>,
    readonly: bool,
    sub_mode: Option<SubscriberMode>,
    ttl: Option<u32>,
    tx: Option<oneshot::Sender<Result<Frame>>>,
}

impl RoutedCommand {
    fn new(cmd: Cmd, tx: oneshot::Sender<Result<Frame>>) -> Self {
        let name = cmd.name();
        Self {
            readonly: command::is_readonly(&name),
            sub_mode: command::subscriber_mode(&name),
            slot: cmd.slot(),
            frame: cmd.into_frame(),
            name,
            ttl: None,
            tx: Some(tx),
        }
    }

    fn finish(&mut self, result: Result<Frame>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl std::fmt::Debug for RoutedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedCommand")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct OfflineEntry {
    command: RoutedCommand,
    node_hint: Option<String>,
    pinned: Option<Arc<PinnedNode>>,
}

enum Target {
    Node { node: Arc<Node>, asking: bool },
    Subscriber,
}

/// A client for a slot-sharded cluster.
///
/// Cheap to clone; all clones share one router, pool and topology view.
///
/// # Example
///
/// ```no_run
/// use shoal::{Cluster, ClusterOptions};
/// use shoal::core::command::Cmd;
///
/// # async fn example() -> shoal::Result<()> {
/// let cluster = Cluster::new(ClusterOptions::new(vec!["127.0.0.1:7000".into()]))?;
/// cluster.connect().await?;
/// let reply = cluster.send(Cmd::new("GET").arg("foo")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

pub(crate) struct ClusterInner {
    options: ClusterOptions,
    events: broadcast::Sender<ClusterEvent>,
    status: Arc<StatusMachine>,
    pool: Arc<ConnectionPool>,
    slots: Arc<SlotMap>,
    refresher: TopologyRefresher,
    delay_queue: Arc<DelayQueue>,
    offline: OfflineQueue<OfflineEntry>,
    subscriber: Arc<ClusterSubscriber>,
    retry_attempts: AtomicU32,
    manually_closing: AtomicBool,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    refresh_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Creates a cluster client.
    ///
    /// Unless [`lazy_connect`](ClusterOptions::lazy_connect) is set, a
    /// connection attempt starts in the background immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when a startup address cannot be
    /// parsed.
    pub fn new(options: ClusterOptions) -> Result<Self> {
        if !options.startup_nodes.is_empty() {
            options.startup_endpoints()?;
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let status = Arc::new(StatusMachine::new(events.clone()));
        let pool = Arc::new(ConnectionPool::new(
            events.clone(),
            options.node_options.clone(),
        ));
        let slots = Arc::new(SlotMap::new());
        let refresher = TopologyRefresher::new(
            pool.clone(),
            slots.clone(),
            status.clone(),
            events.clone(),
            options.slots_refresh_timeout,
        );
        let subscriber = ClusterSubscriber::new(pool.clone(), options.node_options.clone());
        let offline = OfflineQueue::new(options.offline_queue_limit);

        let inner = Arc::new(ClusterInner {
            delay_queue: DelayQueue::new(),
            offline,
            subscriber,
            refresher,
            slots,
            pool,
            status,
            events,
            retry_attempts: AtomicU32::new(0),
            manually_closing: AtomicBool::new(false),
            reconnect_timer: Mutex::new(None),
            refresh_timer: Mutex::new(None),
            options,
        });
        inner.spawn_event_loop();

        if !inner.options.lazy_connect {
            inner.spawn_connect();
        }

        Ok(Self { inner })
    }

    /// Connects to the cluster and waits until it is ready.
    ///
    /// # Errors
    ///
    /// Rejects immediately when a connection attempt is already in flight
    /// or established, and with [`Error::NoStartupNodes`] when no startup
    /// node answered the topology query.
    pub async fn connect(&self) -> Result<()> {
        self.inner.clone().do_connect().await
    }

    /// Sends a command, routing it by the slot of its first key.
    pub async fn send(&self, cmd: Cmd) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();
        let command = RoutedCommand::new(cmd, tx);
        self.inner.dispatch(command, None, None);
        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Sends a command to a caller-pinned target.
    ///
    /// Streaming helpers use this to keep cursor iterations on one node.
    pub async fn send_to(&self, cmd: Cmd, pinned: Arc<PinnedNode>) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();
        let command = RoutedCommand::new(cmd, tx);
        self.inner.dispatch(command, None, Some(pinned));
        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Gets the value of a key.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.send(Cmd::new("GET").arg(key.to_string())).await? {
            Frame::BulkString(value) => Ok(value),
            Frame::Null => Ok(None),
            other => Err(Error::Protocol {
                message: format!("unexpected GET reply: {:?}", other),
            }),
        }
    }

    /// Sets the value of a key.
    pub async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.send(Cmd::new("SET").arg(key.to_string()).arg(value))
            .await?;
        Ok(())
    }

    /// Deletes a key, returning how many keys were removed.
    pub async fn del(&self, key: &str) -> Result<i64> {
        match self.send(Cmd::new("DEL").arg(key.to_string())).await? {
            Frame::Integer(n) => Ok(n),
            other => Err(Error::Protocol {
                message: format!("unexpected DEL reply: {:?}", other),
            }),
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ClusterStatus {
        self.inner.status.status()
    }

    /// Subscribes to cluster events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Receiver for pub/sub messages arriving over the subscriber
    /// connection.
    pub fn messages(&self) -> broadcast::Receiver<PushMessage> {
        self.inner.subscriber.messages()
    }

    /// Tears the cluster down.
    ///
    /// With `reconnect` set the retry strategy decides whether and when a
    /// new connection attempt starts; without it the cluster ends.
    pub fn disconnect(&self, reconnect: bool) {
        self.inner.disconnect(reconnect);
    }

    /// Gracefully shuts the cluster down.
    ///
    /// Issues `QUIT` on every node in parallel, resolves `OK` once all of
    /// them settled, then ends the cluster. From the initial `wait` state
    /// it resolves without any network traffic.
    pub async fn quit(&self) -> Result<Frame> {
        self.inner.clone().quit().await
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("status", &self.inner.status.status())
            .field("nodes", &self.inner.pool.len())
            .finish()
    }
}

impl ClusterInner {
    // Lifecycle ----------------------------------------------------------

    /// Watches the event stream for pool drain and close transitions.
    ///
    /// Holding only a weak reference lets the loop die with the client.
    fn spawn_event_loop(self: &Arc<Self>) {
        let mut rx = self.events.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(inner) = weak.upgrade() else { return };
                match event {
                    ClusterEvent::Drain => {
                        inner.status.set(ClusterStatus::Close);
                    }
                    ClusterEvent::Status(ClusterStatus::Close) => {
                        inner.handle_close();
                    }
                    ClusterEvent::NodeError { node, message } => {
                        trace!("node {} error: {}", node, message);
                    }
                    _ => {}
                }
            }
        });
    }

    fn spawn_connect(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.do_connect().await {
                debug!("connect attempt failed: {}", e);
            }
        });
    }

    async fn do_connect(self: Arc<Self>) -> Result<()> {
        if self.status.is_one_of(&[
            ClusterStatus::Connecting,
            ClusterStatus::Connect,
            ClusterStatus::Ready,
        ]) {
            return Err(Error::InvalidArgument {
                message: "cluster is already connecting/connected".to_string(),
            });
        }

        let endpoints = self.options.startup_endpoints()?;
        self.status.set(ClusterStatus::Connecting);

        // Subscribe before seeding so no refresh or close can slip by.
        let mut rx = self.events.subscribe();

        let specs: Vec<NodeSpec> = endpoints
            .into_iter()
            .map(|(host, port)| NodeSpec {
                host,
                port,
                read_only: false,
            })
            .collect();
        self.pool.reset(&specs);
        self.subscriber.start(self.events.subscribe());

        {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.refresher.refresh().await {
                    match e {
                        Error::RefreshFailed { .. } => {
                            // Emptying the pool drives the close path.
                            let _ = inner.events.send(ClusterEvent::Error(e.to_string()));
                            inner.pool.reset(&[]);
                        }
                        other => debug!("initial topology refresh aborted: {}", other),
                    }
                }
            });
        }

        // Wait for the topology, or for the startup nodes to prove dead.
        loop {
            match rx.recv().await {
                Ok(ClusterEvent::Refresh) => break,
                Ok(ClusterEvent::Status(ClusterStatus::Close)) => {
                    return Err(Error::NoStartupNodes);
                }
                Ok(ClusterEvent::Status(ClusterStatus::End)) => {
                    return Err(Error::Ended);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ConnectionClosed),
            }
        }

        self.status.set(ClusterStatus::Connect);
        self.manually_closing.store(false, Ordering::SeqCst);

        if self.options.enable_ready_check {
            match self.ready_check().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("ready check reported a failing cluster");
                    self.disconnect(true);
                    return Err(Error::Protocol {
                        message: "cluster ready check failed".to_string(),
                    });
                }
                Err(e) => {
                    debug!("ready check errored: {}", e);
                    self.disconnect(true);
                    return Err(e);
                }
            }
        }

        self.on_ready();
        Ok(())
    }

    /// Probes a random node for the cluster health line.
    async fn ready_check(&self) -> Result<bool> {
        let nodes = self.pool.nodes(NodeRole::All);
        let Some(node) = nodes.choose(&mut thread_rng()) else {
            return Ok(false);
        };
        let reply = node.send(command::cluster_info().into_frame()).await?;
        let Some(text) = reply.as_text() else {
            return Err(Error::Protocol {
                message: "unexpected ready check reply".to_string(),
            });
        };
        for line in text.lines() {
            if let Some(value) = line.trim().strip_prefix("cluster_state:") {
                return Ok(value.trim() != "fail");
            }
        }
        Ok(true)
    }

    fn on_ready(self: &Arc<Self>) {
        self.status.set(ClusterStatus::Ready);
        self.retry_attempts.store(0, Ordering::SeqCst);

        let entries = self.offline.drain();
        if !entries.is_empty() {
            debug!("draining {} offline commands", entries.len());
        }
        for entry in entries {
            self.dispatch(entry.command, entry.node_hint, entry.pinned);
        }

        self.install_refresh_timer();
    }

    fn install_refresh_timer(self: &Arc<Self>) {
        let mut slot = self.refresh_timer.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = self.options.slots_refresh_interval;
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(inner) = weak.upgrade() else { return };
                if let Err(e) = inner.refresher.refresh().await {
                    warn!("periodic topology refresh failed: {}", e);
                }
            }
        }));
    }

    fn abort_timers(&self) {
        if let Some(handle) = self.reconnect_timer.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.refresh_timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn disconnect(&self, reconnect: bool) {
        let previous = self.status.status();
        self.status.set(ClusterStatus::Disconnecting);
        if !reconnect {
            self.manually_closing.store(true, Ordering::SeqCst);
        }
        self.abort_timers();
        self.subscriber.stop();

        if previous == ClusterStatus::Wait {
            self.status.set(ClusterStatus::Close);
        } else {
            let was_empty = self.pool.is_empty();
            self.pool.reset(&[]);
            if was_empty {
                // Nothing to drain, so nothing will drive the close.
                self.status.set(ClusterStatus::Close);
            }
        }
    }

    /// Runs once per close; decides between reconnecting and ending.
    fn handle_close(self: &Arc<Self>) {
        if self.manually_closing.load(Ordering::SeqCst) {
            self.subscriber.stop();
            self.status.set(ClusterStatus::End);
            self.flush_offline();
            return;
        }

        let attempts = self.retry_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match (self.options.cluster_retry_strategy)(attempts) {
            Some(delay) => {
                let mut slot = self.reconnect_timer.lock().unwrap();
                if slot.is_some() {
                    return;
                }
                debug!("reconnecting in {:?} (attempt {})", delay, attempts);
                self.status.set(ClusterStatus::Reconnecting);
                let weak = Arc::downgrade(self);
                *slot = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(inner) = weak.upgrade() else { return };
                    *inner.reconnect_timer.lock().unwrap() = None;
                    inner.spawn_connect();
                }));
            }
            None => {
                debug!("retry strategy gave up after {} attempts", attempts);
                self.subscriber.stop();
                self.status.set(ClusterStatus::End);
                self.flush_offline();
            }
        }
    }

    fn flush_offline(&self) {
        for mut entry in self.offline.drain() {
            entry.command.finish(Err(Error::NoStartupNodes));
        }
    }

    async fn quit(self: Arc<Self>) -> Result<Frame> {
        self.manually_closing.store(true, Ordering::SeqCst);
        self.abort_timers();

        match self.status.status() {
            ClusterStatus::Wait => {
                self.subscriber.stop();
                self.status.set(ClusterStatus::Close);
                Ok(Frame::ok())
            }
            ClusterStatus::End => Ok(Frame::ok()),
            _ => {
                let mut handles = Vec::new();
                for node in self.pool.nodes(NodeRole::All) {
                    handles.push(tokio::spawn(async move {
                        let _ = node.send(command::quit().into_frame()).await;
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
                self.disconnect(false);
                Ok(Frame::ok())
            }
        }
    }

    // Routing ------------------------------------------------------------

    pub(crate) fn dispatch(
        self: &Arc<Self>,
        command: RoutedCommand,
        node_hint: Option<String>,
        pinned: Option<Arc<PinnedNode>>,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.exec(command, node_hint, pinned).await;
        });
    }

    async fn exec(
        self: Arc<Self>,
        mut command: RoutedCommand,
        node_hint: Option<String>,
        pinned: Option<Arc<PinnedNode>>,
    ) {
        match self.status.status() {
            ClusterStatus::End => {
                command.finish(Err(Error::ConnectionClosed));
                return;
            }
            ClusterStatus::Wait => {
                // Lazy connect: kick it off and let the command fall into
                // the offline queue meanwhile.
                self.spawn_connect();
            }
            _ => {}
        }

        let slot = pinned.as_ref().and_then(|p| p.slot()).or(command.slot);
        let mut random = false;
        let mut asking: Option<String> = None;
        // A hint from a drained offline entry seeds the first attempt
        // only; later retries select from scratch.
        let mut first_hint = node_hint;
        let mut last_node: Option<String> = first_hint.clone();

        loop {
            if self.status.status() == ClusterStatus::End {
                command.finish(Err(Error::Ended));
                return;
            }

            if self.status.status() != ClusterStatus::Ready && command.name != "CLUSTER" {
                if self.options.enable_offline_queue {
                    trace!("queueing {} until the cluster is ready", command.name);
                    if let Err(mut entry) = self.offline.push(OfflineEntry {
                        command,
                        node_hint: last_node,
                        pinned,
                    }) {
                        entry.command.finish(Err(Error::OfflineQueueFull));
                    }
                } else {
                    command.finish(Err(Error::OfflineQueueDisabled));
                }
                return;
            }

            let hint_once = first_hint.take();
            let target = match self.select_target(
                &command,
                pinned.as_deref(),
                slot,
                random,
                asking.as_deref(),
                hint_once.as_deref(),
            ) {
                Ok(target) => target,
                Err(e) => {
                    command.finish(Err(e));
                    return;
                }
            };

            let send_result = match &target {
                Target::Subscriber => {
                    self.subscriber
                        .send(&command.name, command.frame.clone())
                        .await
                }
                Target::Node { node, asking } => {
                    last_node = Some(node.key().to_string());
                    if *asking {
                        self.send_with_asking(node, command.frame.clone()).await
                    } else {
                        node.send(command.frame.clone()).await
                    }
                }
            };

            let error = match send_result {
                Ok(Frame::Error(payload)) => classify_server_error(&payload),
                Ok(frame) => {
                    command.finish(Ok(frame));
                    return;
                }
                Err(e) => e,
            };

            if matches!(error, Error::NoSubscriber) {
                command.finish(Err(error));
                return;
            }

            // The redirection budget is armed by the first error and
            // spent by each one after it.
            match command.ttl.as_mut() {
                None => command.ttl = Some(self.options.max_redirections),
                Some(ttl) => *ttl = ttl.saturating_sub(1),
            }
            if command.ttl == Some(0) {
                command.finish(Err(Error::MaxRedirections {
                    last: error.to_string(),
                }));
                return;
            }

            asking = None;
            random = false;

            match error {
                Error::Moved { slot: moved, address } => {
                    debug!("slot {} moved to {}", moved, address);
                    if let Some((host, port)) = split_address(&address) {
                        self.pool.find_or_create(&host, port, None);
                    }
                    self.slots.set_primary(moved, &address);
                    self.spawn_refresh();
                }
                Error::Ask { slot: asked, address } => {
                    trace!("slot {} asks for {}", asked, address);
                    if let Some((host, port)) = split_address(&address) {
                        self.pool.find_or_create(&host, port, None);
                    }
                    asking = Some(address);
                }
                Error::TryAgain { .. } => {
                    let rx = self.delay_queue.push(
                        "tryagain",
                        self.options.retry_delay_on_try_again,
                        None,
                    );
                    let _ = rx.await;
                    random = true;
                }
                Error::ClusterDown { .. }
                    if self.options.retry_delay_on_cluster_down > Duration::ZERO =>
                {
                    let rx = self.delay_queue.push(
                        "clusterdown",
                        self.options.retry_delay_on_cluster_down,
                        Some(self.refresh_callback()),
                    );
                    let _ = rx.await;
                    random = true;
                }
                e if e.is_connection_error()
                    && self.status.status() == ClusterStatus::Ready
                    && self.options.retry_delay_on_failover > Duration::ZERO =>
                {
                    let rx = self.delay_queue.push(
                        "failover",
                        self.options.retry_delay_on_failover,
                        Some(self.refresh_callback()),
                    );
                    let _ = rx.await;
                    random = true;
                }
                e => {
                    command.finish(Err(e));
                    return;
                }
            }
        }
    }

    /// Issues the ASKING preamble and the command back to back on one
    /// connection, so nothing can consume the grant in between.
    async fn send_with_asking(&self, node: &Arc<Node>, frame: Frame) -> Result<Frame> {
        let conn = node.connection().await?;
        let mut replies = conn
            .send_batch(vec![command::asking().into_frame(), frame])
            .await?;
        Ok(replies.pop().expect("one reply per request"))
    }

    fn select_target(
        &self,
        command: &RoutedCommand,
        pinned: Option<&PinnedNode>,
        slot: Option<u16>,
        random: bool,
        asking: Option<&str>,
        node_hint: Option<&str>,
    ) -> Result<Target> {
        if self.status.status() == ClusterStatus::End {
            return Err(Error::Ended);
        }

        if let Some(pinned) = pinned {
            if let Some(node) = pinned.bound() {
                return Ok(Target::Node {
                    node,
                    asking: false,
                });
            }
        }

        if command.sub_mode.is_some() {
            return Ok(Target::Subscriber);
        }

        let mut chosen: Option<Arc<Node>> = None;
        let mut with_asking = false;

        if let Some(asking_key) = asking {
            // ASK targets exactly the named endpoint.
            with_asking = true;
            chosen = self.pool.get(asking_key).or_else(|| {
                split_address(asking_key)
                    .map(|(host, port)| self.pool.find_or_create(&host, port, None))
            });
        } else if !random {
            if let Some(slot) = slot {
                let keys = self.slots.lookup(slot);
                if !keys.is_empty() {
                    chosen = self.pick_for_slot(&keys, command);
                }
            }
        }

        let node = match chosen {
            Some(node) => node,
            None => self.sample_fallback(command, node_hint)?,
        };

        if let Some(pinned) = pinned {
            pinned.bind(node.clone());
        }

        Ok(Target::Node {
            node,
            asking: with_asking,
        })
    }

    /// Picks among the nodes serving a slot, honoring the read-scaling
    /// policy for readonly commands. Writes always hit the primary.
    fn pick_for_slot(&self, keys: &[String], command: &RoutedCommand) -> Option<Arc<Node>> {
        if !command.readonly {
            return self.pool.get(&keys[0]);
        }
        match &self.options.scale_reads {
            ScaleReads::Custom(selector) => {
                let nodes: Vec<Arc<Node>> =
                    keys.iter().filter_map(|key| self.pool.get(key)).collect();
                if nodes.is_empty() {
                    return None;
                }
                let picked = selector(&nodes, &command.name);
                if picked.is_empty() {
                    Some(nodes[0].clone())
                } else {
                    picked.choose(&mut thread_rng()).cloned()
                }
            }
            ScaleReads::All => {
                let key = keys.choose(&mut thread_rng())?;
                self.pool.get(key)
            }
            ScaleReads::Slave if keys.len() >= 2 => {
                let key = keys[1..].choose(&mut thread_rng())?;
                self.pool.get(key)
            }
            _ => self.pool.get(&keys[0]),
        }
    }

    /// Uniform sample over nodes of the command's target role, falling
    /// back to the whole pool. A hint from an earlier attempt wins when
    /// that node is still a member.
    fn sample_fallback(
        &self,
        command: &RoutedCommand,
        node_hint: Option<&str>,
    ) -> Result<Arc<Node>> {
        if let Some(hint) = node_hint {
            if let Some(node) = self.pool.get(hint) {
                return Ok(node);
            }
        }

        let role = self.target_role(command.readonly);
        let mut nodes = self.pool.nodes(role);
        if nodes.is_empty() {
            nodes = self.pool.nodes(NodeRole::All);
        }
        nodes
            .choose(&mut thread_rng())
            .cloned()
            .ok_or(Error::ConnectionClosed)
    }

    fn target_role(&self, readonly: bool) -> NodeRole {
        let role = match self.options.scale_reads {
            ScaleReads::Master => NodeRole::Master,
            ScaleReads::Slave => NodeRole::Slave,
            ScaleReads::All | ScaleReads::Custom(_) => NodeRole::All,
        };
        if role != NodeRole::Master && !readonly {
            NodeRole::Master
        } else {
            role
        }
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.refresher.refresh().await {
                warn!("topology refresh failed: {}", e);
            }
        });
    }

    fn refresh_callback(self: &Arc<Self>) -> Box<dyn FnOnce() + Send + 'static> {
        let weak = Arc::downgrade(self);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.spawn_refresh();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(options: ClusterOptions) -> Cluster {
        Cluster::new(options.lazy_connect(true)).unwrap()
    }

    fn routed(cmd: Cmd) -> (RoutedCommand, oneshot::Receiver<Result<Frame>>) {
        let (tx, rx) = oneshot::channel();
        (RoutedCommand::new(cmd, tx), rx)
    }

    #[tokio::test]
    async fn routed_command_carries_catalog_flags() {
        let (command, _rx) = routed(Cmd::new("GET").arg("foo"));
        assert_eq!(command.name, "GET");
        assert!(command.readonly);
        assert_eq!(command.slot, Some(12182));
        assert!(command.sub_mode.is_none());

        let (command, _rx) = routed(Cmd::new("SUBSCRIBE").arg("news"));
        assert_eq!(command.sub_mode, Some(SubscriberMode::Enter));
        assert_eq!(command.slot, None);
    }

    #[tokio::test]
    async fn finish_is_single_shot() {
        let (mut command, mut rx) = routed(Cmd::new("GET").arg("foo"));
        command.finish(Ok(Frame::ok()));
        command.finish(Err(Error::Ended));
        assert!(matches!(rx.try_recv(), Ok(Ok(_))));
    }

    #[tokio::test]
    async fn target_role_forces_master_for_writes() {
        let c = cluster(
            ClusterOptions::new(vec!["127.0.0.1:7000".into()]).scale_reads(ScaleReads::Slave),
        );
        assert_eq!(c.inner.target_role(false), NodeRole::Master);
        assert_eq!(c.inner.target_role(true), NodeRole::Slave);
    }

    #[tokio::test]
    async fn pick_for_slot_prefers_primary_for_writes() {
        let c = cluster(
            ClusterOptions::new(vec!["127.0.0.1:7000".into()]).scale_reads(ScaleReads::All),
        );
        c.inner.pool.find_or_create("a", 7000, Some(false));
        c.inner.pool.find_or_create("b", 7001, Some(true));
        let keys = vec!["a:7000".to_string(), "b:7001".to_string()];

        let (write, _rx) = routed(Cmd::new("SET").arg("foo").arg("v"));
        let node = c.inner.pick_for_slot(&keys, &write).unwrap();
        assert_eq!(node.key(), "a:7000");
    }

    #[tokio::test]
    async fn pick_for_slot_slave_excludes_primary() {
        let c = cluster(
            ClusterOptions::new(vec!["127.0.0.1:7000".into()]).scale_reads(ScaleReads::Slave),
        );
        c.inner.pool.find_or_create("a", 7000, Some(false));
        c.inner.pool.find_or_create("b", 7001, Some(true));
        c.inner.pool.find_or_create("c", 7002, Some(true));
        let keys = vec![
            "a:7000".to_string(),
            "b:7001".to_string(),
            "c:7002".to_string(),
        ];

        let (read, _rx) = routed(Cmd::new("GET").arg("foo"));
        for _ in 0..20 {
            let node = c.inner.pick_for_slot(&keys, &read).unwrap();
            assert_ne!(node.key(), "a:7000");
        }
    }

    #[tokio::test]
    async fn pick_for_slot_custom_selector() {
        let c = cluster(
            ClusterOptions::new(vec!["127.0.0.1:7000".into()]).scale_reads(ScaleReads::Custom(
                Arc::new(|nodes, name| {
                    assert_eq!(name, "GET");
                    nodes
                        .iter()
                        .filter(|node| node.is_replica())
                        .cloned()
                        .collect()
                }),
            )),
        );
        c.inner.pool.find_or_create("a", 7000, Some(false));
        c.inner.pool.find_or_create("b", 7001, Some(true));
        let keys = vec!["a:7000".to_string(), "b:7001".to_string()];

        let (read, _rx) = routed(Cmd::new("GET").arg("foo"));
        let node = c.inner.pick_for_slot(&keys, &read).unwrap();
        assert_eq!(node.key(), "b:7001");
    }

    #[tokio::test]
    async fn custom_selector_empty_result_falls_back_to_primary() {
        let c = cluster(
            ClusterOptions::new(vec!["127.0.0.1:7000".into()])
                .scale_reads(ScaleReads::Custom(Arc::new(|_nodes, _name| Vec::new()))),
        );
        c.inner.pool.find_or_create("a", 7000, Some(false));
        c.inner.pool.find_or_create("b", 7001, Some(true));
        let keys = vec!["a:7000".to_string(), "b:7001".to_string()];

        let (read, _rx) = routed(Cmd::new("GET").arg("foo"));
        let node = c.inner.pick_for_slot(&keys, &read).unwrap();
        assert_eq!(node.key(), "a:7000");
    }

    #[tokio::test]
    async fn sample_fallback_prefers_hint() {
        let c = cluster(ClusterOptions::new(vec!["127.0.0.1:7000".into()]));
        c.inner.pool.find_or_create("a", 7000, Some(false));
        c.inner.pool.find_or_create("b", 7001, Some(false));

        let (read, _rx) = routed(Cmd::new("GET").arg("foo"));
        let node = c.inner.sample_fallback(&read, Some("b:7001")).unwrap();
        assert_eq!(node.key(), "b:7001");
    }

    #[tokio::test]
    async fn pinned_node_binds_once() {
        let c = cluster(ClusterOptions::new(vec!["127.0.0.1:7000".into()]));
        let a = c.inner.pool.find_or_create("a", 7000, Some(false));
        let b = c.inner.pool.find_or_create("b", 7001, Some(false));

        let pinned = PinnedNode::new();
        pinned.bind(a.clone());
        pinned.bind(b);
        assert!(Arc::ptr_eq(&pinned.bound().unwrap(), &a));
    }

    #[tokio::test]
    async fn new_rejects_unparseable_startup_nodes() {
        assert!(Cluster::new(ClusterOptions::new(vec!["nonsense".into()])).is_err());
    }
}
