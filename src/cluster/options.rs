//! Cluster configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::pool::Node;
use crate::proto::error::{Error, Result};

/// Strategy deciding the delay before a reconnect attempt.
///
/// Receives the attempt count (starting at 1) and returns the delay, or
/// `None` to stop reconnecting and end the cluster.
pub type RetryStrategy = Arc<dyn Fn(u32) -> Option<Duration> + Send + Sync>;

/// Custom replica-selection function for [`ScaleReads::Custom`].
///
/// Receives the nodes serving the command's slot (primary first) and the
/// command name; returns the candidates to sample from. An empty result
/// falls back to the primary.
pub type ReadsSelector = Arc<dyn Fn(&[Arc<Node>], &str) -> Vec<Arc<Node>> + Send + Sync>;

/// Where readonly commands may be routed.
#[derive(Clone, Default)]
pub enum ScaleReads {
    /// Always the slot's primary.
    #[default]
    Master,
    /// A replica when the slot has one, excluding the primary.
    Slave,
    /// Any node serving the slot, primary included.
    All,
    /// User-supplied selection.
    Custom(ReadsSelector),
}

impl fmt::Debug for ScaleReads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleReads::Master => f.write_str("Master"),
            ScaleReads::Slave => f.write_str("Slave"),
            ScaleReads::All => f.write_str("All"),
            ScaleReads::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Options applied to every single-node client the cluster creates.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Password sent as `AUTH` right after connecting.
    pub password: Option<String>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            password: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for a [`Cluster`](crate::Cluster).
///
/// # Example
///
/// ```
/// use shoal::{ClusterOptions, ScaleReads};
/// use std::time::Duration;
///
/// let options = ClusterOptions::new(vec!["127.0.0.1:7000".into()])
///     .scale_reads(ScaleReads::Slave)
///     .max_redirections(8)
///     .slots_refresh_interval(Duration::from_secs(10))
///     .lazy_connect(true);
/// ```
#[derive(Clone)]
pub struct ClusterOptions {
    /// Nodes used to discover the rest of the cluster. `host:port` or
    /// `redis://host:port` forms are accepted.
    pub startup_nodes: Vec<String>,
    /// Reconnect delay strategy consulted after every close.
    pub cluster_retry_strategy: RetryStrategy,
    /// Buffer commands submitted before the cluster is ready. When false
    /// such commands are rejected instead.
    pub enable_offline_queue: bool,
    /// Capacity of the offline queue.
    pub offline_queue_limit: usize,
    /// Gate `ready` on the cluster reporting a healthy state.
    pub enable_ready_check: bool,
    /// Routing policy for readonly commands.
    pub scale_reads: ScaleReads,
    /// Redirection budget per command.
    pub max_redirections: u32,
    /// Coalescing delay for retries after a connection loss while ready.
    pub retry_delay_on_failover: Duration,
    /// Coalescing delay for retries after a cluster-down reply. Zero
    /// disables the retry and surfaces the error.
    pub retry_delay_on_cluster_down: Duration,
    /// Coalescing delay for retries after a try-again reply.
    pub retry_delay_on_try_again: Duration,
    /// Per-node timeout for the slot layout query.
    pub slots_refresh_timeout: Duration,
    /// Cadence of the periodic topology refresh once ready.
    pub slots_refresh_interval: Duration,
    /// Stay in `wait` until the first command instead of connecting
    /// eagerly.
    pub lazy_connect: bool,
    /// Options handed to every node client.
    pub node_options: NodeOptions,
}

impl ClusterOptions {
    /// Creates options with the given startup nodes and defaults for
    /// everything else.
    pub fn new(startup_nodes: Vec<String>) -> Self {
        Self {
            startup_nodes,
            cluster_retry_strategy: Arc::new(default_retry_strategy),
            enable_offline_queue: true,
            offline_queue_limit: 4096,
            enable_ready_check: true,
            scale_reads: ScaleReads::Master,
            max_redirections: 16,
            retry_delay_on_failover: Duration::from_millis(100),
            retry_delay_on_cluster_down: Duration::from_millis(100),
            retry_delay_on_try_again: Duration::from_millis(100),
            slots_refresh_timeout: Duration::from_millis(1000),
            slots_refresh_interval: Duration::from_millis(5000),
            lazy_connect: false,
            node_options: NodeOptions::default(),
        }
    }

    /// Sets the reconnect delay strategy.
    #[inline]
    pub fn cluster_retry_strategy(
        mut self,
        strategy: impl Fn(u32) -> Option<Duration> + Send + Sync + 'static,
    ) -> Self {
        self.cluster_retry_strategy = Arc::new(strategy);
        self
    }

    /// Enables or disables the offline queue.
    #[inline]
    pub fn enable_offline_queue(mut self, enabled: bool) -> Self {
        self.enable_offline_queue = enabled;
        self
    }

    /// Sets the offline queue capacity.
    #[inline]
    pub fn offline_queue_limit(mut self, limit: usize) -> Self {
        self.offline_queue_limit = limit;
        self
    }

    /// Enables or disables the ready check.
    #[inline]
    pub fn enable_ready_check(mut self, enabled: bool) -> Self {
        self.enable_ready_check = enabled;
        self
    }

    /// Sets the read-scaling policy.
    #[inline]
    pub fn scale_reads(mut self, scale_reads: ScaleReads) -> Self {
        self.scale_reads = scale_reads;
        self
    }

    /// Sets the per-command redirection budget.
    #[inline]
    pub fn max_redirections(mut self, max: u32) -> Self {
        self.max_redirections = max;
        self
    }

    /// Sets the failover retry delay.
    #[inline]
    pub fn retry_delay_on_failover(mut self, delay: Duration) -> Self {
        self.retry_delay_on_failover = delay;
        self
    }

    /// Sets the cluster-down retry delay. Zero disables the retry.
    #[inline]
    pub fn retry_delay_on_cluster_down(mut self, delay: Duration) -> Self {
        self.retry_delay_on_cluster_down = delay;
        self
    }

    /// Sets the try-again retry delay.
    #[inline]
    pub fn retry_delay_on_try_again(mut self, delay: Duration) -> Self {
        self.retry_delay_on_try_again = delay;
        self
    }

    /// Sets the per-node slot layout query timeout.
    #[inline]
    pub fn slots_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.slots_refresh_timeout = timeout;
        self
    }

    /// Sets the periodic refresh cadence.
    #[inline]
    pub fn slots_refresh_interval(mut self, interval: Duration) -> Self {
        self.slots_refresh_interval = interval;
        self
    }

    /// Enables or disables lazy connect.
    #[inline]
    pub fn lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy_connect = lazy;
        self
    }

    /// Sets the options handed to every node client.
    #[inline]
    pub fn node_options(mut self, node_options: NodeOptions) -> Self {
        self.node_options = node_options;
        self
    }

    /// Parses the startup nodes into `(host, port)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the list is empty or an
    /// address cannot be parsed.
    pub fn startup_endpoints(&self) -> Result<Vec<(String, u16)>> {
        if self.startup_nodes.is_empty() {
            return Err(Error::InvalidArgument {
                message: "startup nodes should contain at least one node".to_string(),
            });
        }
        self.startup_nodes
            .iter()
            .map(|addr| parse_node_address(addr))
            .collect()
    }
}

impl fmt::Debug for ClusterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterOptions")
            .field("startup_nodes", &self.startup_nodes)
            .field("enable_offline_queue", &self.enable_offline_queue)
            .field("enable_ready_check", &self.enable_ready_check)
            .field("scale_reads", &self.scale_reads)
            .field("max_redirections", &self.max_redirections)
            .field("slots_refresh_interval", &self.slots_refresh_interval)
            .field("lazy_connect", &self.lazy_connect)
            .finish_non_exhaustive()
    }
}

/// Default reconnect strategy: `min(100 + attempts * 2, 2000)` ms, never
/// giving up.
fn default_retry_strategy(attempts: u32) -> Option<Duration> {
    let ms = (100 + u64::from(attempts) * 2).min(2000);
    Some(Duration::from_millis(ms))
}

/// Parses `host:port`, `redis://host:port` or `rediss://host:port` into a
/// `(host, port)` pair. Bracketed IPv6 hosts keep their brackets so the
/// canonical `host:port` key form round-trips.
pub(crate) fn parse_node_address(addr: &str) -> Result<(String, u16)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(Error::InvalidArgument {
            message: "empty node address".to_string(),
        });
    }

    if addr.starts_with("redis://") || addr.starts_with("rediss://") {
        let parsed = url::Url::parse(addr).map_err(|e| Error::InvalidArgument {
            message: format!("invalid node address {}: {}", addr, e),
        })?;
        let host = parsed.host_str().ok_or_else(|| Error::InvalidArgument {
            message: format!("missing host in {}", addr),
        })?;
        // Url::host_str already brackets IPv6 hosts.
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        return Ok((host, parsed.port().unwrap_or(6379)));
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| Error::InvalidArgument {
        message: format!("missing port in node address {}", addr),
    })?;
    let port: u16 = port.parse().map_err(|_| Error::InvalidArgument {
        message: format!("invalid port in node address {}", addr),
    })?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let options = ClusterOptions::new(vec!["127.0.0.1:7000".into()]);
        assert!(options.enable_offline_queue);
        assert!(options.enable_ready_check);
        assert_eq!(options.max_redirections, 16);
        assert_eq!(options.retry_delay_on_failover, Duration::from_millis(100));
        assert_eq!(
            options.retry_delay_on_cluster_down,
            Duration::from_millis(100)
        );
        assert_eq!(
            options.retry_delay_on_try_again,
            Duration::from_millis(100)
        );
        assert_eq!(options.slots_refresh_timeout, Duration::from_millis(1000));
        assert_eq!(options.slots_refresh_interval, Duration::from_millis(5000));
        assert!(!options.lazy_connect);
        assert!(matches!(options.scale_reads, ScaleReads::Master));
    }

    #[test]
    fn default_retry_strategy_curve() {
        assert_eq!(
            default_retry_strategy(1),
            Some(Duration::from_millis(102))
        );
        assert_eq!(
            default_retry_strategy(50),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            default_retry_strategy(5000),
            Some(Duration::from_millis(2000))
        );
    }

    #[test]
    fn parse_plain_address() {
        assert_eq!(
            parse_node_address("127.0.0.1:7000").unwrap(),
            ("127.0.0.1".to_string(), 7000)
        );
        assert_eq!(
            parse_node_address("  node-1.local:6379  ").unwrap(),
            ("node-1.local".to_string(), 6379)
        );
    }

    #[test]
    fn parse_url_address() {
        assert_eq!(
            parse_node_address("redis://127.0.0.1:7000").unwrap(),
            ("127.0.0.1".to_string(), 7000)
        );
        assert_eq!(
            parse_node_address("redis://example.com").unwrap(),
            ("example.com".to_string(), 6379)
        );
    }

    #[test]
    fn parse_ipv6_address() {
        assert_eq!(
            parse_node_address("[::1]:7000").unwrap(),
            ("[::1]".to_string(), 7000)
        );
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(parse_node_address("").is_err());
        assert!(parse_node_address("no-port").is_err());
        assert!(parse_node_address("host:notaport").is_err());
    }

    #[test]
    fn startup_endpoints_rejects_empty_list() {
        let options = ClusterOptions::new(Vec::new());
        assert!(options.startup_endpoints().is_err());
    }
}
