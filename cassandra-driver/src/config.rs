//! Configuration of connections, per-host pools and sessions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cassandra_cql::frame::response::event::Event;
use cassandra_cql::frame::Compression;
use cassandra_cql::Consistency;
use tokio::sync::mpsc;

use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy, RoundRobinPolicy};
use crate::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};

/// Default port of the native protocol.
pub const DEFAULT_PORT: u16 = 9042;

/// Username and password sent in answer to an AUTHENTICATE challenge.
#[derive(Clone)]
pub struct PlainTextCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for PlainTextCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainTextCredentials")
            .field("username", &self.username)
            .field("password", &"<hidden>")
            .finish()
    }
}

/// Settings of a single connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Preferred compression. Falls back to none if the server does not offer it.
    pub compression: Option<Compression>,
    pub tcp_nodelay: bool,
    /// Idle time after which TCP keepalive probes start. `None` disables keepalive.
    pub tcp_keepalive_interval: Option<Duration>,
    #[cfg(feature = "openssl-010")]
    pub ssl_context: Option<openssl::ssl::SslContext>,
    pub credentials: Option<PlainTextCredentials>,
    /// Bounds the TCP connect together with the whole startup handshake.
    pub connect_timeout: Duration,
    /// When set, the connection registers for all server events and pushes them here.
    pub event_sender: Option<mpsc::Sender<Event>>,
    /// Consistency used for internal queries such as `USE`.
    pub default_consistency: Consistency,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            #[cfg(feature = "openssl-010")]
            ssl_context: None,
            credentials: None,
            connect_timeout: Duration::from_secs(5),
            event_sender: None,
            default_consistency: Consistency::One,
        }
    }
}

/// Pool sizing for hosts of one [`HostDistance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DistancePooling {
    /// Connections kept in the active pool before idle ones are moved to the trashcan.
    pub core_connections: usize,
    /// Hard limit of connections open to one host.
    pub max_connections: usize,
    /// A connection with this many requests in flight is considered busy.
    pub max_simultaneous_requests_threshold: usize,
    /// A connection with at most this many requests in flight may be retired.
    pub min_simultaneous_requests_threshold: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolingOptions {
    pub local: DistancePooling,
    pub remote: DistancePooling,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        Self {
            local: DistancePooling {
                core_connections: 2,
                max_connections: 8,
                max_simultaneous_requests_threshold: 100,
                min_simultaneous_requests_threshold: 25,
            },
            remote: DistancePooling {
                core_connections: 1,
                max_connections: 2,
                max_simultaneous_requests_threshold: 100,
                min_simultaneous_requests_threshold: 25,
            },
        }
    }
}

impl PoolingOptions {
    /// Ignored hosts get no connections at all.
    pub fn for_distance(&self, distance: HostDistance) -> Option<&DistancePooling> {
        match distance {
            HostDistance::Local => Some(&self.local),
            HostDistance::Remote => Some(&self.remote),
            HostDistance::Ignored => None,
        }
    }
}

/// Configuration options for [`Session`](crate::Session).
///
/// Usually built with [`SessionBuilder`](crate::SessionBuilder).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Nodes to connect to, as `host` or `host:port`; hostnames are resolved once at startup.
    pub known_nodes: Vec<String>,
    /// Port used for known nodes given without one.
    pub port: u16,
    pub connection: ConnectionConfig,
    pub pooling: PoolingOptions,
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Upper bound for the `USE`/`PREPARE` round-trips done before a connection is handed out.
    pub sync_timeout: Duration,
    /// How often the trashcan frees its idle connections.
    pub trashcan_sweep_interval: Duration,
    /// Keyspace selected on every connection at startup.
    pub keyspace: Option<String>,
}

impl SessionConfig {
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            port: DEFAULT_PORT,
            connection: ConnectionConfig::default(),
            pooling: PoolingOptions::default(),
            load_balancing: Arc::new(RoundRobinPolicy::new()),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            sync_timeout: Duration::from_secs(30),
            trashcan_sweep_interval: Duration::from_secs(10),
            keyspace: None,
        }
    }

    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes.push(hostname.as_ref().to_string());
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooling_defaults() {
        let pooling = PoolingOptions::default();
        let local = pooling.for_distance(HostDistance::Local).unwrap();
        assert_eq!(
            (
                local.core_connections,
                local.max_connections,
                local.max_simultaneous_requests_threshold,
                local.min_simultaneous_requests_threshold
            ),
            (2, 8, 100, 25)
        );
        let remote = pooling.for_distance(HostDistance::Remote).unwrap();
        assert_eq!((remote.core_connections, remote.max_connections), (1, 2));
        assert!(pooling.for_distance(HostDistance::Ignored).is_none());
    }

    #[test]
    fn session_defaults() {
        let config = SessionConfig::new();
        assert_eq!(config.port, 9042);
        assert_eq!(config.sync_timeout, Duration::from_secs(30));
        assert_eq!(config.trashcan_sweep_interval, Duration::from_secs(10));
        assert!(config.connection.tcp_nodelay);
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = PlainTextCredentials {
            username: "cassandra".to_owned(),
            password: "secret".to_owned(),
        };
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("cassandra"));
        assert!(!debug.contains("secret"));
    }
}
