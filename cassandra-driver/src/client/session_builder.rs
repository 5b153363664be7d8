//! SessionBuilder provides an easy way to create new Sessions

use std::sync::Arc;
use std::time::Duration;

use cassandra_cql::frame::response::event::Event;
use cassandra_cql::frame::Compression;
use cassandra_cql::Consistency;
#[cfg(feature = "openssl-010")]
use openssl::ssl::SslContext;
use tokio::sync::mpsc;

use super::session::Session;
use crate::config::{PlainTextCredentials, PoolingOptions, SessionConfig};
use crate::errors::NewSessionError;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::reconnection::ReconnectionPolicy;
use crate::policies::retry::RetryPolicy;

/// SessionBuilder is used to create new Session instances
/// # Example
///
/// ```
/// # use cassandra_driver::{Session, SessionBuilder};
/// # use cassandra_driver::Compression;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .compression(Some(Compression::Snappy))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// Creates new SessionBuilder with default configuration
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Add a known node with a hostname, or `hostname:port`.
    /// Nodes without a port use the one set with [`port`](Self::port).
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        for hostname in hostnames {
            self.config.add_known_node(hostname);
        }
        self
    }

    /// Port used for known nodes given without one. The default is 9042.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set preferred Compression algorithm.
    /// The default is no compression.
    /// If it is not supported by database server Session will fall back to no compression.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.connection.compression = compression;
        self
    }

    /// Set username and password for plain text authentication.
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.connection.credentials = Some(PlainTextCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn pooling(mut self, pooling: PoolingOptions) -> Self {
        self.config.pooling = pooling;
        self
    }

    /// Set the policy deciding the order in which hosts are tried, and how far they are.
    /// The default is round robin over all hosts.
    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing = policy;
        self
    }

    /// The default retries once on some timeouts, see
    /// [`DefaultRetryPolicy`](crate::policies::retry::DefaultRetryPolicy).
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// The default waits 1 second after a host goes down, doubling up to 10 minutes.
    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.config.reconnection_policy = policy;
        self
    }

    /// Limits the keyspace and prepared statement synchronization done before a
    /// connection is handed out. The default is 30 seconds.
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout = timeout;
        self
    }

    /// How often idle connections parked after a traffic spike are closed.
    /// The default is 10 seconds.
    pub fn trashcan_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.trashcan_sweep_interval = interval;
        self
    }

    /// Keyspace to `USE` when the session starts.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>) -> Self {
        self.config.keyspace = Some(keyspace_name.into());
        self
    }

    /// Consistency of statements the driver issues on its own, like `USE`.
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.connection.default_consistency = consistency;
        self
    }

    /// Set the nodelay TCP flag.
    /// The default is true.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.connection.tcp_nodelay = nodelay;
        self
    }

    /// Set the TCP keepalive interval.
    /// The default is `None`, which implies that no keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        if interval <= Duration::from_secs(1) {
            tracing::warn!(
                "Setting the TCP keepalive interval to low values ({:?}) is not recommended as it can have a negative impact on performance. Consider setting it above 1 second.",
                interval
            );
        }

        self.config.connection.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Bounds the TCP connect and handshake of every new connection.
    /// The default is 5 seconds.
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connection.connect_timeout = duration;
        self
    }

    /// Receive every topology, status and schema change event the cluster pushes.
    pub fn event_sender(mut self, sender: mpsc::Sender<Event>) -> Self {
        self.config.connection.event_sender = Some(sender);
        self
    }

    /// ssl feature
    /// Provide SessionBuilder with SslContext from openssl crate that will be
    /// used to create an ssl connection to the database.
    /// If set to None SSL connection won't be used.
    /// Default is None.
    #[cfg(feature = "openssl-010")]
    pub fn ssl_context(mut self, ssl_context: Option<SslContext>) -> Self {
        self.config.connection.ssl_context = ssl_context;
        self
    }

    /// Builds the Session after setting all the options
    pub async fn build(self) -> Result<Session, NewSessionError> {
        Session::connect(self.config).await
    }
}
