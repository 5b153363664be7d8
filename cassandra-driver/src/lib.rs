//! Async Rust driver for [Apache Cassandra™](https://cassandra.apache.org/), speaking
//! version 1 of the CQL native protocol.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Session]\
//! `Session` is created by specifying a few known nodes and connecting to them:
//!
//! ```rust,no_run
//! use cassandra_driver::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!    let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .known_node("1.2.3.4:9876")
//!         .build()
//!         .await?;
//!
//!    Ok(())
//! }
//! ```
//! The session keeps a pool of connections to every host it may use. Each
//! connection multiplexes up to 127 concurrent requests over one socket.
//!
//! ### Making queries
//! ```rust
//! # use cassandra_driver::{Consistency, Session};
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! use bytes::Bytes;
//!
//! session
//!     .query("CREATE KEYSPACE ks WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 1}", Consistency::One)
//!     .await?;
//! session.use_keyspace("ks").await?;
//!
//! let prepared = session.prepare("INSERT INTO tab (a) VALUES (?)").await?;
//! session
//!     .execute(&prepared, &[Some(Bytes::from_static(&[0, 0, 0, 2]))], Consistency::Quorum)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Receiving results
//! ```rust
//! # use cassandra_driver::{Consistency, QueryResult, Session};
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! if let QueryResult::Rows(mut rows) = session
//!     .query("SELECT a, b FROM ks.tab", Consistency::One)
//!     .await?
//! {
//!     // The cursor starts before the first row.
//!     while rows.next() {
//!         let a: i32 = rows.get_int(0)?;
//!         let b: &str = rows.get_string("b")?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod frame {
    pub use cassandra_cql::frame::{frame_errors, Compression};

    pub mod response {
        pub use cassandra_cql::frame::response::event;

        pub mod result {
            pub use cassandra_cql::frame::response::result::*;
        }
    }
}

pub mod client;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod network;
pub mod policies;

/// Address of a node's native protocol port.
pub type Endpoint = std::net::SocketAddr;

pub use cassandra_cql::frame::Compression;
pub use cassandra_cql::Consistency;

pub use client::session::{QueryResult, Session};
pub use client::session_builder::SessionBuilder;
pub use client::PreparedStatement;
pub use cluster::{Host, HostRegistry};
pub use config::{ConnectionConfig, PoolingOptions, SessionConfig};
pub use errors::{NewSessionError, QueryError};
