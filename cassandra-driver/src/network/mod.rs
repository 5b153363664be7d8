//! Connections to a single node and the stream ids multiplexed over them.

pub mod connection;
pub mod stream_table;
#[cfg(feature = "openssl-010")]
pub mod tls;

pub use connection::{Connection, ConnectionId, ConnectionState, RequestStream};
pub use stream_table::{StreamGuard, StreamId, StreamTable, MAX_STREAMS};
