//! This module contains various errors which can be returned by the driver.

use std::net::SocketAddr;
use std::sync::Arc;

pub use cassandra_cql::errors::{DbError, WriteType};
use cassandra_cql::frame::frame_errors::{CellAccessError, FrameError, ParseError};
use cassandra_cql::frame::response;
use thiserror::Error;

/// Message carried by requests that were pending on a connection when it was closed.
pub(crate) const CONNECTION_CLOSED_MESSAGE: &str = "The connection was closed.";

/// Error that occurred during query execution
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum QueryError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Caller passed an invalid query
    #[error("Invalid query: {0}")]
    BadQuery(String),

    /// Input/Output error has occurred, connection broken etc.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// The connection's read loop or writer stopped; every pending request on it fails.
    #[error("Connection broken: {0}")]
    BrokenConnection(String),

    /// The request was pending on a connection that was closed.
    #[error("{}", CONNECTION_CLOSED_MESSAGE)]
    ConnectionClosed,

    /// Unexpected message received
    #[error("Protocol Error: {0}")]
    ProtocolError(&'static str),

    /// Invalid message received
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Timeout error has occurred, function didn't complete in time.
    #[error("Timeout Error")]
    TimeoutError,

    #[error(
        "Too many streams. The maximum value of parallel requests is 127 \
        (1 is reserved by this library)"
    )]
    UnableToAllocStreamId,

    /// No host in the query plan could provide a connection.
    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailable),

    /// Opening a new connection failed.
    #[error("Could not open a connection: {0}")]
    ConnectionError(Box<ConnectionError>),

    /// The session was closed.
    #[error("The session is closed")]
    SessionClosed,
}

impl QueryError {
    /// Whether the error means the connection it happened on can no longer be used.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            QueryError::IoError(_)
                | QueryError::BrokenConnection(_)
                | QueryError::ConnectionClosed
                | QueryError::ConnectionError(_)
        )
    }
}

impl From<std::io::Error> for QueryError {
    fn from(io_error: std::io::Error) -> QueryError {
        QueryError::IoError(Arc::new(io_error))
    }
}

impl From<ParseError> for QueryError {
    fn from(parse_error: ParseError) -> QueryError {
        QueryError::InvalidMessage(format!("Error parsing message: {}", parse_error))
    }
}

impl From<FrameError> for QueryError {
    fn from(frame_error: FrameError) -> QueryError {
        QueryError::InvalidMessage(format!("Frame error: {}", frame_error))
    }
}

impl From<CellAccessError> for QueryError {
    fn from(access_error: CellAccessError) -> QueryError {
        QueryError::InvalidMessage(access_error.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for QueryError {
    fn from(_timer_error: tokio::time::error::Elapsed) -> QueryError {
        QueryError::TimeoutError
    }
}

impl From<response::Error> for QueryError {
    fn from(error: response::Error) -> QueryError {
        QueryError::DbError(error.error, error.reason)
    }
}

impl From<ConnectionError> for QueryError {
    fn from(error: ConnectionError) -> QueryError {
        QueryError::ConnectionError(Box::new(error))
    }
}

/// Returned when every host of a query plan was skipped or refused a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No host available, tried: {tried:?}")]
pub struct NoHostAvailable {
    /// Hosts that were considered up and attempted, in plan order.
    pub tried: Vec<SocketAddr>,
}

/// Error that occurred while opening a connection and running its handshake
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// A request of the OPTIONS/STARTUP/CREDENTIALS/REGISTER exchange failed.
    #[error("{request} request failed during connection setup: {error}")]
    SetupRequest {
        request: &'static str,
        error: Box<QueryError>,
    },

    #[error("Server requires authentication ({0}), but no credentials were provided")]
    MissingCredentials(String),

    #[error("Connection was closed")]
    Closed,
}

impl From<std::io::Error> for ConnectionError {
    fn from(io_error: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(io_error))
    }
}

impl ConnectionError {
    pub(crate) fn setup(request: &'static str) -> impl FnOnce(QueryError) -> ConnectionError {
        move |error| ConnectionError::SetupRequest {
            request,
            error: Box::new(error),
        }
    }
}

/// Error that occurred during session creation
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// Failed to resolve hostname passed in Session creation
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// List of known nodes passed to Session constructor is empty
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),

    /// Could not reach any of the known nodes, or the initial keyspace was rejected.
    #[error(transparent)]
    QueryError(#[from] QueryError),
}

/// A configuration value was out of its accepted range.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid argument: {0}")]
pub struct InvalidArgument(pub String);
