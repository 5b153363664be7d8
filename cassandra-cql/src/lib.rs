//! Defines CQL native protocol (version 1) frames, primitive types and
//! response decoding for interacting with Cassandra.
//!
//! Mainly intended to be used by the `cassandra-driver` crate, but can also be
//! useful for other applications that need to speak CQL, e.g. test servers.

pub mod errors;
pub mod frame;

pub use crate::frame::types::Consistency;
