//! Types of events a connection can REGISTER for.

use std::fmt;
use std::str::FromStr;

use super::frame_errors::ParseError;

/// Represents the type of a CQL event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(clippy::enum_variant_names)]
pub enum EventType {
    /// A node was added to or removed from the cluster.
    TopologyChange,
    /// A node went up or down.
    StatusChange,
    /// A keyspace or table was created, updated or dropped.
    SchemaChange,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match &self {
            Self::TopologyChange => "TOPOLOGY_CHANGE",
            Self::StatusChange => "STATUS_CHANGE",
            Self::SchemaChange => "SCHEMA_CHANGE",
        };

        write!(f, "{s}")
    }
}

impl FromStr for EventType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(Self::TopologyChange),
            "STATUS_CHANGE" => Ok(Self::StatusChange),
            "SCHEMA_CHANGE" => Ok(Self::SchemaChange),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type event type: {}",
                s
            ))),
        }
    }
}
