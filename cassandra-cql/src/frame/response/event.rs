use crate::frame::frame_errors::ParseError;
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

/// Version 1 schema events name a keyspace and, for table changes, a table.
/// An empty table name means the keyspace itself changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub keyspace_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let event_type: EventType = types::read_string(buf)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let change_type = SchemaChangeType::from(types::read_string(buf)?);
        let keyspace_name = types::read_string(buf)?.to_string();
        let table_name = types::read_string(buf)?.to_string();

        Ok(Self {
            change_type,
            keyspace_name,
            table_name,
        })
    }
}

impl From<&str> for SchemaChangeType {
    fn from(s: &str) -> Self {
        match s {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of change ({}) in TopologyChangeEvent",
                type_of_change
            ))),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of status change ({}) in StatusChangeEvent",
                type_of_change
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn status_change_event() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 9042);
        let mut buf = Vec::new();
        types::write_string("STATUS_CHANGE", &mut buf).unwrap();
        types::write_string("DOWN", &mut buf).unwrap();
        types::write_inet(addr, &mut buf);

        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(event, Event::StatusChange(StatusChangeEvent::Down(addr)));
    }

    #[test]
    fn schema_change_event() {
        let mut buf = Vec::new();
        types::write_string("SCHEMA_CHANGE", &mut buf).unwrap();
        types::write_string("CREATED", &mut buf).unwrap();
        types::write_string("km", &mut buf).unwrap();
        types::write_string("test_cf", &mut buf).unwrap();

        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            event,
            Event::SchemaChange(SchemaChangeEvent {
                change_type: SchemaChangeType::Created,
                keyspace_name: "km".to_string(),
                table_name: "test_cf".to_string(),
            })
        );
    }

    #[test]
    fn unknown_event_type() {
        let mut buf = Vec::new();
        types::write_string("SOMETHING_ELSE", &mut buf).unwrap();
        assert!(Event::deserialize(&mut &buf[..]).is_err());
    }
}
