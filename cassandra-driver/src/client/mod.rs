//! This module holds entities that represent the whole database session.

use std::collections::HashMap;
use std::sync::Arc;

use crate::network::{Connection, ConnectionId};

mod prepared;
pub mod session;
pub mod session_builder;
mod trashcan;

pub use prepared::PreparedStatement;

/// Connections to a single host, by id.
pub(crate) type ConnectionsCollection = HashMap<ConnectionId, Arc<Connection>>;
