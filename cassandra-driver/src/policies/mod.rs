//! Policies consulted by the session: which hosts to try, when to retry,
//! and how long to wait before reconnecting to a host that went down.

pub mod load_balancing;
pub mod reconnection;
pub mod retry;
