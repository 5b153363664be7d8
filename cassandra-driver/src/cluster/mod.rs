//! Hosts of the cluster and their up/down bookkeeping.

mod host;

pub use host::{Host, HostRegistry};
