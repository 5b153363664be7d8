//! Load balancing configurations\
//! `Session` can use any load balancing policy which implements the `LoadBalancingPolicy` trait

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cluster::{Host, HostRegistry};

mod dc_aware;
mod round_robin;

pub use dc_aware::DcAwareRoundRobinPolicy;
pub use round_robin::RoundRobinPolicy;

/// How far a host is from the client, which decides the size of its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostDistance {
    Local,
    Remote,
    /// The host is never queried and gets no connections.
    Ignored,
}

/// Decides the order in which hosts are tried for a request.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the hosts to try, most preferred first. Hosts at
    /// [`HostDistance::Ignored`] are never part of a plan. Whether a host is
    /// currently up is left to the caller.
    fn new_query_plan(&self, hosts: &HostRegistry) -> Vec<Arc<Host>>;

    /// Returns the distance of `host`, given all `hosts` currently known.
    fn distance(&self, host: &Host, hosts: &HostRegistry) -> HostDistance;

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

/// Shared round-robin cursor. Starts at a random offset so that clients
/// started together do not all hit the same host first.
#[derive(Debug)]
struct Rotation {
    index: AtomicUsize,
}

impl Rotation {
    fn new() -> Self {
        Rotation {
            index: AtomicUsize::new(rand::random::<u32>() as usize),
        }
    }

    /// Rotation to use for the next plan.
    fn next(&self) -> usize {
        self.index.fetch_add(1, Ordering::Relaxed)
    }
}

/// Returns `items` rotated left by `rotation` (modulo its length).
fn rotated_left<T: Clone>(items: &[T], rotation: usize) -> impl Iterator<Item = T> + '_ {
    let mid = if items.is_empty() {
        0
    } else {
        rotation % items.len()
    };
    items[mid..].iter().chain(items[..mid].iter()).cloned()
}
