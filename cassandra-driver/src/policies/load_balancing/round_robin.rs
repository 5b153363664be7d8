use std::sync::Arc;

use tracing::trace;

use super::{rotated_left, HostDistance, LoadBalancingPolicy, Rotation};
use crate::cluster::{Host, HostRegistry};

/// Tries every known host, starting one further on each plan. All hosts are local.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    rotation: Rotation,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            rotation: Rotation::new(),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn new_query_plan(&self, hosts: &HostRegistry) -> Vec<Arc<Host>> {
        let all = hosts.all();
        let plan: Vec<Arc<Host>> = rotated_left(&all, self.rotation.next()).collect();
        trace!(
            plan = ?plan.iter().map(|host| host.endpoint()).collect::<Vec<_>>(),
            "RoundRobin policy"
        );
        plan
    }

    fn distance(&self, _host: &Host, _hosts: &HostRegistry) -> HostDistance {
        HostDistance::Local
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}
