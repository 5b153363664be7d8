use std::sync::Arc;

use tracing::trace;

use super::{rotated_left, HostDistance, LoadBalancingPolicy, Rotation};
use crate::cluster::{Host, HostRegistry};

/// Round-robin over the hosts of the local datacenter first, then over at
/// most `used_hosts_per_remote_dc` hosts of every other datacenter.
///
/// A host with no datacenter, or the datacenter `"unknown"`, counts as local.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    used_hosts_per_remote_dc: usize,
    rotation: Rotation,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: impl Into<String>, used_hosts_per_remote_dc: usize) -> Self {
        Self {
            local_dc: local_dc.into(),
            used_hosts_per_remote_dc,
            rotation: Rotation::new(),
        }
    }

    pub fn local_dc(&self) -> &str {
        &self.local_dc
    }

    fn is_local(&self, host: &Host) -> bool {
        let dc = host.datacenter();
        dc.is_empty() || dc == "unknown" || dc == self.local_dc
    }

    /// Position of `host` among the hosts of its datacenter, in registry order.
    fn index_in_dc(host: &Host, all: &[Arc<Host>]) -> Option<usize> {
        all.iter()
            .filter(|other| other.datacenter() == host.datacenter())
            .position(|other| other.endpoint() == host.endpoint())
    }

    fn remote_distance(&self, host: &Host, all: &[Arc<Host>]) -> HostDistance {
        match Self::index_in_dc(host, all) {
            Some(index) if index < self.used_hosts_per_remote_dc => HostDistance::Remote,
            _ => HostDistance::Ignored,
        }
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn new_query_plan(&self, hosts: &HostRegistry) -> Vec<Arc<Host>> {
        let all = hosts.all();
        let (local, remote): (Vec<_>, Vec<_>) =
            all.iter().cloned().partition(|host| self.is_local(host));
        let remote: Vec<_> = remote
            .into_iter()
            .filter(|host| self.remote_distance(host, &all) == HostDistance::Remote)
            .collect();

        let rotation = self.rotation.next();
        let plan: Vec<Arc<Host>> = rotated_left(&local, rotation)
            .chain(rotated_left(&remote, rotation))
            .collect();
        trace!(
            local_dc = %self.local_dc,
            plan = ?plan.iter().map(|host| host.endpoint()).collect::<Vec<_>>(),
            "DcAwareRoundRobin policy"
        );
        plan
    }

    fn distance(&self, host: &Host, hosts: &HostRegistry) -> HostDistance {
        if self.is_local(host) {
            return HostDistance::Local;
        }
        self.remote_distance(host, &hosts.all())
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_string()
    }
}
