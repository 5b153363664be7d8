use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::policies::reconnection::ReconnectionSchedule;
use crate::Endpoint;

struct HostState {
    up: bool,
    /// Created fresh on every up -> down transition.
    schedule: Option<Box<dyn ReconnectionSchedule>>,
    /// When the next reconnection attempt is due. Only set while down.
    next_up_time: Option<Instant>,
}

/// A node of the cluster, as known to the session.
pub struct Host {
    endpoint: Endpoint,
    datacenter: String,
    rack: String,
    state: Mutex<HostState>,
}

impl Host {
    pub fn new(endpoint: Endpoint, datacenter: impl Into<String>, rack: impl Into<String>) -> Self {
        Host {
            endpoint,
            datacenter: datacenter.into(),
            rack: rack.into(),
            state: Mutex::new(HostState {
                up: true,
                schedule: None,
                next_up_time: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Empty when unknown.
    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub fn rack(&self) -> &str {
        &self.rack
    }

    pub fn is_up(&self) -> bool {
        self.state().up
    }

    /// Up, or down with its next reconnection attempt already due.
    pub fn is_considerably_up(&self) -> bool {
        let state = self.state();
        state.up
            || state
                .next_up_time
                .is_some_and(|next_up_time| next_up_time <= Instant::now())
    }

    /// Marks the host down, starting `schedule` for its reconnection attempts.
    /// Returns false, dropping `schedule`, if the host was already down.
    pub fn set_down(&self, mut schedule: Box<dyn ReconnectionSchedule>) -> bool {
        let mut state = self.state();
        if !state.up {
            return false;
        }
        let delay = schedule.get_delay();
        state.up = false;
        state.schedule = Some(schedule);
        state.next_up_time = Some(Instant::now() + delay);
        debug!(endpoint = %self.endpoint, ?delay, "Host marked down");
        true
    }

    /// Returns false if the host was already up.
    pub fn bring_up(&self) -> bool {
        let mut state = self.state();
        if state.up {
            return false;
        }
        state.up = true;
        state.schedule = None;
        state.next_up_time = None;
        info!(endpoint = %self.endpoint, "Host is up");
        true
    }

    /// How long until the next reconnection attempt is due; `None` while up.
    pub fn time_until_next_attempt(&self) -> Option<Duration> {
        let state = self.state();
        if state.up {
            return None;
        }
        let now = Instant::now();
        Some(
            state
                .next_up_time
                .map_or(Duration::ZERO, |next_up_time| {
                    next_up_time.saturating_duration_since(now)
                }),
        )
    }

    /// Moves the next attempt one schedule step ahead after a failed one.
    /// Returns the delay, or `None` if the host is up.
    pub fn advance_schedule(&self) -> Option<Duration> {
        let mut state = self.state();
        if state.up {
            return None;
        }
        let delay = state.schedule.as_mut()?.get_delay();
        state.next_up_time = Some(Instant::now() + delay);
        Some(delay)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("endpoint", &self.endpoint)
            .field("datacenter", &self.datacenter)
            .field("rack", &self.rack)
            .field("up", &self.is_up())
            .finish()
    }
}

/// All hosts known to a session, ordered by endpoint.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: Mutex<BTreeMap<Endpoint, Arc<Host>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn hosts(&self) -> MutexGuard<'_, BTreeMap<Endpoint, Arc<Host>>> {
        self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an up host, or returns the one already registered under `endpoint`.
    pub fn add_host(
        &self,
        endpoint: Endpoint,
        datacenter: impl Into<String>,
        rack: impl Into<String>,
    ) -> Arc<Host> {
        self.hosts()
            .entry(endpoint)
            .or_insert_with(|| Arc::new(Host::new(endpoint, datacenter, rack)))
            .clone()
    }

    pub fn get(&self, endpoint: Endpoint) -> Option<Arc<Host>> {
        self.hosts().get(&endpoint).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Host>> {
        self.hosts().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hosts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts().is_empty()
    }

    pub fn try_remove(&self, endpoint: Endpoint) -> Option<Arc<Host>> {
        self.hosts().remove(&endpoint)
    }

    pub fn bring_up(&self, endpoint: Endpoint) -> bool {
        self.get(endpoint).is_some_and(|host| host.bring_up())
    }

    pub fn set_down(&self, endpoint: Endpoint, schedule: Box<dyn ReconnectionSchedule>) -> bool {
        self.get(endpoint)
            .is_some_and(|host| host.set_down(schedule))
    }
}
