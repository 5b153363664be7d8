//! `Session` is the main object used in the driver.
//! It manages the per-host connection pools and runs statements on them.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use cassandra_cql::errors::DbError;
use cassandra_cql::frame::request::{Execute, Prepare, Query};
use cassandra_cql::frame::response::{result, NonErrorResponse, Response};
use cassandra_cql::Consistency;
use futures::future::RemoteHandle;
use futures::FutureExt;
use itertools::Itertools;
use tracing::{debug, info, trace, warn};

use super::prepared::{PreparedStatement, PreparedStatementRegistry};
use super::trashcan::Trashcan;
use super::ConnectionsCollection;
use crate::cluster::{Host, HostRegistry};
use crate::config::{DistancePooling, SessionConfig};
use crate::errors::{InvalidArgument, NewSessionError, NoHostAvailable, QueryError};
use crate::network::connection::validate_keyspace_name;
use crate::network::{Connection, RequestStream};
use crate::policies::retry::{self, RetryDecision};
use crate::Endpoint;

/// Result of a statement: rows, or an acknowledgement of some kind.
pub type QueryResult = result::Result;

/// Session manages connections to the cluster and allows to execute CQL statements.
pub struct Session {
    inner: Arc<SessionInner>,
    _sweeper_handle: RemoteHandle<()>,
}

struct SessionInner {
    config: SessionConfig,
    hosts: HostRegistry,
    pools: Mutex<HashMap<Endpoint, ConnectionsCollection>>,
    trashcan: Trashcan,
    connection_counters: Mutex<HashMap<Endpoint, usize>>,
    keyspace: ArcSwapOption<String>,
    prepared: PreparedStatementRegistry,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Statement<'a> {
    Query(&'a str),
    Execute(&'a PreparedStatement, &'a [Option<Bytes>]),
}

impl Session {
    /// Establishes a CQL session with the database
    ///
    /// Usually it's easier to use [SessionBuilder](crate::client::session_builder::SessionBuilder)
    /// instead of calling `Session::connect` directly
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }
        validate_pooling("local", &config.pooling.local)?;
        validate_pooling("remote", &config.pooling.remote)?;
        if let Some(keyspace) = &config.keyspace {
            validate_keyspace_name(keyspace)?;
        }

        let endpoints = resolve_known_nodes(&config.known_nodes, config.port).await?;
        let hosts = HostRegistry::new();
        for endpoint in endpoints {
            hosts.add_host(endpoint, "", "");
        }
        debug!(
            hosts = ?hosts.all().iter().map(|host| host.endpoint()).collect::<Vec<_>>(),
            load_balancing = config.load_balancing.name(),
            "Starting session"
        );

        let sweep_interval = config.trashcan_sweep_interval;
        let keyspace = config.keyspace.clone();
        let inner = Arc::new(SessionInner::new(config, hosts));

        let (sweeper, _sweeper_handle) =
            SessionInner::sweep_trashcan(Arc::downgrade(&inner), sweep_interval).remote_handle();
        tokio::task::spawn(sweeper);

        let session = Session {
            inner,
            _sweeper_handle,
        };

        // Make sure at least one node is reachable.
        let (connection, _stream) = session.get_connection().await?;
        trace!(connection_id = %connection.id(), "Initial connection opened");

        if let Some(keyspace) = keyspace {
            session.use_keyspace(&keyspace).await?;
        }

        Ok(session)
    }

    /// Returns a connection to the first host of a fresh query plan that can
    /// provide one, together with a stream acquired on it.
    ///
    /// The connection has the session keyspace in use and every statement
    /// prepared through the session known to the server.
    pub async fn get_connection(&self) -> Result<(Arc<Connection>, RequestStream), QueryError> {
        self.inner.get_connection().await
    }

    /// Runs an unprepared statement.
    ///
    /// Server errors are retried as decided by the session's retry policy. A
    /// successful `USE` also switches the keyspace of the whole session.
    pub async fn query(
        &self,
        contents: &str,
        consistency: Consistency,
    ) -> Result<QueryResult, QueryError> {
        let result = self
            .inner
            .run(Statement::Query(contents), consistency)
            .await?;
        if let result::Result::SetKeyspace(set_keyspace) = &result {
            self.inner.set_keyspace(&set_keyspace.keyspace_name);
        }
        Ok(result)
    }

    /// Prepares a statement on one connection. Other connections prepare it
    /// before they are next handed out.
    pub async fn prepare(&self, contents: &str) -> Result<PreparedStatement, QueryError> {
        let (connection, stream) = self.inner.get_connection().await?;
        let prepare = Prepare {
            query: Cow::Borrowed(contents),
        };
        let response = connection.send_request(&stream, &prepare).await;
        let response = self.inner.inspect_transport_error(&connection, response)?;
        match into_result(response)? {
            result::Result::Prepared(prepared) => {
                connection.set_prepared_statement_synced(&prepared.id);
                self.inner
                    .set_prepare_statement(prepared.id.clone(), contents.to_owned());
                Ok(PreparedStatement::new(
                    prepared.id,
                    contents.to_owned(),
                    prepared.metadata,
                ))
            }
            _ => Err(QueryError::ProtocolError(
                "PREPARE: Unexpected server response",
            )),
        }
    }

    /// Executes a prepared statement with positional values; `None` binds null.
    ///
    /// If the server forgot the statement, it is prepared again on the same
    /// connection and executed once more.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: &[Option<Bytes>],
        consistency: Consistency,
    ) -> Result<QueryResult, QueryError> {
        self.inner
            .run(Statement::Execute(prepared, values), consistency)
            .await
    }

    /// Sends `USE <keyspace_name>` and makes every connection use that keyspace.
    pub async fn use_keyspace(&self, keyspace_name: &str) -> Result<(), QueryError> {
        validate_keyspace_name(keyspace_name)?;
        let query = format!("USE {}", keyspace_name);
        let consistency = self.inner.config.connection.default_consistency;
        match self.inner.run(Statement::Query(&query), consistency).await? {
            result::Result::SetKeyspace(_) => {
                self.inner.set_keyspace(keyspace_name);
                Ok(())
            }
            _ => Err(QueryError::ProtocolError("USE: Unexpected server response")),
        }
    }

    /// Selects the keyspace connections use, without contacting the server.
    /// Connections switch to it before they are next handed out.
    pub fn set_keyspace(&self, keyspace_name: &str) {
        self.inner.set_keyspace(keyspace_name);
    }

    pub fn get_keyspace(&self) -> Option<Arc<String>> {
        self.inner.keyspace.load_full()
    }

    /// Registers a statement prepared elsewhere so that every connection prepares it.
    pub fn set_prepare_statement(&self, id: Bytes, statement: String) {
        self.inner.set_prepare_statement(id, statement);
    }

    /// Closes every connection of the session. Requests in flight fail with
    /// [`QueryError::ConnectionClosed`], later ones with [`QueryError::SessionClosed`].
    /// Calling it again does nothing.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.inner.hosts
    }

    /// Adds a host to the cluster view, or returns the one already known.
    pub fn add_host(
        &self,
        endpoint: Endpoint,
        datacenter: impl Into<String>,
        rack: impl Into<String>,
    ) -> Arc<Host> {
        self.inner.hosts.add_host(endpoint, datacenter, rack)
    }

    /// Marks a host up; returns false if it was not down.
    pub fn bring_up(&self, endpoint: Endpoint) -> bool {
        self.inner.hosts.bring_up(endpoint)
    }

    /// Marks a host down and starts reconnecting to it in the background.
    /// Returns false if it was already down or is unknown.
    pub fn set_down(&self, endpoint: Endpoint) -> bool {
        self.inner.set_down(endpoint)
    }

    /// Forgets a host and closes all of its connections.
    pub fn try_remove(&self, endpoint: Endpoint) -> Option<Arc<Host>> {
        self.inner.try_remove(endpoint)
    }

    /// Number of open connections to `endpoint`, whether pooled, parked in
    /// the trashcan or being opened.
    pub fn connection_count(&self, endpoint: Endpoint) -> usize {
        lock(&self.inner.connection_counters)
            .get(&endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Number of connections to `endpoint` in the active pool.
    pub fn pool_size(&self, endpoint: Endpoint) -> usize {
        lock(&self.inner.pools)
            .get(&endpoint)
            .map_or(0, HashMap::len)
    }

    /// Number of connections parked in the trashcan.
    pub fn trashcan_size(&self) -> usize {
        self.inner.trashcan.len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("hosts", &self.inner.hosts)
            .field("keyspace", &self.get_keyspace())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionInner {
    fn new(config: SessionConfig, hosts: HostRegistry) -> Self {
        SessionInner {
            config,
            hosts,
            pools: Mutex::new(HashMap::new()),
            trashcan: Trashcan::new(),
            connection_counters: Mutex::new(HashMap::new()),
            keyspace: ArcSwapOption::empty(),
            prepared: PreparedStatementRegistry::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn get_connection(
        self: &Arc<Self>,
    ) -> Result<(Arc<Connection>, RequestStream), QueryError> {
        if self.is_closed() {
            return Err(QueryError::SessionClosed);
        }

        let load_balancing = &self.config.load_balancing;
        let mut tried = Vec::new();
        for host in load_balancing.new_query_plan(&self.hosts) {
            if !host.is_considerably_up() {
                continue;
            }
            let distance = load_balancing.distance(&host, &self.hosts);
            let Some(pooling) = self.config.pooling.for_distance(distance) else {
                continue;
            };
            let endpoint = host.endpoint();
            tried.push(endpoint);

            let connection = match self.connection_for_host(endpoint, pooling).await {
                Ok(Some(connection)) => connection,
                Ok(None) => {
                    trace!(%endpoint, "Host has no connection to spare");
                    continue;
                }
                Err(err) => {
                    debug!(%endpoint, error = %err, "Could not open connection");
                    self.set_down(endpoint);
                    continue;
                }
            };

            let Some(stream) = connection.acquire_stream() else {
                continue;
            };

            match self.sync_connection(&connection).await {
                Ok(()) => return Ok((connection, stream)),
                Err(err) if err.is_transport_error() || matches!(err, QueryError::TimeoutError) => {
                    drop(stream);
                    self.handle_transport_error(&connection);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        if self.is_closed() {
            return Err(QueryError::SessionClosed);
        }
        Err(NoHostAvailable { tried }.into())
    }

    /// Picks or opens a connection to `endpoint`. `Ok(None)` means the host
    /// is at its connection limit and every connection is busy.
    async fn connection_for_host(
        self: &Arc<Self>,
        endpoint: Endpoint,
        pooling: &DistancePooling,
    ) -> Result<Option<Arc<Connection>>, QueryError> {
        let (found, unhealthy, retired) = {
            let mut pools = lock(&self.pools);
            let pool = pools.entry(endpoint).or_default();

            let unhealthy_ids: Vec<_> = pool
                .iter()
                .filter(|(_, connection)| !connection.is_healthy())
                .map(|(id, _)| *id)
                .collect();
            let unhealthy: Vec<_> = unhealthy_ids
                .iter()
                .filter_map(|id| pool.remove(id))
                .collect();

            let found = pool
                .values()
                .find(|connection| !connection.is_busy(pooling.max_simultaneous_requests_threshold))
                .cloned();

            let mut retired = None;
            if pool.len() > pooling.core_connections {
                let idle = pool
                    .values()
                    .filter(|connection| {
                        found
                            .as_ref()
                            .is_none_or(|found| found.id() != connection.id())
                    })
                    .find(|connection| {
                        connection.is_free(pooling.min_simultaneous_requests_threshold)
                    })
                    .map(|connection| connection.id());
                retired = idle.and_then(|id| pool.remove(&id));
            }

            (found, unhealthy, retired)
        };

        for connection in unhealthy {
            self.free_connection(connection);
        }
        if let Some(connection) = retired {
            self.retire(connection);
        }
        if let Some(connection) = found {
            return Ok(Some(connection));
        }

        while let Some(connection) = self.trashcan.recycle(endpoint) {
            if connection.is_healthy() {
                trace!(connection_id = %connection.id(), "Recycled connection from trashcan");
                return Ok(self.add_to_pool(connection));
            }
            self.free_connection(connection);
        }

        if !self.increase_connection_counter(endpoint, pooling.max_connections) {
            return Ok(None);
        }
        match self.allocate_connection(endpoint).await {
            Ok(connection) => Ok(self.add_to_pool(connection)),
            Err(err) => {
                self.decrease_connection_counter(endpoint);
                Err(err)
            }
        }
    }

    async fn allocate_connection(&self, endpoint: Endpoint) -> Result<Arc<Connection>, QueryError> {
        // Breakage is noticed through `is_healthy` when the pool is scanned.
        let (connection, _error_receiver) =
            Connection::connect(endpoint, self.config.connection.clone()).await?;
        if let Some(keyspace) = self.keyspace.load().as_deref() {
            connection.set_keyspace(keyspace);
        }
        for id in self.prepared.ids() {
            connection.set_prepared_statement(&id);
        }
        debug!(
            connection_id = %connection.id(),
            %endpoint,
            "Opened new connection"
        );
        Ok(Arc::new(connection))
    }

    /// Puts `connection` in its host's pool and hands it back. The connection
    /// is freed instead, and `None` returned, when the session was closed or
    /// the host removed, since nothing would drain that pool any more.
    fn add_to_pool(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let endpoint = connection.endpoint();
        {
            let mut pools = lock(&self.pools);
            if !self.is_closed() && self.hosts.get(endpoint).is_some() {
                pools
                    .entry(endpoint)
                    .or_default()
                    .insert(connection.id(), Arc::clone(&connection));
                return Some(connection);
            }
        }
        debug!(
            connection_id = %connection.id(),
            %endpoint,
            "Session closed or host removed, freeing connection"
        );
        self.free_connection(connection);
        None
    }

    fn retire(&self, connection: Arc<Connection>) {
        self.trashcan.put(connection);
        // `close` may have emptied the trashcan already.
        if self.is_closed() {
            for connection in self.trashcan.remove_all() {
                self.free_connection(connection);
            }
        }
    }

    async fn sync_connection(&self, connection: &Connection) -> Result<(), QueryError> {
        let timeout = self.config.sync_timeout;
        if !connection.is_keyspace_syncd() {
            connection.sync_keyspace(timeout).await?;
        }
        let unprepared = connection.get_unprepared_statements();
        if !unprepared.is_empty() {
            let statements = self.prepared.lookup(&unprepared);
            connection.sync_prepared(&statements, timeout).await?;
        }
        Ok(())
    }

    /// Counts a connection about to be opened to `endpoint`; false when the
    /// host already has `max` connections.
    fn increase_connection_counter(&self, endpoint: Endpoint, max: usize) -> bool {
        let mut counters = lock(&self.connection_counters);
        let counter = counters.entry(endpoint).or_insert(0);
        if *counter >= max {
            return false;
        }
        *counter += 1;
        true
    }

    fn decrease_connection_counter(&self, endpoint: Endpoint) {
        let mut counters = lock(&self.connection_counters);
        if let Some(counter) = counters.get_mut(&endpoint) {
            *counter = counter.saturating_sub(1);
            if *counter == 0 {
                counters.remove(&endpoint);
            }
        }
    }

    /// Closes a connection that is no longer in any collection and releases
    /// its slot in the counter.
    fn free_connection(&self, connection: Arc<Connection>) {
        trace!(connection_id = %connection.id(), "Freeing connection");
        connection.close();
        self.decrease_connection_counter(connection.endpoint());
    }

    fn handle_transport_error(self: &Arc<Self>, connection: &Arc<Connection>) {
        let endpoint = connection.endpoint();
        let removed = lock(&self.pools)
            .get_mut(&endpoint)
            .and_then(|pool| pool.remove(&connection.id()));
        if let Some(removed) = removed {
            self.free_connection(removed);
        }
        self.set_down(endpoint);
    }

    fn inspect_transport_error<T>(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        result: Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        if let Err(err) = &result {
            if err.is_transport_error() {
                warn!(
                    connection_id = %connection.id(),
                    endpoint = %connection.endpoint(),
                    error = %err,
                    "Request failed on a broken connection"
                );
                self.handle_transport_error(connection);
            }
        }
        result
    }

    async fn run(
        self: &Arc<Self>,
        statement: Statement<'_>,
        mut consistency: Consistency,
    ) -> Result<QueryResult, QueryError> {
        let mut nb_retry = 0;
        loop {
            let (connection, stream) = self.get_connection().await?;
            let result = self
                .run_on_connection(&connection, &stream, &statement, consistency)
                .await;
            drop(stream);
            let error = match self.inspect_transport_error(&connection, result) {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };

            let QueryError::DbError(db_error, _) = &error else {
                return Err(error);
            };
            match retry::decide(self.config.retry_policy.as_ref(), db_error, nb_retry) {
                RetryDecision::RetryWithConsistency(new_consistency) => {
                    debug!(
                        error = %db_error,
                        nb_retry,
                        consistency = ?new_consistency,
                        "Retrying request"
                    );
                    consistency = new_consistency;
                    nb_retry += 1;
                }
                RetryDecision::Rethrow => return Err(error),
                RetryDecision::Ignore => return Ok(result::Result::Void),
            }
        }
    }

    async fn run_on_connection(
        &self,
        connection: &Connection,
        stream: &RequestStream,
        statement: &Statement<'_>,
        consistency: Consistency,
    ) -> Result<QueryResult, QueryError> {
        match statement {
            Statement::Query(contents) => {
                let query = Query {
                    contents: Cow::Borrowed(*contents),
                    consistency,
                };
                into_result(connection.send_request(stream, &query).await?)
            }
            Statement::Execute(prepared, values) => {
                let execute = Execute {
                    id: prepared.get_id().clone(),
                    values: values.to_vec(),
                    consistency,
                };
                match into_result(connection.send_request(stream, &execute).await?) {
                    Err(QueryError::DbError(DbError::Unprepared { statement_id }, _)) => {
                        debug!(
                            connection_id = %connection.id(),
                            ?statement_id,
                            "Statement unknown to the server, preparing it again"
                        );
                        let statement = [(
                            prepared.get_id().clone(),
                            prepared.get_statement().to_owned(),
                        )];
                        connection
                            .sync_prepared(&statement, self.config.sync_timeout)
                            .await?;
                        into_result(connection.send_request(stream, &execute).await?)
                    }
                    other => other,
                }
            }
        }
    }

    fn set_keyspace(&self, keyspace_name: &str) {
        self.keyspace.store(Some(Arc::new(keyspace_name.to_owned())));
        self.for_each_connection(|connection| connection.set_keyspace(keyspace_name));
    }

    fn set_prepare_statement(&self, id: Bytes, statement: String) {
        self.for_each_connection(|connection| connection.set_prepared_statement(&id));
        self.prepared.insert(id, statement);
    }

    fn for_each_connection(&self, mut f: impl FnMut(&Arc<Connection>)) {
        lock(&self.pools)
            .values()
            .flat_map(|pool| pool.values())
            .for_each(&mut f);
        self.trashcan.for_each(f);
    }

    fn set_down(self: &Arc<Self>, endpoint: Endpoint) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(host) = self.hosts.get(endpoint) else {
            return false;
        };
        if !host.set_down(self.config.reconnection_policy.new_schedule()) {
            return false;
        }
        warn!(%endpoint, "Host is down, scheduling reconnection");
        tokio::task::spawn(Self::reconnect_host(Arc::downgrade(self), host));
        true
    }

    fn try_remove(&self, endpoint: Endpoint) -> Option<Arc<Host>> {
        // Taken together with the pool, so an allocation in flight either lands
        // in the pool drained below or finds the host gone.
        let (host, pool) = {
            let mut pools = lock(&self.pools);
            let host = self.hosts.try_remove(endpoint)?;
            (host, pools.remove(&endpoint).unwrap_or_default())
        };
        info!(%endpoint, "Removing host");
        for connection in pool.into_values() {
            self.free_connection(connection);
        }
        for connection in self.trashcan.remove_endpoint(endpoint) {
            self.free_connection(connection);
        }
        Some(host)
    }

    fn close(&self) {
        // The flag flips under the pools lock, so `add_to_pool` either lands
        // before the drain or sees the session closed.
        let pools = {
            let mut pools = lock(&self.pools);
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *pools)
        };
        debug!("Closing session");
        for connection in pools.into_values().flat_map(HashMap::into_values) {
            self.free_connection(connection);
        }
        for connection in self.trashcan.remove_all() {
            self.free_connection(connection);
        }
    }

    /// Periodically frees idle connections parked in the trashcan.
    async fn sweep_trashcan(session: Weak<SessionInner>, interval: Duration) {
        let mut interval = tokio::time::interval(interval);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.is_closed() {
                return;
            }
            let swept = session.trashcan.take_sweepable();
            if !swept.is_empty() {
                trace!(
                    connections = %swept.iter().map(|c| c.id()).join(", "),
                    "Sweeping trashcan"
                );
            }
            for connection in swept {
                session.free_connection(connection);
            }
        }
    }

    /// Probes a down host on its reconnection schedule until it answers, is
    /// brought up or removed elsewhere, or the session goes away.
    async fn reconnect_host(session: Weak<SessionInner>, host: Arc<Host>) {
        let endpoint = host.endpoint();
        loop {
            let Some(wait) = host.time_until_next_attempt() else {
                // Brought up elsewhere.
                return;
            };
            tokio::time::sleep(wait).await;

            let config = {
                let Some(session) = session.upgrade() else {
                    return;
                };
                if session.is_closed() {
                    return;
                }
                match session.hosts.get(endpoint) {
                    Some(registered) if Arc::ptr_eq(&registered, &host) => {}
                    _ => return,
                }
                session.config.connection.clone()
            };
            if host.is_up() {
                return;
            }

            trace!(%endpoint, "Trying to reconnect");
            match Connection::connect(endpoint, config).await {
                Ok((probe, _)) => {
                    probe.close();
                    host.bring_up();
                    return;
                }
                Err(err) => {
                    let delay = host.advance_schedule();
                    debug!(%endpoint, error = %err, ?delay, "Reconnection attempt failed");
                }
            }
        }
    }
}

fn into_result(response: Response) -> Result<QueryResult, QueryError> {
    match response.into_non_error_response()? {
        NonErrorResponse::Result(result) => Ok(result),
        _ => Err(QueryError::ProtocolError("Unexpected server response")),
    }
}

fn validate_pooling(distance: &str, pooling: &DistancePooling) -> Result<(), InvalidArgument> {
    if pooling.max_connections == 0 {
        return Err(InvalidArgument(format!(
            "{} max_connections must be at least 1",
            distance
        )));
    }
    if pooling.core_connections > pooling.max_connections {
        return Err(InvalidArgument(format!(
            "{} core_connections ({}) cannot exceed max_connections ({})",
            distance, pooling.core_connections, pooling.max_connections
        )));
    }
    if pooling.min_simultaneous_requests_threshold > pooling.max_simultaneous_requests_threshold {
        return Err(InvalidArgument(format!(
            "{} min_simultaneous_requests_threshold ({}) cannot exceed max_simultaneous_requests_threshold ({})",
            distance,
            pooling.min_simultaneous_requests_threshold,
            pooling.max_simultaneous_requests_threshold
        )));
    }
    Ok(())
}

/// Resolves `host` or `host:port` entries; entries that fail to resolve are
/// skipped as long as at least one succeeds.
async fn resolve_known_nodes(
    known_nodes: &[String],
    default_port: u16,
) -> Result<Vec<Endpoint>, NewSessionError> {
    let mut endpoints = Vec::new();
    let mut failed = Vec::new();
    for node in known_nodes {
        match resolve_hostname(node, default_port).await {
            Some(endpoint) => endpoints.push(endpoint),
            None => {
                warn!(hostname = node, "Failed to resolve known node");
                failed.push(node.clone());
            }
        }
    }
    if endpoints.is_empty() {
        return Err(NewSessionError::FailedToResolveAnyHostname(failed));
    }
    Ok(endpoints)
}

async fn resolve_hostname(hostname: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = hostname.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    let addrs: Vec<SocketAddr> = match tokio::net::lookup_host(hostname).await {
        Ok(addrs) => addrs.collect(),
        // No port in the hostname.
        Err(_) => tokio::net::lookup_host((hostname, default_port))
            .await
            .ok()?
            .collect(),
    };
    // Prefer IPv4 addresses, as the rest of the cluster usually is.
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::network::ConnectionState;
    use assert_matches::assert_matches;

    fn endpoint() -> Endpoint {
        "127.0.0.1:9042".parse().unwrap()
    }

    fn session_with_one_host() -> SessionInner {
        let hosts = HostRegistry::new();
        hosts.add_host(endpoint(), "", "");
        SessionInner::new(SessionConfig::new(), hosts)
    }

    /// A connection counted as allocated, the way `connection_for_host` does.
    fn allocated(session: &SessionInner) -> Arc<Connection> {
        assert!(session.increase_connection_counter(endpoint(), 8));
        Arc::new(Connection::new_disconnected(
            endpoint(),
            ConnectionConfig::default(),
        ))
    }

    fn counter(session: &SessionInner) -> usize {
        lock(&session.connection_counters)
            .get(&endpoint())
            .copied()
            .unwrap_or(0)
    }

    #[test]
    fn pooled_connection_is_freed_by_close() {
        let session = session_with_one_host();
        let connection = allocated(&session);
        assert!(session.add_to_pool(Arc::clone(&connection)).is_some());
        assert_eq!(counter(&session), 1);

        session.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(counter(&session), 0);
    }

    #[test]
    fn connection_opened_while_closing_is_freed() {
        let session = session_with_one_host();
        let connection = allocated(&session);

        // The allocation finishes only after the session has been closed.
        session.close();
        assert!(session.add_to_pool(Arc::clone(&connection)).is_none());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(lock(&session.pools).is_empty());
        assert_eq!(counter(&session), 0);
    }

    #[test]
    fn connection_opened_for_removed_host_is_freed() {
        let session = session_with_one_host();
        let connection = allocated(&session);

        assert!(session.try_remove(endpoint()).is_some());
        assert!(session.add_to_pool(Arc::clone(&connection)).is_none());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(lock(&session.pools).is_empty());
        assert_eq!(counter(&session), 0);
    }

    #[test]
    fn connection_retired_after_close_is_freed() {
        let session = session_with_one_host();
        let connection = allocated(&session);

        session.close();
        session.retire(Arc::clone(&connection));
        assert_eq!(session.trashcan.len(), 0);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(counter(&session), 0);
    }

    #[tokio::test]
    async fn resolves_addresses_with_and_without_port() {
        assert_eq!(
            resolve_hostname("127.0.0.1:1234", 9042).await,
            Some("127.0.0.1:1234".parse().unwrap())
        );
        assert_eq!(
            resolve_hostname("127.0.0.1", 9042).await,
            Some("127.0.0.1:9042".parse().unwrap())
        );
        assert_eq!(
            resolve_hostname("::1", 9042).await,
            Some("[::1]:9042".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn resolves_hostnames_with_and_without_port() {
        let with_port = resolve_hostname("localhost:1234", 9042).await.unwrap();
        assert!(with_port.ip().is_loopback());
        assert_eq!(with_port.port(), 1234);

        let without_port = resolve_hostname("localhost", 9042).await.unwrap();
        assert!(without_port.ip().is_loopback());
        assert_eq!(without_port.port(), 9042);
    }

    #[test]
    fn pooling_validation() {
        let mut pooling = DistancePooling {
            core_connections: 2,
            max_connections: 8,
            max_simultaneous_requests_threshold: 100,
            min_simultaneous_requests_threshold: 25,
        };
        assert!(validate_pooling("local", &pooling).is_ok());

        pooling.core_connections = 9;
        assert_matches!(validate_pooling("local", &pooling), Err(InvalidArgument(_)));

        pooling.core_connections = 0;
        pooling.max_connections = 0;
        assert_matches!(validate_pooling("local", &pooling), Err(InvalidArgument(_)));

        pooling.max_connections = 1;
        pooling.min_simultaneous_requests_threshold = 101;
        assert_matches!(validate_pooling("local", &pooling), Err(InvalidArgument(_)));
    }
}
