use bytes::Bytes;
use cassandra_cql::frame::request::options::{self, Options};
use cassandra_cql::frame::request::{
    Credentials, Execute, Prepare, Query, Register, SerializableRequest, Startup,
};
use cassandra_cql::frame::response::event::Event;
use cassandra_cql::frame::response::{result, NonErrorResponse, Response, ResponseOpcode};
use cassandra_cql::frame::server_event_type::EventType;
use cassandra_cql::frame::{
    self as frame, Compression, FrameParams, SerializedRequest, EVENT_STREAM_ID,
};
use cassandra_cql::Consistency;
use futures::{future::RemoteHandle, FutureExt};
use socket2::{SockRef, TcpKeepalive};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use super::stream_table::{StreamGuard, StreamId, StreamTable};
use crate::config::ConnectionConfig;
use crate::errors::{ConnectionError, QueryError};
use crate::Endpoint;

/// Unique, process-wide identifier of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static CONNECTION_ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(CONNECTION_ID_GENERATOR.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a [`Connection`].
///
/// `Handshaking` is only entered when TLS is configured, `Authenticating` only
/// when the server answers STARTUP with AUTHENTICATE. `Defunct` is entered from
/// any state on a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    Connecting,
    Handshaking,
    NegotiatingOptions,
    AwaitingReady,
    Authenticating,
    Ready,
    Closing,
    Closed,
    Defunct,
}

/// Completion handle of a request waiting for its response on some stream.
pub struct ResponseHandler(oneshot::Sender<Result<TaskResponse, QueryError>>);

/// A stream id acquired on a connection, released when dropped.
pub type RequestStream = StreamGuard<ResponseHandler>;

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

struct Task {
    serialized_request: SerializedRequest,
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
    /// Negotiated during STARTUP; requests are sent uncompressed until then.
    compression: Option<Compression>,
    _worker_handle: RemoteHandle<()>,
}

// Used to listen for fatal error in connection
pub(crate) type ErrorReceiver = oneshot::Receiver<QueryError>;

#[derive(Default)]
struct KeyspaceSync {
    selected: Option<String>,
    current: Option<String>,
}

/// A single multiplexed connection to one endpoint.
///
/// Up to 127 requests can be in flight at once, each on its own stream. All
/// writes go through one writer task and all reads through one reader task;
/// both stop when the connection is closed or dropped.
pub struct Connection {
    id: ConnectionId,
    endpoint: Endpoint,
    config: ConnectionConfig,
    streams: Arc<StreamTable<ResponseHandler>>,
    state: Arc<StdMutex<ConnectionState>>,
    router_handle: StdMutex<Option<RouterHandle>>,
    // Serializes use of the management stream.
    management: tokio::sync::Mutex<()>,
    keyspace: StdMutex<KeyspaceSync>,
    // Prepared id -> whether it is known to the server on this connection.
    prepared: StdMutex<HashMap<Bytes, bool>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Connection {
    /// Opens a connection to `endpoint` and runs the startup handshake on it.
    ///
    /// Returns the ready connection and a receiver which fires once if the
    /// connection later breaks.
    pub async fn connect(
        endpoint: Endpoint,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let connection = Self::new_disconnected(endpoint, config);
        let error_receiver = connection.open().await?;
        Ok((connection, error_receiver))
    }

    pub(crate) fn new_disconnected(endpoint: Endpoint, config: ConnectionConfig) -> Self {
        Connection {
            id: ConnectionId::next(),
            endpoint,
            config,
            streams: Arc::new(StreamTable::new()),
            state: Arc::new(StdMutex::new(ConnectionState::Disconnected)),
            router_handle: StdMutex::new(None),
            management: tokio::sync::Mutex::new(()),
            keyspace: StdMutex::new(KeyspaceSync::default()),
            prepared: StdMutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        trace!(
            connection_id = %self.id,
            endpoint = %self.endpoint,
            ?state,
            "Connection state change"
        );
        *lock(&self.state) = state;
    }

    async fn open(&self) -> Result<ErrorReceiver, ConnectionError> {
        let result = tokio::time::timeout(self.config.connect_timeout, self.open_inner()).await;
        let result = match result {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::ConnectTimeout),
        };
        if let Err(err) = &result {
            debug!(
                connection_id = %self.id,
                endpoint = %self.endpoint,
                error = %err,
                "Failed to open connection"
            );
            self.router_handle_take();
            self.set_state(ConnectionState::Defunct);
        }
        result
    }

    async fn open_inner(&self) -> Result<ErrorReceiver, ConnectionError> {
        // Endpoints are resolved addresses already; hostnames are looked up
        // when the session is built.
        self.set_state(ConnectionState::Resolving);
        self.set_state(ConnectionState::Connecting);
        let stream = TcpStream::connect(self.endpoint).await?;
        stream.set_nodelay(self.config.tcp_nodelay)?;
        if let Some(tcp_keepalive_interval) = self.config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();

        let _worker_handle = self.run_router(stream, receiver, error_sender).await?;
        *lock(&self.router_handle) = Some(RouterHandle {
            submit_channel: sender,
            compression: None,
            _worker_handle,
        });

        self.startup().await?;
        self.set_state(ConnectionState::Ready);
        debug!(
            connection_id = %self.id,
            endpoint = %self.endpoint,
            "Connection ready"
        );

        Ok(error_receiver)
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is the idle time before the first probe ("time" in
        // socket2 terms); socket2's interval is the gap between probes.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    /// OPTIONS, STARTUP, optional CREDENTIALS and REGISTER, all on the management stream.
    async fn startup(&self) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::NegotiatingOptions);
        let mut supported = match self
            .send_management(&Options)
            .await
            .map_err(ConnectionError::setup("OPTIONS"))?
        {
            NonErrorResponse::Supported(supported) => supported,
            _ => {
                return Err(ConnectionError::setup("OPTIONS")(QueryError::ProtocolError(
                    "OPTIONS: Unexpected server response",
                )))
            }
        };

        let mut startup_options = HashMap::new();
        startup_options.insert(
            Cow::Borrowed(options::CQL_VERSION),
            Cow::Borrowed(options::DEFAULT_CQL_VERSION),
        );

        let supported_compression = supported
            .options
            .remove(options::COMPRESSION)
            .unwrap_or_default();
        let mut negotiated_compression = None;
        if let Some(compression) = self.config.compression {
            let compression_str = compression.as_str();
            if supported_compression.iter().any(|c| c == compression_str) {
                startup_options.insert(
                    Cow::Borrowed(options::COMPRESSION),
                    Cow::Borrowed(compression_str),
                );
                negotiated_compression = Some(compression);
            } else {
                warn!(
                    endpoint = %self.endpoint,
                    "Requested compression <{}> is not supported by the server. Falling back to no compression",
                    compression_str
                );
            }
        }

        self.set_state(ConnectionState::AwaitingReady);
        let startup = Startup {
            options: startup_options,
        };
        match self
            .send_management(&startup)
            .await
            .map_err(ConnectionError::setup("STARTUP"))?
        {
            NonErrorResponse::Ready => {}
            NonErrorResponse::Authenticate(authenticate) => {
                self.set_state(ConnectionState::Authenticating);
                self.authenticate(&authenticate.authenticator_name).await?;
            }
            _ => {
                return Err(ConnectionError::setup("STARTUP")(QueryError::ProtocolError(
                    "STARTUP: Unexpected server response",
                )))
            }
        }

        if let Some(router_handle) = lock(&self.router_handle).as_mut() {
            router_handle.compression = negotiated_compression;
        }

        if self.config.event_sender.is_some() {
            let register = Register {
                event_types_to_register_for: vec![
                    EventType::TopologyChange,
                    EventType::StatusChange,
                    EventType::SchemaChange,
                ],
            };
            match self
                .send_management(&register)
                .await
                .map_err(ConnectionError::setup("REGISTER"))?
            {
                NonErrorResponse::Ready => {}
                _ => {
                    return Err(ConnectionError::setup("REGISTER")(
                        QueryError::ProtocolError("REGISTER: Unexpected server response"),
                    ))
                }
            }
        }

        Ok(())
    }

    async fn authenticate(&self, authenticator_name: &str) -> Result<(), ConnectionError> {
        let Some(credentials) = &self.config.credentials else {
            return Err(ConnectionError::MissingCredentials(
                authenticator_name.to_owned(),
            ));
        };
        debug!(
            endpoint = %self.endpoint,
            authenticator = authenticator_name,
            "Authenticating"
        );
        let request = Credentials::username_password(&credentials.username, &credentials.password);
        match self
            .send_management(&request)
            .await
            .map_err(ConnectionError::setup("CREDENTIALS"))?
        {
            NonErrorResponse::Ready => Ok(()),
            _ => Err(ConnectionError::setup("CREDENTIALS")(
                QueryError::ProtocolError("CREDENTIALS: Unexpected server response"),
            )),
        }
    }

    /// Takes a free stream id on this connection.
    pub fn acquire_stream(&self) -> Option<RequestStream> {
        StreamGuard::acquire(&self.streams)
    }

    /// Sends `request` on an already acquired stream and waits for its response.
    ///
    /// A stream whose request was cancelled before the response arrived must
    /// be dropped rather than reused.
    pub async fn send_request(
        &self,
        stream: &RequestStream,
        request: &impl SerializableRequest,
    ) -> Result<Response, QueryError> {
        if !stream.belongs_to(&self.streams) {
            return Err(QueryError::ProtocolError(
                "Stream was acquired on a different connection",
            ));
        }
        let response = self.send_on_stream(stream.id(), request).await?;
        // A user-issued `USE` switches this socket's keyspace too.
        if let Response::Result(result::Result::SetKeyspace(set_keyspace)) = &response {
            lock(&self.keyspace).current = Some(set_keyspace.keyspace_name.clone());
        }
        Ok(response)
    }

    async fn send_on_stream(
        &self,
        stream: StreamId,
        request: &impl SerializableRequest,
    ) -> Result<Response, QueryError> {
        let (submit_channel, compression) = match lock(&self.router_handle).as_ref() {
            Some(handle) => (handle.submit_channel.clone(), handle.compression),
            None => return Err(QueryError::ConnectionClosed),
        };

        let mut serialized_request = SerializedRequest::make(request, compression, false)?;
        serialized_request.set_stream(stream.as_i8());

        let (response_sender, receiver) = oneshot::channel();
        self.streams
            .set_pending(stream, ResponseHandler(response_sender));

        if submit_channel
            .send(Task { serialized_request })
            .await
            .is_err()
        {
            self.streams.take_pending(stream);
            return Err(QueryError::BrokenConnection(
                "Connection's writer is not running".to_owned(),
            ));
        }

        let task_response = receiver
            .await
            .map_err(|_| QueryError::ConnectionClosed)??;

        Self::parse_response(task_response, compression)
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
    ) -> Result<Response, QueryError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;
        Ok(Response::deserialize(
            task_response.opcode,
            body_with_ext.body,
        )?)
    }

    /// Management traffic is unbounded in time; callers wrap it in a timeout.
    /// Giving up on a request before its response marks the connection defunct.
    async fn send_management(
        &self,
        request: &impl SerializableRequest,
    ) -> Result<NonErrorResponse, QueryError> {
        let _management = self.management.lock().await;
        let _in_flight = ManagementInFlight { connection: self };
        let response = self.send_on_stream(StreamId::MANAGEMENT, request).await?;
        Ok(response.into_non_error_response()?)
    }

    fn mark_defunct(&self, reason: &str) {
        error!(
            connection_id = %self.id,
            endpoint = %self.endpoint,
            reason,
            "Marking connection defunct"
        );
        self.router_handle_take();
        self.fail_pending(QueryError::BrokenConnection(reason.to_owned()));
        self.set_state(ConnectionState::Defunct);
    }

    async fn send_user_request(
        &self,
        request: &impl SerializableRequest,
    ) -> Result<NonErrorResponse, QueryError> {
        let stream = self
            .acquire_stream()
            .ok_or(QueryError::UnableToAllocStreamId)?;
        let response = self.send_request(&stream, request).await?;
        Ok(response.into_non_error_response()?)
    }

    pub async fn query(
        &self,
        contents: &str,
        consistency: Consistency,
    ) -> Result<result::Result, QueryError> {
        let query = Query {
            contents: Cow::Borrowed(contents),
            consistency,
        };
        match self.send_user_request(&query).await? {
            NonErrorResponse::Result(result) => Ok(result),
            _ => Err(QueryError::ProtocolError(
                "QUERY: Unexpected server response",
            )),
        }
    }

    pub async fn prepare(&self, contents: &str) -> Result<result::Prepared, QueryError> {
        let prepare = Prepare {
            query: Cow::Borrowed(contents),
        };
        match self.send_user_request(&prepare).await? {
            NonErrorResponse::Result(result::Result::Prepared(prepared)) => {
                self.set_prepared_statement_synced(&prepared.id);
                Ok(prepared)
            }
            _ => Err(QueryError::ProtocolError(
                "PREPARE: Unexpected server response",
            )),
        }
    }

    pub async fn execute(
        &self,
        id: &Bytes,
        values: &[Option<Bytes>],
        consistency: Consistency,
    ) -> Result<result::Result, QueryError> {
        let execute = Execute {
            id: id.clone(),
            values: values.to_vec(),
            consistency,
        };
        match self.send_user_request(&execute).await? {
            NonErrorResponse::Result(result) => Ok(result),
            _ => Err(QueryError::ProtocolError(
                "EXECUTE: Unexpected server response",
            )),
        }
    }

    /// Ready and neither closing nor defunct.
    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_defunct(&self) -> bool {
        self.state() == ConnectionState::Defunct
    }

    /// Number of user streams currently taken.
    pub fn in_flight(&self) -> usize {
        self.streams.in_use()
    }

    pub fn is_busy(&self, threshold: usize) -> bool {
        self.in_flight() >= threshold
    }

    pub fn is_free(&self, threshold: usize) -> bool {
        self.in_flight() <= threshold
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight() == 0
    }

    /// Stops I/O and fails every pending request with
    /// [`QueryError::ConnectionClosed`]. Calling it again does nothing.
    pub fn close(&self) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        debug!(
            connection_id = %self.id,
            endpoint = %self.endpoint,
            "Closing connection"
        );
        // Dropping the worker handle stops the router and closes the socket.
        self.router_handle_take();
        self.fail_pending(QueryError::ConnectionClosed);
        self.set_state(ConnectionState::Closed);
    }

    fn router_handle_take(&self) -> Option<RouterHandle> {
        lock(&self.router_handle).take()
    }

    fn fail_pending(&self, error: QueryError) {
        for (_, handler) in self.streams.take_all_pending() {
            // Ignore sending error, request was dropped
            let _ = handler.0.send(Err(error.clone()));
        }
    }

    /// Tears the current I/O down and runs the whole connect sequence again
    /// against the same endpoint.
    ///
    /// The server forgets the keyspace and prepared statements of the old
    /// socket, so both are marked as needing a resync.
    pub async fn reconnect(&self) -> Result<ErrorReceiver, ConnectionError> {
        debug!(
            connection_id = %self.id,
            endpoint = %self.endpoint,
            "Reconnecting"
        );
        self.router_handle_take();
        self.fail_pending(QueryError::ConnectionClosed);
        self.streams.clear_orphans();
        self.set_state(ConnectionState::Disconnected);
        lock(&self.keyspace).current = None;
        lock(&self.prepared)
            .values_mut()
            .for_each(|synced| *synced = false);

        self.open().await
    }

    /// True when no keyspace was selected, or the selected one is in use on the server.
    pub fn is_keyspace_syncd(&self) -> bool {
        let keyspace = lock(&self.keyspace);
        keyspace.selected.is_none() || keyspace.selected == keyspace.current
    }

    /// Selects the keyspace this connection should be using; applied by
    /// [`Connection::sync_keyspace`].
    pub fn set_keyspace(&self, name: &str) {
        lock(&self.keyspace).selected = Some(name.to_owned());
    }

    /// Issues `USE` for the selected keyspace unless it is already in use.
    pub async fn sync_keyspace(&self, timeout: Duration) -> Result<(), QueryError> {
        let Some(selected) = ({
            let keyspace = lock(&self.keyspace);
            (keyspace.selected != keyspace.current)
                .then(|| keyspace.selected.clone())
                .flatten()
        }) else {
            return Ok(());
        };

        let query = Query {
            contents: Cow::Owned(format!("USE {}", selected)),
            consistency: self.config.default_consistency,
        };
        let response = self.management_with_timeout(&query, timeout).await?;
        match response {
            NonErrorResponse::Result(result::Result::SetKeyspace(set_keyspace)) => {
                trace!(
                    connection_id = %self.id,
                    keyspace = set_keyspace.keyspace_name,
                    "Keyspace synced"
                );
                lock(&self.keyspace).current = Some(selected);
                Ok(())
            }
            _ => Err(QueryError::ProtocolError("USE: Unexpected server response")),
        }
    }

    /// Registers a statement prepared elsewhere as unknown on this connection.
    pub fn set_prepared_statement(&self, id: &Bytes) {
        lock(&self.prepared).entry(id.clone()).or_insert(false);
    }

    pub fn set_prepared_statement_synced(&self, id: &Bytes) {
        lock(&self.prepared).insert(id.clone(), true);
    }

    pub fn get_unprepared_statements(&self) -> Vec<Bytes> {
        lock(&self.prepared)
            .iter()
            .filter(|(_, synced)| !**synced)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Prepares each `(id, text)` statement on the management stream.
    pub async fn sync_prepared(
        &self,
        statements: &[(Bytes, String)],
        timeout: Duration,
    ) -> Result<(), QueryError> {
        for (id, text) in statements {
            let prepare = Prepare {
                query: Cow::Borrowed(text),
            };
            match self.management_with_timeout(&prepare, timeout).await? {
                NonErrorResponse::Result(result::Result::Prepared(prepared)) => {
                    if prepared.id != *id {
                        warn!(
                            connection_id = %self.id,
                            registered = ?id,
                            returned = ?prepared.id,
                            "Statement prepared with a different id than the one registered"
                        );
                        return Err(QueryError::ProtocolError(
                            "PREPARE: Server returned a different statement id",
                        ));
                    }
                    self.set_prepared_statement_synced(id);
                }
                _ => {
                    return Err(QueryError::ProtocolError(
                        "PREPARE: Unexpected server response",
                    ))
                }
            }
        }
        Ok(())
    }

    async fn management_with_timeout(
        &self,
        request: &impl SerializableRequest,
        timeout: Duration,
    ) -> Result<NonErrorResponse, QueryError> {
        // Dropping the request on timeout marks the connection defunct.
        tokio::time::timeout(timeout, self.send_management(request))
            .await
            .map_err(|_| QueryError::TimeoutError)?
    }

    async fn run_router(
        &self,
        stream: TcpStream,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<QueryError>,
    ) -> Result<RemoteHandle<()>, std::io::Error> {
        #[cfg(feature = "openssl-010")]
        if let Some(context) = &self.config.ssl_context {
            self.set_state(ConnectionState::Handshaking);
            let stream = super::tls::connect(context, stream).await?;
            return Ok(self.spawn_router(stream, receiver, error_sender));
        }

        Ok(self.spawn_router(stream, receiver, error_sender))
    }

    fn spawn_router(
        &self,
        stream: impl AsyncRead + AsyncWrite + Send + 'static,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<QueryError>,
    ) -> RemoteHandle<()> {
        let (task, handle) = Self::router(
            stream,
            receiver,
            error_sender,
            RouterContext {
                connection_id: self.id,
                streams: Arc::clone(&self.streams),
                state: Arc::clone(&self.state),
                event_sender: self.config.event_sender.clone(),
                compression: self.config.compression,
            },
        )
        .remote_handle();
        tokio::task::spawn(task);
        handle
    }

    async fn router(
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<QueryError>,
        context: RouterContext,
    ) {
        let (read_half, write_half) = split(stream);

        let r = Self::reader(BufReader::with_capacity(8192, read_half), &context);
        let w = Self::writer(BufWriter::with_capacity(8192, write_half), receiver);

        let error = match futures::try_join!(r, w) {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };

        debug!(
            connection_id = %context.connection_id,
            error = %error,
            "Connection broken"
        );
        *lock(&context.state) = ConnectionState::Defunct;

        // Respond to all pending requests with the error
        for (_, handler) in context.streams.take_all_pending() {
            let _ = handler.0.send(Err(error.clone()));
        }

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error);
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        context: &RouterContext,
    ) -> Result<(), QueryError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(|err| {
                    QueryError::BrokenConnection(format!("Failed to read frame: {}", err))
                })?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            if params.stream == EVENT_STREAM_ID {
                if let Some(event_sender) = context.event_sender.as_ref() {
                    Self::handle_event(response, context, event_sender).await;
                }
                continue;
            }

            let Some(stream) = StreamId::from_header(params.stream) else {
                // Negative streams other than -1 are not used by the server.
                continue;
            };

            trace!(
                connection_id = %context.connection_id,
                stream = params.stream,
                ?opcode,
                "Received response"
            );
            match context.streams.take_pending(stream) {
                Some(handler) => {
                    // Don't care if sending of the response fails. This must
                    // mean that the receiver side was impatient and is not
                    // waiting for the result anymore.
                    let _ = handler.0.send(Ok(response));
                }
                None => {
                    debug!(
                        connection_id = %context.connection_id,
                        stream = params.stream,
                        "Received response with no pending request, dropping it"
                    );
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), QueryError> {
        // When the Connection object is dropped, the sender half
        // of the channel will be dropped, this task will return
        // and the whole worker will be stopped
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            loop {
                let req_data = task.serialized_request.get_data();
                total_sent += req_data.len();
                num_requests += 1;
                write_half
                    .write_all(req_data)
                    .await
                    .map_err(|err| {
                        QueryError::BrokenConnection(format!("Failed to write request: {}", err))
                    })?;
                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => break,
                };
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(|err| {
                    QueryError::BrokenConnection(format!("Failed to flush requests: {}", err))
                })?;
        }

        Ok(())
    }

    async fn handle_event(
        task_response: TaskResponse,
        context: &RouterContext,
        event_sender: &mpsc::Sender<Event>,
    ) {
        let event = match Self::parse_response(task_response, context.compression) {
            Ok(Response::Event(event)) => event,
            Ok(other) => {
                warn!(
                    connection_id = %context.connection_id,
                    opcode = ?other.opcode(),
                    "Expected to receive Event response on the event stream"
                );
                return;
            }
            Err(err) => {
                warn!(
                    connection_id = %context.connection_id,
                    error = %err,
                    "Failed to parse event, dropping it"
                );
                return;
            }
        };

        // Receiver might have been dropped, nothing to do about it.
        let _ = event_sender.send(event).await;
    }
}

/// Held while a management request is outstanding. If the request is
/// abandoned before its response arrives, a late reply on the management
/// stream would be taken by the next management request, so the connection
/// is marked defunct instead.
struct ManagementInFlight<'a> {
    connection: &'a Connection,
}

impl Drop for ManagementInFlight<'_> {
    fn drop(&mut self) {
        if self.connection.streams.has_pending(StreamId::MANAGEMENT) {
            self.connection
                .mark_defunct("Management request abandoned before its response");
        }
    }
}

struct RouterContext {
    connection_id: ConnectionId,
    streams: Arc<StreamTable<ResponseHandler>>,
    state: Arc<StdMutex<ConnectionState>>,
    event_sender: Option<mpsc::Sender<Event>>,
    compression: Option<Compression>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.fail_pending(QueryError::ConnectionClosed);
    }
}

/// Keyspace names must be plain identifiers or double-quoted ones.
pub(crate) fn validate_keyspace_name(name: &str) -> Result<(), QueryError> {
    let valid = if let Some(quoted) = name
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        !quoted.is_empty() && quoted.len() <= 48 && !quoted.contains('"')
    } else {
        !name.is_empty()
            && name.len() <= 48
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if valid {
        Ok(())
    } else {
        Err(QueryError::BadQuery(format!(
            "Invalid keyspace name: {:?}",
            name
        )))
    }
}
