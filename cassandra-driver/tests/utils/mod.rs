#![allow(dead_code)]

//! A minimal in-process CQL v1 node: enough of the protocol to run the
//! driver's handshake, queries, prepared statements and events against it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cassandra_cql::errors::DbError;
use cassandra_cql::frame::request::{Request, RequestOpcode};
use cassandra_cql::frame::response::error::Error as ErrorBody;
use cassandra_cql::frame::response::ResponseOpcode;
use cassandra_cql::frame::{self, types, FrameParams};
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// What the node answers to a QUERY or EXECUTE. `Void` answers a `USE`
/// with the new keyspace.
#[derive(Clone, Debug)]
pub enum Reply {
    Void,
    /// A single `int` column named `a`.
    IntRows(Vec<Option<i32>>),
    Error(DbError, String),
    Delayed(Duration, Box<Reply>),
    /// Read the request and never answer it.
    Ignore,
}

type QueryHandler = dyn Fn(&str) -> Reply + Send + Sync;

pub const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedRequest {
    pub connection: usize,
    pub opcode: RequestOpcode,
    /// Query or prepared statement text, empty for other requests.
    pub text: String,
}

struct NodeState {
    credentials: Option<(String, String)>,
    handler: Mutex<Arc<QueryHandler>>,
    refuse: AtomicBool,
    accepted: AtomicUsize,
    open: AtomicUsize,
    received: Mutex<Vec<ReceivedRequest>>,
    /// Statement texts by id.
    statements: Mutex<HashMap<Bytes, String>>,
    /// (connection, statement id) pairs the node has prepared.
    prepared: Mutex<HashSet<(usize, Bytes)>>,
    /// Prepended to the query text to form a statement id.
    statement_id_prefix: Mutex<Vec<u8>>,
    event_listeners: Mutex<Vec<mpsc::UnboundedSender<(i8, ResponseOpcode, Vec<u8>)>>>,
    kill: watch::Sender<u64>,
}

pub struct MockNode {
    addr: SocketAddr,
    state: Arc<NodeState>,
    _handle: RemoteHandle<()>,
}

impl MockNode {
    pub async fn start() -> MockNode {
        Self::start_with_credentials(None).await
    }

    /// Requires the password authenticator with these credentials.
    pub async fn start_with_credentials(credentials: Option<(&str, &str)>) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kill, _) = watch::channel(0);
        let state = Arc::new(NodeState {
            credentials: credentials.map(|(u, p)| (u.to_owned(), p.to_owned())),
            handler: Mutex::new(Arc::new(|_: &str| Reply::Void)),
            refuse: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            statements: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashSet::new()),
            statement_id_prefix: Mutex::new(Vec::new()),
            event_listeners: Mutex::new(Vec::new()),
            kill,
        });

        let (fut, _handle) = accept_loop(listener, Arc::clone(&state)).remote_handle();
        tokio::spawn(fut);

        MockNode {
            addr,
            state,
            _handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_handler(&self, handler: impl Fn(&str) -> Reply + Send + Sync + 'static) {
        *self.state.handler.lock().unwrap() = Arc::new(handler);
    }

    /// While refusing, new connections are closed right after accept.
    pub fn set_refusing(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Drops every open connection.
    pub fn kill_connections(&self) {
        self.state.kill.send_modify(|generation| *generation += 1);
    }

    /// Forgets all prepared statements, as a restarted node would.
    pub fn forget_prepared(&self) {
        self.state.prepared.lock().unwrap().clear();
    }

    /// Makes later PREPAREs return ids starting with `prefix`, as a node
    /// hashing statements differently would.
    pub fn set_statement_id_prefix(&self, prefix: &[u8]) {
        *self.state.statement_id_prefix.lock().unwrap() = prefix.to_vec();
    }

    pub fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn received_with(&self, opcode: RequestOpcode) -> Vec<ReceivedRequest> {
        self.received()
            .into_iter()
            .filter(|request| request.opcode == opcode)
            .collect()
    }

    /// Pushes a STATUS_CHANGE event to every connection that registered for events.
    pub fn push_status_change(&self, change: &str, addr: SocketAddr) {
        let mut body = Vec::new();
        types::write_string("STATUS_CHANGE", &mut body).unwrap();
        types::write_string(change, &mut body).unwrap();
        types::write_inet(addr, &mut body);
        self.state
            .event_listeners
            .lock()
            .unwrap()
            .retain(|listener| {
                listener
                    .send((frame::EVENT_STREAM_ID, ResponseOpcode::Event, body.clone()))
                    .is_ok()
            });
    }

    /// Waits until `condition` holds, polling every few milliseconds.
    pub async fn wait_for(&self, condition: impl Fn(&MockNode) -> bool) {
        while !condition(self) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<NodeState>) {
    let mut next_connection = 0;
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            continue;
        };
        if state.refuse.load(Ordering::SeqCst) {
            drop(socket);
            continue;
        }
        state.accepted.fetch_add(1, Ordering::SeqCst);
        state.open.fetch_add(1, Ordering::SeqCst);
        let connection = next_connection;
        next_connection += 1;
        tokio::spawn(serve_connection(socket, connection, Arc::clone(&state)));
    }
}

async fn serve_connection(socket: TcpStream, connection: usize, state: Arc<NodeState>) {
    let mut kill = state.kill.subscribe();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let (sender, mut receiver) = mpsc::unbounded_channel::<(i8, ResponseOpcode, Vec<u8>)>();

    let writer = async move {
        while let Some((stream, opcode, body)) = receiver.recv().await {
            let header = frame::encode_header(0x81, 0, stream, opcode as u8, body.len() as i32);
            if write_half.write_all(&header).await.is_err()
                || write_half.write_all(&body).await.is_err()
            {
                break;
            }
        }
    };
    let (writer, _writer_handle) = writer.remote_handle();
    tokio::spawn(writer);

    loop {
        let request = tokio::select! {
            request = frame::read_request_frame(&mut reader) => request,
            _ = kill.changed() => break,
        };
        let Ok((params, opcode, body)) = request else {
            break;
        };
        handle_request(&state, connection, params, opcode, body, &sender);
    }

    debug!(connection, "Mock connection closed");
    state.open.fetch_sub(1, Ordering::SeqCst);
}

fn handle_request(
    state: &Arc<NodeState>,
    connection: usize,
    params: FrameParams,
    opcode: RequestOpcode,
    body: Bytes,
    sender: &mpsc::UnboundedSender<(i8, ResponseOpcode, Vec<u8>)>,
) {
    let request = Request::deserialize(&mut &body[..], opcode).unwrap();
    let stream = params.stream;
    let reply = |opcode: ResponseOpcode, body: Vec<u8>| {
        let _ = sender.send((stream, opcode, body));
    };
    let text = match &request {
        Request::Query(query) => query.contents.to_string(),
        Request::Prepare(prepare) => prepare.query.to_string(),
        Request::Execute(execute) => state
            .statements
            .lock()
            .unwrap()
            .get(&execute.id)
            .cloned()
            .unwrap_or_default(),
        _ => String::new(),
    };
    trace!(connection, stream, ?opcode, text = %text, "Mock request");
    state.received.lock().unwrap().push(ReceivedRequest {
        connection,
        opcode,
        text: text.clone(),
    });

    match request {
        Request::Options(_) => {
            let mut options = HashMap::new();
            options.insert("CQL_VERSION".to_owned(), vec!["3.0.0".to_owned()]);
            options.insert("COMPRESSION".to_owned(), Vec::new());
            let mut body = Vec::new();
            types::write_string_multimap(&options, &mut body).unwrap();
            reply(ResponseOpcode::Supported, body);
        }
        Request::Startup(_) => match &state.credentials {
            Some(_) => {
                let mut body = Vec::new();
                types::write_string(PASSWORD_AUTHENTICATOR, &mut body).unwrap();
                reply(ResponseOpcode::Authenticate, body);
            }
            None => reply(ResponseOpcode::Ready, Vec::new()),
        },
        Request::Credentials(credentials) => {
            let expected = state.credentials.as_ref().unwrap();
            let field = |name: &str| credentials.credentials.get(name).map(|v| v.to_string());
            let matches = field("username").as_ref() == Some(&expected.0)
                && field("password").as_ref() == Some(&expected.1);
            if matches {
                reply(ResponseOpcode::Ready, Vec::new());
            } else {
                reply(
                    ResponseOpcode::Error,
                    error_body(DbError::AuthenticationError, "Bad credentials"),
                );
            }
        }
        Request::Register(_) => {
            state.event_listeners.lock().unwrap().push(sender.clone());
            reply(ResponseOpcode::Ready, Vec::new());
        }
        Request::Query(query) => {
            let handler = Arc::clone(&*state.handler.lock().unwrap());
            let answer = handler(&text);
            match (query.contents.strip_prefix("USE "), answer) {
                (Some(keyspace), Reply::Void) => {
                    let mut body = Vec::new();
                    types::write_int(0x0003, &mut body);
                    types::write_string(keyspace.trim_matches('"'), &mut body).unwrap();
                    reply(ResponseOpcode::Result, body);
                }
                (_, answer) => spawn_reply(answer, stream, sender.clone()),
            }
        }
        Request::Prepare(prepare) => {
            let mut id = state.statement_id_prefix.lock().unwrap().clone();
            id.extend_from_slice(prepare.query.as_bytes());
            let id = Bytes::from(id);
            state
                .statements
                .lock()
                .unwrap()
                .insert(id.clone(), prepare.query.to_string());
            state.prepared.lock().unwrap().insert((connection, id.clone()));

            let mut body = Vec::new();
            types::write_int(0x0004, &mut body);
            types::write_short_bytes(&id, &mut body).unwrap();
            write_int_column_metadata(&mut body);
            reply(ResponseOpcode::Result, body);
        }
        Request::Execute(execute) => {
            let known = state
                .prepared
                .lock()
                .unwrap()
                .contains(&(connection, execute.id.clone()));
            if !known {
                reply(
                    ResponseOpcode::Error,
                    error_body(
                        DbError::Unprepared {
                            statement_id: execute.id.clone(),
                        },
                        "Prepared statement not found",
                    ),
                );
                return;
            }
            let handler = Arc::clone(&*state.handler.lock().unwrap());
            spawn_reply(handler(&text), stream, sender.clone());
        }
    }
}

fn spawn_reply(
    reply: Reply,
    stream: i8,
    sender: mpsc::UnboundedSender<(i8, ResponseOpcode, Vec<u8>)>,
) {
    tokio::spawn(async move {
        let mut reply = reply;
        let reply = loop {
            match reply {
                Reply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                other => break other,
            }
        };
        let (opcode, body) = match reply {
            Reply::Void => {
                let mut body = Vec::new();
                types::write_int(0x0001, &mut body);
                (ResponseOpcode::Result, body)
            }
            Reply::IntRows(values) => (ResponseOpcode::Result, int_rows_body(&values)),
            Reply::Error(error, reason) => (ResponseOpcode::Error, error_body(error, &reason)),
            Reply::Ignore => return,
            Reply::Delayed(..) => unreachable!(),
        };
        let _ = sender.send((stream, opcode, body));
    });
}

fn error_body(error: DbError, reason: &str) -> Vec<u8> {
    let mut body = Vec::new();
    ErrorBody {
        error,
        reason: reason.to_owned(),
    }
    .serialize(&mut body)
    .unwrap();
    body
}

/// Metadata of one `int` column `ks.t.a`, with a global table spec.
fn write_int_column_metadata(body: &mut Vec<u8>) {
    types::write_int(0x0001, body);
    types::write_int(1, body);
    types::write_string("ks", body).unwrap();
    types::write_string("t", body).unwrap();
    types::write_string("a", body).unwrap();
    types::write_short(0x0009, body);
}

fn int_rows_body(values: &[Option<i32>]) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0002, &mut body);
    write_int_column_metadata(&mut body);
    types::write_int(values.len() as i32, &mut body);
    for value in values {
        match value {
            Some(value) => types::write_bytes(&value.to_be_bytes(), &mut body).unwrap(),
            None => types::write_int(-1, &mut body),
        }
    }
    body
}
