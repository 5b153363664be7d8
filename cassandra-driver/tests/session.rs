mod utils;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use cassandra_cql::frame::request::RequestOpcode;
use cassandra_driver::config::{DistancePooling, PoolingOptions};
use cassandra_driver::errors::{DbError, NewSessionError, NoHostAvailable, QueryError};
use cassandra_driver::policies::reconnection::ConstantReconnectionPolicy;
use cassandra_driver::policies::retry::FallthroughRetryPolicy;
use cassandra_driver::{Consistency, QueryResult, Session, SessionBuilder};
use itertools::Itertools;
use utils::{setup_tracing, MockNode, Reply};

fn pooling(core_connections: usize, max_connections: usize, max_requests: usize) -> PoolingOptions {
    let local = DistancePooling {
        core_connections,
        max_connections,
        max_simultaneous_requests_threshold: max_requests,
        min_simultaneous_requests_threshold: 0,
    };
    PoolingOptions {
        local,
        remote: local,
    }
}

fn builder(node: &MockNode) -> SessionBuilder {
    SessionBuilder::new()
        .known_node(node.addr().to_string())
        .reconnection_policy(Arc::new(ConstantReconnectionPolicy::new(
            Duration::from_millis(50),
        )))
}

async fn wait_until(condition: impl Fn() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn query_and_use_keyspace() {
    setup_tracing();
    let node = MockNode::start().await;
    node.set_handler(|query| {
        if query.starts_with("SELECT") {
            Reply::IntRows(vec![Some(7)])
        } else {
            Reply::Void
        }
    });
    let session = builder(&node).use_keyspace("ks").build().await.unwrap();
    assert_eq!(session.get_keyspace().as_deref().map(String::as_str), Some("ks"));

    let result = session.query("SELECT a FROM t", Consistency::One).await.unwrap();
    let mut rows = assert_matches!(result, QueryResult::Rows(rows) => rows);
    assert!(rows.next());
    assert_eq!(rows.get_int(0usize).unwrap(), 7);

    session.query("USE other", Consistency::One).await.unwrap();
    assert_eq!(
        session.get_keyspace().as_deref().map(String::as_str),
        Some("other")
    );

    assert_matches!(
        session.use_keyspace("bad keyspace").await,
        Err(QueryError::BadQuery(_))
    );
    let uses: Vec<_> = node
        .received_with(RequestOpcode::Query)
        .into_iter()
        .filter(|request| request.text.starts_with("USE"))
        .map(|request| request.text)
        .collect();
    assert_eq!(uses, vec!["USE ks".to_owned(), "USE other".to_owned()]);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn new_connections_switch_to_session_keyspace() {
    setup_tracing();
    let node = MockNode::start().await;
    node.set_handler(|query| {
        if query.starts_with("SELECT") {
            Reply::Delayed(Duration::from_millis(100), Box::new(Reply::Void))
        } else {
            Reply::Void
        }
    });
    let session = builder(&node)
        .pooling(pooling(1, 2, 1))
        .use_keyspace("ks")
        .build()
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        session.query("SELECT a FROM t", Consistency::One),
        session.query("SELECT a FROM t", Consistency::One),
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(node.accepted_connections(), 2);

    // Every connection that ran a SELECT had switched keyspace before.
    let by_connection = node
        .received_with(RequestOpcode::Query)
        .into_iter()
        .into_group_map_by(|request| request.connection);
    assert_eq!(by_connection.len(), 2);
    for (connection, requests) in by_connection {
        let texts: Vec<_> = requests.iter().map(|request| request.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["USE ks", "SELECT a FROM t"],
            "connection {}",
            connection
        );
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn prepared_statements_follow_new_connections() {
    setup_tracing();
    let node = MockNode::start().await;
    node.set_handler(|_| Reply::Delayed(Duration::from_millis(100), Box::new(Reply::Void)));
    let session = builder(&node)
        .pooling(pooling(1, 2, 1))
        .build()
        .await
        .unwrap();

    let prepared = session
        .prepare("INSERT INTO t (a) VALUES (?)")
        .await
        .unwrap();
    assert_eq!(prepared.get_statement(), "INSERT INTO t (a) VALUES (?)");
    assert_eq!(prepared.get_variables_metadata().col_count, 1);

    let values = [Some(Bytes::from_static(&[0, 0, 0, 1]))];
    let (first, second) = tokio::join!(
        session.execute(&prepared, &values, Consistency::One),
        session.execute(&prepared, &values, Consistency::One),
    );
    first.unwrap();
    second.unwrap();

    let executed_on: Vec<_> = node
        .received_with(RequestOpcode::Execute)
        .into_iter()
        .map(|request| request.connection)
        .sorted()
        .collect();
    let prepared_on: Vec<_> = node
        .received_with(RequestOpcode::Prepare)
        .into_iter()
        .map(|request| request.connection)
        .sorted()
        .collect();
    assert_eq!(executed_on, vec![0, 1]);
    assert_eq!(prepared_on, vec![0, 1]);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn statement_is_prepared_again_when_server_forgets_it() {
    setup_tracing();
    let node = MockNode::start().await;
    node.set_handler(|_| Reply::IntRows(vec![Some(1)]));
    let session = builder(&node).build().await.unwrap();

    let prepared = session.prepare("SELECT a FROM t WHERE a = ?").await.unwrap();
    node.forget_prepared();

    let result = session
        .execute(
            &prepared,
            &[Some(Bytes::from_static(&[0, 0, 0, 1]))],
            Consistency::One,
        )
        .await
        .unwrap();
    assert_matches!(result, QueryResult::Rows(_));
    assert_eq!(node.received_with(RequestOpcode::Prepare).len(), 2);
    assert_eq!(node.received_with(RequestOpcode::Execute).len(), 2);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn connections_per_host_stay_within_limit() {
    setup_tracing();
    let node = MockNode::start().await;
    node.set_handler(|_| Reply::Delayed(Duration::from_millis(50), Box::new(Reply::Void)));
    let session = builder(&node)
        .pooling(pooling(1, 2, 1))
        .build()
        .await
        .unwrap();

    let queries = (0..20).map(|_| session.query("SELECT a FROM t", Consistency::One));
    let results = futures::future::join_all(queries).await;

    for result in &results {
        assert_matches!(
            result,
            Ok(QueryResult::Void) | Err(QueryError::NoHostAvailable(_))
        );
    }
    assert!(results.iter().any(|result| result.is_ok()));
    assert!(session.connection_count(node.addr()) <= 2);
    assert!(node.accepted_connections() <= 2);

    session.close();
    assert_eq!(session.connection_count(node.addr()), 0);
    node.wait_for(|node| node.open_connections() == 0).await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn idle_connections_are_retired_and_swept() {
    setup_tracing();
    let node = MockNode::start().await;
    node.set_handler(|_| Reply::Delayed(Duration::from_millis(100), Box::new(Reply::Void)));
    let session = builder(&node)
        .pooling(pooling(1, 3, 1))
        .trashcan_sweep_interval(Duration::from_millis(500))
        .build()
        .await
        .unwrap();

    let (a, b, c) = tokio::join!(
        session.query("SELECT a FROM t", Consistency::One),
        session.query("SELECT a FROM t", Consistency::One),
        session.query("SELECT a FROM t", Consistency::One),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(session.pool_size(node.addr()), 3);
    assert_eq!(session.connection_count(node.addr()), 3);

    // The traffic is gone: the next checkout parks one idle connection.
    node.set_handler(|_| Reply::Void);
    session
        .query("SELECT a FROM t", Consistency::One)
        .await
        .unwrap();
    assert_eq!(session.pool_size(node.addr()), 2);
    assert_eq!(session.trashcan_size(), 1);
    assert_eq!(session.connection_count(node.addr()), 3);

    // Parked connections count until the sweep closes them.
    wait_until(|| session.trashcan_size() == 0).await;
    assert_eq!(session.connection_count(node.addr()), 2);
    node.wait_for(|node| node.open_connections() == 2).await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn down_host_is_skipped_without_connecting() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder(&node)
        .reconnection_policy(Arc::new(ConstantReconnectionPolicy::new(
            Duration::from_secs(3600),
        )))
        .build()
        .await
        .unwrap();
    let accepted = node.accepted_connections();

    assert!(session.set_down(node.addr()));
    assert!(!session.set_down(node.addr()));
    assert_matches!(
        session.query("SELECT a FROM t", Consistency::One).await,
        Err(QueryError::NoHostAvailable(NoHostAvailable { tried })) if tried.is_empty()
    );
    assert_eq!(node.accepted_connections(), accepted);

    assert!(session.bring_up(node.addr()));
    session
        .query("SELECT a FROM t", Consistency::One)
        .await
        .unwrap();
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn broken_connection_marks_host_down_until_it_answers_again() {
    setup_tracing();
    let node = MockNode::start().await;
    node.set_handler(|_| Reply::Ignore);
    let session = Arc::new(builder(&node).build().await.unwrap());

    let pending = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.query("SELECT a FROM t", Consistency::One).await }
    });
    node.wait_for(|node| node.received_with(RequestOpcode::Query).len() == 1)
        .await;

    node.set_refusing(true);
    node.kill_connections();
    let error = pending.await.unwrap().unwrap_err();
    assert!(error.is_transport_error(), "{:?}", error);

    let host = session.hosts().get(node.addr()).unwrap();
    assert!(!host.is_up());
    assert_matches!(
        session.query("SELECT a FROM t", Consistency::One).await,
        Err(QueryError::NoHostAvailable(_))
    );

    node.set_handler(|_| Reply::Void);
    node.set_refusing(false);
    wait_until(|| host.is_up()).await;
    session
        .query("SELECT a FROM t", Consistency::One)
        .await
        .unwrap();
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn server_errors_go_through_retry_policy() {
    setup_tracing();
    let node = MockNode::start().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    node.set_handler({
        let attempts = Arc::clone(&attempts);
        move |_| {
            if attempts.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Reply::Error(
                    DbError::Unavailable {
                        consistency: Consistency::Quorum,
                        required: 2,
                        alive: 1,
                    },
                    "Not enough replicas".to_owned(),
                )
            } else {
                Reply::Void
            }
        }
    });

    let session = builder(&node).build().await.unwrap();
    session
        .query("SELECT a FROM t", Consistency::Quorum)
        .await
        .unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let session = builder(&node)
        .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
        .build()
        .await
        .unwrap();
    assert_matches!(
        session.query("SELECT a FROM t", Consistency::Quorum).await,
        Err(QueryError::DbError(DbError::Unavailable { .. }, reason)) if reason == "Not enough replicas"
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn close_fails_pending_and_later_requests() {
    setup_tracing();
    let node = MockNode::start().await;
    node.set_handler(|_| Reply::Ignore);
    let session = Arc::new(builder(&node).build().await.unwrap());

    let pending = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.query("SELECT a FROM t", Consistency::One).await }
    });
    node.wait_for(|node| node.received_with(RequestOpcode::Query).len() == 1)
        .await;

    session.close();
    session.close();
    assert!(session.is_closed());
    assert_matches!(pending.await.unwrap(), Err(QueryError::ConnectionClosed));
    assert_matches!(
        session.query("SELECT a FROM t", Consistency::One).await,
        Err(QueryError::SessionClosed)
    );
    assert_eq!(session.connection_count(node.addr()), 0);
    assert!(session.hosts().get(node.addr()).unwrap().is_up());
    node.wait_for(|node| node.open_connections() == 0).await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn removed_host_loses_its_connections() {
    setup_tracing();
    let node = MockNode::start().await;
    let session = builder(&node).build().await.unwrap();
    assert_eq!(session.connection_count(node.addr()), 1);

    assert!(session.try_remove(node.addr()).is_some());
    assert!(session.try_remove(node.addr()).is_none());
    assert_eq!(session.connection_count(node.addr()), 0);
    assert_matches!(
        session.query("SELECT a FROM t", Consistency::One).await,
        Err(QueryError::NoHostAvailable(_))
    );
    node.wait_for(|node| node.open_connections() == 0).await;

    session.add_host(node.addr(), "", "");
    session
        .query("SELECT a FROM t", Consistency::One)
        .await
        .unwrap();
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn session_creation_errors() {
    setup_tracing();
    assert_matches!(
        SessionBuilder::new().build().await,
        Err(NewSessionError::EmptyKnownNodesList)
    );

    let node = MockNode::start().await;
    assert_matches!(
        builder(&node).pooling(pooling(3, 2, 100)).build().await,
        Err(NewSessionError::InvalidArgument(_))
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed: SocketAddr = listener.local_addr().unwrap();
    drop(listener);
    assert_matches!(
        SessionBuilder::new().known_node(closed.to_string()).build().await,
        Err(NewSessionError::QueryError(QueryError::NoHostAvailable(NoHostAvailable { tried })))
            if tried == vec![closed]
    );

    let session: Session = SessionBuilder::new()
        .known_node("127.0.0.1")
        .known_node(node.addr().to_string())
        .port(closed.port())
        .build()
        .await
        .unwrap();
    assert_eq!(session.hosts().len(), 2);
}
