mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{MockFactory, Recorder};
use fanout_core::ConnectionPool;
use fanout_exec::{ConnectionState, Target, TransportKind};

fn pool(recorder: &Arc<Recorder>) -> ConnectionPool {
    ConnectionPool::new(Arc::new(MockFactory::new(recorder)))
}

#[tokio::test]
async fn test_checkin_then_reuse() {
    let recorder = Recorder::new();
    let pool = pool(&recorder);
    let target = Target::new("web1", TransportKind::Ssh);

    let mut conn = pool.checkout(&target).await.unwrap();
    conn.connect().await.unwrap();
    pool.checkin(conn).await;
    assert_eq!(pool.idle_count().await, 1);

    let conn = pool.checkout(&target).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(pool.idle_count().await, 0);
    assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unconnected_is_not_pooled() {
    let recorder = Recorder::new();
    let pool = pool(&recorder);

    let conn = pool
        .checkout(&Target::new("web1", TransportKind::Ssh))
        .await
        .unwrap();
    pool.checkin(conn).await;

    assert_eq!(pool.idle_count().await, 0);
}

#[tokio::test]
async fn test_extra_connection_is_closed() {
    let recorder = Recorder::new();
    let pool = pool(&recorder);
    let target = Target::new("web1", TransportKind::Ssh);

    let mut first = pool.checkout(&target).await.unwrap();
    let mut second = pool.checkout(&target).await.unwrap();
    first.connect().await.unwrap();
    second.connect().await.unwrap();

    pool.checkin(first).await;
    pool.checkin(second).await;

    assert_eq!(pool.idle_count().await, 1);
    assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_drain_disconnects_idle() {
    let recorder = Recorder::new();
    let pool = pool(&recorder);

    for name in ["a", "b", "c"] {
        let mut conn = pool
            .checkout(&Target::new(name, TransportKind::Ssh))
            .await
            .unwrap();
        conn.connect().await.unwrap();
        pool.checkin(conn).await;
    }
    assert_eq!(pool.idle_count().await, 3);

    pool.drain().await;

    assert_eq!(pool.idle_count().await, 0);
    assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 3);
}
