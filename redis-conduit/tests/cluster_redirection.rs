//! Redis Cluster routing against scripted nodes

mod common;

use common::{cluster_slots, init_tracing, mock_params, Action, MockConnector};
use redis_conduit::{
    calculate_slot, ClusterConfig, ClusterRouter, Cmd, Connection, DiscoveryCommand, ErrorPolicy,
    RedisError, RespValue, SlotRange,
};
use std::time::Duration;

const FOO_SLOT: u16 = 12182;

fn get_foo() -> Cmd {
    Cmd::new("GET").key("foo")
}

fn config() -> ClusterConfig {
    ClusterConfig::default().with_retry_interval(Duration::ZERO)
}

#[tokio::test]
async fn test_moved_updates_slot_map_and_retries() {
    init_tracing();
    assert_eq!(calculate_slot(b"foo"), FOO_SLOT);

    let mock = MockConnector::new();
    let seed = mock.node(7000, |_| Action::error("MOVED 12182 127.0.0.1:7001"));
    let owner = mock.node(7001, |_| Action::bulk("bar"));

    let router = ClusterRouter::new(
        mock.factory(),
        vec![mock_params(7000).with_slots(SlotRange::new(0, 16383))],
        config(),
    )
    .unwrap();

    let reply = router.send(&get_foo()).await.unwrap();
    assert_eq!(reply, RespValue::from("bar"));
    assert_eq!(router.slot_map().await.get(FOO_SLOT), Some("127.0.0.1:7001"));
    assert_eq!(router.slot_map().await.get(FOO_SLOT - 1), Some("127.0.0.1:7000"));

    // The second request goes straight to the new owner
    router.send(&get_foo()).await.unwrap();
    assert_eq!(seed.count("GET"), 1);
    assert_eq!(owner.count("GET"), 2);
    assert_eq!(owner.connects(), 1);
}

#[tokio::test]
async fn test_ask_sends_asking_once_and_keeps_slot_map() {
    init_tracing();
    let mock = MockConnector::new();
    let seed = mock.node(7000, |_| Action::error("ASK 12182 127.0.0.1:7002"));
    let importing = mock.node(7002, |req| match req[0].as_str() {
        "ASKING" => Action::ok(),
        "GET" => Action::bulk("bar"),
        _ => Action::error("ERR unexpected"),
    });

    let router = ClusterRouter::new(
        mock.factory(),
        vec![mock_params(7000).with_slots(SlotRange::new(0, 16383))],
        config(),
    )
    .unwrap();

    assert_eq!(router.send(&get_foo()).await.unwrap(), RespValue::from("bar"));
    assert_eq!(
        importing.received(),
        vec![
            vec!["ASKING".to_string()],
            vec!["GET".to_string(), "foo".to_string()]
        ]
    );
    assert_eq!(router.slot_map().await.get(FOO_SLOT), Some("127.0.0.1:7000"));

    // ASK is a one-shot hint: the next request starts at the slot owner again
    router.send(&get_foo()).await.unwrap();
    assert_eq!(seed.count("GET"), 2);
    assert_eq!(importing.count("ASKING"), 2);
}

#[tokio::test]
async fn test_connection_failures_bounded_by_retry_limit() {
    init_tracing();
    let mock = MockConnector::new();
    let dead = mock.node(7000, |_| Action::Close);

    let router = ClusterRouter::new(
        mock.factory(),
        vec![mock_params(7000).with_slots(SlotRange::new(0, 16383))],
        config().with_retry_limit(3),
    )
    .unwrap();

    let err = router.send(&get_foo()).await.unwrap_err();
    assert!(err.is_connection_error(), "unexpected error: {err}");
    assert_eq!(dead.count("GET"), 3);
}

#[tokio::test]
async fn test_connection_failure_refreshes_topology() {
    init_tracing();
    let mock = MockConnector::new();
    // 7000 claims every slot at first, then drops the GET and reports 7001 as owner
    let seed = mock.node(7000, |req| match req[0].as_str() {
        "CLUSTER" => Action::value(cluster_slots(&[
            (0, 8191, "127.0.0.1", 7000),
            (8192, 16383, "127.0.0.1", 7001),
        ])),
        _ => Action::Close,
    });
    let owner = mock.node(7001, |_| Action::bulk("bar"));

    let router = ClusterRouter::new(
        mock.factory(),
        vec![mock_params(7000).with_slots(SlotRange::new(0, 16383))],
        config(),
    )
    .unwrap();

    assert_eq!(router.send(&get_foo()).await.unwrap(), RespValue::from("bar"));
    assert_eq!(seed.count("GET"), 1);
    assert_eq!(seed.count("CLUSTER"), 1);
    assert_eq!(owner.count("GET"), 1);
    assert_eq!(router.slot_map().await.get(FOO_SLOT), Some("127.0.0.1:7001"));
}

#[tokio::test]
async fn test_discovery_on_first_use() {
    init_tracing();
    let mock = MockConnector::new();
    let seed = mock.node(7000, |req| match req[0].as_str() {
        // Empty host means the node that answered
        "CLUSTER" => Action::value(cluster_slots(&[
            (0, 8191, "", 7000),
            (8192, 16383, "127.0.0.1", 7001),
        ])),
        _ => Action::bulk("from-7000"),
    });
    let owner = mock.node(7001, |_| Action::bulk("from-7001"));

    let router = ClusterRouter::new(mock.factory(), vec![mock_params(7000)], config()).unwrap();
    assert!(router.slot_map().await.is_empty());

    assert_eq!(
        router.send(&get_foo()).await.unwrap(),
        RespValue::from("from-7001")
    );
    let map = router.slot_map().await;
    assert!(map.is_complete());
    assert_eq!(map.get(0), Some("127.0.0.1:7000"));
    assert_eq!(router.nodes().await, vec!["127.0.0.1:7000", "127.0.0.1:7001"]);
    assert_eq!(seed.count("GET"), 0);
    assert_eq!(owner.count("GET"), 1);
}

#[tokio::test]
async fn test_cluster_shards_discovery() {
    init_tracing();
    let mock = MockConnector::new();
    let shard = |first: i64, last: i64, port: i64| {
        RespValue::Array(vec![
            RespValue::from("slots"),
            RespValue::Array(vec![RespValue::Integer(first), RespValue::Integer(last)]),
            RespValue::from("nodes"),
            RespValue::Array(vec![RespValue::Array(vec![
                RespValue::from("port"),
                RespValue::Integer(port),
                RespValue::from("ip"),
                RespValue::from("127.0.0.1"),
                RespValue::from("role"),
                RespValue::from("master"),
                RespValue::from("health"),
                RespValue::from("online"),
            ])]),
        ])
    };
    let shards = RespValue::Array(vec![shard(0, 8191, 7000), shard(8192, 16383, 7001)]);
    let seed = mock.node(7000, move |req| match req.get(1).map(String::as_str) {
        Some("SHARDS") => Action::value(shards.clone()),
        _ => Action::error("ERR unexpected"),
    });
    mock.node(7001, |_| Action::bulk("bar"));

    let router = ClusterRouter::new(
        mock.factory(),
        vec![mock_params(7000)],
        config().with_discovery(DiscoveryCommand::Shards),
    )
    .unwrap();

    router.refresh_topology().await.unwrap();
    assert_eq!(seed.received(), vec![vec!["CLUSTER".to_string(), "SHARDS".to_string()]]);
    assert_eq!(router.send(&get_foo()).await.unwrap(), RespValue::from("bar"));
}

#[tokio::test]
async fn test_refresh_fails_fast_on_error_reply() {
    init_tracing();
    let mock = MockConnector::new();
    let seed = mock.node(7000, |_| {
        Action::error("ERR This instance has cluster support disabled")
    });

    let router = ClusterRouter::new(mock.factory(), vec![mock_params(7000)], config()).unwrap();
    let err = router.refresh_topology().await.unwrap_err();
    assert!(matches!(err, RedisError::Server { .. }));
    assert_eq!(seed.count("CLUSTER"), 1);
}

#[tokio::test]
async fn test_redirection_loop_is_bounded() {
    init_tracing();
    let mock = MockConnector::new();
    mock.node(7000, |_| Action::error("MOVED 12182 127.0.0.1:7001"));
    mock.node(7001, |_| Action::error("MOVED 12182 127.0.0.1:7000"));

    let router = ClusterRouter::new(
        mock.factory(),
        vec![mock_params(7000).with_slots(SlotRange::new(0, 16383))],
        config().with_max_redirections(4),
    )
    .unwrap();

    let err = router.send(&get_foo()).await.unwrap_err();
    assert!(matches!(err, RedisError::Cluster(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn test_error_policy() {
    init_tracing();
    let mock = MockConnector::new();
    mock.node(7000, |_| Action::error("WRONGTYPE Operation against a key"));
    let seeds = || vec![mock_params(7000).with_slots(SlotRange::new(0, 16383))];

    let raising = ClusterRouter::new(mock.factory(), seeds(), config()).unwrap();
    let err = raising.send(&get_foo()).await.unwrap_err();
    assert!(matches!(err, RedisError::Server { ref node, .. } if node == "127.0.0.1:7000"));

    let returning = ClusterRouter::new(
        mock.factory(),
        seeds(),
        config().with_error_policy(ErrorPolicy::Return),
    )
    .unwrap();
    let reply = returning.send(&get_foo()).await.unwrap();
    let err = reply.into_error().unwrap();
    assert_eq!(err.code(), "WRONGTYPE");
}

#[tokio::test]
async fn test_cross_slot_command_rejected() {
    let mock = MockConnector::new();
    let seed = mock.node(7000, |_| Action::ok());
    let router = ClusterRouter::new(
        mock.factory(),
        vec![mock_params(7000).with_slots(SlotRange::new(0, 16383))],
        config(),
    )
    .unwrap();

    let err = router
        .send(&Cmd::new("MSET").key("a").arg("1").key("b").arg("2"))
        .await
        .unwrap_err();
    assert!(matches!(err, RedisError::Routing(_)));
    assert!(seed.received().is_empty());

    router
        .send(&Cmd::new("MSET").key("{t}a").arg("1").key("{t}b").arg("2"))
        .await
        .unwrap();
    assert_eq!(seed.count("MSET"), 1);
}

#[tokio::test]
async fn test_unreachable_cluster_without_slots_reports_connection_error() {
    init_tracing();
    let mock = MockConnector::new();
    let dead = mock.node(7000, |_| Action::Close);

    let router = ClusterRouter::new(
        mock.factory(),
        vec![mock_params(7000)],
        config().with_retry_limit(3),
    )
    .unwrap();

    let err = router.send(&get_foo()).await.unwrap_err();
    assert!(err.is_connection_error(), "unexpected error: {err}");
    assert_eq!(err.node(), Some("127.0.0.1:7000"));
    assert_eq!(dead.count("GET"), 3);
}

#[tokio::test]
async fn test_refresh_gives_up_after_retry_limit_attempts() {
    init_tracing();
    let mock = MockConnector::new();
    let first = mock.node(7000, |_| Action::Close);
    let second = mock.node(7001, |_| Action::Close);

    let router = ClusterRouter::new(
        mock.factory(),
        vec![mock_params(7000), mock_params(7001)],
        config().with_retry_limit(3),
    )
    .unwrap();

    let err = router.refresh_topology().await.unwrap_err();
    assert!(err.is_connection_error(), "unexpected error: {err}");
    // Candidates are tried in turn: 7000, 7001, then 7000 again
    assert_eq!(first.count("CLUSTER"), 2);
    assert_eq!(second.count("CLUSTER"), 1);
}

#[tokio::test]
async fn test_refresh_keeps_open_connections_to_listed_nodes() {
    init_tracing();
    let mock = MockConnector::new();
    // 7000 owns every slot, 7001 is listed as its replica and importing foo
    let slots = RespValue::Array(vec![RespValue::Array(vec![
        RespValue::Integer(0),
        RespValue::Integer(16383),
        RespValue::Array(vec![RespValue::from("127.0.0.1"), RespValue::Integer(7000)]),
        RespValue::Array(vec![RespValue::from("127.0.0.1"), RespValue::Integer(7001)]),
    ])]);
    mock.node(7000, move |req| match req[0].as_str() {
        "CLUSTER" => Action::value(slots.clone()),
        _ => Action::error("ASK 12182 127.0.0.1:7001"),
    });
    let importing = mock.node(7001, |req| match req[0].as_str() {
        "ASKING" => Action::ok(),
        _ => Action::bulk("bar"),
    });

    let router = ClusterRouter::new(mock.factory(), vec![mock_params(7000)], config()).unwrap();
    assert_eq!(router.send(&get_foo()).await.unwrap(), RespValue::from("bar"));

    router.refresh_topology().await.unwrap();
    assert_eq!(router.nodes().await, vec!["127.0.0.1:7000", "127.0.0.1:7001"]);

    assert_eq!(router.send(&get_foo()).await.unwrap(), RespValue::from("bar"));
    assert_eq!(importing.count("GET"), 2);
    assert_eq!(importing.connects(), 1);
}
