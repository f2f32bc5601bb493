//! Cluster Routing Tests
//!
//! Two balanced masters over the in-process network:
//! - n1 owns slots 0..=8191 ("b", "2", "bar", "{t}...")
//! - n2 owns slots 8192..=16383 ("a", "1", "foo")


use shardis_server::{Cluster, LocalNetwork, Reply};
use std::sync::Arc;
use test_helper::{exec, shutdown_all, start_node, wait_balanced};

async fn two_masters() -> (LocalNetwork, Arc<Cluster>, Arc<Cluster>) {
    let net = LocalNetwork::new();
    let n1 = start_node(&net, "n1", None, None).await;
    let n2 = start_node(&net, "n2", Some("n1"), None).await;
    wait_balanced(&[&n1, &n2], 2).await;
    (net, n1, n2)
}

#[tokio::test]
async fn test_single_key_commands_reach_owner() {
    let (_net, n1, n2) = two_masters().await;

    // Written through n1, stored on n2
    assert!(exec(&n1, &["SET", "a", "1"]).await.is_ok());
    assert!(n2.store().get_entity("a").is_some());
    assert!(n1.store().get_entity("a").is_none());

    assert_eq!(exec(&n2, &["GET", "a"]).await, Reply::bulk("1"));
    assert_eq!(exec(&n1, &["INCR", "a"]).await, Reply::Integer(2));
    assert_eq!(exec(&n1, &["GET", "a"]).await, Reply::bulk("2"));

    shutdown_all(&[&n1, &n2]);
}

#[tokio::test]
async fn test_del_and_exists_across_nodes() {
    let (_net, n1, n2) = two_masters().await;

    assert!(exec(&n1, &["SET", "1", "x"]).await.is_ok());
    assert!(exec(&n1, &["SET", "2", "y"]).await.is_ok());
    assert_eq!(exec(&n2, &["EXISTS", "1", "2", "missing"]).await, Reply::Integer(2));

    assert_eq!(exec(&n1, &["DEL", "1", "2"]).await, Reply::Integer(2));
    assert_eq!(exec(&n1, &["EXISTS", "1", "2"]).await, Reply::Integer(0));
    assert!(n1.store().get_entity("2").is_none());
    assert!(n2.store().get_entity("1").is_none());

    shutdown_all(&[&n1, &n2]);
}

#[tokio::test]
async fn test_mget_keeps_request_order() {
    let (_net, n1, n2) = two_masters().await;

    exec(&n1, &["SET", "a", "va"]).await;
    exec(&n1, &["SET", "b", "vb"]).await;

    let reply = exec(&n2, &["MGET", "b", "nope", "a"]).await;
    assert_eq!(
        reply,
        Reply::Array(vec![Reply::bulk("vb"), Reply::Null, Reply::bulk("va")])
    );

    shutdown_all(&[&n1, &n2]);
}

#[tokio::test]
async fn test_mset_on_one_owner_skips_transaction() {
    let (_net, n1, n2) = two_masters().await;

    let reply = exec(&n2, &["MSET", "{t}x", "1", "{t}y", "2"]).await;
    assert!(reply.is_ok());
    assert!(n1.tx_manager().is_empty());
    assert!(n2.tx_manager().is_empty());
    assert_eq!(exec(&n2, &["GET", "{t}y"]).await, Reply::bulk("2"));

    shutdown_all(&[&n1, &n2]);
}

#[tokio::test]
async fn test_mset_across_nodes() {
    let (_net, n1, n2) = two_masters().await;

    let reply = exec(&n1, &["MSET", "a", "1", "b", "2"]).await;
    assert!(reply.is_ok(), "{}", reply);
    assert_eq!(n1.tx_manager().len(), 1);
    assert_eq!(n2.tx_manager().len(), 1);
    assert!(n2.store().get_entity("a").is_some());
    assert!(n1.store().get_entity("b").is_some());

    // One key already present vetoes the whole MSETNX
    let reply = exec(&n2, &["MSETNX", "a", "x", "bar", "y"]).await;
    assert_eq!(reply, Reply::Integer(0));
    assert_eq!(exec(&n1, &["GET", "a"]).await, Reply::bulk("1"));
    assert_eq!(exec(&n1, &["EXISTS", "bar"]).await, Reply::Integer(0));

    let reply = exec(&n2, &["MSETNX", "foo", "x", "bar", "y"]).await;
    assert_eq!(reply, Reply::Integer(1));
    assert_eq!(
        exec(&n2, &["MGET", "foo", "bar"]).await,
        Reply::Array(vec![Reply::bulk("x"), Reply::bulk("y")])
    );

    shutdown_all(&[&n1, &n2]);
}

#[tokio::test]
async fn test_failed_mset_prepare_rolls_back_every_participant() {
    let (net, n1, n2) = two_masters().await;

    exec(&n1, &["SET", "b", "old"]).await;

    // "a" lives on n2, whose participant never answers the prepare
    net.fail_on("n2", "cluster.prepare");
    let reply = exec(&n1, &["MSET", "a", "x", "b", "y"]).await;
    assert!(reply.is_error(), "{}", reply);
    net.clear_faults();

    assert_eq!(exec(&n1, &["GET", "b"]).await, Reply::bulk("old"));
    assert_eq!(exec(&n1, &["EXISTS", "a"]).await, Reply::Integer(0));
    assert!(n2.store().get_entity("a").is_none());

    // No key lock outlives the rollback
    assert!(exec(&n1, &["SET", "b", "z"]).await.is_ok());
    assert!(exec(&n2, &["SET", "a", "w"]).await.is_ok());
    assert!(exec(&n2, &["MSET", "a", "1", "b", "2"]).await.is_ok());
    assert_eq!(
        exec(&n1, &["MGET", "a", "b"]).await,
        Reply::Array(vec![Reply::bulk("1"), Reply::bulk("2")])
    );

    shutdown_all(&[&n1, &n2]);
}

#[tokio::test]
async fn test_rename_across_nodes_keeps_ttl() {
    let (_net, n1, n2) = two_masters().await;

    exec(&n1, &["SET", "b", "v"]).await;
    exec(&n1, &["PEXPIRE", "b", "60000"]).await;

    let reply = exec(&n2, &["RENAME", "b", "a"]).await;
    assert!(reply.is_ok(), "{}", reply);
    assert_eq!(exec(&n1, &["GET", "a"]).await, Reply::bulk("v"));
    assert_eq!(exec(&n1, &["EXISTS", "b"]).await, Reply::Integer(0));
    let pttl = exec(&n1, &["PTTL", "a"]).await.as_integer().unwrap();
    assert!(pttl > 0 && pttl <= 60000, "pttl {}", pttl);

    // Missing source
    let reply = exec(&n1, &["RENAME", "b", "a"]).await;
    assert!(reply.is_error());

    shutdown_all(&[&n1, &n2]);
}

#[tokio::test]
async fn test_renamenx_and_copy_respect_destination() {
    let (_net, n1, n2) = two_masters().await;

    exec(&n1, &["SET", "b", "src"]).await;
    exec(&n1, &["SET", "a", "dst"]).await;

    assert_eq!(exec(&n1, &["RENAMENX", "b", "a"]).await, Reply::Integer(0));
    assert_eq!(exec(&n1, &["COPY", "b", "a"]).await, Reply::Integer(0));
    assert_eq!(exec(&n1, &["GET", "a"]).await, Reply::bulk("dst"));

    assert_eq!(exec(&n1, &["COPY", "b", "a", "REPLACE"]).await, Reply::Integer(1));
    assert_eq!(exec(&n1, &["GET", "a"]).await, Reply::bulk("src"));
    assert_eq!(exec(&n1, &["GET", "b"]).await, Reply::bulk("src"));

    // Copying a missing key is a no-op, not an error
    assert_eq!(exec(&n1, &["COPY", "2", "1"]).await, Reply::Integer(0));

    shutdown_all(&[&n1, &n2]);
}

#[tokio::test]
async fn test_failed_rename_leaves_source_untouched() {
    let (net, n1, n2) = two_masters().await;

    exec(&n1, &["SET", "b", "v"]).await;
    exec(&n1, &["PEXPIRE", "b", "60000"]).await;
    let expires_at = n1.store().get_expiration("b");
    assert!(expires_at.is_some());

    // Destination owner drops the prepare
    net.fail_on("n2", "cluster.preparerenameto");
    let reply = exec(&n1, &["RENAME", "b", "a"]).await;
    assert!(reply.is_error(), "{}", reply);
    net.clear_faults();

    assert_eq!(exec(&n1, &["GET", "b"]).await, Reply::bulk("v"));
    assert_eq!(n1.store().get_expiration("b"), expires_at);
    assert_eq!(exec(&n1, &["EXISTS", "a"]).await, Reply::Integer(0));

    // Locks on the source were released by the rollback
    assert!(exec(&n1, &["SET", "b", "w"]).await.is_ok());
    assert!(exec(&n1, &["RENAME", "b", "a"]).await.is_ok());
    assert_eq!(exec(&n2, &["GET", "a"]).await, Reply::bulk("w"));

    shutdown_all(&[&n1, &n2]);
}

#[tokio::test]
async fn test_flushdb_reaches_every_master() {
    let (_net, n1, n2) = two_masters().await;

    exec(&n1, &["MSET", "a", "1", "b", "2"]).await;
    assert!(exec(&n2, &["FLUSHDB"]).await.is_ok());
    assert!(n1.store().keys().is_empty());
    assert!(n2.store().keys().is_empty());

    shutdown_all(&[&n1, &n2]);
}

#[tokio::test]
async fn test_cluster_nodes_lists_both_masters() {
    let (_net, n1, n2) = two_masters().await;

    let Reply::Bulk(text) = exec(&n2, &["cluster.nodes"]).await else {
        panic!("expected bulk reply");
    };
    let text = String::from_utf8_lossy(&text);
    assert!(text.contains("n1 raft-n1 master,leader"));
    assert!(text.contains("n2 raft-n2 master,myself"));
    assert!(text.contains("0-8191"));
    assert!(text.contains("8192-16383"));

    shutdown_all(&[&n1, &n2]);
}
