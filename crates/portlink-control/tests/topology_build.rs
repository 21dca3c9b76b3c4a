//! Topology construction against a real in-memory database

use chrono::Utc;
use portlink_control::{
    build_topology, CommandChannel, IpPreference, NodeSpec, Orchestrator, TopologySpec,
    TopologyError, TunnelKind,
};
use portlink_db::entities::{chain_node, forward_port, node};
use portlink_db::{connect, migrate};
use portlink_federation::FederationClient;
use sea_orm::{ActiveModelTrait, DatabaseConnection, NotSet, Set};
use std::sync::Arc;

async fn setup_db() -> DatabaseConnection {
    let db = connect("sqlite::memory:").await.expect("connect");
    migrate(&db).await.expect("migrate");
    db
}

async fn insert_node(
    db: &DatabaseConnection,
    name: &str,
    status: i32,
    port_range: &str,
    is_remote: bool,
) -> i64 {
    let now = Utc::now();
    let model = node::ActiveModel {
        id: NotSet,
        name: Set(name.to_string()),
        secret: Set(format!("{name}-secret")),
        server_addr: Set("10.0.0.1".to_string()),
        server_addr_v4: Set(Some("10.0.0.1".to_string())),
        server_addr_v6: Set(None),
        port_range: Set(port_range.to_string()),
        tcp_listen_addr: Set("[::]".to_string()),
        udp_listen_addr: Set("[::]".to_string()),
        interface_name: Set(None),
        version: Set(Some("v1".to_string())),
        http: Set(1),
        tls: Set(1),
        socks: Set(1),
        status: Set(status),
        is_remote: Set(is_remote),
        remote_url: Set(is_remote.then(|| "http://peer".to_string())),
        remote_token: Set(is_remote.then(|| "peer-token".to_string())),
        remote_config: Set(is_remote.then(|| r#"{"shareId":1}"#.to_string())),
        sort_index: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert node");
    model.id
}

fn spec(node_id: i64, port: u16) -> NodeSpec {
    NodeSpec {
        node_id,
        port,
        protocol: Some("tls".to_string()),
        strategy: Some("round".to_string()),
    }
}

#[tokio::test]
async fn remote_auto_port_is_left_for_federation() {
    let db = setup_db().await;
    let entry_id = insert_node(&db, "entry", 1, "31000-31010", false).await;
    let remote_exit_id = insert_node(&db, "remote-exit", 1, "30000", true).await;

    // a committed port on the remote node must not influence the outcome
    forward_port::ActiveModel {
        id: NotSet,
        forward_id: Set(1),
        node_id: Set(remote_exit_id),
        port: Set(30000),
    }
    .insert(&db)
    .await
    .unwrap();

    let topology = build_topology(
        &db,
        &TopologySpec {
            entries: vec![spec(entry_id, 0)],
            hops: Vec::new(),
            exits: vec![spec(remote_exit_id, 0)],
        },
        TunnelKind::Chained,
        IpPreference::Auto,
        None,
    )
    .await
    .expect("build should not fail for a remote auto-port exit");

    assert_eq!(topology.exits.len(), 1);
    assert_eq!(
        topology.exits[0].port, 0,
        "remote exit port must stay 0 until federation reserves one"
    );
}

#[tokio::test]
async fn offline_remote_middle_node_is_allowed() {
    let db = setup_db().await;
    let entry_id = insert_node(&db, "entry-local", 1, "32000-32010", false).await;
    let remote_middle_id = insert_node(&db, "middle-remote", 0, "33000-33010", true).await;
    let exit_id = insert_node(&db, "exit-local", 1, "34000-34010", false).await;

    let topology = build_topology(
        &db,
        &TopologySpec {
            entries: vec![spec(entry_id, 0)],
            hops: vec![vec![spec(remote_middle_id, 0)]],
            exits: vec![spec(exit_id, 0)],
        },
        TunnelKind::Chained,
        IpPreference::Auto,
        None,
    )
    .await
    .expect("offline remote middle node must be accepted");

    assert_eq!(topology.hops.len(), 1);
    assert_eq!(topology.hops[0][0].node_id, remote_middle_id);
    assert!(topology.nodes[&remote_middle_id].is_remote);
    // the local exit got a port from its own range
    assert_eq!(topology.exits[0].port, 34000);
}

#[tokio::test]
async fn offline_local_node_is_rejected() {
    let db = setup_db().await;
    let entry_id = insert_node(&db, "entry", 1, "32000-32010", false).await;
    let exit_id = insert_node(&db, "exit-down", 0, "34000-34010", false).await;

    let err = build_topology(
        &db,
        &TopologySpec {
            entries: vec![spec(entry_id, 0)],
            hops: Vec::new(),
            exits: vec![spec(exit_id, 0)],
        },
        TunnelKind::Chained,
        IpPreference::Auto,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TopologyError::NodeOffline(_)));
}

#[tokio::test]
async fn duplicate_nodes_are_rejected() {
    let db = setup_db().await;
    let entry_id = insert_node(&db, "entry", 1, "32000-32010", false).await;

    let err = build_topology(
        &db,
        &TopologySpec {
            entries: vec![spec(entry_id, 0)],
            hops: Vec::new(),
            exits: vec![spec(entry_id, 0)],
        },
        TunnelKind::Chained,
        IpPreference::Auto,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TopologyError::DuplicateNode(_)));
}

#[tokio::test]
async fn allocation_skips_committed_ports_and_honors_tunnel_exclusion() {
    let db = setup_db().await;
    let entry_id = insert_node(&db, "entry", 1, "32000-32010", false).await;
    let exit_id = insert_node(&db, "exit", 1, "35000-35002", false).await;

    // 35000 held by another tunnel's chain row, 35001 by a forward port
    chain_node::ActiveModel {
        id: NotSet,
        tunnel_id: Set(77),
        chain_role: Set(chain_node::ROLE_EXIT),
        node_id: Set(exit_id),
        hop_index: Set(0),
        port: Set(Some(35000)),
        protocol: Set("tls".to_string()),
        strategy: Set("round".to_string()),
    }
    .insert(&db)
    .await
    .unwrap();
    forward_port::ActiveModel {
        id: NotSet,
        forward_id: Set(1),
        node_id: Set(exit_id),
        port: Set(35001),
    }
    .insert(&db)
    .await
    .unwrap();

    let make_spec = || TopologySpec {
        entries: vec![spec(entry_id, 0)],
        hops: Vec::new(),
        exits: vec![spec(exit_id, 0)],
    };

    let topology = build_topology(&db, &make_spec(), TunnelKind::Chained, IpPreference::Auto, None)
        .await
        .unwrap();
    assert_eq!(topology.exits[0].port, 35002);

    // rebuilding tunnel 77 may reuse its own row's port
    let topology = build_topology(
        &db,
        &make_spec(),
        TunnelKind::Chained,
        IpPreference::Auto,
        Some(77),
    )
    .await
    .unwrap();
    assert_eq!(topology.exits[0].port, 35000);
}

#[tokio::test]
async fn explicit_caller_ports_win_over_the_allocator() {
    let db = setup_db().await;
    let entry_id = insert_node(&db, "entry", 1, "32000-32010", false).await;
    let exit_id = insert_node(&db, "exit", 1, "35000-35010", false).await;

    let topology = build_topology(
        &db,
        &TopologySpec {
            entries: vec![spec(entry_id, 0)],
            hops: Vec::new(),
            exits: vec![spec(exit_id, 35007)],
        },
        TunnelKind::Chained,
        IpPreference::Auto,
        None,
    )
    .await
    .unwrap();
    assert_eq!(topology.exits[0].port, 35007);
}

#[tokio::test]
async fn apply_local_runtime_skips_remote_nodes_entirely() {
    let db = setup_db().await;
    let entry_id = insert_node(&db, "remote-entry", 1, "31000", true).await;
    let middle_id = insert_node(&db, "remote-middle", 1, "32000", true).await;
    let exit_id = insert_node(&db, "remote-exit", 1, "33000", true).await;

    let topology = build_topology(
        &db,
        &TopologySpec {
            entries: vec![spec(entry_id, 0)],
            hops: vec![vec![spec(middle_id, 41000)]],
            exits: vec![spec(exit_id, 42000)],
        },
        TunnelKind::Chained,
        IpPreference::Auto,
        None,
    )
    .await
    .unwrap();

    // no node sessions registered: any local push would fail, so a clean
    // apply proves every remote element was skipped
    let orchestrator = Orchestrator::new(
        db,
        Arc::new(CommandChannel::new()),
        FederationClient::new(),
        "panel.example.com",
    );
    let outcome = orchestrator
        .apply_local_runtime(&topology)
        .await
        .expect("apply must skip remote nodes");
    assert_eq!(outcome, portlink_control::ApplyOutcome::Applied);
}
