//! Integration tests for portlink-db
//!
//! Exercises the schema against a real in-memory SQLite database.

use chrono::Utc;
use portlink_db::entities::{chain_node, forward, forward_port, node, prelude::*, tunnel};
use portlink_db::{connect, migrate};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, NotSet, QueryFilter, Set};

async fn setup_test_db() -> sea_orm::DatabaseConnection {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    migrate(&db).await.expect("Failed to run migrations");
    db
}

fn node_model(name: &str, addr: &str) -> node::ActiveModel {
    let now = Utc::now();
    node::ActiveModel {
        id: NotSet,
        name: Set(name.to_string()),
        secret: Set(format!("{name}-secret")),
        server_addr: Set(addr.to_string()),
        server_addr_v4: Set(None),
        server_addr_v6: Set(None),
        port_range: Set("1000-65535".to_string()),
        tcp_listen_addr: Set("[::]".to_string()),
        udp_listen_addr: Set("[::]".to_string()),
        interface_name: Set(None),
        version: Set(None),
        http: Set(0),
        tls: Set(0),
        socks: Set(0),
        status: Set(1),
        is_remote: Set(false),
        remote_url: Set(None),
        remote_token: Set(None),
        remote_config: Set(None),
        sort_index: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_create_and_read_node() {
    let db = setup_test_db().await;

    let inserted = node_model("edge-1", "10.0.0.1").insert(&db).await.unwrap();
    assert!(inserted.id > 0);

    let found = Node::find_by_id(inserted.id)
        .one(&db)
        .await
        .unwrap()
        .expect("node not found");
    assert_eq!(found.name, "edge-1");
    assert_eq!(found.server_addr, "10.0.0.1");
    assert_eq!(found.display_name(), "edge-1");
}

#[tokio::test]
async fn test_chain_nodes_cascade_with_tunnel() {
    let db = setup_test_db().await;
    let now = Utc::now();

    let n = node_model("relay-1", "10.0.0.2").insert(&db).await.unwrap();

    let t = tunnel::ActiveModel {
        id: NotSet,
        name: Set("chained-1".to_string()),
        kind: Set(tunnel::KIND_CHAINED),
        protocol: Set("tls".to_string()),
        ip_preference: Set(String::new()),
        status: Set(1),
        entry_ip: Set(None),
        sort_index: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&db)
    .await
    .unwrap();

    chain_node::ActiveModel {
        id: NotSet,
        tunnel_id: Set(t.id),
        chain_role: Set(chain_node::ROLE_EXIT),
        node_id: Set(n.id),
        hop_index: Set(0),
        port: Set(Some(41000)),
        protocol: Set("tls".to_string()),
        strategy: Set("round".to_string()),
    }
    .insert(&db)
    .await
    .unwrap();

    Tunnel::delete_by_id(t.id).exec(&db).await.unwrap();

    let rows = ChainNode::find()
        .filter(chain_node::Column::TunnelId.eq(t.id))
        .all(&db)
        .await
        .unwrap();
    assert!(rows.is_empty(), "chain rows must cascade with their tunnel");
}

#[tokio::test]
async fn test_forward_ports_per_entry_node() {
    let db = setup_test_db().await;
    let now = Utc::now();

    let entry_a = node_model("entry-a", "10.0.0.3").insert(&db).await.unwrap();
    let entry_b = node_model("entry-b", "10.0.0.4").insert(&db).await.unwrap();

    let t = tunnel::ActiveModel {
        id: NotSet,
        name: Set("direct-1".to_string()),
        kind: Set(tunnel::KIND_DIRECT),
        protocol: Set("tls".to_string()),
        ip_preference: Set(String::new()),
        status: Set(1),
        entry_ip: Set(None),
        sort_index: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&db)
    .await
    .unwrap();

    let f = forward::ActiveModel {
        id: NotSet,
        name: Set("web".to_string()),
        tunnel_id: Set(t.id),
        remote_addr: Set("192.168.1.50:8080".to_string()),
        strategy: Set("fifo".to_string()),
        status: Set(1),
        sort_index: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&db)
    .await
    .unwrap();

    for node_id in [entry_a.id, entry_b.id] {
        forward_port::ActiveModel {
            id: NotSet,
            forward_id: Set(f.id),
            node_id: Set(node_id),
            port: Set(12000),
        }
        .insert(&db)
        .await
        .unwrap();
    }

    let ports = ForwardPort::find()
        .filter(forward_port::Column::ForwardId.eq(f.id))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(ports.len(), 2);
    assert!(ports.iter().all(|p| p.port == 12000));
}
