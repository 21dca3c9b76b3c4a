//! Consolidated initial schema migration

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. nodes
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Node::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Node::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len(Node::Name, 255).not_null())
                    .col(string_len(Node::Secret, 64).not_null().unique_key())
                    .col(string_len(Node::ServerAddr, 255).not_null())
                    .col(string_len_null(Node::ServerAddrV4, 255))
                    .col(string_len_null(Node::ServerAddrV6, 255))
                    .col(string_len(Node::PortRange, 255).not_null().default("1000-65535"))
                    .col(string_len(Node::TcpListenAddr, 64).not_null().default("[::]"))
                    .col(string_len(Node::UdpListenAddr, 64).not_null().default("[::]"))
                    .col(string_len_null(Node::InterfaceName, 64))
                    .col(string_len_null(Node::Version, 32))
                    .col(integer(Node::Http).not_null().default(0))
                    .col(integer(Node::Tls).not_null().default(0))
                    .col(integer(Node::Socks).not_null().default(0))
                    .col(integer(Node::Status).not_null().default(0))
                    .col(boolean(Node::IsRemote).not_null().default(false))
                    .col(string_len_null(Node::RemoteUrl, 255))
                    .col(string_len_null(Node::RemoteToken, 255))
                    .col(text_null(Node::RemoteConfig))
                    .col(integer(Node::SortIndex).not_null().default(0))
                    .col(
                        timestamp_with_time_zone(Node::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Node::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. tunnels
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Tunnel::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tunnel::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len(Tunnel::Name, 255).not_null().unique_key())
                    .col(integer(Tunnel::Kind).not_null().default(1))
                    .col(string_len(Tunnel::Protocol, 32).not_null().default("tls"))
                    .col(string_len(Tunnel::IpPreference, 8).not_null().default(""))
                    .col(integer(Tunnel::Status).not_null().default(1))
                    .col(string_len_null(Tunnel::EntryIp, 512))
                    .col(integer(Tunnel::SortIndex).not_null().default(0))
                    .col(
                        timestamp_with_time_zone(Tunnel::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Tunnel::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. chain_nodes
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(ChainNode::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ChainNode::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(big_integer(ChainNode::TunnelId).not_null())
                    .col(integer(ChainNode::ChainRole).not_null())
                    .col(big_integer(ChainNode::NodeId).not_null())
                    .col(integer(ChainNode::HopIndex).not_null().default(0))
                    .col(integer_null(ChainNode::Port))
                    .col(string_len(ChainNode::Protocol, 32).not_null().default("tls"))
                    .col(string_len(ChainNode::Strategy, 32).not_null().default("round"))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_chain_node_tunnel_id")
                            .from(ChainNode::Table, ChainNode::TunnelId)
                            .to(Tunnel::Table, Tunnel::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chain_node_tunnel_id")
                    .table(ChainNode::Table)
                    .col(ChainNode::TunnelId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chain_node_node_id")
                    .table(ChainNode::Table)
                    .col(ChainNode::NodeId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. forwards
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Forward::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Forward::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len(Forward::Name, 255).not_null())
                    .col(big_integer(Forward::TunnelId).not_null())
                    .col(string_len(Forward::RemoteAddr, 1024).not_null())
                    .col(string_len(Forward::Strategy, 32).not_null().default("fifo"))
                    .col(integer(Forward::Status).not_null().default(1))
                    .col(integer(Forward::SortIndex).not_null().default(0))
                    .col(
                        timestamp_with_time_zone(Forward::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Forward::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_forward_tunnel_id")
                            .from(Forward::Table, Forward::TunnelId)
                            .to(Tunnel::Table, Tunnel::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 5. forward_ports
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(ForwardPort::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ForwardPort::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(big_integer(ForwardPort::ForwardId).not_null())
                    .col(big_integer(ForwardPort::NodeId).not_null())
                    .col(integer(ForwardPort::Port).not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_forward_port_forward_id")
                            .from(ForwardPort::Table, ForwardPort::ForwardId)
                            .to(Forward::Table, Forward::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_forward_port_node_id")
                    .table(ForwardPort::Table)
                    .col(ForwardPort::NodeId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 6. federation_bindings
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(FederationBinding::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FederationBinding::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(big_integer(FederationBinding::TunnelId).not_null())
                    .col(big_integer(FederationBinding::NodeId).not_null())
                    .col(integer(FederationBinding::ChainRole).not_null())
                    .col(integer(FederationBinding::HopIndex).not_null().default(0))
                    .col(string_len(FederationBinding::RemoteUrl, 255).not_null())
                    .col(string_len(FederationBinding::ResourceKey, 255).not_null())
                    .col(string_len(FederationBinding::RemoteBindingId, 64).not_null().default(""))
                    .col(string_len(FederationBinding::ReservationId, 64).not_null().default(""))
                    .col(integer(FederationBinding::AllocatedPort).not_null().default(0))
                    .col(integer(FederationBinding::Status).not_null().default(1))
                    .col(
                        timestamp_with_time_zone(FederationBinding::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(FederationBinding::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_federation_binding_tunnel_id")
                    .table(FederationBinding::Table)
                    .col(FederationBinding::TunnelId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 7. peer_shares
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(PeerShare::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PeerShare::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len(PeerShare::Name, 255).not_null())
                    .col(big_integer(PeerShare::NodeId).not_null())
                    .col(string_len(PeerShare::Token, 64).not_null().unique_key())
                    .col(big_integer(PeerShare::MaxBandwidth).not_null().default(0))
                    .col(big_integer(PeerShare::CurrentFlow).not_null().default(0))
                    .col(timestamp_with_time_zone_null(PeerShare::ExpiryAt))
                    .col(integer(PeerShare::PortRangeStart).not_null().default(0))
                    .col(integer(PeerShare::PortRangeEnd).not_null().default(0))
                    .col(boolean(PeerShare::IsActive).not_null().default(true))
                    .col(string_len_null(PeerShare::AllowedDomains, 1024))
                    .col(string_len_null(PeerShare::AllowedIps, 1024))
                    .col(
                        timestamp_with_time_zone(PeerShare::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(PeerShare::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 8. peer_share_runtimes
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(PeerShareRuntime::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PeerShareRuntime::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(big_integer(PeerShareRuntime::ShareId).not_null())
                    .col(big_integer(PeerShareRuntime::NodeId).not_null())
                    .col(string_len(PeerShareRuntime::ReservationId, 64).not_null())
                    .col(string_len(PeerShareRuntime::ResourceKey, 255).not_null())
                    .col(string_len(PeerShareRuntime::BindingId, 64).not_null().default(""))
                    .col(string_len(PeerShareRuntime::Role, 16).not_null().default(""))
                    .col(string_len(PeerShareRuntime::ChainName, 64).not_null().default(""))
                    .col(string_len(PeerShareRuntime::ServiceName, 64).not_null().default(""))
                    .col(string_len(PeerShareRuntime::Protocol, 32).not_null().default("tls"))
                    .col(string_len(PeerShareRuntime::Strategy, 32).not_null().default("round"))
                    .col(integer(PeerShareRuntime::Port).not_null().default(0))
                    .col(text(PeerShareRuntime::Target).not_null().default(""))
                    .col(boolean(PeerShareRuntime::Applied).not_null().default(false))
                    .col(integer(PeerShareRuntime::Status).not_null().default(1))
                    .col(
                        timestamp_with_time_zone(PeerShareRuntime::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(PeerShareRuntime::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_peer_share_runtime_share_id")
                            .from(PeerShareRuntime::Table, PeerShareRuntime::ShareId)
                            .to(PeerShare::Table, PeerShare::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_peer_share_runtime_share_id")
                    .table(PeerShareRuntime::Table)
                    .col(PeerShareRuntime::ShareId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PeerShareRuntime::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PeerShare::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(FederationBinding::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ForwardPort::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Forward::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ChainNode::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tunnel::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Node::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Node {
    #[sea_orm(iden = "node")]
    Table,
    Id,
    Name,
    Secret,
    ServerAddr,
    ServerAddrV4,
    ServerAddrV6,
    PortRange,
    TcpListenAddr,
    UdpListenAddr,
    InterfaceName,
    Version,
    Http,
    Tls,
    Socks,
    Status,
    IsRemote,
    RemoteUrl,
    RemoteToken,
    RemoteConfig,
    SortIndex,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tunnel {
    #[sea_orm(iden = "tunnel")]
    Table,
    Id,
    Name,
    Kind,
    Protocol,
    IpPreference,
    Status,
    EntryIp,
    SortIndex,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ChainNode {
    #[sea_orm(iden = "chain_node")]
    Table,
    Id,
    TunnelId,
    ChainRole,
    NodeId,
    HopIndex,
    Port,
    Protocol,
    Strategy,
}

#[derive(DeriveIden)]
enum Forward {
    #[sea_orm(iden = "forward")]
    Table,
    Id,
    Name,
    TunnelId,
    RemoteAddr,
    Strategy,
    Status,
    SortIndex,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ForwardPort {
    #[sea_orm(iden = "forward_port")]
    Table,
    Id,
    ForwardId,
    NodeId,
    Port,
}

#[derive(DeriveIden)]
enum FederationBinding {
    #[sea_orm(iden = "federation_binding")]
    Table,
    Id,
    TunnelId,
    NodeId,
    ChainRole,
    HopIndex,
    RemoteUrl,
    ResourceKey,
    RemoteBindingId,
    ReservationId,
    AllocatedPort,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum PeerShare {
    #[sea_orm(iden = "peer_share")]
    Table,
    Id,
    Name,
    NodeId,
    Token,
    MaxBandwidth,
    CurrentFlow,
    ExpiryAt,
    PortRangeStart,
    PortRangeEnd,
    IsActive,
    AllowedDomains,
    AllowedIps,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum PeerShareRuntime {
    #[sea_orm(iden = "peer_share_runtime")]
    Table,
    Id,
    ShareId,
    NodeId,
    ReservationId,
    ResourceKey,
    BindingId,
    Role,
    ChainName,
    ServiceName,
    Protocol,
    Strategy,
    Port,
    Target,
    Applied,
    Status,
    CreatedAt,
    UpdatedAt,
}
