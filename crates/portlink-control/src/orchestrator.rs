//! Runtime orchestrator
//!
//! Owns the handles everything stateful flows through: the database, the
//! node command channel, and the federation client. The topology, forward,
//! federation and diagnosis flows are implemented in their own modules as
//! further `impl` blocks.

use crate::channel::CommandChannel;
use portlink_federation::FederationClient;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;

/// How long a config push may wait for the agent's response.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(12);

pub struct Orchestrator {
    pub(crate) db: DatabaseConnection,
    pub(crate) channel: Arc<CommandChannel>,
    pub(crate) federation: FederationClient,
    /// Panel domain sent with federation calls so peers can attribute usage
    pub(crate) local_domain: String,
}

impl Orchestrator {
    pub fn new(
        db: DatabaseConnection,
        channel: Arc<CommandChannel>,
        federation: FederationClient,
        local_domain: impl Into<String>,
    ) -> Self {
        Orchestrator {
            db,
            channel,
            federation,
            local_domain: local_domain.into(),
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }
}

/// Name of the relay chain configured on every node of a tunnel.
pub fn chain_name(tunnel_id: i64) -> String {
    format!("chains_{tunnel_id}")
}

/// Name of the relay service bound on hop and exit nodes of a tunnel.
pub fn tunnel_service_name(tunnel_id: i64) -> String {
    format!("{tunnel_id}_tls")
}

/// Base name of the ingress services of a forward.
pub fn forward_service_base(forward_id: i64) -> String {
    format!("fwd_{forward_id}")
}
