//! Error taxonomy of the control plane core
//!
//! Every failure carries a typed kind from the point it is raised, so
//! tolerance checks and the defer policy are exhaustive matches rather than
//! substring probes. Free text from systems we do not control (agent
//! responses, federation peers) is classified exactly once, in
//! [`CommandErrorKind::classify`].

use portlink_federation::FederationError;
use sea_orm::DbErr;

/// Semantic class of a node-command failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    /// The node has no live connection
    Offline,
    /// The command timed out waiting for a response
    Timeout,
    /// The connection dropped while the command was in flight
    ConnectionClosed,
    /// The outbound queue rejected the write
    WriteFailed,
    /// The agent reported the resource already exists
    AlreadyExists,
    /// The agent reported the resource does not exist
    NotFound,
    /// The agent rejected the command for any other reason
    Rejected,
    /// The frame could not be serialized or encrypted
    Protocol,
}

impl CommandErrorKind {
    /// Classify a free-text message returned by an agent or a federation
    /// peer. The table covers the known message shapes (bilingual, matching
    /// what the deployed agents actually send); anything unrecognized stays
    /// `Rejected` so it is never silently swallowed.
    pub fn classify(message: &str) -> CommandErrorKind {
        let msg = message.trim().to_lowercase();
        if msg.contains("not found") || msg.contains("不存在") {
            CommandErrorKind::NotFound
        } else if msg.contains("exists") || msg.contains("already") || msg.contains("已存在") {
            CommandErrorKind::AlreadyExists
        } else if msg.contains("offline") || msg.contains("不在线") {
            CommandErrorKind::Offline
        } else if msg.contains("timeout") || msg.contains("timed out") || msg.contains("超时") {
            CommandErrorKind::Timeout
        } else {
            CommandErrorKind::Rejected
        }
    }
}

/// A node-command failure with its classified kind.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: CommandErrorKind, message: impl Into<String>) -> Self {
        CommandError {
            kind,
            message: message.into(),
        }
    }

    pub fn offline() -> Self {
        CommandError::new(CommandErrorKind::Offline, "node offline")
    }

    pub fn timeout() -> Self {
        CommandError::new(CommandErrorKind::Timeout, "timed out waiting for node response")
    }

    pub fn connection_closed() -> Self {
        CommandError::new(CommandErrorKind::ConnectionClosed, "connection closed")
    }

    /// Build from an unsuccessful agent response, classifying the message.
    pub fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            "command failed".to_string()
        } else {
            message
        };
        CommandError {
            kind: CommandErrorKind::classify(&message),
            message,
        }
    }

    /// Offline and timed-out pushes are deferred during topology apply: the
    /// agent reconciles itself once it reconnects.
    pub fn is_deferrable(&self) -> bool {
        matches!(
            self.kind,
            CommandErrorKind::Offline | CommandErrorKind::Timeout
        )
    }
}

/// Which swallowed outcomes a tolerant command send accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tolerance {
    pub exists: bool,
    pub not_found: bool,
}

impl Tolerance {
    pub const NONE: Tolerance = Tolerance {
        exists: false,
        not_found: false,
    };
    pub const EXISTS: Tolerance = Tolerance {
        exists: true,
        not_found: false,
    };
    pub const NOT_FOUND: Tolerance = Tolerance {
        exists: false,
        not_found: true,
    };

    pub fn accepts(&self, kind: CommandErrorKind) -> bool {
        match kind {
            CommandErrorKind::AlreadyExists => self.exists,
            CommandErrorKind::NotFound => self.not_found,
            _ => false,
        }
    }
}

/// Port allocation failures.
#[derive(Debug, thiserror::Error)]
pub enum PortAllocError {
    #[error("no available port")]
    Exhausted,
    #[error("port out of range")]
    OutOfRange,
    #[error(transparent)]
    Db(#[from] DbErr),
}

/// No address family shared by the two endpoints of a chain edge.
#[derive(Debug, thiserror::Error)]
#[error(
    "no common address family: {from_name}(v4={from_v4},v6={from_v6}) -> {to_name}(v4={to_v4},v6={to_v6})"
)]
pub struct DualStackError {
    pub from_name: String,
    pub from_v4: bool,
    pub from_v6: bool,
    pub to_name: String,
    pub to_v4: bool,
    pub to_v6: bool,
}

/// Failures of topology construction and application.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("at least one entry node is required")]
    EmptyEntries,
    #[error("at least one exit node is required")]
    EmptyExits,
    #[error("duplicate node in topology: {0}")]
    DuplicateNode(i64),
    #[error("node {0} does not exist")]
    NodeNotFound(i64),
    #[error("node {0} is offline")]
    NodeOffline(String),
    #[error("node {node} port {port} outside shared range {start}-{end}")]
    PortOutOfRange {
        node: String,
        port: u16,
        start: u16,
        end: u16,
    },
    #[error("node {0} has no port assigned")]
    MissingPort(String),
    #[error("remote node {0} is missing federation credentials")]
    MissingRemoteCredentials(String),
    #[error("chain targets required")]
    EmptyTargets,
    #[error("tunnel {0} does not exist")]
    TunnelNotFound(i64),
    #[error("port allocation failed on node {node}: {source}")]
    PortAlloc {
        node: String,
        #[source]
        source: PortAllocError,
    },
    #[error(transparent)]
    DualStack(#[from] DualStackError),
    #[error("remote node {node}: {source}")]
    Federation {
        node: String,
        #[source]
        source: FederationError,
    },
    #[error("node {node}: {source}")]
    Command {
        node: String,
        #[source]
        source: CommandError,
    },
    #[error(transparent)]
    Db(#[from] DbErr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_remote_messages() {
        assert_eq!(
            CommandErrorKind::classify("service sv1 not found"),
            CommandErrorKind::NotFound
        );
        assert_eq!(
            CommandErrorKind::classify("链不存在"),
            CommandErrorKind::NotFound
        );
        assert_eq!(
            CommandErrorKind::classify("service already exists"),
            CommandErrorKind::AlreadyExists
        );
        assert_eq!(
            CommandErrorKind::classify("服务已存在"),
            CommandErrorKind::AlreadyExists
        );
        assert_eq!(
            CommandErrorKind::classify("等待节点响应超时"),
            CommandErrorKind::Timeout
        );
        assert_eq!(
            CommandErrorKind::classify("bind: address in use"),
            CommandErrorKind::Rejected
        );
    }

    #[test]
    fn tolerance_matches_on_kind_not_text() {
        let exists = CommandError::rejected("chain already exists");
        assert!(Tolerance::EXISTS.accepts(exists.kind));
        assert!(!Tolerance::NOT_FOUND.accepts(exists.kind));

        let missing = CommandError::rejected("service not found");
        assert!(Tolerance::NOT_FOUND.accepts(missing.kind));
        assert!(!Tolerance::EXISTS.accepts(missing.kind));

        assert!(!Tolerance::NONE.accepts(CommandErrorKind::AlreadyExists));
    }

    #[test]
    fn defer_policy_covers_offline_and_timeout_only() {
        assert!(CommandError::offline().is_deferrable());
        assert!(CommandError::timeout().is_deferrable());
        assert!(!CommandError::rejected("port conflict").is_deferrable());
        assert!(!CommandError::connection_closed().is_deferrable());
    }

    #[test]
    fn empty_rejection_message_gets_a_default() {
        let err = CommandError::rejected("   ");
        assert_eq!(err.message, "command failed");
        assert_eq!(err.kind, CommandErrorKind::Rejected);
    }
}
