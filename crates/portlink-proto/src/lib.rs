//! Wire protocol for the portlink control plane
//!
//! Defines the command frames exchanged with agents over their persistent
//! connection, the optional encrypted envelope wrapping those frames, and the
//! request/response bodies of the federation HTTP protocol.

pub mod command;
pub mod crypto;
pub mod federation;

pub use command::{
    AdminBroadcast, CommandFrame, CommandKind, CommandResponse, CommandResult, Envelope,
};
pub use crypto::{CryptoError, EnvelopeCipher};
pub use federation::{
    ApiEnvelope, ApplyRoleRequest, ApplyRoleResponse, DiagnoseRequest, DialTarget,
    RemoteNodeDescriptor, RemoteTunnelRequest, RemoteTunnelResponse, ReleaseRoleRequest,
    ReservePortRequest, ReservePortResponse,
};
