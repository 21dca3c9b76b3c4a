//! Database entities

pub mod chain_node;
pub mod federation_binding;
pub mod forward;
pub mod forward_port;
pub mod node;
pub mod peer_share;
pub mod peer_share_runtime;
pub mod tunnel;

pub use chain_node::Entity as ChainNode;
pub use federation_binding::Entity as FederationBinding;
pub use forward::Entity as Forward;
pub use forward_port::Entity as ForwardPort;
pub use node::Entity as Node;
pub use peer_share::Entity as PeerShare;
pub use peer_share_runtime::Entity as PeerShareRuntime;
pub use tunnel::Entity as Tunnel;

pub mod prelude {
    pub use super::chain_node::Entity as ChainNode;
    pub use super::federation_binding::Entity as FederationBinding;
    pub use super::forward::Entity as Forward;
    pub use super::forward_port::Entity as ForwardPort;
    pub use super::node::Entity as Node;
    pub use super::peer_share::Entity as PeerShare;
    pub use super::peer_share_runtime::Entity as PeerShareRuntime;
    pub use super::tunnel::Entity as Tunnel;
}
