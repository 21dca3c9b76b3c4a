//! Control-plane core for portlink
//!
//! The pieces that make the panel a control plane: the node command channel
//! (correlated RPC over each agent's persistent connection), the dual-stack
//! host resolver, the port allocator, the topology builder and runtime
//! orchestrator with federation leasing and compensating rollback, and the
//! diagnostic path tracer.

pub mod channel;
pub mod diagnose;
pub mod dual_stack;
pub mod error;
pub mod federation_runtime;
pub mod forwards;
pub mod orchestrator;
pub mod ports;
pub mod runtime;
pub mod topology;

pub use channel::CommandChannel;
pub use diagnose::{DiagnosisEntry, DiagnosisReport};
pub use dual_stack::{select_dial_host, IpPreference};
pub use error::{
    CommandError, CommandErrorKind, DualStackError, PortAllocError, Tolerance, TopologyError,
};
pub use federation_runtime::{persist_bindings, resource_key, BindingDraft, ReleaseRef};
pub use orchestrator::{Orchestrator, COMMAND_TIMEOUT};
pub use runtime::ApplyOutcome;
pub use topology::{
    build_topology, persist_topology, reconstruct_topology, NodeSpec, TopologySpec, TunnelKind,
    TunnelTopology,
};
