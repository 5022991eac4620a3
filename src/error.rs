//! Error types for graph mutation, scheduling and persistence.

use miette::Diagnostic;
use thiserror::Error;

use crate::settings::SettingsError;
use crate::types::{ConnectionId, NodeId};

/// Errors reported by [`WorkflowManager`](crate::manager::WorkflowManager)
/// operations.
///
/// Precondition violations are reported synchronously at the offending call
/// and leave the graph unchanged. [`DisconnectedPredecessor`](Self::DisconnectedPredecessor)
/// is the exception: it indicates corrupted bookkeeping rather than bad
/// input, and callers should treat it as fatal.
#[derive(Debug, Error, Diagnostic)]
pub enum WorkflowError {
    /// A referenced node id is not present in this scope.
    #[error("node #{id} does not exist in this workflow")]
    #[diagnostic(code(trellis::workflow::unknown_node))]
    UnknownNode { id: NodeId },

    /// A referenced connection id is not present in this scope.
    #[error("connection #{id} does not exist in this workflow")]
    #[diagnostic(code(trellis::workflow::unknown_connection))]
    UnknownConnection { id: ConnectionId },

    /// The node exists but is not managed by this workflow manager.
    #[error("node #{id} is not managed by this workflow manager")]
    #[diagnostic(code(trellis::workflow::unmanaged_node))]
    NodeNotManaged { id: NodeId },

    /// A deserialized node entry carries an id that is already live.
    #[error("a node with id #{id} already exists in the workflow")]
    #[diagnostic(code(trellis::workflow::duplicate_node_id))]
    DuplicateNodeId { id: NodeId },

    /// A deserialized connection entry carries an id that is already live.
    #[error("a connection with id #{id} already exists in the workflow")]
    #[diagnostic(code(trellis::workflow::duplicate_connection_id))]
    DuplicateConnectionId { id: ConnectionId },

    /// A port index is outside the node's declared port range.
    #[error("{direction} port {port} does not exist on node #{node}")]
    #[diagnostic(code(trellis::workflow::invalid_port))]
    InvalidPort {
        node: NodeId,
        port: usize,
        direction: &'static str,
    },

    /// The target input port already has an incoming connection.
    #[error("in-port {port} of node #{node} already has an incoming connection")]
    #[diagnostic(
        code(trellis::workflow::port_occupied),
        help("Remove the existing connection before adding a new one.")
    )]
    PortOccupied { node: NodeId, port: usize },

    /// A data port was paired with a non-data port.
    #[error(
        "cannot connect out-port {source_port} of node #{source_node} \
         to in-port {target_port} of node #{target}: data and non-data ports do not mix"
    )]
    #[diagnostic(code(trellis::workflow::port_kind_mismatch))]
    PortKindMismatch {
        source_node: NodeId,
        source_port: usize,
        target: NodeId,
        target_port: usize,
    },

    /// The connection would close a loop in the graph.
    #[error("connecting node #{source_node} to node #{target} would create a cycle")]
    #[diagnostic(code(trellis::workflow::cycle))]
    WouldCreateCycle { source_node: NodeId, target: NodeId },

    /// Backward scheduling found a predecessor owned by no scope in the
    /// parent chain. The graph's own bookkeeping is corrupt.
    #[error("node #{id} is not part of this workflow manager or any of its ancestors")]
    #[diagnostic(
        code(trellis::workflow::disconnected_predecessor),
        severity(Error),
        help("This indicates corrupted adjacency bookkeeping; the graph should be rebuilt.")
    )]
    DisconnectedPredecessor { id: NodeId },

    /// A persisted workflow must live in a file with the canonical name.
    #[error("workflow file must be named {expected:?}, got {path:?}")]
    #[diagnostic(code(trellis::workflow::wrong_file))]
    WrongWorkflowFile {
        expected: &'static str,
        path: std::path::PathBuf,
    },

    /// A settings entry was missing or malformed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Settings(#[from] SettingsError),

    /// Reading or writing the persisted form failed.
    #[error("workflow I/O failed: {0}")]
    #[diagnostic(code(trellis::workflow::io))]
    Io(#[from] std::io::Error),

    /// A node factory refused to rebuild a node from its settings.
    #[error("node factory failed: {reason}")]
    #[diagnostic(code(trellis::workflow::factory))]
    Factory { reason: String },
}
