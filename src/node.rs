//! The node contract: what the engine requires from a computational unit.
//!
//! The engine never looks inside a node. It wraps each one in a
//! [`NodeContainer`](crate::containers::NodeContainer), asks it about
//! readiness and ports, and relays its lifecycle notifications. What a node
//! actually computes, and how it decides it is executable, is entirely the
//! implementor's business.
//!
//! # The execution handshake
//!
//! An external executor claims ready nodes from the manager, runs them
//! out-of-band, and reports progress back through [`NodeStatus`]
//! notifications:
//!
//! 1. the executor claims a node via
//!    [`get_next_executable_node`](crate::manager::WorkflowManager::get_next_executable_node),
//! 2. it signals [`NodeStatus::StartExecute`] and calls [`Node::execute`],
//! 3. when the node settles it signals [`NodeStatus::EndExecute`], which
//!    triggers readiness re-evaluation of the whole graph.
//!
//! Both `execute` and `cancel_execution` are fire-and-forget: the engine
//! only flips bookkeeping state and relies on the node's goodwill to stop.

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::settings::Settings;
use crate::types::NodeId;

/// A computational unit managed by a workflow scope.
///
/// Implementations must be thread-safe: readiness queries and lifecycle
/// calls may arrive from scheduler and executor threads concurrently, so
/// mutable internals belong behind interior locks.
pub trait Node: Send + Sync {
    /// Human-readable node name used in logs.
    fn name(&self) -> &str;

    /// Whether all inputs this node needs are available right now.
    ///
    /// The scheduler consults this at marking time and again at claim time;
    /// it must be cheap and side-effect free.
    fn is_executable(&self) -> bool;

    /// Whether this node has already produced its results.
    fn is_executed(&self) -> bool;

    /// Number of input ports.
    fn nr_in_ports(&self) -> usize;

    /// Number of output ports.
    fn nr_out_ports(&self) -> usize;

    /// Whether the given in-port carries data (as opposed to a
    /// control/model connection).
    fn is_data_in_port(&self, port: usize) -> bool;

    /// Whether the given out-port carries data.
    fn is_data_out_port(&self, port: usize) -> bool;

    /// Whether the node may be promoted from idle without an explicit
    /// prepare pass. Defaults to `false`.
    fn is_auto_executable(&self) -> bool {
        false
    }

    /// Start computing. Fire-and-forget: implementations return
    /// immediately and report completion through their status listener.
    fn execute(&self);

    /// Ask a queued or running computation to stop. Cooperative only.
    fn cancel_execution(&self);

    /// An in-port of this node has been bound to `source`'s out-port.
    fn connect_in_port(&self, _port: usize, _source: &dyn Node, _source_port: usize) {}

    /// The binding of an in-port has been removed.
    fn disconnect_in_port(&self, _port: usize) {}

    /// The node is being removed from its workflow; release any external
    /// resources.
    fn detach(&self) {}

    /// Persist node-specific settings into the given sub-tree.
    ///
    /// The engine treats the sub-tree as opaque; it must contain whatever a
    /// [`NodeFactory`] needs to rebuild the node.
    fn save_settings(&self, _settings: &mut Settings) {}
}

/// Rebuilds nodes from their persisted settings sub-trees during load.
pub trait NodeFactory: Send + Sync {
    fn create_node(&self, settings: &Settings) -> Result<Box<dyn Node>, WorkflowError>;
}

/// Lifecycle notifications a node (or its executor) reports back into the
/// engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    /// The node has started computing.
    StartExecute,
    /// The node has finished computing (successfully or not).
    EndExecute,
    /// The node's results have been discarded.
    Reset,
    /// The node's configuration changed.
    Configured,
    /// The node's display placement changed.
    ExtrainfoChanged,
}

/// Observer for per-node status notifications.
///
/// The owning [`WorkflowManager`](crate::manager::WorkflowManager) is always
/// registered as a listener on every container it manages; it translates
/// statuses into state-machine transitions and workflow events.
pub trait NodeStateListener: Send + Sync {
    fn state_changed(&self, status: NodeStatus, node: NodeId);
}

/// Display placement of a node. The engine stores, serializes and offsets
/// it; rendering is someone else's problem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExtraInfo {
    pub x: i32,
    pub y: i32,
}

impl NodeExtraInfo {
    /// Shift the placement by `delta` in both directions, as done when
    /// copied nodes are pasted into a workflow.
    #[must_use]
    pub fn shifted(self, delta: i32) -> Self {
        NodeExtraInfo {
            x: self.x + delta,
            y: self.y + delta,
        }
    }
}
