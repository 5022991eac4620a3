//! Workflow change notifications and the listener boundary.

use std::sync::Arc;

use crate::containers::{ConnectionContainer, NodeContainer};
use crate::types::{ConnectionId, NodeId};

/// A change in a workflow scope, fanned out to registered listeners.
///
/// The set is closed: listeners match exhaustively instead of subclassing.
/// Structural variants carry the affected container so listeners can react
/// without a lookup; the removal variants hand out the container that was
/// just dropped from the graph (its old value).
#[derive(Clone, Debug)]
pub enum WorkflowEvent {
    NodeAdded {
        id: NodeId,
        node: Arc<NodeContainer>,
    },
    NodeRemoved {
        id: NodeId,
        node: Arc<NodeContainer>,
    },
    ConnectionAdded {
        id: ConnectionId,
        connection: Arc<ConnectionContainer>,
    },
    ConnectionRemoved {
        id: ConnectionId,
        connection: Arc<ConnectionContainer>,
    },
    /// At least one node is currently ready for execution.
    ExecPoolChanged,
    /// No node is ready, queued or running anymore.
    ExecPoolDone,
    NodeReset {
        id: NodeId,
    },
    NodeConfigured {
        id: NodeId,
    },
    NodeExtrainfoChanged {
        id: NodeId,
    },
    ConnectionExtrainfoChanged {
        id: ConnectionId,
    },
}

impl WorkflowEvent {
    /// The node id this event refers to, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            WorkflowEvent::NodeAdded { id, .. }
            | WorkflowEvent::NodeRemoved { id, .. }
            | WorkflowEvent::NodeReset { id }
            | WorkflowEvent::NodeConfigured { id }
            | WorkflowEvent::NodeExtrainfoChanged { id } => Some(*id),
            _ => None,
        }
    }

    /// The connection id this event refers to, if any.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            WorkflowEvent::ConnectionAdded { id, .. }
            | WorkflowEvent::ConnectionRemoved { id, .. }
            | WorkflowEvent::ConnectionExtrainfoChanged { id } => Some(*id),
            _ => None,
        }
    }
}

/// Observer for [`WorkflowEvent`]s.
///
/// Listeners are invoked synchronously, in registration order, against a
/// snapshot of the listener set taken before dispatch, so a listener may add
/// or remove listeners (including itself) while handling an event without
/// corrupting the in-progress dispatch.
pub trait WorkflowListener: Send + Sync {
    fn workflow_changed(&self, event: &WorkflowEvent);
}
