//! Node wrapper: execution state machine plus derived adjacency.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::node::{Node, NodeExtraInfo, NodeStateListener, NodeStatus};
use crate::settings::Settings;
use crate::types::NodeId;

pub(crate) const KEY_ID: &str = "id";
pub(crate) const KEY_CUSTOM_NAME: &str = "customName";
pub(crate) const KEY_EXTRA_INFO: &str = "extraInfo";
pub(crate) const KEY_NODE_SETTINGS: &str = "node";

/// Execution state of a node within the scheduling pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Not scheduled.
    Idle,
    /// Wants to run but upstream data is not yet available.
    WaitingToBeExecutable,
    /// Ready to run, not yet claimed by an executor.
    IsExecutable,
    /// Claimed by an executor, queued for execution.
    WaitingForExecution,
    /// Running.
    CurrentlyExecuting,
}

impl NodeState {
    /// Anything other than [`Idle`](Self::Idle).
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, NodeState::Idle)
    }

    /// Claimed or running: the states an executor owns.
    #[must_use]
    pub fn is_execution_pending(self) -> bool {
        matches!(
            self,
            NodeState::WaitingForExecution | NodeState::CurrentlyExecuting
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Idle => "idle",
            NodeState::WaitingToBeExecutable => "waiting-to-be-executable",
            NodeState::IsExecutable => "executable",
            NodeState::WaitingForExecution => "waiting-for-execution",
            NodeState::CurrentlyExecuting => "executing",
        };
        f.write_str(name)
    }
}

struct Inner {
    state: NodeState,
    custom_name: String,
    extra_info: Option<NodeExtraInfo>,
    /// At most one upstream neighbor per in-port.
    predecessors: Vec<Option<Weak<NodeContainer>>>,
    /// Any number of downstream neighbors per out-port.
    successors: Vec<Vec<Weak<NodeContainer>>>,
}

/// Wraps one [`Node`] with its scheduling state, display name and the
/// per-port adjacency derived from the connection set.
///
/// Adjacency holds weak references: containers own nothing but their node,
/// and the owning manager's maps keep neighbors alive.
pub struct NodeContainer {
    id: NodeId,
    node: Box<dyn Node>,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Weak<dyn NodeStateListener>>>,
}

impl NodeContainer {
    pub(crate) fn new(id: NodeId, node: Box<dyn Node>) -> Self {
        let nr_in = node.nr_in_ports();
        let nr_out = node.nr_out_ports();
        NodeContainer {
            id,
            node,
            inner: Mutex::new(Inner {
                state: NodeState::Idle,
                custom_name: format!("Node {}", id.index() + 1),
                extra_info: None,
                predecessors: (0..nr_in).map(|_| None).collect(),
                successors: (0..nr_out).map(|_| Vec::new()).collect(),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The wrapped computational unit.
    #[must_use]
    pub fn node(&self) -> &dyn Node {
        self.node.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.inner.lock().state = state;
    }

    #[must_use]
    pub fn custom_name(&self) -> String {
        self.inner.lock().custom_name.clone()
    }

    pub fn set_custom_name(&self, name: impl Into<String>) {
        self.inner.lock().custom_name = name.into();
    }

    /// Whether this container still carries the label assigned at creation
    /// time (`"Node <id+1>"`).
    #[must_use]
    pub fn has_default_name(&self) -> bool {
        self.inner.lock().custom_name == format!("Node {}", self.id.index() + 1)
    }

    /// Display label plus id, for logs.
    #[must_use]
    pub fn name_with_id(&self) -> String {
        format!("{} (#{})", self.custom_name(), self.id)
    }

    #[must_use]
    pub fn extra_info(&self) -> Option<NodeExtraInfo> {
        self.inner.lock().extra_info
    }

    /// Update the display placement and notify state listeners.
    pub fn set_extra_info(&self, info: Option<NodeExtraInfo>) {
        self.inner.lock().extra_info = info;
        self.notify_state_changed(NodeStatus::ExtrainfoChanged);
    }

    /// Register a status observer. Registration is idempotent.
    pub fn add_listener(&self, listener: Weak<dyn NodeStateListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|known| Weak::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    /// Report a node lifecycle notification to all registered listeners.
    ///
    /// This is the ingress point for the execution handshake: executors (or
    /// nodes themselves) call it with [`NodeStatus::StartExecute`] and
    /// [`NodeStatus::EndExecute`], and the owning manager reacts by driving
    /// the state machine. Dead listeners are pruned on the way.
    pub fn notify_state_changed(&self, status: NodeStatus) {
        let snapshot: Vec<_> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|weak| weak.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in snapshot {
            listener.state_changed(status, self.id);
        }
    }

    /// Upstream neighbor per in-port, `None` where the port is unconnected.
    #[must_use]
    pub fn predecessors(&self) -> Vec<Option<Arc<NodeContainer>>> {
        self.inner
            .lock()
            .predecessors
            .iter()
            .map(|slot| slot.as_ref().and_then(Weak::upgrade))
            .collect()
    }

    /// Downstream neighbors per out-port.
    #[must_use]
    pub fn successors(&self) -> Vec<Vec<Arc<NodeContainer>>> {
        self.inner
            .lock()
            .successors
            .iter()
            .map(|port| port.iter().filter_map(Weak::upgrade).collect())
            .collect()
    }

    pub(crate) fn set_incoming(&self, port: usize, source: &Arc<NodeContainer>) {
        self.inner.lock().predecessors[port] = Some(Arc::downgrade(source));
    }

    pub(crate) fn clear_incoming(&self, port: usize) {
        self.inner.lock().predecessors[port] = None;
    }

    pub(crate) fn add_outgoing(&self, port: usize, target: &Arc<NodeContainer>) {
        self.inner.lock().successors[port].push(Arc::downgrade(target));
    }

    pub(crate) fn remove_outgoing(&self, port: usize, target: &Arc<NodeContainer>) {
        self.inner.lock().successors[port]
            .retain(|weak| !weak.upgrade().is_some_and(|nc| Arc::ptr_eq(&nc, target)));
    }

    /// Whether `other` is reachable from this container via successor
    /// edges. A container is considered to follow itself, so probing a
    /// self-loop returns `true`.
    ///
    /// Used as the cycle check before adding a connection: an edge
    /// `source -> target` is legal only if `target.is_followed_by(source)`
    /// is `false`. Traversal is an explicit worklist with a visited set.
    #[must_use]
    pub fn is_followed_by(self: &Arc<Self>, other: &Arc<NodeContainer>) -> bool {
        let mut visited: FxHashSet<usize> = FxHashSet::default();
        let mut stack = vec![Arc::clone(self)];
        while let Some(current) = stack.pop() {
            if !visited.insert(Arc::as_ptr(&current) as usize) {
                continue;
            }
            if Arc::ptr_eq(&current, other) {
                return true;
            }
            for port in current.successors() {
                stack.extend(port);
            }
        }
        false
    }

    /// Persist this container (identity, label, placement, node settings).
    pub(crate) fn save(&self, settings: &mut Settings) {
        settings.add_i64(KEY_ID, self.id.index());
        settings.add_string(KEY_CUSTOM_NAME, self.custom_name());
        if let Some(info) = self.extra_info() {
            match serde_json::to_value(info) {
                Ok(value) => settings.add_value(KEY_EXTRA_INFO, value),
                Err(err) => {
                    tracing::warn!(node = %self.id, %err, "could not serialize extra info");
                }
            }
        }
        let mut node_settings = Settings::new();
        self.node.save_settings(&mut node_settings);
        settings.set_config(KEY_NODE_SETTINGS, node_settings);
    }
}

impl fmt::Debug for NodeContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContainer")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("custom_name", &self.custom_name())
            .finish_non_exhaustive()
    }
}
