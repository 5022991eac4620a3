//! The workflow manager: one scope of the (possibly nested) graph.
//!
//! A [`WorkflowManager`] owns the nodes and connections of one graph scope,
//! validates every mutation against the structural invariants (unique ids,
//! at most one connection per in-port, matching port kinds, no cycles),
//! drives the per-node execution state machines, and persists the whole
//! scope into a [`Settings`] tree.
//!
//! # Scopes
//!
//! Managers nest: [`create_sub_manager`](WorkflowManager::create_sub_manager)
//! produces a child scope that holds a strong handle to its parent and is
//! registered weakly with it. Readiness propagation flows down into live
//! children after every completion (dead children are pruned on the way),
//! while executable-node queries and backward marking delegate up to the
//! parent. Each scope locks only itself, so cross-scope recursion never
//! holds two locks at once.
//!
//! # Scheduling
//!
//! The manager never runs node work. An external executor polls
//! [`get_next_executable_node`](WorkflowManager::get_next_executable_node),
//! runs the claimed node out-of-band, and reports back through
//! [`state_changed`](WorkflowManager::state_changed) (usually via
//! [`NodeContainer::notify_state_changed`]); the `EndExecute` notification
//! re-evaluates downstream readiness before it returns. Selection among
//! several ready nodes is deliberately unspecified; callers may only rely
//! on each ready node being handed out at most once per readiness cycle.

use std::io::{BufReader, BufWriter, Write as _};
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::containers::{
    ConnectionContainer, NodeContainer, NodeState, KEY_CUSTOM_NAME, KEY_EXTRA_INFO, KEY_ID,
    KEY_NODE_SETTINGS,
};
use crate::error::WorkflowError;
use crate::events::{WorkflowEvent, WorkflowListener};
use crate::node::{Node, NodeExtraInfo, NodeFactory, NodeStateListener, NodeStatus};
use crate::settings::Settings;
use crate::types::{ConnectionId, NodeId};

/// Settings key holding the node section.
pub const KEY_NODES: &str = "nodes";
/// Settings key holding the connection section.
pub const KEY_CONNECTIONS: &str = "connections";
const KEY_RUNNING_NODE_ID: &str = "runningNodeID";
const KEY_RUNNING_CONNECTION_ID: &str = "runningConnectionID";

/// Canonical file name for persisted workflows.
pub const WORKFLOW_FILE: &str = "workflow.json";

/// Horizontal/vertical shift applied per paste when copying content into a
/// workflow, so copies do not land on top of their originals.
const PASTE_OFFSET: i32 = 40;

struct Scope {
    nodes: FxHashMap<NodeId, Arc<NodeContainer>>,
    connections: FxHashMap<ConnectionId, Arc<ConnectionContainer>>,
    running_node_id: i64,
    running_connection_id: i64,
}

impl Scope {
    fn new() -> Self {
        Scope {
            nodes: FxHashMap::default(),
            connections: FxHashMap::default(),
            running_node_id: -1,
            running_connection_id: -1,
        }
    }
}

/// Manager for one workflow scope; see the [module docs](self).
pub struct WorkflowManager {
    me: Weak<WorkflowManager>,
    parent: Option<Arc<WorkflowManager>>,
    scope: Mutex<Scope>,
    children: Mutex<Vec<Weak<WorkflowManager>>>,
    listeners: Mutex<Vec<Arc<dyn WorkflowListener>>>,
    exec_done: Mutex<bool>,
    exec_done_signal: Condvar,
}

impl WorkflowManager {
    /// Create a new, empty root scope.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Arc<WorkflowManager>>) -> Arc<Self> {
        Arc::new_cyclic(|me| WorkflowManager {
            me: me.clone(),
            parent,
            scope: Mutex::new(Scope::new()),
            children: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            exec_done: Mutex::new(false),
            exec_done_signal: Condvar::new(),
        })
    }

    /// Create a nested scope. The child keeps a strong handle to this
    /// manager; this manager only tracks the child weakly, so the child
    /// lives exactly as long as the caller's handle does.
    #[must_use]
    pub fn create_sub_manager(self: &Arc<Self>) -> Arc<WorkflowManager> {
        let child = Self::with_parent(Some(Arc::clone(self)));
        self.children.lock().push(Arc::downgrade(&child));
        child
    }

    /// The enclosing scope, if this is not the root.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<WorkflowManager>> {
        self.parent.as_ref()
    }

    // ------------------------------------------------------------------
    // Listener registry
    // ------------------------------------------------------------------

    /// Register a workflow listener. Has no effect if it is already
    /// registered.
    pub fn add_listener(&self, listener: Arc<dyn WorkflowListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a workflow listener. Has no effect if it was never
    /// registered.
    pub fn remove_listener(&self, listener: &Arc<dyn WorkflowListener>) {
        self.listeners
            .lock()
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    /// Notify all registered listeners. Dispatch runs against a snapshot
    /// of the listener set, so handlers may add or remove listeners.
    fn fire_event(&self, event: WorkflowEvent) {
        let snapshot: Vec<_> = self.listeners.lock().clone();
        for listener in &snapshot {
            listener.workflow_changed(&event);
        }
        if matches!(event, WorkflowEvent::ExecPoolDone) {
            let mut done = self.exec_done.lock();
            *done = true;
            self.exec_done_signal.notify_all();
        }
    }

    fn fire_events(&self, events: Vec<WorkflowEvent>) {
        for event in events {
            self.fire_event(event);
        }
    }

    // ------------------------------------------------------------------
    // Graph access
    // ------------------------------------------------------------------

    /// The container managed under the given id, if any.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<Arc<NodeContainer>> {
        self.scope.lock().nodes.get(&id).cloned()
    }

    /// Snapshot of all containers in this scope, in unspecified order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<NodeContainer>> {
        self.scope.lock().nodes.values().cloned().collect()
    }

    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionContainer>> {
        self.scope.lock().connections.get(&id).cloned()
    }

    /// Snapshot of all connections in this scope, in unspecified order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ConnectionContainer>> {
        self.scope.lock().connections.values().cloned().collect()
    }

    /// The connection ending at the given in-port, if any.
    #[must_use]
    pub fn incoming_connection_at(
        &self,
        target: &Arc<NodeContainer>,
        port: usize,
    ) -> Option<Arc<ConnectionContainer>> {
        self.scope
            .lock()
            .connections
            .values()
            .find(|c| Arc::ptr_eq(c.target(), target) && c.target_port() == port)
            .cloned()
    }

    /// All connections starting at the given out-port.
    #[must_use]
    pub fn outgoing_connections_at(
        &self,
        source: &Arc<NodeContainer>,
        port: usize,
    ) -> Vec<Arc<ConnectionContainer>> {
        self.scope
            .lock()
            .connections
            .values()
            .filter(|c| Arc::ptr_eq(c.source(), source) && c.source_port() == port)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Graph mutation
    // ------------------------------------------------------------------

    /// Wrap `node` in a fresh container, register this manager as its
    /// status listener and add it to the scope. Emits
    /// [`WorkflowEvent::NodeAdded`].
    pub fn add_node(&self, node: Box<dyn Node>) -> Arc<NodeContainer> {
        let (container, event) = {
            let mut scope = self.scope.lock();
            scope.running_node_id += 1;
            let id = NodeId::new(scope.running_node_id);
            debug_assert!(!scope.nodes.contains_key(&id));
            let container = Arc::new(NodeContainer::new(id, node));
            self.listen_to_node(&container);
            scope.nodes.insert(id, Arc::clone(&container));
            tracing::debug!("added {}", container.name_with_id());
            let event = WorkflowEvent::NodeAdded {
                id,
                node: Arc::clone(&container),
            };
            (container, event)
        };
        self.fire_event(event);
        container
    }

    /// Remove a node: first every connection touching it (both directions),
    /// then the node itself, detaching the wrapped unit in between. Fails
    /// if the id is not managed by this scope; the graph is unchanged then.
    pub fn remove_node(&self, id: NodeId) -> Result<(), WorkflowError> {
        let mut events = Vec::new();
        {
            let mut scope = self.scope.lock();
            let container = scope
                .nodes
                .get(&id)
                .cloned()
                .ok_or(WorkflowError::NodeNotManaged { id })?;
            let touching: Vec<_> = scope
                .connections
                .values()
                .filter(|c| {
                    Arc::ptr_eq(c.source(), &container) || Arc::ptr_eq(c.target(), &container)
                })
                .cloned()
                .collect();
            for connection in touching {
                Self::unlink_connection(&mut scope, &connection, &mut events);
            }
            container.node().detach();
            container.clear_listeners();
            scope.nodes.remove(&id);
            tracing::debug!("removed {}", container.name_with_id());
            events.push(WorkflowEvent::NodeRemoved {
                id,
                node: container,
            });
        }
        self.fire_events(events);
        Ok(())
    }

    /// Remove every connection touching the given node, leaving the node
    /// itself in place.
    pub fn disconnect_node(&self, id: NodeId) -> Result<(), WorkflowError> {
        let mut events = Vec::new();
        {
            let mut scope = self.scope.lock();
            let container = scope
                .nodes
                .get(&id)
                .cloned()
                .ok_or(WorkflowError::NodeNotManaged { id })?;
            let touching: Vec<_> = scope
                .connections
                .values()
                .filter(|c| {
                    Arc::ptr_eq(c.source(), &container) || Arc::ptr_eq(c.target(), &container)
                })
                .cloned()
                .collect();
            for connection in touching {
                Self::unlink_connection(&mut scope, &connection, &mut events);
            }
        }
        self.fire_events(events);
        Ok(())
    }

    /// Remove all nodes and connections and reset both id counters.
    pub fn clear(&self) {
        let ids: Vec<NodeId> = self.scope.lock().nodes.keys().copied().collect();
        for id in ids {
            // a concurrent removal already achieved the goal
            let _ = self.remove_node(id);
        }
        let mut scope = self.scope.lock();
        debug_assert!(scope.nodes.is_empty());
        debug_assert!(scope.connections.is_empty());
        scope.running_node_id = -1;
        scope.running_connection_id = -1;
    }

    /// Connect `source`'s out-port to `target`'s in-port.
    ///
    /// Fails with a reference error if either id is unknown in this scope,
    /// and with the corresponding rejection error if the port indices are
    /// invalid, the in-port is occupied, the port kinds do not match, or
    /// the edge would close a loop. On success both containers' adjacency
    /// is updated, the underlying node ports are bound, and
    /// [`WorkflowEvent::ConnectionAdded`] is emitted.
    pub fn add_connection(
        &self,
        source: NodeId,
        source_port: usize,
        target: NodeId,
        target_port: usize,
    ) -> Result<Arc<ConnectionContainer>, WorkflowError> {
        let connection = {
            let mut scope = self.scope.lock();
            let src = scope
                .nodes
                .get(&source)
                .cloned()
                .ok_or(WorkflowError::UnknownNode { id: source })?;
            let dst = scope
                .nodes
                .get(&target)
                .cloned()
                .ok_or(WorkflowError::UnknownNode { id: target })?;
            self.link_containers(&mut scope, &src, source_port, &dst, target_port, None)?
        };
        self.fire_event(WorkflowEvent::ConnectionAdded {
            id: connection.id(),
            connection: Arc::clone(&connection),
        });
        Ok(connection)
    }

    /// Container-based variant of [`add_connection`](Self::add_connection).
    ///
    /// A root scope insists that both containers are managed by it. A
    /// nested scope also accepts containers owned by an ancestor, which is
    /// how a sub-workflow consumes data produced outside of it.
    pub fn add_connection_between(
        &self,
        source: &Arc<NodeContainer>,
        source_port: usize,
        target: &Arc<NodeContainer>,
        target_port: usize,
    ) -> Result<Arc<ConnectionContainer>, WorkflowError> {
        let connection = {
            let mut scope = self.scope.lock();
            if self.parent.is_none() {
                for container in [source, target] {
                    let managed = scope
                        .nodes
                        .get(&container.id())
                        .is_some_and(|known| Arc::ptr_eq(known, container));
                    if !managed {
                        return Err(WorkflowError::NodeNotManaged {
                            id: container.id(),
                        });
                    }
                }
            }
            self.link_containers(&mut scope, source, source_port, target, target_port, None)?
        };
        self.fire_event(WorkflowEvent::ConnectionAdded {
            id: connection.id(),
            connection: Arc::clone(&connection),
        });
        Ok(connection)
    }

    /// Pure feasibility probe: would
    /// [`add_connection`](Self::add_connection) succeed right now?
    ///
    /// Performs the same checks without mutating anything and without
    /// raising an error, so callers (undo logic, drag feedback) can test
    /// before committing. A cycle-forming pair simply yields `false`.
    #[must_use]
    pub fn can_add_connection(
        &self,
        source: NodeId,
        source_port: usize,
        target: NodeId,
        target_port: usize,
    ) -> bool {
        let scope = self.scope.lock();
        let (Some(src), Some(dst)) = (scope.nodes.get(&source), scope.nodes.get(&target)) else {
            tracing::error!("checking for a connection between nonexistent nodes");
            return false;
        };
        Self::validate_link(&scope, src, source_port, dst, target_port).is_ok()
    }

    /// Remove a connection. A no-op (and no event) if the id is already
    /// absent; otherwise unwinds the adjacency, unbinds the node ports and
    /// emits [`WorkflowEvent::ConnectionRemoved`].
    pub fn remove_connection_if_exists(&self, id: ConnectionId) {
        let mut events = Vec::new();
        {
            let mut scope = self.scope.lock();
            let Some(connection) = scope.connections.get(&id).cloned() else {
                return;
            };
            Self::unlink_connection(&mut scope, &connection, &mut events);
        }
        self.fire_events(events);
    }

    fn listen_to_node(&self, container: &NodeContainer) {
        let listener: Weak<dyn NodeStateListener> = self.me.clone();
        container.add_listener(listener);
    }

    /// All invariant checks for a prospective edge, in rejection order:
    /// port ranges, free in-port, matching port kinds, acyclicity.
    fn validate_link(
        scope: &Scope,
        source: &Arc<NodeContainer>,
        source_port: usize,
        target: &Arc<NodeContainer>,
        target_port: usize,
    ) -> Result<(), WorkflowError> {
        if source_port >= source.node().nr_out_ports() {
            return Err(WorkflowError::InvalidPort {
                node: source.id(),
                port: source_port,
                direction: "out",
            });
        }
        if target_port >= target.node().nr_in_ports() {
            return Err(WorkflowError::InvalidPort {
                node: target.id(),
                port: target_port,
                direction: "in",
            });
        }
        let occupied = scope
            .connections
            .values()
            .any(|c| Arc::ptr_eq(c.target(), target) && c.target_port() == target_port);
        if occupied {
            return Err(WorkflowError::PortOccupied {
                node: target.id(),
                port: target_port,
            });
        }
        let data_link =
            source.node().is_data_out_port(source_port) && target.node().is_data_in_port(target_port);
        let model_link = !source.node().is_data_out_port(source_port)
            && !target.node().is_data_in_port(target_port);
        if !data_link && !model_link {
            return Err(WorkflowError::PortKindMismatch {
                source_node: source.id(),
                source_port,
                target: target.id(),
                target_port,
            });
        }
        if target.is_followed_by(source) {
            return Err(WorkflowError::WouldCreateCycle {
                source_node: source.id(),
                target: target.id(),
            });
        }
        Ok(())
    }

    /// Validate and wire one edge under the scope lock. `explicit_id`
    /// carries the persisted id on load; fresh edges allocate one.
    fn link_containers(
        &self,
        scope: &mut Scope,
        source: &Arc<NodeContainer>,
        source_port: usize,
        target: &Arc<NodeContainer>,
        target_port: usize,
        explicit_id: Option<ConnectionId>,
    ) -> Result<Arc<ConnectionContainer>, WorkflowError> {
        Self::validate_link(scope, source, source_port, target, target_port)?;
        let id = match explicit_id {
            Some(id) => {
                if scope.connections.contains_key(&id) {
                    return Err(WorkflowError::DuplicateConnectionId { id });
                }
                id
            }
            None => {
                scope.running_connection_id += 1;
                ConnectionId::new(scope.running_connection_id)
            }
        };
        let connection = Arc::new(ConnectionContainer::new(
            id,
            Arc::clone(source),
            source_port,
            Arc::clone(target),
            target_port,
        ));
        scope.connections.insert(id, Arc::clone(&connection));
        source.add_outgoing(source_port, target);
        target.set_incoming(target_port, source);
        target
            .node()
            .connect_in_port(target_port, source.node(), source_port);
        let listener: Weak<dyn WorkflowListener> = self.me.clone();
        connection.add_listener(listener);
        tracing::debug!(
            "added connection from node {} port {} to node {} port {}",
            source.id(),
            source_port,
            target.id(),
            target_port
        );
        Ok(connection)
    }

    fn unlink_connection(
        scope: &mut Scope,
        connection: &Arc<ConnectionContainer>,
        events: &mut Vec<WorkflowEvent>,
    ) {
        let id = connection.id();
        if scope.connections.remove(&id).is_none() {
            return;
        }
        connection
            .source()
            .remove_outgoing(connection.source_port(), connection.target());
        connection.target().clear_incoming(connection.target_port());
        connection
            .target()
            .node()
            .disconnect_in_port(connection.target_port());
        tracing::info!(
            "removed connection from node {} port {} to node {} port {}",
            connection.source().id(),
            connection.source_port(),
            connection.target().id(),
            connection.target_port()
        );
        events.push(WorkflowEvent::ConnectionRemoved {
            id,
            connection: Arc::clone(connection),
        });
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Mark every node that is not executed, queued or running as ready
    /// (`IsExecutable`) or waiting (`WaitingToBeExecutable`) according to
    /// its own readiness predicate, then do the same in the parent scope,
    /// since readiness may depend on ancestors outside this scope.
    pub fn prepare_for_exec_all_nodes(&self) {
        {
            let scope = self.scope.lock();
            for container in scope.nodes.values() {
                Self::mark_for_execution(container);
            }
        }
        if let Some(parent) = &self.parent {
            parent.prepare_for_exec_all_nodes();
        }
    }

    /// Mark the given node and all of its transitive predecessors for
    /// execution, following the adjacency derived from the connection set.
    ///
    /// Traversal is an explicit worklist with a visited set. A predecessor
    /// owned by an ancestor scope is handed to that scope; a predecessor
    /// owned by no scope in the chain means the bookkeeping is corrupt and
    /// yields [`WorkflowError::DisconnectedPredecessor`].
    pub fn prepare_for_exec_up_to_node(&self, id: NodeId) -> Result<(), WorkflowError> {
        let container = self.node(id).ok_or(WorkflowError::UnknownNode { id })?;
        self.prepare_up_to_container(&container)
    }

    fn prepare_up_to_container(&self, start: &Arc<NodeContainer>) -> Result<(), WorkflowError> {
        let mut foreign: Vec<Arc<NodeContainer>> = Vec::new();
        {
            let scope = self.scope.lock();
            let owned_here = |container: &Arc<NodeContainer>| {
                scope
                    .nodes
                    .get(&container.id())
                    .is_some_and(|known| Arc::ptr_eq(known, container))
            };
            if owned_here(start) {
                let mut visited: FxHashSet<usize> = FxHashSet::default();
                let mut stack = vec![Arc::clone(start)];
                while let Some(container) = stack.pop() {
                    if !visited.insert(Arc::as_ptr(&container) as usize) {
                        continue;
                    }
                    if container.node().is_executed() || container.state().is_execution_pending() {
                        continue;
                    }
                    Self::mark_for_execution(&container);
                    for (port, predecessor) in container.predecessors().into_iter().enumerate() {
                        match predecessor {
                            Some(pred) => {
                                if owned_here(&pred) {
                                    stack.push(pred);
                                } else {
                                    foreign.push(pred);
                                }
                            }
                            None => tracing::error!(
                                "{} is not executable: in-port {port} is unconnected",
                                container.name_with_id()
                            ),
                        }
                    }
                }
            } else {
                foreign.push(Arc::clone(start));
            }
        }
        // nodes owned elsewhere are resolved by the ancestor chain, outside
        // our own lock; running out of ancestors means the adjacency points
        // at a node no scope knows
        for pred in foreign {
            match &self.parent {
                Some(parent) => parent.prepare_up_to_container(&pred)?,
                None => {
                    return Err(WorkflowError::DisconnectedPredecessor { id: pred.id() });
                }
            }
        }
        Ok(())
    }

    fn mark_for_execution(container: &Arc<NodeContainer>) {
        if container.node().is_executed() || container.state().is_execution_pending() {
            return;
        }
        if container.node().is_executable() {
            container.set_state(NodeState::IsExecutable);
        } else {
            container.set_state(NodeState::WaitingToBeExecutable);
        }
    }

    /// Hand out the next ready node, transitioning it to
    /// `WaitingForExecution` so it is returned at most once per readiness
    /// cycle. Delegates to the parent scope when this scope has nothing;
    /// `None` means nothing is ready *right now*; more nodes may become
    /// ready when a running node completes.
    #[must_use]
    pub fn get_next_executable_node(&self) -> Option<Arc<NodeContainer>> {
        {
            let scope = self.scope.lock();
            for container in scope.nodes.values() {
                if container.state() == NodeState::IsExecutable && container.node().is_executable()
                {
                    container.set_state(NodeState::WaitingForExecution);
                    tracing::debug!("returning node {} as next executable", container.id());
                    return Some(Arc::clone(container));
                }
            }
        }
        self.parent.as_ref()?.get_next_executable_node()
    }

    /// Re-evaluate the execution pool after a completion: promote waiting
    /// and auto-executable nodes whose predicate now holds, emit
    /// [`WorkflowEvent::ExecPoolChanged`] when anything is ready, and when
    /// nothing is ready, queued or running anymore, reset all nodes to
    /// idle and emit [`WorkflowEvent::ExecPoolDone`]. Finally propagate
    /// into every live child scope.
    pub fn check_for_executable_nodes(&self) {
        let mut events = Vec::new();
        {
            let scope = self.scope.lock();
            let mut executable = 0usize;
            for container in scope.nodes.values() {
                match container.state() {
                    NodeState::WaitingToBeExecutable if container.node().is_executable() => {
                        container.set_state(NodeState::IsExecutable);
                        executable += 1;
                    }
                    NodeState::Idle
                        if container.node().is_auto_executable()
                            && container.node().is_executable() =>
                    {
                        container.set_state(NodeState::IsExecutable);
                        executable += 1;
                    }
                    NodeState::IsExecutable => executable += 1,
                    _ => {}
                }
            }
            let running = scope
                .nodes
                .values()
                .filter(|c| c.state().is_execution_pending())
                .count();
            if executable > 0 {
                events.push(WorkflowEvent::ExecPoolChanged);
            }
            if executable == 0 && running == 0 {
                // reset all flags, in case some were left behind
                for container in scope.nodes.values() {
                    container.set_state(NodeState::Idle);
                }
                tracing::info!("workflow pool done");
                events.push(WorkflowEvent::ExecPoolDone);
            }
        }
        self.fire_events(events);
        for child in self.live_children() {
            child.check_for_executable_nodes();
        }
    }

    /// Cancel every remaining node in this scope. Nodes that were merely
    /// marked are reset synchronously; queued or running nodes are asked
    /// to stop and settle on their own time.
    pub fn cancel_execution_all_remaining_nodes(&self) {
        let pool_done = {
            let scope = self.scope.lock();
            for container in scope.nodes.values() {
                Self::cancel_container(container);
            }
            scope
                .nodes
                .values()
                .all(|c| !c.state().is_execution_pending())
        };
        if pool_done {
            self.fire_event(WorkflowEvent::ExecPoolDone);
        }
    }

    /// Cancel the given node and everything downstream of it.
    pub fn cancel_execution_after_node(&self, id: NodeId) -> Result<(), WorkflowError> {
        let pool_done = {
            let scope = self.scope.lock();
            let start = scope
                .nodes
                .get(&id)
                .cloned()
                .ok_or(WorkflowError::UnknownNode { id })?;
            let mut visited: FxHashSet<usize> = FxHashSet::default();
            let mut stack = vec![start];
            while let Some(container) = stack.pop() {
                if !visited.insert(Arc::as_ptr(&container) as usize) {
                    continue;
                }
                Self::cancel_container(&container);
                for port in container.successors() {
                    stack.extend(port);
                }
            }
            scope.nodes.values().all(|c| !c.state().is_active())
        };
        if pool_done {
            self.fire_event(WorkflowEvent::ExecPoolDone);
        }
        Ok(())
    }

    fn cancel_container(container: &Arc<NodeContainer>) {
        match container.state() {
            NodeState::WaitingToBeExecutable | NodeState::IsExecutable => {
                container.set_state(NodeState::Idle);
            }
            NodeState::WaitingForExecution | NodeState::CurrentlyExecuting => {
                // already handed to an executor; ask the node to stop
                container.node().cancel_execution();
            }
            NodeState::Idle => {}
        }
    }

    /// Mark the whole graph for execution and kick off pool bookkeeping.
    /// No node is run by this call; executors drive the actual work. With
    /// `wait`, blocks until [`WorkflowEvent::ExecPoolDone`] fires.
    pub fn start_execution(&self, wait: bool) {
        *self.exec_done.lock() = false;
        self.prepare_for_exec_all_nodes();
        self.check_for_executable_nodes();
        if wait {
            let mut done = self.exec_done.lock();
            while !*done {
                self.exec_done_signal.wait(&mut done);
            }
        }
    }

    /// React to a node lifecycle notification; see the state machine in
    /// [`NodeState`]. `EndExecute` re-evaluates the whole graph (including
    /// child scopes) before this call returns.
    pub fn state_changed(&self, status: NodeStatus, node_id: NodeId) {
        match status {
            NodeStatus::StartExecute => {
                let scope = self.scope.lock();
                if let Some(container) = scope.nodes.get(&node_id) {
                    debug_assert_eq!(container.state(), NodeState::WaitingForExecution);
                    container.set_state(NodeState::CurrentlyExecuting);
                } else {
                    tracing::warn!("start notification for unknown node {node_id}");
                }
            }
            NodeStatus::EndExecute => {
                let known = {
                    let scope = self.scope.lock();
                    match scope.nodes.get(&node_id) {
                        Some(container) => {
                            container.set_state(NodeState::Idle);
                            true
                        }
                        None => {
                            tracing::warn!("end notification for unknown node {node_id}");
                            false
                        }
                    }
                };
                if known {
                    self.check_for_executable_nodes();
                }
            }
            NodeStatus::Reset => self.fire_event(WorkflowEvent::NodeReset { id: node_id }),
            NodeStatus::Configured => {
                self.fire_event(WorkflowEvent::NodeConfigured { id: node_id });
            }
            NodeStatus::ExtrainfoChanged => {
                self.fire_event(WorkflowEvent::NodeExtrainfoChanged { id: node_id });
            }
        }
    }

    fn live_children(&self) -> Vec<Arc<WorkflowManager>> {
        let mut children = self.children.lock();
        children.retain(|weak| weak.strong_count() > 0);
        children.iter().filter_map(Weak::upgrade).collect()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Serialize this scope: counters first, then all nodes, then all
    /// connections. Connections reference node ids, so the order matters
    /// on reconstruction.
    pub fn save(&self, settings: &mut Settings) {
        let scope = self.scope.lock();
        Self::save_scope(&scope, settings);
    }

    /// Like [`save`](Self::save), but producing a snapshot of the graph
    /// minus the given nodes and every connection touching them. The live
    /// maps are temporarily reduced, serialized and restored; no second
    /// copy of the graph is built.
    pub fn save_omitting(&self, settings: &mut Settings, omit: &[NodeId]) {
        let mut scope = self.scope.lock();
        let mut parked_nodes = Vec::new();
        for id in omit {
            if let Some(container) = scope.nodes.remove(id) {
                parked_nodes.push((*id, container));
            }
        }
        let omitted: Vec<_> = parked_nodes
            .iter()
            .map(|(_, container)| Arc::clone(container))
            .collect();
        let parked_connections: Vec<_> = scope
            .connections
            .iter()
            .filter(|(_, c)| {
                omitted
                    .iter()
                    .any(|nc| Arc::ptr_eq(nc, c.source()) || Arc::ptr_eq(nc, c.target()))
            })
            .map(|(id, c)| (*id, Arc::clone(c)))
            .collect();
        for (id, _) in &parked_connections {
            scope.connections.remove(id);
        }

        Self::save_scope(&scope, settings);

        for (id, container) in parked_nodes {
            scope.nodes.insert(id, container);
        }
        for (id, connection) in parked_connections {
            scope.connections.insert(id, connection);
        }
    }

    fn save_scope(scope: &Scope, settings: &mut Settings) {
        settings.add_i64(KEY_RUNNING_NODE_ID, scope.running_node_id);
        settings.add_i64(KEY_RUNNING_CONNECTION_ID, scope.running_connection_id);
        let mut nodes = Settings::new();
        for container in scope.nodes.values() {
            let mut entry = Settings::new();
            container.save(&mut entry);
            nodes.set_config(format!("node_{}", container.id()), entry);
        }
        settings.set_config(KEY_NODES, nodes);
        let mut connections = Settings::new();
        for connection in scope.connections.values() {
            let mut entry = Settings::new();
            connection.save(&mut entry);
            connections.set_config(format!("connection_{}", connection.id()), entry);
        }
        settings.set_config(KEY_CONNECTIONS, connections);
    }

    /// Reconstruct a scope from its serialized form: counters, then nodes
    /// (stored ids verbatim), then connections (stored endpoint ids).
    ///
    /// A malformed node or connection entry, or a connection referencing a
    /// node that did not come back, is logged and skipped; the load
    /// proceeds with a partially populated graph. Only missing top-level
    /// sections are fatal.
    pub fn load(
        &self,
        settings: &Settings,
        factory: &dyn NodeFactory,
    ) -> Result<(), WorkflowError> {
        let mut events = Vec::new();
        {
            let mut scope = self.scope.lock();
            scope.running_node_id = settings.get_i64(KEY_RUNNING_NODE_ID)?;
            scope.running_connection_id = settings.get_i64(KEY_RUNNING_CONNECTION_ID)?;

            let nodes = settings.get_config(KEY_NODES)?;
            for key in nodes.keys() {
                let restored = nodes
                    .get_config(key)
                    .map_err(WorkflowError::from)
                    .and_then(|entry| self.restore_node_entry(&mut scope, &entry, factory));
                match restored {
                    Ok(container) => events.push(WorkflowEvent::NodeAdded {
                        id: container.id(),
                        node: container,
                    }),
                    Err(err) => tracing::warn!("could not create node {key}: {err}"),
                }
            }

            let connections = settings.get_config(KEY_CONNECTIONS)?;
            for key in connections.keys() {
                let restored = connections
                    .get_config(key)
                    .map_err(WorkflowError::from)
                    .and_then(|entry| self.restore_connection_entry(&mut scope, &entry));
                match restored {
                    Ok(connection) => events.push(WorkflowEvent::ConnectionAdded {
                        id: connection.id(),
                        connection,
                    }),
                    Err(err) => tracing::warn!("could not create connection {key}: {err}"),
                }
            }
        }
        self.fire_events(events);
        Ok(())
    }

    fn restore_node_entry(
        &self,
        scope: &mut Scope,
        entry: &Settings,
        factory: &dyn NodeFactory,
    ) -> Result<Arc<NodeContainer>, WorkflowError> {
        let id = NodeId::new(entry.get_i64(KEY_ID)?);
        if scope.nodes.contains_key(&id) {
            return Err(WorkflowError::DuplicateNodeId { id });
        }
        let node = factory.create_node(&entry.get_config(KEY_NODE_SETTINGS)?)?;
        let container = Arc::new(NodeContainer::new(id, node));
        if let Ok(name) = entry.get_string(KEY_CUSTOM_NAME) {
            container.set_custom_name(name);
        }
        Self::restore_extra_info(&container, entry);
        self.listen_to_node(&container);
        scope.nodes.insert(id, Arc::clone(&container));
        Ok(container)
    }

    fn restore_connection_entry(
        &self,
        scope: &mut Scope,
        entry: &Settings,
    ) -> Result<Arc<ConnectionContainer>, WorkflowError> {
        let id = ConnectionContainer::id_from_settings(entry)?;
        let ((source, source_port), (target, target_port)) =
            ConnectionContainer::endpoints_from_settings(entry)?;
        let src = scope
            .nodes
            .get(&source)
            .cloned()
            .ok_or(WorkflowError::UnknownNode { id: source })?;
        let dst = scope
            .nodes
            .get(&target)
            .cloned()
            .ok_or(WorkflowError::UnknownNode { id: target })?;
        let connection =
            self.link_containers(scope, &src, source_port, &dst, target_port, Some(id))?;
        connection.load_extra_info(entry);
        Ok(connection)
    }

    fn restore_extra_info(container: &Arc<NodeContainer>, entry: &Settings) {
        if let Ok(value) = entry.get_value(KEY_EXTRA_INFO) {
            match serde_json::from_value::<NodeExtraInfo>(value.clone()) {
                // listeners are registered after restoration, so this does
                // not fan out a change notification
                Ok(info) => container.set_extra_info(Some(info)),
                Err(err) => {
                    tracing::warn!(node = %container.id(), %err, "ignoring malformed extra info");
                }
            }
        }
    }

    /// Copy serialized content *into* this scope: every stored node id is
    /// remapped to a freshly allocated one, copied placements are shifted
    /// by `40 * position_offset`, and copies still carrying their default
    /// label are relabeled for their new id. Connections are translated
    /// through the old→new id map; a connection whose endpoint was not part
    /// of the copied content is omitted. Malformed entries are logged and
    /// skipped.
    ///
    /// Returns the ids of the newly created nodes and connections.
    pub fn create_sub_workflow(
        &self,
        settings: &Settings,
        position_offset: i32,
        factory: &dyn NodeFactory,
    ) -> Result<(Vec<NodeId>, Vec<ConnectionId>), WorkflowError> {
        let mut events = Vec::new();
        let mut new_nodes = Vec::new();
        let mut new_connections = Vec::new();
        {
            let mut scope = self.scope.lock();
            let nodes = settings.get_config(KEY_NODES)?;
            let mut id_map: FxHashMap<NodeId, NodeId> = FxHashMap::default();
            for key in nodes.keys() {
                let copied = nodes
                    .get_config(key)
                    .map_err(WorkflowError::from)
                    .and_then(|entry| {
                        self.copy_node_entry(&mut scope, &entry, position_offset, factory)
                    });
                match copied {
                    Ok((old_id, container)) => {
                        id_map.insert(old_id, container.id());
                        new_nodes.push(container.id());
                        events.push(WorkflowEvent::NodeAdded {
                            id: container.id(),
                            node: container,
                        });
                    }
                    Err(err) => tracing::warn!("could not create node {key}: {err}"),
                }
            }

            let connections = settings.get_config(KEY_CONNECTIONS)?;
            for key in connections.keys() {
                let entry = match connections.get_config(key) {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!("could not create connection {key}: {err}");
                        continue;
                    }
                };
                let endpoints = match ConnectionContainer::endpoints_from_settings(&entry) {
                    Ok(endpoints) => endpoints,
                    Err(err) => {
                        tracing::warn!("could not create connection {key}: {err}");
                        continue;
                    }
                };
                let ((old_source, source_port), (old_target, target_port)) = endpoints;
                // a connection to content outside the copied set is omitted
                let (Some(&source), Some(&target)) =
                    (id_map.get(&old_source), id_map.get(&old_target))
                else {
                    continue;
                };
                let src = scope.nodes.get(&source).cloned();
                let dst = scope.nodes.get(&target).cloned();
                let (Some(src), Some(dst)) = (src, dst) else {
                    continue;
                };
                match self.link_containers(&mut scope, &src, source_port, &dst, target_port, None)
                {
                    Ok(connection) => {
                        connection.load_extra_info(&entry);
                        new_connections.push(connection.id());
                        events.push(WorkflowEvent::ConnectionAdded {
                            id: connection.id(),
                            connection,
                        });
                    }
                    Err(err) => tracing::warn!("could not create connection {key}: {err}"),
                }
            }
        }
        self.fire_events(events);
        Ok((new_nodes, new_connections))
    }

    fn copy_node_entry(
        &self,
        scope: &mut Scope,
        entry: &Settings,
        position_offset: i32,
        factory: &dyn NodeFactory,
    ) -> Result<(NodeId, Arc<NodeContainer>), WorkflowError> {
        let old_id = NodeId::new(entry.get_i64(KEY_ID)?);
        let node = factory.create_node(&entry.get_config(KEY_NODE_SETTINGS)?)?;
        scope.running_node_id += 1;
        let new_id = NodeId::new(scope.running_node_id);
        let container = Arc::new(NodeContainer::new(new_id, node));
        match entry.get_string(KEY_CUSTOM_NAME) {
            // a copy still carrying the default label keeps a default label
            // for its *new* id, which the container already has
            Ok(name) if name == format!("Node {}", old_id.index() + 1) => {}
            Ok(name) => container.set_custom_name(name),
            Err(_) => {}
        }
        if let Ok(value) = entry.get_value(KEY_EXTRA_INFO) {
            match serde_json::from_value::<NodeExtraInfo>(value.clone()) {
                Ok(info) => {
                    container.set_extra_info(Some(info.shifted(PASTE_OFFSET * position_offset)));
                }
                Err(err) => {
                    tracing::warn!(node = %new_id, %err, "ignoring malformed extra info");
                }
            }
        }
        self.listen_to_node(&container);
        scope.nodes.insert(new_id, Arc::clone(&container));
        Ok((old_id, container))
    }

    /// Persist this scope to `path`, which must point at a file named
    /// [`WORKFLOW_FILE`].
    pub fn save_to_path(&self, path: &Path) -> Result<(), WorkflowError> {
        Self::check_workflow_file(path)?;
        let mut settings = Settings::new();
        self.save(&mut settings);
        let file = std::fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        settings.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Restore this scope from a file previously produced by
    /// [`save_to_path`](Self::save_to_path).
    pub fn load_from_path(
        &self,
        path: &Path,
        factory: &dyn NodeFactory,
    ) -> Result<(), WorkflowError> {
        Self::check_workflow_file(path)?;
        let file = std::fs::File::open(path)?;
        let settings = Settings::read_from(BufReader::new(file))?;
        self.load(&settings, factory)
    }

    /// Create a fresh root manager populated from a workflow file.
    pub fn from_path(path: &Path, factory: &dyn NodeFactory) -> Result<Arc<Self>, WorkflowError> {
        let manager = Self::new();
        manager.load_from_path(path, factory)?;
        Ok(manager)
    }

    fn check_workflow_file(path: &Path) -> Result<(), WorkflowError> {
        if path.file_name().and_then(|name| name.to_str()) != Some(WORKFLOW_FILE) {
            return Err(WorkflowError::WrongWorkflowFile {
                expected: WORKFLOW_FILE,
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }
}

impl NodeStateListener for WorkflowManager {
    fn state_changed(&self, status: NodeStatus, node: NodeId) {
        WorkflowManager::state_changed(self, status, node);
    }
}

impl WorkflowListener for WorkflowManager {
    /// Forward extra-info changes reported by the connections this manager
    /// listens on.
    fn workflow_changed(&self, event: &WorkflowEvent) {
        if let WorkflowEvent::ConnectionExtrainfoChanged { .. } = event {
            self.fire_event(event.clone());
        }
    }
}
