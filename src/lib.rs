//! # Trellis: a mutable workflow graph engine
//!
//! Trellis manages directed graphs of computational units ("nodes") linked
//! by typed, indexed ports, and schedules them for execution as their
//! upstream data becomes available. The engine owns graph structure and
//! scheduling state; what a node computes is defined entirely by the
//! [`Node`](node::Node) contract implementor.
//!
//! ## Core concepts
//!
//! - **Node**: the external computational unit; defines its own readiness
//!   predicate and execute/cancel behavior.
//! - **NodeContainer**: the scheduler-visible wrapper holding a node plus
//!   its execution state machine.
//! - **ConnectionContainer**: a directed edge between a specific out-port
//!   and a specific in-port.
//! - **WorkflowManager**: one scope of the (possibly nested) graph; owns
//!   its nodes, connections and id counters, validates every mutation,
//!   and drives readiness propagation.
//!
//! ## Quick start
//!
//! ```
//! use trellis::manager::WorkflowManager;
//! use trellis::node::{Node, NodeStatus};
//! use trellis::containers::NodeState;
//!
//! struct SourceNode;
//!
//! impl Node for SourceNode {
//!     fn name(&self) -> &str {
//!         "source"
//!     }
//!     fn is_executable(&self) -> bool {
//!         true
//!     }
//!     fn is_executed(&self) -> bool {
//!         false
//!     }
//!     fn nr_in_ports(&self) -> usize {
//!         0
//!     }
//!     fn nr_out_ports(&self) -> usize {
//!         1
//!     }
//!     fn is_data_in_port(&self, _port: usize) -> bool {
//!         true
//!     }
//!     fn is_data_out_port(&self, _port: usize) -> bool {
//!         true
//!     }
//!     fn execute(&self) {}
//!     fn cancel_execution(&self) {}
//! }
//!
//! let manager = WorkflowManager::new();
//! let node = manager.add_node(Box::new(SourceNode));
//!
//! // mark the graph, then poll for work like an executor would
//! manager.start_execution(false);
//! let claimed = manager.get_next_executable_node().unwrap();
//! assert_eq!(claimed.id(), node.id());
//! assert_eq!(claimed.state(), NodeState::WaitingForExecution);
//!
//! // the executor reports progress back through the container
//! claimed.notify_state_changed(NodeStatus::StartExecute);
//! claimed.notify_state_changed(NodeStatus::EndExecute);
//! ```
//!
//! ## Module guide
//!
//! - [`manager`] - Graph scopes: mutation, scheduling, persistence
//! - [`containers`] - Node and connection wrappers
//! - [`node`] - The node contract and lifecycle notifications
//! - [`events`] - Workflow events and the listener boundary
//! - [`settings`] - Nested key/value settings trees
//! - [`error`] - Error types
//! - [`telemetry`] - Tracing bootstrap

pub mod containers;
pub mod error;
pub mod events;
pub mod manager;
pub mod node;
pub mod settings;
pub mod telemetry;
pub mod types;
