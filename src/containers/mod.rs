//! Scheduler-visible wrappers around nodes and edges.
//!
//! A [`NodeContainer`] pairs one [`Node`](crate::node::Node) with its
//! execution state machine and the adjacency derived from the connection
//! set; a [`ConnectionContainer`] is one immutable directed edge between
//! two ports. Both are shared as `Arc`s between the owning manager, its
//! listeners and external executors, so their mutable parts sit behind
//! interior locks; every state transition still happens under the owning
//! scope's lock.

mod connection;
mod node_container;

pub use connection::{ConnectionContainer, ConnectionExtraInfo};
pub use node_container::{NodeContainer, NodeState};

pub(crate) use node_container::{KEY_CUSTOM_NAME, KEY_EXTRA_INFO, KEY_ID, KEY_NODE_SETTINGS};
