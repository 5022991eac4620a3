//! Core identifier types for the trellis workflow engine.
//!
//! Every node and connection in a workflow scope is addressed by a small
//! integer id allocated from that scope's running counter. Ids are unique
//! within their owning [`WorkflowManager`](crate::manager::WorkflowManager)
//! and are never reused while the manager is alive; a nested scope has its
//! own counters, so ids are only meaningful relative to one scope.
//!
//! # Examples
//!
//! ```rust
//! use trellis::types::NodeId;
//!
//! let id = NodeId::new(3);
//! assert_eq!(id.index(), 3);
//! assert_eq!(format!("{id}"), "3");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node within one workflow scope.
///
/// Allocated from the scope's monotonically increasing node counter.
/// Comparisons between ids from different scopes are meaningless.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(i64);

impl NodeId {
    #[must_use]
    pub fn new(index: i64) -> Self {
        NodeId(index)
    }

    /// The raw counter value behind this id.
    #[must_use]
    pub fn index(self) -> i64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for NodeId {
    fn from(index: i64) -> Self {
        NodeId(index)
    }
}

/// Identifier of a connection within one workflow scope.
///
/// Allocated from the scope's connection counter, independently of node ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(i64);

impl ConnectionId {
    #[must_use]
    pub fn new(index: i64) -> Self {
        ConnectionId(index)
    }

    #[must_use]
    pub fn index(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ConnectionId {
    fn from(index: i64) -> Self {
        ConnectionId(index)
    }
}
