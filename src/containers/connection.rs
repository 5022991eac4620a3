//! Directed edges between node ports.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::node_container::NodeContainer;
use crate::events::{WorkflowEvent, WorkflowListener};
use crate::settings::{Settings, SettingsError};
use crate::types::{ConnectionId, NodeId};

pub(crate) const KEY_ID: &str = "id";
pub(crate) const KEY_SOURCE_ID: &str = "sourceId";
pub(crate) const KEY_SOURCE_PORT: &str = "sourcePort";
pub(crate) const KEY_TARGET_ID: &str = "targetId";
pub(crate) const KEY_TARGET_PORT: &str = "targetPort";
const KEY_EXTRA_INFO: &str = "extraInfo";

/// Display routing of a connection (bend points). Opaque to the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionExtraInfo {
    pub bend_points: Vec<(i32, i32)>,
}

/// One directed edge from an out-port to an in-port.
///
/// Endpoints and ports are fixed at creation; an edge is never rerouted,
/// only removed and recreated. Only the display routing is mutable.
pub struct ConnectionContainer {
    id: ConnectionId,
    source: Arc<NodeContainer>,
    source_port: usize,
    target: Arc<NodeContainer>,
    target_port: usize,
    extra_info: Mutex<Option<ConnectionExtraInfo>>,
    listeners: Mutex<Vec<Weak<dyn WorkflowListener>>>,
}

impl ConnectionContainer {
    pub(crate) fn new(
        id: ConnectionId,
        source: Arc<NodeContainer>,
        source_port: usize,
        target: Arc<NodeContainer>,
        target_port: usize,
    ) -> Self {
        ConnectionContainer {
            id,
            source,
            source_port,
            target,
            target_port,
            extra_info: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn source(&self) -> &Arc<NodeContainer> {
        &self.source
    }

    #[must_use]
    pub fn source_port(&self) -> usize {
        self.source_port
    }

    #[must_use]
    pub fn target(&self) -> &Arc<NodeContainer> {
        &self.target
    }

    #[must_use]
    pub fn target_port(&self) -> usize {
        self.target_port
    }

    #[must_use]
    pub fn extra_info(&self) -> Option<ConnectionExtraInfo> {
        self.extra_info.lock().clone()
    }

    /// Update the display routing and notify listeners.
    pub fn set_extra_info(&self, info: Option<ConnectionExtraInfo>) {
        *self.extra_info.lock() = info;
        let event = WorkflowEvent::ConnectionExtrainfoChanged { id: self.id };
        let snapshot: Vec<_> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|weak| weak.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in snapshot {
            listener.workflow_changed(&event);
        }
    }

    /// Register a listener for extra-info changes. Idempotent.
    pub fn add_listener(&self, listener: Weak<dyn WorkflowListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|known| Weak::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    /// Persist this edge: its id and both endpoints by node id and port.
    pub(crate) fn save(&self, settings: &mut Settings) {
        settings.add_i64(KEY_ID, self.id.index());
        settings.add_i64(KEY_SOURCE_ID, self.source.id().index());
        settings.add_i64(KEY_SOURCE_PORT, self.source_port as i64);
        settings.add_i64(KEY_TARGET_ID, self.target.id().index());
        settings.add_i64(KEY_TARGET_PORT, self.target_port as i64);
        if let Some(info) = self.extra_info() {
            match serde_json::to_value(info) {
                Ok(value) => settings.add_value(KEY_EXTRA_INFO, value),
                Err(err) => {
                    tracing::warn!(connection = %self.id, %err, "could not serialize extra info");
                }
            }
        }
    }

    /// Read the persisted display routing back, if present.
    pub(crate) fn load_extra_info(&self, settings: &Settings) {
        if let Ok(value) = settings.get_value(KEY_EXTRA_INFO) {
            match serde_json::from_value(value.clone()) {
                Ok(info) => *self.extra_info.lock() = Some(info),
                Err(err) => {
                    tracing::warn!(connection = %self.id, %err, "ignoring malformed extra info");
                }
            }
        }
    }

    /// The connection id stored in a persisted connection entry.
    pub fn id_from_settings(settings: &Settings) -> Result<ConnectionId, SettingsError> {
        Ok(ConnectionId::new(settings.get_i64(KEY_ID)?))
    }

    /// Both persisted endpoints as `((source, port), (target, port))`.
    pub fn endpoints_from_settings(
        settings: &Settings,
    ) -> Result<((NodeId, usize), (NodeId, usize)), SettingsError> {
        let port = |key: &str| -> Result<usize, SettingsError> {
            usize::try_from(settings.get_i64(key)?).map_err(|_| SettingsError::TypeMismatch {
                key: key.to_string(),
                expected: "non-negative integer",
            })
        };
        let source = NodeId::new(settings.get_i64(KEY_SOURCE_ID)?);
        let target = NodeId::new(settings.get_i64(KEY_TARGET_ID)?);
        Ok((
            (source, port(KEY_SOURCE_PORT)?),
            (target, port(KEY_TARGET_PORT)?),
        ))
    }
}

impl fmt::Debug for ConnectionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContainer")
            .field("id", &self.id)
            .field("source", &self.source.id())
            .field("source_port", &self.source_port)
            .field("target", &self.target.id())
            .field("target_port", &self.target_port)
            .finish_non_exhaustive()
    }
}
