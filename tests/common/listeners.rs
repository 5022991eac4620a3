//! Listener helpers: record events as compact labels for assertions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use trellis::events::{WorkflowEvent, WorkflowListener};

/// Compact label for an event, including the affected id where there is
/// one, e.g. `"node-added:0"` or `"exec-pool-done"`.
pub fn label(event: &WorkflowEvent) -> String {
    match event {
        WorkflowEvent::NodeAdded { id, .. } => format!("node-added:{id}"),
        WorkflowEvent::NodeRemoved { id, .. } => format!("node-removed:{id}"),
        WorkflowEvent::ConnectionAdded { id, .. } => format!("connection-added:{id}"),
        WorkflowEvent::ConnectionRemoved { id, .. } => format!("connection-removed:{id}"),
        WorkflowEvent::ExecPoolChanged => "exec-pool-changed".to_string(),
        WorkflowEvent::ExecPoolDone => "exec-pool-done".to_string(),
        WorkflowEvent::NodeReset { id } => format!("node-reset:{id}"),
        WorkflowEvent::NodeConfigured { id } => format!("node-configured:{id}"),
        WorkflowEvent::NodeExtrainfoChanged { id } => format!("node-extrainfo:{id}"),
        WorkflowEvent::ConnectionExtrainfoChanged { id } => format!("connection-extrainfo:{id}"),
    }
}

/// Records every event label in arrival order.
#[derive(Default)]
pub struct RecordingListener {
    seen: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingListener::default())
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.as_str() == wanted)
            .count()
    }

    pub fn contains(&self, wanted: &str) -> bool {
        self.count(wanted) > 0
    }

    pub fn clear(&self) {
        self.seen.lock().unwrap().clear();
    }
}

impl WorkflowListener for RecordingListener {
    fn workflow_changed(&self, event: &WorkflowEvent) {
        self.seen.lock().unwrap().push(label(event));
    }
}

/// Flips a flag once the execution pool reports done.
#[derive(Default)]
pub struct DoneFlag {
    done: AtomicBool,
}

impl DoneFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(DoneFlag::default())
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl WorkflowListener for DoneFlag {
    fn workflow_changed(&self, event: &WorkflowEvent) {
        if matches!(event, WorkflowEvent::ExecPoolDone) {
            self.done.store(true, Ordering::SeqCst);
        }
    }
}
