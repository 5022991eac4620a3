//! Probe nodes for exercising the engine: fully scriptable readiness and
//! instrumented lifecycle calls.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use trellis::error::WorkflowError;
use trellis::node::{Node, NodeFactory};
use trellis::settings::Settings;

/// Shared handle into a [`ProbeNode`]'s observable state. Tests keep a
/// clone to flip readiness and to assert on lifecycle calls after the node
/// itself has been boxed into the engine.
#[derive(Default)]
pub struct ProbeState {
    pub executable: AtomicBool,
    pub executed: AtomicBool,
    pub execute_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    pub detach_calls: AtomicUsize,
    pub connected_in_ports: Mutex<Vec<usize>>,
    pub disconnected_in_ports: Mutex<Vec<usize>>,
}

impl ProbeState {
    pub fn set_executable(&self, value: bool) {
        self.executable.store(value, Ordering::SeqCst);
    }

    pub fn set_executed(&self, value: bool) {
        self.executed.store(value, Ordering::SeqCst);
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn detach_calls(&self) -> usize {
        self.detach_calls.load(Ordering::SeqCst)
    }
}

/// A scriptable node: port layout and readiness are whatever the test
/// says, and every lifecycle call is recorded on the shared probe.
pub struct ProbeNode {
    name: String,
    nr_in: usize,
    nr_out: usize,
    model_in: Vec<usize>,
    model_out: Vec<usize>,
    auto: bool,
    state: Arc<ProbeState>,
}

impl ProbeNode {
    pub fn new(name: &str, nr_in: usize, nr_out: usize) -> Self {
        ProbeNode {
            name: name.to_string(),
            nr_in,
            nr_out,
            model_in: Vec::new(),
            model_out: Vec::new(),
            auto: false,
            state: Arc::new(ProbeState::default()),
        }
    }

    /// A node with no inputs that is ready to run immediately.
    pub fn source(name: &str) -> Self {
        let node = ProbeNode::new(name, 0, 1);
        node.state.set_executable(true);
        node
    }

    /// A one-in/one-out node that is not ready until the test says so.
    pub fn stage(name: &str) -> Self {
        ProbeNode::new(name, 1, 1)
    }

    pub fn executable(self, value: bool) -> Self {
        self.state.set_executable(value);
        self
    }

    pub fn executed(self, value: bool) -> Self {
        self.state.set_executed(value);
        self
    }

    pub fn auto_executable(mut self, value: bool) -> Self {
        self.auto = value;
        self
    }

    /// Declare an in-port as a non-data (model) port.
    pub fn model_in_port(mut self, port: usize) -> Self {
        self.model_in.push(port);
        self
    }

    /// Declare an out-port as a non-data (model) port.
    pub fn model_out_port(mut self, port: usize) -> Self {
        self.model_out.push(port);
        self
    }

    pub fn probe(&self) -> Arc<ProbeState> {
        Arc::clone(&self.state)
    }
}

impl Node for ProbeNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_executable(&self) -> bool {
        self.state.executable.load(Ordering::SeqCst)
    }

    fn is_executed(&self) -> bool {
        self.state.executed.load(Ordering::SeqCst)
    }

    fn nr_in_ports(&self) -> usize {
        self.nr_in
    }

    fn nr_out_ports(&self) -> usize {
        self.nr_out
    }

    fn is_data_in_port(&self, port: usize) -> bool {
        !self.model_in.contains(&port)
    }

    fn is_data_out_port(&self, port: usize) -> bool {
        !self.model_out.contains(&port)
    }

    fn is_auto_executable(&self) -> bool {
        self.auto
    }

    fn execute(&self) {
        self.state.execute_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel_execution(&self) {
        self.state.cancel_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn connect_in_port(&self, port: usize, _source: &dyn Node, _source_port: usize) {
        self.state.connected_in_ports.lock().unwrap().push(port);
    }

    fn disconnect_in_port(&self, port: usize) {
        self.state.disconnected_in_ports.lock().unwrap().push(port);
    }

    fn detach(&self) {
        self.state.detach_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn save_settings(&self, settings: &mut Settings) {
        settings.add_string("name", &self.name);
        settings.add_i64("inPorts", self.nr_in as i64);
        settings.add_i64("outPorts", self.nr_out as i64);
        settings.add_bool("executable", self.is_executable());
        settings.add_bool("executed", self.is_executed());
    }
}

/// Rebuilds [`ProbeNode`]s from their settings and keeps a probe for every
/// node it created, in creation order.
#[derive(Default)]
pub struct ProbeNodeFactory {
    pub created: Mutex<Vec<Arc<ProbeState>>>,
}

impl NodeFactory for ProbeNodeFactory {
    fn create_node(&self, settings: &Settings) -> Result<Box<dyn Node>, WorkflowError> {
        let name = settings.get_string("name")?;
        let nr_in = settings.get_i64("inPorts")?;
        let nr_out = settings.get_i64("outPorts")?;
        let node = ProbeNode::new(&name, nr_in as usize, nr_out as usize)
            .executable(settings.get_bool("executable").unwrap_or(false))
            .executed(settings.get_bool("executed").unwrap_or(false));
        self.created.lock().unwrap().push(node.probe());
        Ok(Box::new(node))
    }
}
