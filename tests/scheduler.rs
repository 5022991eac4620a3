mod common;

use common::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use trellis::containers::{NodeContainer, NodeState};
use trellis::error::WorkflowError;
use trellis::manager::WorkflowManager;
use trellis::node::NodeStatus;
use trellis::types::NodeId;

/// A -> B pipeline where B only becomes ready once the test says so.
fn pipeline(manager: &WorkflowManager) -> (Arc<NodeContainer>, Arc<NodeContainer>, PipelineProbes) {
    let a_node = ProbeNode::source("a");
    let b_node = ProbeNode::stage("b");
    let probes = PipelineProbes {
        a: a_node.probe(),
        b: b_node.probe(),
    };
    let a = manager.add_node(Box::new(a_node));
    let b = manager.add_node(Box::new(b_node));
    manager.add_connection(a.id(), 0, b.id(), 0).unwrap();
    (a, b, probes)
}

struct PipelineProbes {
    a: Arc<ProbeState>,
    b: Arc<ProbeState>,
}

#[test]
fn prepare_marks_nodes_by_their_own_readiness() {
    let manager = WorkflowManager::new();
    let (a, b, _probes) = pipeline(&manager);

    manager.prepare_for_exec_all_nodes();
    assert_eq!(a.state(), NodeState::IsExecutable);
    assert_eq!(b.state(), NodeState::WaitingToBeExecutable);
}

#[test]
fn prepare_skips_executed_and_claimed_nodes() {
    let manager = WorkflowManager::new();
    let done = ProbeNode::source("done").executed(true);
    let done_container = manager.add_node(Box::new(done));
    let (a, _b, _probes) = pipeline(&manager);

    manager.prepare_for_exec_all_nodes();
    assert_eq!(done_container.state(), NodeState::Idle);

    let claimed = manager.get_next_executable_node().unwrap();
    assert_eq!(claimed.id(), a.id());
    // a second prepare must not unclaim the node
    manager.prepare_for_exec_all_nodes();
    assert_eq!(a.state(), NodeState::WaitingForExecution);
}

#[test]
fn next_executable_is_returned_at_most_once() {
    let manager = WorkflowManager::new();
    let a = manager.add_node(Box::new(ProbeNode::source("a")));
    let b = manager.add_node(Box::new(ProbeNode::source("b")));

    manager.prepare_for_exec_all_nodes();
    let first = manager.get_next_executable_node().unwrap();
    let second = manager.get_next_executable_node().unwrap();
    // order is unspecified, but both ready nodes come out exactly once
    let mut claimed: Vec<NodeId> = vec![first.id(), second.id()];
    claimed.sort();
    let mut expected = vec![a.id(), b.id()];
    expected.sort();
    assert_eq!(claimed, expected);

    assert!(manager.get_next_executable_node().is_none());
}

#[test]
fn claim_rechecks_the_readiness_predicate() {
    let manager = WorkflowManager::new();
    let node = ProbeNode::source("flaky");
    let probe = node.probe();
    let a = manager.add_node(Box::new(node));

    manager.prepare_for_exec_all_nodes();
    assert_eq!(a.state(), NodeState::IsExecutable);

    // readiness evaporated between marking and claiming
    probe.set_executable(false);
    assert!(manager.get_next_executable_node().is_none());
    assert_eq!(a.state(), NodeState::IsExecutable);
}

#[test]
fn completion_promotes_ready_successors() {
    let manager = WorkflowManager::new();
    let (a, b, probes) = pipeline(&manager);
    let listener = RecordingListener::new();
    manager.add_listener(listener.clone());

    manager.prepare_for_exec_all_nodes();
    let claimed = manager.get_next_executable_node().unwrap();
    assert_eq!(claimed.id(), a.id());

    claimed.notify_state_changed(NodeStatus::StartExecute);
    assert_eq!(a.state(), NodeState::CurrentlyExecuting);

    // upstream results appear before the completion callback
    probes.a.set_executed(true);
    probes.b.set_executable(true);
    claimed.notify_state_changed(NodeStatus::EndExecute);

    assert_eq!(a.state(), NodeState::Idle);
    assert_eq!(b.state(), NodeState::IsExecutable);
    assert!(listener.contains("exec-pool-changed"));
    assert!(!listener.contains("exec-pool-done"));
}

#[test]
fn completion_without_new_work_reports_the_pool_done() {
    let manager = WorkflowManager::new();
    let node = ProbeNode::source("only");
    let probe = node.probe();
    let a = manager.add_node(Box::new(node));
    let listener = RecordingListener::new();
    manager.add_listener(listener.clone());

    manager.prepare_for_exec_all_nodes();
    let claimed = manager.get_next_executable_node().unwrap();
    claimed.notify_state_changed(NodeStatus::StartExecute);
    probe.set_executed(true);
    probe.set_executable(false);
    claimed.notify_state_changed(NodeStatus::EndExecute);

    assert_eq!(listener.count("exec-pool-done"), 1);
    assert_eq!(a.state(), NodeState::Idle);
}

#[test]
fn auto_executable_nodes_are_promoted_from_idle() {
    let manager = WorkflowManager::new();
    let auto = ProbeNode::new("auto", 0, 1)
        .executable(true)
        .auto_executable(true);
    let a = manager.add_node(Box::new(auto));

    manager.check_for_executable_nodes();
    assert_eq!(a.state(), NodeState::IsExecutable);
}

#[test]
fn prepare_up_to_marks_only_the_needed_subgraph() {
    let manager = WorkflowManager::new();
    let a = manager.add_node(Box::new(ProbeNode::source("a")));
    let b = manager.add_node(Box::new(ProbeNode::stage("b")));
    let c = manager.add_node(Box::new(ProbeNode::stage("c")));
    let unrelated = manager.add_node(Box::new(ProbeNode::source("unrelated")));
    manager.add_connection(a.id(), 0, b.id(), 0).unwrap();
    manager.add_connection(b.id(), 0, c.id(), 0).unwrap();

    manager.prepare_for_exec_up_to_node(b.id()).unwrap();

    assert_eq!(a.state(), NodeState::IsExecutable);
    assert_eq!(b.state(), NodeState::WaitingToBeExecutable);
    assert_eq!(c.state(), NodeState::Idle);
    assert_eq!(unrelated.state(), NodeState::Idle);

    assert!(matches!(
        manager.prepare_for_exec_up_to_node(77.into()),
        Err(WorkflowError::UnknownNode { .. })
    ));
}

#[test]
fn prepare_up_to_resolves_predecessors_in_ancestor_scopes() {
    let root = WorkflowManager::new();
    let child = root.create_sub_manager();
    let upstream = root.add_node(Box::new(ProbeNode::source("upstream")));
    let inner = child.add_node(Box::new(ProbeNode::stage("inner")));
    child
        .add_connection_between(&upstream, 0, &inner, 0)
        .unwrap();

    child.prepare_for_exec_up_to_node(inner.id()).unwrap();
    assert_eq!(inner.state(), NodeState::WaitingToBeExecutable);
    assert_eq!(upstream.state(), NodeState::IsExecutable);
}

#[test]
fn unresolvable_predecessors_are_fatal() {
    let root_a = WorkflowManager::new();
    let root_b = WorkflowManager::new();
    let child_of_b = root_b.create_sub_manager();

    let foreign = root_a.add_node(Box::new(ProbeNode::source("foreign")));
    let inner = child_of_b.add_node(Box::new(ProbeNode::stage("inner")));
    child_of_b
        .add_connection_between(&foreign, 0, &inner, 0)
        .unwrap();

    let err = child_of_b
        .prepare_for_exec_up_to_node(inner.id())
        .unwrap_err();
    assert!(matches!(err, WorkflowError::DisconnectedPredecessor { .. }));
}

#[test]
fn next_executable_falls_back_to_the_parent_scope() {
    let root = WorkflowManager::new();
    let child = root.create_sub_manager();
    let a = root.add_node(Box::new(ProbeNode::source("a")));

    root.prepare_for_exec_all_nodes();
    let claimed = child.get_next_executable_node().unwrap();
    assert_eq!(claimed.id(), a.id());
    assert!(child.get_next_executable_node().is_none());
}

#[test]
fn completion_checks_propagate_into_child_scopes() {
    let root = WorkflowManager::new();
    let child = root.create_sub_manager();
    let inner = child.add_node(Box::new(
        ProbeNode::new("inner", 0, 1)
            .executable(true)
            .auto_executable(true),
    ));

    root.check_for_executable_nodes();
    assert_eq!(inner.state(), NodeState::IsExecutable);
}

#[test]
fn dead_child_scopes_are_pruned_during_propagation() {
    let root = WorkflowManager::new();
    let child = root.create_sub_manager();
    drop(child);
    // must not panic or hang on the dead registration
    root.check_for_executable_nodes();
}

#[test]
fn cancel_resets_marked_nodes_and_asks_running_ones_to_stop() {
    let manager = WorkflowManager::new();
    let (a, b, probes) = pipeline(&manager);
    let listener = RecordingListener::new();
    manager.add_listener(listener.clone());

    manager.prepare_for_exec_all_nodes();
    let claimed = manager.get_next_executable_node().unwrap();
    claimed.notify_state_changed(NodeStatus::StartExecute);

    manager.cancel_execution_all_remaining_nodes();

    // the marked successor resets synchronously
    assert_eq!(b.state(), NodeState::Idle);
    // the running node is only asked to stop
    assert_eq!(a.state(), NodeState::CurrentlyExecuting);
    assert_eq!(probes.a.cancel_calls(), 1);
    assert!(!listener.contains("exec-pool-done"));

    // once the canceled node settles, the pool drains
    probes.a.set_executable(false);
    claimed.notify_state_changed(NodeStatus::EndExecute);
    assert_eq!(listener.count("exec-pool-done"), 1);
}

#[test]
fn cancel_with_nothing_running_reports_done_immediately() {
    let manager = WorkflowManager::new();
    let (_a, _b, _probes) = pipeline(&manager);
    let listener = RecordingListener::new();
    manager.add_listener(listener.clone());

    manager.prepare_for_exec_all_nodes();
    manager.cancel_execution_all_remaining_nodes();
    assert_eq!(listener.count("exec-pool-done"), 1);
}

#[test]
fn cancel_after_node_only_touches_the_downstream_cone() {
    let manager = WorkflowManager::new();
    let a = manager.add_node(Box::new(ProbeNode::source("a")));
    let b = manager.add_node(Box::new(ProbeNode::stage("b")));
    let c = manager.add_node(Box::new(ProbeNode::stage("c")));
    let other = manager.add_node(Box::new(ProbeNode::source("other")));
    manager.add_connection(a.id(), 0, b.id(), 0).unwrap();
    manager.add_connection(b.id(), 0, c.id(), 0).unwrap();

    manager.prepare_for_exec_all_nodes();
    manager.cancel_execution_after_node(b.id()).unwrap();

    assert_eq!(b.state(), NodeState::Idle);
    assert_eq!(c.state(), NodeState::Idle);
    // upstream and unrelated nodes keep their marking
    assert_eq!(a.state(), NodeState::IsExecutable);
    assert_eq!(other.state(), NodeState::IsExecutable);

    assert!(matches!(
        manager.cancel_execution_after_node(123.into()),
        Err(WorkflowError::UnknownNode { .. })
    ));
}

#[test]
fn start_execution_blocks_until_the_pool_drains() {
    let manager = WorkflowManager::new();

    // diamond: src feeds two stages that feed a sink
    let src = ProbeNode::source("src");
    let left = ProbeNode::stage("left");
    let right = ProbeNode::stage("right");
    let sink = ProbeNode::new("sink", 2, 0);

    let mut probes: HashMap<NodeId, Arc<ProbeState>> = HashMap::new();
    let mut downstream: HashMap<NodeId, Vec<Arc<ProbeState>>> = HashMap::new();

    let src_probe = src.probe();
    let left_probe = left.probe();
    let right_probe = right.probe();
    let sink_probe = sink.probe();

    let src_nc = manager.add_node(Box::new(src));
    let left_nc = manager.add_node(Box::new(left));
    let right_nc = manager.add_node(Box::new(right));
    let sink_nc = manager.add_node(Box::new(sink));
    manager
        .add_connection(src_nc.id(), 0, left_nc.id(), 0)
        .unwrap();
    manager
        .add_connection(src_nc.id(), 0, right_nc.id(), 0)
        .unwrap();
    manager
        .add_connection(left_nc.id(), 0, sink_nc.id(), 0)
        .unwrap();
    manager
        .add_connection(right_nc.id(), 0, sink_nc.id(), 1)
        .unwrap();

    probes.insert(src_nc.id(), Arc::clone(&src_probe));
    probes.insert(left_nc.id(), Arc::clone(&left_probe));
    probes.insert(right_nc.id(), Arc::clone(&right_probe));
    probes.insert(sink_nc.id(), Arc::clone(&sink_probe));

    downstream.insert(
        src_nc.id(),
        vec![Arc::clone(&left_probe), Arc::clone(&right_probe)],
    );
    downstream.insert(left_nc.id(), vec![Arc::clone(&sink_probe)]);
    downstream.insert(right_nc.id(), vec![Arc::clone(&sink_probe)]);

    let done = DoneFlag::new();
    manager.add_listener(done.clone());

    let worker_manager = Arc::clone(&manager);
    let worker_done = Arc::clone(&done);
    let worker = std::thread::spawn(move || {
        loop {
            if let Some(claimed) = worker_manager.get_next_executable_node() {
                claimed.notify_state_changed(NodeStatus::StartExecute);
                let id = claimed.id();
                let probe = &probes[&id];
                probe.set_executed(true);
                probe.set_executable(false);
                // downstream readiness appears before the completion
                // callback, as a real node's outputs would
                if let Some(children) = downstream.get(&id) {
                    for child in children {
                        child.set_executable(true);
                    }
                }
                claimed.notify_state_changed(NodeStatus::EndExecute);
            } else if worker_done.is_done() {
                break;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    });

    manager.start_execution(true);

    assert!(done.is_done());
    worker.join().unwrap();
    for probe in [&src_probe, &left_probe, &right_probe, &sink_probe] {
        assert_eq!(probe.execute_calls(), 0); // engine never runs nodes itself
        assert!(probe.executed.load(std::sync::atomic::Ordering::SeqCst));
    }
    for nc in [&src_nc, &left_nc, &right_nc, &sink_nc] {
        assert_eq!(nc.state(), NodeState::Idle);
    }
}

#[test]
fn start_execution_on_an_empty_graph_finishes_immediately() {
    let manager = WorkflowManager::new();
    let listener = RecordingListener::new();
    manager.add_listener(listener.clone());
    manager.start_execution(true);
    assert_eq!(listener.count("exec-pool-done"), 1);
}

#[test]
fn sink_readiness_requires_both_inputs() {
    let manager = WorkflowManager::new();
    let (a, b, probes) = pipeline(&manager);

    manager.prepare_for_exec_all_nodes();
    let claimed = manager.get_next_executable_node().unwrap();
    assert_eq!(claimed.id(), a.id());
    claimed.notify_state_changed(NodeStatus::StartExecute);
    probes.a.set_executed(true);
    // b's own predicate still says no: it must stay waiting
    claimed.notify_state_changed(NodeStatus::EndExecute);
    assert_eq!(b.state(), NodeState::WaitingToBeExecutable);
    assert!(manager.get_next_executable_node().is_none());
}
