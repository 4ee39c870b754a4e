use std::sync::Arc;
use std::time::Duration;

use super::common::*;
use crate::base::mem::DeviceMemory;
use crate::device::{Device, SimulatorDevice};
use crate::error::UmdError;
use crate::graph::{Graph, IoKind};
use crate::job::dump::DumpConfig;
use crate::job::{Job, JobConfig, JobState};
use crate::tcb::{TcbType, TCB_SIZE};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn setup() -> (Arc<TestMemory>, Arc<SimulatorDevice>, Arc<Graph>) {
    let mem = Arc::new(TestMemory::new(mem_config()));
    let graph = loaded_graph(graph_desc(TWO_SUBGRAPHS), mem.as_ref());
    let sim = simulator(Arc::clone(&mem), sim_config());
    (mem, sim, graph)
}

fn create(sim: &Arc<SimulatorDevice>, graph: &Arc<Graph>) -> Job {
    let device: Arc<dyn Device> = Arc::clone(sim) as Arc<dyn Device>;
    Job::create(Arc::clone(graph), device, JobConfig::default(), DumpConfig::default()).expect("create")
}

#[test]
fn schedule_and_rerun() {
    let (_mem, sim, graph) = setup();
    let mut job = create(&sim, &graph);
    assert_eq!(JobState::Init, job.state());
    assert_eq!(JobState::Init, job.get_status(WAIT).expect("status"));

    job.schedule().expect("schedule");
    assert_eq!(JobState::Done, job.get_status(WAIT).expect("status"));
    // done stays done without touching the device
    assert_eq!(JobState::Done, job.get_status(Some(Duration::ZERO)).expect("status"));

    job.schedule().expect("second run");
    assert_eq!(JobState::Done, job.get_status(WAIT).expect("status"));
    job.destroy().expect("destroy");
}

#[test]
fn schedule_twice_is_rejected() {
    let (_mem, sim, graph) = setup();
    sim.halt();
    let mut job = create(&sim, &graph);
    job.schedule().expect("schedule");
    assert!(matches!(job.schedule(), Err(UmdError::BadState { state: JobState::Scheduled, .. })));
    sim.resume();
    assert_eq!(JobState::Done, job.get_status(WAIT).expect("status"));
}

#[test]
fn poll_timeout_keeps_job_scheduled() {
    let (_mem, sim, graph) = setup();
    sim.halt();
    let mut job = create(&sim, &graph);
    job.schedule().expect("schedule");
    let err = job.get_status(Some(Duration::from_millis(20))).err().expect("timeout");
    assert!(matches!(err, UmdError::Timeout { timeout_ms: 20 }));
    assert_eq!(JobState::Scheduled, job.state());
    sim.resume();
    assert_eq!(JobState::Done, job.get_status(WAIT).expect("status"));
}

#[test]
fn bind_then_trigger() {
    let (_mem, sim, graph) = setup();
    let mut job = create(&sim, &graph);
    job.bind_core(0).expect("bind");
    assert_eq!(JobState::Bound, job.state());
    assert_eq!(1, sim.bound_len());
    assert_eq!(JobState::Bound, job.get_status(WAIT).expect("status"));
    assert!(matches!(job.bind_core(0), Err(UmdError::BadState { .. })));

    job.schedule().expect("trigger");
    assert_eq!(0, sim.bound_len());
    assert_eq!(JobState::Done, job.get_status(WAIT).expect("status"));

    job.bind_core(0).expect("bind again");
    job.debugger_run().expect("debugger run");
    assert_eq!(JobState::Done, job.state());
}

#[test]
fn debugger_run_needs_a_bound_job() {
    let (_mem, sim, graph) = setup();
    let mut job = create(&sim, &graph);
    assert!(matches!(job.debugger_run(), Err(UmdError::BadState { state: JobState::Init, .. })));
    assert!(matches!(job.bind_core(3), Err(UmdError::InvalidPartition { partition: 3, count: 1 })));
    assert_eq!(JobState::Init, job.state());
}

#[test]
fn malformed_chain_raises_exception() {
    let (mem, sim, graph) = setup();
    let mut job = create(&sim, &graph);
    // strip the grid-end bits from the last task
    let tcbs = job.tcb_buffer().expect("tcbs").pa;
    let last = tcbs + (job.layout().last_task_index() * TCB_SIZE) as u64;
    mem.write_u32(last, TcbType::Task as u32).expect("corrupt");

    job.schedule().expect("schedule");
    assert_eq!(JobState::Exception, job.get_status(WAIT).expect("status"));
    assert!(matches!(job.schedule(), Err(UmdError::BadState { state: JobState::Exception, .. })));
}

#[test]
fn chain_is_restored_before_rerun() {
    let (mem, sim, graph) = setup();
    let mut job = create(&sim, &graph);
    job.schedule().expect("schedule");
    assert_eq!(JobState::Done, job.get_status(WAIT).expect("status"));

    let tcbs = job.tcb_buffer().expect("tcbs").pa;
    let last = tcbs + (job.layout().last_task_index() * TCB_SIZE) as u64;
    mem.write_u32(last, TcbType::Task as u32).expect("corrupt");
    job.schedule().expect("rerun");
    assert_eq!(JobState::Done, job.get_status(WAIT).expect("status"));
}

#[test]
fn tensors_round_trip_through_device_memory() {
    let (_mem, sim, graph) = setup();
    let job = create(&sim, &graph);
    let data: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
    job.load_tensor(0, &data).expect("load");
    assert_eq!(data, job.get_tensor(IoKind::Input, 0).expect("get"));
    assert_eq!(2048, job.get_tensor(IoKind::Output, 0).expect("output").len());

    let short = job.load_tensor(0, &data[..10]).err().expect("short input");
    assert!(matches!(short, UmdError::TensorSize { expected: 1024, actual: 10, .. }));
    assert!(matches!(job.load_tensor(1, &data), Err(UmdError::InvalidTensorId { .. })));
}

#[test]
fn zero_subgraph_job_completes_without_device() {
    let mem = Arc::new(TestMemory::new(mem_config()));
    let graph = loaded_graph(graph_desc("text = [0, 0, 0, 0]\n"), mem.as_ref());
    let sim = simulator(Arc::clone(&mem), sim_config());
    sim.halt();
    let mut job = create(&sim, &graph);
    assert_eq!(1, job.layout().total());
    job.schedule().expect("schedule");
    assert_eq!(JobState::Done, job.get_status(Some(Duration::ZERO)).expect("status"));
    assert_eq!(0, sim.inflight_len());
}

#[test]
fn destroy_releases_memory_and_group_ids() {
    let (mem, sim, graph) = setup();
    let baseline = mem.live_count();
    let mut job = create(&sim, &graph);
    let start = job.start_group();
    job.schedule().expect("schedule");
    job.get_status(WAIT).expect("status");
    job.destroy().expect("destroy");
    assert_eq!(baseline, mem.live_count());
    assert_eq!(start, create(&sim, &graph).start_group());
}

#[test]
fn dynamic_shape_graph_needs_shapes() {
    let mem = Arc::new(TestMemory::new(mem_config()));
    let mut desc = graph_desc(TWO_SUBGRAPHS);
    desc.global_param = Some(crate::graph::Blob::Zeros { zeros: 64 });
    let graph = loaded_graph(desc, mem.as_ref());
    let sim = simulator(Arc::clone(&mem), sim_config());
    let device: Arc<dyn Device> = sim;
    let err = Job::create(graph, device, JobConfig::default(), DumpConfig::default()).err().expect("no shapes");
    assert!(matches!(err, UmdError::ShapeNotConfigured { index: 0 }));
}
