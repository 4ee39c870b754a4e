use std::sync::Arc;
use std::time::Duration;

use super::common::*;
use crate::base::mem::{lo32, DeviceMemory, MemRegion};
use crate::device::{
    Device, HardwareDevice, JobOutcome, Qos, JOB_EXEC_FLAG_DBG_DISPATCH, JOB_EXEC_FLAG_QOS_FAST,
    JOB_EXEC_FLAG_QOS_SLOW,
};
use crate::error::UmdError;
use crate::graph::{Graph, IoKind};
use crate::job::alloc::Backing;
use crate::job::dump::DumpConfig;
use crate::job::io::SharedSource;
use crate::job::{Job, JobConfig, JobState};
use crate::sim::config::MemConfig;
use crate::tcb::TCB_SIZE;

fn setup(kernel: FakeKernel, text: &str) -> (Arc<TestMemory>, Arc<HardwareDevice<FakeKernel>>, Arc<Graph>) {
    let mem = Arc::new(TestMemory::new(mem_config()));
    let graph = loaded_graph(graph_desc(text), mem.as_ref());
    let hw = hardware(Arc::clone(&mem), kernel);
    (mem, hw, graph)
}

fn create(hw: &Arc<HardwareDevice<FakeKernel>>, graph: &Arc<Graph>, config: JobConfig) -> Job {
    let device: Arc<dyn Device> = Arc::clone(hw) as Arc<dyn Device>;
    Job::create(Arc::clone(graph), device, config, DumpConfig::default()).expect("create")
}

#[test]
fn submission_describes_the_chain() {
    let (_mem, hw, graph) = setup(FakeKernel::new(vec![1]), TWO_SUBGRAPHS);
    let mut job = create(&hw, &graph, JobConfig::default());
    job.schedule().expect("schedule");

    let submitted = hw.driver().submitted();
    assert_eq!(1, submitted.len());
    let desc = submitted[0];
    let tcbs = job.tcb_buffer().expect("tcbs");
    assert_eq!(job.id(), desc.job_id);
    assert_eq!(job.grid_id(), desc.grid_id);
    assert_eq!(tcbs.pa, desc.head_tcb_pa);
    assert_eq!(tcbs.pa + (10 * TCB_SIZE) as u64, desc.tail_tcb_pa);
    assert_eq!(11, desc.tcb_number);
    assert_eq!(JOB_EXEC_FLAG_QOS_SLOW, desc.exec_flag);
    assert!(!desc.is_defer_run);
    assert_eq!(desc, *job.desc());
}

#[test]
fn debug_dispatch_and_fast_qos() {
    let (_mem, hw, graph) = setup(FakeKernel::new(vec![1, 2]), TWO_SUBGRAPHS);
    let config = JobConfig { qos: Qos::Fast, dbg_dispatch: true, dbg_core_id: 1, partition_id: 1, ..Default::default() };
    let mut job = create(&hw, &graph, config);
    job.schedule().expect("schedule");
    let desc = hw.driver().submitted()[0];
    assert_eq!(JOB_EXEC_FLAG_QOS_FAST | JOB_EXEC_FLAG_DBG_DISPATCH, desc.exec_flag);
    assert_eq!(1, desc.core_id);
    assert_eq!(1, desc.partition_id);
    assert_eq!(Qos::Fast, desc.qos);
}

#[test]
fn kernel_outcomes_map_to_states() {
    let (_mem, hw, graph) = setup(FakeKernel::new(vec![1]), TWO_SUBGRAPHS);
    let mut job = create(&hw, &graph, JobConfig::default());
    job.schedule().expect("schedule");

    let err = job.get_status(Some(Duration::from_millis(5))).err().expect("no outcome yet");
    assert!(matches!(err, UmdError::Timeout { timeout_ms: 5 }));
    assert_eq!(JobState::Scheduled, job.state());

    hw.driver().set_outcome(Some(JobOutcome::Done));
    assert_eq!(JobState::Done, job.get_status(None).expect("done"));

    hw.driver().set_outcome(Some(JobOutcome::Exception));
    job.bind_core(0).expect("bind");
    let desc = *hw.driver().submitted().last().expect("bound submission");
    assert!(desc.is_defer_run && !desc.do_trigger);
    assert!(matches!(job.debugger_run(), Err(UmdError::JobException { .. })));
    assert_eq!(JobState::Exception, job.state());
    let trigger = *hw.driver().submitted().last().expect("trigger submission");
    assert!(trigger.is_defer_run && trigger.do_trigger);
}

#[test]
fn unknown_partition_is_rejected_at_create() {
    let (_mem, hw, graph) = setup(FakeKernel::new(vec![1]), TWO_SUBGRAPHS);
    let device: Arc<dyn Device> = Arc::clone(&hw) as Arc<dyn Device>;
    let config = JobConfig { partition_id: 2, ..Default::default() };
    let err = Job::create(graph, device, config, DumpConfig::default()).err().expect("partition");
    assert!(matches!(err, UmdError::InvalidPartition { partition: 2, count: 1 }));
}

#[test]
fn error_code_tensor_is_cleared_per_run() {
    let text = format!("{}\n[[bss.io.err_code]]\nid = 0\nsize = 16\nref_section = 1\noffset_in_section = 1024\n", TWO_SUBGRAPHS);
    let (mem, hw, graph) = setup(FakeKernel::new(vec![1]), &text);
    let mut job = create(&hw, &graph, JobConfig::default());
    let err_code = *job.tensor(IoKind::ErrorCode, 0).expect("err code");
    mem.write_u32(err_code.pa, 0xDEAD).expect("poison");
    job.schedule().expect("schedule");
    assert_eq!(0, mem.read_u32(err_code.pa).expect("cleared"));
}

#[test]
fn shared_input_moves_its_section() {
    let (mem, hw, graph) = setup(FakeKernel::new(vec![1]), TWO_SUBGRAPHS);
    let mut job = create(&hw, &graph, JobConfig::default());
    let shared = mem.malloc(1024, 0, "shared", MemRegion::Default).expect("shared");

    job.bind_shared_tensor(IoKind::Input, 0, SharedSource::SameProcess { pa: shared.pa }).expect("bind");
    let input = *job.tensor(IoKind::Input, 0).expect("input");
    assert_eq!(shared.pa, input.pa);
    assert!(!input.dump_ignore);
    let slot = job.subgraph_buffers().and_then(|b| b.reuses[0].as_ref()).expect("slot");
    assert_eq!(Backing::Imported, slot.backing);

    // rodata now points at the shared buffer
    let rodata = job.rodata_buffer().expect("rodata");
    assert_eq!(lo32(shared.align_asid_pa() + 16), mem.read_u32(rodata.pa).expect("param"));

    let data = vec![7u8; 1024];
    job.load_tensor(0, &data).expect("load");
    let mut raw = vec![0u8; 1024];
    mem.read(shared.pa, &mut raw).expect("read");
    assert_eq!(data, raw);

    job.destroy().expect("destroy");
    // the shared buffer stays with its owner
    mem.free(shared).expect("owner frees");
}

#[test]
fn customised_and_dma_buf_sources() {
    let kernel = FakeKernel { dmabuf: Some((0xA000_0000, 0x2000)), ..FakeKernel::new(vec![1]) };
    let (_mem, hw, graph) = setup(kernel, TWO_SUBGRAPHS);
    let mut job = create(&hw, &graph, JobConfig::default());

    job.bind_shared_tensor(IoKind::Output, 0, SharedSource::DmaBuf { fd: 9, offset: 0x100 }).expect("dma-buf");
    let output = *job.tensor(IoKind::Output, 0).expect("output");
    assert_eq!(0xA000_0100, output.pa);
    let binding = output.dmabuf.expect("binding");
    assert_eq!((9, 0x100, 0x2000), (binding.fd, binding.offset, binding.bytes));

    job.bind_shared_tensor(IoKind::Input, 0, SharedSource::Customised { pa: 0xB000_0000 }).expect("customised");
    assert!(job.tensor(IoKind::Input, 0).expect("input").dump_ignore);

    assert!(matches!(
        job.bind_shared_tensor(IoKind::Profiler, 0, SharedSource::SameProcess { pa: 0 }),
        Err(UmdError::InvalidTensorId { .. })
    ));
}

#[test]
fn section_with_input_and_output_cannot_be_shared() {
    let text = TWO_SUBGRAPHS.replace("size = 2048\nref_section = 1", "size = 512\nref_section = 0");
    let (_mem, hw, graph) = setup(FakeKernel::new(vec![1]), &text);
    let mut job = create(&hw, &graph, JobConfig::default());
    let err = job.bind_shared_tensor(IoKind::Input, 0, SharedSource::SameProcess { pa: 0x8800_0000 }).err();
    assert!(matches!(err, Some(UmdError::SharedIoConflict { section: 0 })));
}

#[test]
fn shared_buffer_below_asid_base_is_rejected() {
    let mem = Arc::new(TestMemory::new(MemConfig { asid0_base: 0x8000_0000, ..mem_config() }));
    let graph = loaded_graph(graph_desc(TWO_SUBGRAPHS), mem.as_ref());
    let hw = hardware(Arc::clone(&mem), FakeKernel::new(vec![1]));
    let mut job = create(&hw, &graph, JobConfig::default());
    let input = job.tensor(IoKind::Input, 0).expect("input").pa;

    let err = job.bind_shared_tensor(IoKind::Input, 0, SharedSource::SameProcess { pa: 0x1000 }).err();
    assert!(matches!(err, Some(UmdError::InvalidArgument { .. })));
    // the section keeps its own buffer
    assert_eq!(input, job.tensor(IoKind::Input, 0).expect("input").pa);

    job.bind_shared_tensor(IoKind::Input, 0, SharedSource::SameProcess { pa: 0x8800_0000 }).expect("above base");
    assert_eq!(0x8800_0000, job.tensor(IoKind::Input, 0).expect("input").pa);
}
