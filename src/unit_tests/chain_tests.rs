use std::sync::Arc;

use super::common::*;
use crate::base::mem::{lo32, DeviceMemory};
use crate::device::Device;
use crate::graph::IoKind;
use crate::job::dump::DumpConfig;
use crate::job::{Job, JobConfig};
use crate::tcb::*;

fn job_on_hardware(text: &str, config: JobConfig) -> (Arc<TestMemory>, Job) {
    let mem = Arc::new(TestMemory::new(mem_config()));
    let graph = loaded_graph(graph_desc(text), mem.as_ref());
    let device: Arc<dyn Device> = hardware(Arc::clone(&mem), FakeKernel::new(vec![1]));
    let job = Job::create(graph, device, config, DumpConfig::default()).expect("create");
    (mem, job)
}

#[test]
fn chain_layout_and_flags() {
    let (_mem, job) = job_on_hardware(TWO_SUBGRAPHS, JobConfig::default());
    let chain = job.read_chain().expect("chain");
    assert_eq!(11, chain.len());

    let Tcb::GridInit(grid) = &chain[0] else { panic!("chain must open with grid-init") };
    assert_eq!(2, grid.group_num);
    assert_eq!(job.grid_id(), grid.grid_id);
    assert_eq!(job.start_group(), grid.group_id);
    assert_eq!(EN_INTERRUPT_GRID_ALL, grid.interrupt_en);

    for (sg, index) in [(0u16, 1usize), (1, 6)] {
        let Tcb::GroupInit(group) = &chain[index] else { panic!("group-init expected at {}", index) };
        assert_eq!(job.start_group() + sg, group.group_id);
        assert!(group.flag & TCB_FLAG_GRID_INIT != 0);
    }
    assert_eq!(Some(DepType::None), chain[1].dep_type());
    assert_eq!(Some(DepType::Group), chain[6].dep_type());
    assert_eq!([EN_GROUP_DEPEND | job.start_group(), 0, 0, 0], chain[6].group_deps());
    // first task of the group repeats the dependency, the others do not
    assert_eq!(chain[6].group_deps(), chain[7].group_deps());
    assert_eq!([0; 4], chain[8].group_deps());

    let ends: Vec<usize> = chain.iter().enumerate().filter(|(_, t)| t.is_group_end()).map(|(i, _)| i).collect();
    assert_eq!(vec![5, 10], ends);
    assert!(!chain[5].is_grid_end());
    assert!(chain[10].is_grid_end());
    assert_eq!(1, chain.iter().filter(|t| t.is_grid_end()).count());
}

#[test]
fn task_pointers_follow_job_buffers() {
    let (mem, job) = job_on_hardware(TWO_SUBGRAPHS, JobConfig::default());
    let chain = job.read_chain().expect("chain");
    let tcbs = job.tcb_buffer().expect("tcbs");
    let rodata = job.rodata_buffer().expect("rodata");

    for (index, tcb) in chain.iter().enumerate() {
        let Tcb::Task(task) = tcb else { continue };
        assert_eq!(lo32(tcbs.pa + (index * TCB_SIZE) as u64 - tcbs.asid_base), task.tcbp);
        assert_eq!([1, 1, 1], task.grid_dim);
        assert_eq!(4, task.group_dim[0]);
        assert_eq!(EN_INTERRUPT_TEC_ALL, task.interrupt_en);
    }
    let Tcb::Task(first) = &chain[2] else { panic!("task expected") };
    let Tcb::Task(second_group) = &chain[7] else { panic!("task expected") };
    assert_eq!(lo32(rodata.align_asid_pa()), first.pp);
    assert_eq!(lo32(rodata.align_asid_pa() + 32), second_group.pp);
    assert_eq!(first.spc + 128, second_group.spc);

    // four tasks, four stacks
    let stacks: std::collections::BTreeSet<u32> =
        chain[2..6].iter().filter_map(|t| if let Tcb::Task(t) = t { Some(t.sp) } else { None }).collect();
    assert_eq!(4, stacks.len());

    // trailer after the text image
    let text_pa = first.spc as u64 + mem.asid_base(0);
    assert_eq!(first.spc, mem.read_u32(text_pa + 256).expect("trailer"));
    assert_eq!(lo32(rodata.align_asid_pa()), mem.read_u32(text_pa + 260).expect("trailer"));
}

#[test]
fn params_point_at_job_buffers() {
    let (mem, job) = job_on_hardware(TWO_SUBGRAPHS, JobConfig::default());
    let rodata = job.rodata_buffer().expect("rodata");
    let dcr = job.descriptor_buffer().expect("dcr");
    let buffers = job.subgraph_buffers().expect("buffers");

    let reuse0 = buffers.reuse(0).expect("reuse 0");
    assert_eq!(lo32(reuse0.align_asid_pa() + 16), mem.read_u32(rodata.pa).expect("ro"));

    let private = buffers.private(0, 0).expect("private");
    assert_eq!(lo32(private.align_asid_pa() + 4), mem.read_u32(rodata.pa + 8).expect("ro"));

    let reuse1 = buffers.reuse(1).expect("reuse 1");
    assert_eq!(lo32(reuse1.align_asid_pa()) & 0xFFFF, mem.read_u32(dcr.pa + 8).expect("dcr"));

    // input 0 lives at the start of reuse 0
    assert_eq!(reuse0.pa, job.tensor(IoKind::Input, 0).expect("input").pa);
}

#[test]
fn tasks_per_group_is_configurable() {
    let config = JobConfig { tasks_per_group: 2, ..Default::default() };
    let (_mem, job) = job_on_hardware(TWO_SUBGRAPHS, config);
    let chain = job.read_chain().expect("chain");
    assert_eq!(7, chain.len());
    assert!(chain[6].is_grid_end());
    assert_eq!(7, job.layout().total());
}

const PRINTF_AND_PREALL: &str = r#"
text = { zeros = 64 }
rodata = { zeros = 16 }

[[subgraphs]]
id = 0
printfifo_size = 1024

[[subgraphs]]
id = 1
printfifo_size = 1024
precursor_cnt = -1

[[bss]]
reuse_sections = [{ size = 64 }]
"#;

#[test]
fn printf_and_pre_all_dependency() {
    let (_mem, job) = job_on_hardware(PRINTF_AND_PREALL, JobConfig::default());
    let chain = job.read_chain().expect("chain");
    assert_eq!(Some(DepType::PreAll), chain[6].dep_type());
    assert_eq!([0; 4], chain[6].group_deps());

    let printf = job.subgraph_buffers().and_then(|b| b.printf.as_ref()).expect("printf buffer");
    let Tcb::Task(t0) = &chain[2] else { panic!("task expected") };
    let Tcb::Task(t1) = &chain[3] else { panic!("task expected") };
    let Tcb::Task(g1t0) = &chain[7] else { panic!("task expected") };
    assert_eq!(lo32(printf.align_asid_pa()), t0.pprint);
    assert_eq!(t0.pprint + 1024, t1.pprint);
    assert_eq!(t0.pprint + 4096, g1t0.pprint);
    assert!(t0.interrupt_en & EN_INTERRUPT_TEC_SIGNAL != 0);

    // the barrier subgraph borrows the first subgraph's task buffers
    let table = job.task_table().expect("tasks");
    assert_eq!(1, table.set_count());
    assert_eq!(Some(0), table.owner(1));
    assert_eq!(t0.sp, g1t0.sp);
}

const SECOND_SUBGRAPH: &str = "[[subgraphs]]\nid = 1\ntext = { offset = 128, size = 128 }\nrodata = { offset = 32, size = 32 }\nprecursor_cnt = 1\nprecursors = [0]\n\n";

#[test]
fn single_subgraph_single_task() {
    let text = TWO_SUBGRAPHS.replace(SECOND_SUBGRAPH, "");
    let (_mem, job) = job_on_hardware(&text, JobConfig { tasks_per_group: 1, ..Default::default() });
    let chain = job.read_chain().expect("chain");
    assert_eq!(3, chain.len());

    let Tcb::GridInit(grid) = &chain[0] else { panic!("grid-init expected") };
    assert_eq!(1, grid.group_num);
    assert!(matches!(chain[1], Tcb::GroupInit(_)));
    assert_eq!(Some(DepType::None), chain[1].dep_type());
    assert!(matches!(chain[2], Tcb::Task(_)));
    assert!(chain[2].is_group_end());
    assert!(chain[2].is_grid_end());
}

#[test]
fn group_depends_on_non_adjacent_precursor() {
    let third = "[[subgraphs]]\nid = 2\ntext = { offset = 0, size = 128 }\nrodata = { offset = 0, size = 32 }\nprecursor_cnt = 1\nprecursors = [0]\n\n";
    let text = TWO_SUBGRAPHS.replace(SECOND_SUBGRAPH, &format!("{}{}", SECOND_SUBGRAPH, third));
    let (_mem, job) = job_on_hardware(&text, JobConfig::default());
    let tasks = job.layout().tasks_per_group as usize;
    let chain = job.read_chain().expect("chain");
    assert_eq!(1 + 3 * (tasks + 1), chain.len());

    let index = 1 + 2 * (tasks + 1);
    let Tcb::GroupInit(group) = &chain[index] else { panic!("group-init expected at {}", index) };
    assert_eq!(job.start_group() + 2, group.group_id);
    assert_eq!(Some(DepType::Group), chain[index].dep_type());
    let deps = chain[index].group_deps();
    assert_eq!(EN_GROUP_DEPEND | job.start_group(), deps[0]);
    assert_eq!([0; 3], deps[1..4]);
    assert!(chain[chain.len() - 1].is_grid_end());
}
