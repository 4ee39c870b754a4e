//! Construction of a job's TCB chain.
//!
//! Layout for `S` subgraphs of `T` tasks each:
//!
//! ```text
//! [grid-init][group-init 0][task 0.0] .. [task 0.T-1][group-init 1][task 1.0] ..
//! ```
//!
//! `1 + S * (T + 1)` records. The chain is built in host memory and written
//! to the device in one piece.

use log::debug;

use crate::base::mem::{hi32, lo32, BufferDesc, PAGE_SIZE};
use crate::error::{Result, UmdError};
use crate::graph::{Dependency, Graph, Subgraph};
use crate::job::alloc::TaskTable;
use crate::job::gm::GmSync;
use crate::job::segmmu::SegMmuRegs;
use crate::tcb::*;

/// Byte stride between the printf areas of two tasks of one subgraph.
pub const PRINTF_TASK_STRIDE: u64 = 1024;
const MAX_DEP_GROUP: u32 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLayout {
    pub subgraphs: usize,
    pub tasks_per_group: u32,
}

impl ChainLayout {
    pub fn new(subgraphs: usize, tasks_per_group: u32) -> Self {
        Self { subgraphs, tasks_per_group }
    }

    fn stride(&self) -> usize {
        self.tasks_per_group as usize + 1
    }

    pub fn total(&self) -> usize {
        1 + self.subgraphs * self.stride()
    }

    pub fn group_init_index(&self, sg: usize) -> usize {
        1 + sg * self.stride()
    }

    pub fn task_index(&self, sg: usize, task: u32) -> usize {
        2 + sg * self.stride() + task as usize
    }

    pub fn last_task_index(&self) -> usize {
        self.total() - 1
    }
}

/// Flag bits and dependency slots of a subgraph's group-init and first task.
pub fn encode_dependency(sg: &Subgraph, start_group: u16) -> Result<(u32, [u16; 4])> {
    let mut slots = [0u16; 4];
    match sg.dependency()? {
        Dependency::None => Ok((DepType::None.bits(), slots)),
        Dependency::PreAll => Ok((DepType::PreAll.bits(), slots)),
        Dependency::Groups(precursors) => {
            for (slot, &p) in slots.iter_mut().zip(precursors.iter()) {
                if p > MAX_DEP_GROUP {
                    return Err(UmdError::InvalidDependency {
                        subgraph: sg.id,
                        reason: format!("precursor group {} out of range", p),
                    });
                }
                *slot = EN_GROUP_DEPEND | ((p + u32::from(start_group)) & MAX_DEP_GROUP) as u16;
            }
            Ok((DepType::Group.bits(), slots))
        }
    }
}

/// Device buffers a chain points into.
pub struct ChainInputs<'a> {
    pub graph: &'a Graph,
    pub layout: ChainLayout,
    pub grid_id: u16,
    pub start_group: u16,
    pub tcbs: &'a BufferDesc,
    pub text: &'a BufferDesc,
    pub rodata: Option<&'a BufferDesc>,
    pub crodata: Option<&'a BufferDesc>,
    pub tasks: &'a TaskTable,
    pub printf: Option<&'a BufferDesc>,
    /// ASID-relative base of the first profiler tensor
    pub profiler: Option<u64>,
    pub global_param: Option<&'a BufferDesc>,
    pub asid0_base: u64,
    pub asid1_base: u64,
    pub gm: Option<GmSync>,
    /// per core; empty when the graph has no SegMMU config
    pub segmmu: &'a [SegMmuRegs],
}

impl ChainInputs<'_> {
    fn tcb_pa(&self, index: usize) -> u64 {
        self.tcbs.pa + (index * TCB_SIZE) as u64
    }

    fn grid_init(&self) -> GridInitTcb {
        let mut tcb = GridInitTcb {
            flag: TcbType::GridInit as u32 | TCB_FLAG_L2D_FLUSH,
            group_num: self.layout.subgraphs as u32,
            interrupt_en: EN_INTERRUPT_GRID_ALL,
            group_id: self.start_group,
            grid_id: self.grid_id,
            ..Default::default()
        };
        if let Some(gm) = self.gm {
            tcb.gm_ctrl = gm.ctrl;
            tcb.gm_sync = gm.sync;
            tcb.gm_addr_low = lo32(gm.base);
            tcb.gm_addr_high = hi32(gm.base);
        }
        tcb
    }

    fn group_init(&self, sg_idx: usize, sg: &Subgraph, dep: (u32, [u16; 4])) -> GroupInitTcb {
        let asid1 = self
            .graph
            .weight_buffer(sg.bss_idx as usize)
            .and_then(|w| w.asid_base())
            .filter(|_| self.graph.has_weights())
            .unwrap_or(self.asid1_base);
        let mut tcb = GroupInitTcb {
            flag: TcbType::GroupInit as u32 | TCB_FLAG_GRID_INIT | dep.0,
            group_id: self.start_group.wrapping_add(sg_idx as u16),
            grid_id: self.grid_id,
            asids: [
                lo32(self.asid0_base) | ASID_RD | ASID_WR,
                hi32(self.asid0_base),
                lo32(asid1) | ASID_RD | ASID_WR,
                hi32(asid1),
                0,
                0,
                0,
                0,
            ],
            group_deps: dep.1,
            ..Default::default()
        };
        if !self.segmmu.is_empty() {
            let regs = &self.segmmu[sg_idx % self.segmmu.len()];
            tcb.segmmu_ctrl = regs.ctrl;
            tcb.segmmu_remap_ctrl0 = regs.remap;
            tcb.segmmu_remap_ctrl1 = regs.remap;
            tcb.segmmu_seg_ctrl[..8].copy_from_slice(&regs.seg_ctrl_words());
        }
        tcb
    }

    fn task(&self, sg_idx: usize, sg: &Subgraph, task: u32, dep: (u32, [u16; 4])) -> Result<TaskTcb> {
        let last_task = task + 1 == self.layout.tasks_per_group;
        let mut flag = TcbType::Task as u32;
        if last_task {
            flag |= TCB_FLAG_END_TYPE_GROUP_END;
            if sg_idx + 1 == self.layout.subgraphs {
                flag |= TCB_FLAG_END_TYPE_GRID_END;
            }
        }
        let mut group_deps = [0u16; 4];
        if task == 0 {
            flag |= dep.0;
            group_deps = dep.1;
        }

        let buffers = self.tasks.tasks(sg_idx).get(task as usize).ok_or_else(|| UmdError::BufferAllocFailed {
            reason: format!("no task buffers for subgraph {} task {}", sg_idx, task),
        })?;
        let index = self.layout.task_index(sg_idx, task);
        let mut tcb = TaskTcb {
            flag,
            spc: lo32(self.text.align_asid_pa() + u64::from(sg.text.offset)),
            interrupt_en: EN_INTERRUPT_TEC_ALL,
            group_id: self.start_group.wrapping_add(sg_idx as u16),
            grid_id: self.grid_id,
            task_id: task as u16,
            warmup_len: sg.warmup_len,
            grid_dim: [1, 1, 1],
            group_dim: [self.layout.tasks_per_group as u16, 1, 1],
            group_idx: [1, 0, 0],
            task_idx: [task as u16, 0, 0],
            sp: lo32(buffers.stack.align_asid_pa()),
            pp: lo32(self.rodata.map_or(0, BufferDesc::align_asid_pa) + u64::from(sg.rodata.offset)),
            dp: buffers.private_data.as_ref().map_or(0, |dp| lo32(dp.align_asid_pa())),
            tcbp: lo32(self.tcb_pa(index) - self.tcbs.asid_base),
            group_deps,
            ..Default::default()
        };
        if let Some(cp) = self.crodata {
            tcb.cp = lo32(cp.align_asid_pa());
        }
        if let Some(profiler) = self.profiler {
            tcb.pprofiler = lo32(profiler + u64::from(sg.profiler_buf_size));
        }
        if let (Some(printf), true) = (self.printf, sg.printfifo_size > 0) {
            let pa = printf.align_asid_pa() + PAGE_SIZE * sg_idx as u64 + PRINTF_TASK_STRIDE * u64::from(task);
            tcb.pprint = lo32(pa);
            tcb.interrupt_en |= EN_INTERRUPT_TEC_SIGNAL;
        }
        if let Some(param) = self.global_param {
            tcb.global_param = lo32(param.align_asid_pa());
        }
        Ok(tcb)
    }
}

pub fn build_chain(inputs: &ChainInputs<'_>) -> Result<Vec<Tcb>> {
    let layout = inputs.layout;
    let mut chain = Vec::with_capacity(layout.total());
    chain.push(Tcb::GridInit(inputs.grid_init()));
    for (sg_idx, sg) in inputs.graph.subgraphs.iter().enumerate().take(layout.subgraphs) {
        let dep = encode_dependency(sg, inputs.start_group)?;
        chain.push(Tcb::GroupInit(inputs.group_init(sg_idx, sg, dep)));
        for task in 0..layout.tasks_per_group {
            chain.push(Tcb::Task(inputs.task(sg_idx, sg, task, dep)?));
        }
    }
    debug!(
        "grid {}: {} tcbs @ {:#x}, groups {}..{}",
        inputs.grid_id,
        chain.len(),
        inputs.tcbs.pa,
        inputs.start_group,
        u32::from(inputs.start_group) + layout.subgraphs as u32
    );
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SUBG_DEPEND_PREALL;
    use smallvec::smallvec;

    #[test]
    fn layout_indices() {
        let layout = ChainLayout::new(3, 4);
        assert_eq!(16, layout.total());
        assert_eq!(1, layout.group_init_index(0));
        assert_eq!(6, layout.group_init_index(1));
        assert_eq!(7, layout.task_index(1, 0));
        assert_eq!(15, layout.task_index(2, 3));
        assert_eq!(15, layout.last_task_index());
    }

    #[test]
    fn dependency_slots_are_offset_by_start_group() {
        let sg = Subgraph { id: 2, precursor_cnt: 2, precursors: smallvec![0, 1], ..Default::default() };
        let (flag, slots) = encode_dependency(&sg, 0x7FFF).expect("encode");
        assert_eq!(DepType::Group.bits(), flag);
        assert_eq!([EN_GROUP_DEPEND | 0x7FFF, EN_GROUP_DEPEND, 0, 0], slots);

        let pre_all = Subgraph { precursor_cnt: SUBG_DEPEND_PREALL, ..Default::default() };
        assert_eq!((DepType::PreAll.bits(), [0; 4]), encode_dependency(&pre_all, 5).expect("pre-all"));

        let far = Subgraph { precursor_cnt: 1, precursors: smallvec![0x8000], ..Default::default() };
        assert!(encode_dependency(&far, 0).expect_err("out of range").is_format_error());
    }
}
