//! Placement of a job's private, reuse and per-task buffers.
//!
//! Two strategies share one entry point: the centralized strategy carves
//! every poolable section out of one private and one reuse allocation, the
//! scattered strategy allocates section by section. Centralized runs first;
//! a resource failure there rolls back and retries scattered.

use std::collections::BTreeSet;

use log::{debug, info, warn};
use serde::Deserialize;

use crate::base::mem::{page_align, BufferDesc, DeviceMemory, MemRegion, PAGE_SIZE};
use crate::error::{Result, UmdError};
use crate::graph::{GmBufType, Graph, GraphSectionDesc, Subgraph};
use crate::job::gm::GmManager;

fn align_up(offset: u64, align_in_page: u32) -> u64 {
    let align = PAGE_SIZE << align_in_page.min(20);
    (offset + align - 1) & !(align - 1)
}

/// How a slot's buffer came to be, and so how it is given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// owned allocation, freed through the allocator
    Allocated,
    /// view into a pooled allocation
    Pooled,
    /// caller memory bound in place of the original buffer
    Imported,
}

#[derive(Debug)]
pub struct SlotBuffer {
    pub buf: BufferDesc,
    pub backing: Backing,
}

impl SlotBuffer {
    pub fn allocated(buf: BufferDesc) -> Self {
        Self { buf, backing: Backing::Allocated }
    }

    pub fn pooled(buf: BufferDesc) -> Self {
        Self { buf, backing: Backing::Pooled }
    }

    pub fn imported(buf: BufferDesc) -> Self {
        Self { buf, backing: Backing::Imported }
    }

    pub fn release(self, mem: &dyn DeviceMemory) -> Result<()> {
        match self.backing {
            Backing::Allocated => mem.free(self.buf),
            Backing::Pooled | Backing::Imported => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Centralized,
    Scattered,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocPolicy {
    /// centralized, falling back to scattered
    #[default]
    Auto,
    Scattered,
}

/// Subgraph-level buffers of one job.
#[derive(Debug)]
pub struct SubgraphBuffers {
    pub kind: StrategyKind,
    pub priv_pool: Option<BufferDesc>,
    pub reuse_pool: Option<BufferDesc>,
    /// per subgraph, indexed like `Subgraph::private_buffers`
    pub private: Vec<Vec<Option<SlotBuffer>>>,
    /// indexed like the reuse sections of bss 0; `None` for empty sections
    pub reuses: Vec<Option<SlotBuffer>>,
    pub printf: Option<BufferDesc>,
}

impl SubgraphBuffers {
    fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            priv_pool: None,
            reuse_pool: None,
            private: Vec::new(),
            reuses: Vec::new(),
            printf: None,
        }
    }

    pub fn reuse(&self, index: usize) -> Option<&BufferDesc> {
        self.reuses.get(index).and_then(Option::as_ref).map(|s| &s.buf)
    }

    pub fn private(&self, sg: usize, index: usize) -> Option<&BufferDesc> {
        self.private.get(sg).and_then(|p| p.get(index)).and_then(Option::as_ref).map(|s| &s.buf)
    }

    /// Give back every owned buffer. Views are dropped with their pool.
    pub fn release(self, mem: &dyn DeviceMemory) -> Result<()> {
        let mut first_err = None;
        let slots = self.private.into_iter().flatten().chain(self.reuses).flatten();
        for slot in slots {
            if let Err(e) = slot.release(mem) {
                first_err.get_or_insert(e);
            }
        }
        for buf in [self.priv_pool, self.reuse_pool, self.printf].into_iter().flatten() {
            if let Err(e) = mem.free(buf) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[derive(Debug)]
pub enum AllocOutcome {
    /// resource failure; another strategy may still succeed
    Retry(UmdError),
    Fatal(UmdError),
}

impl AllocOutcome {
    pub fn into_error(self) -> UmdError {
        match self {
            AllocOutcome::Retry(e) | AllocOutcome::Fatal(e) => e,
        }
    }
}

pub struct AllocContext<'a> {
    pub graph: &'a Graph,
    pub mem: &'a dyn DeviceMemory,
    pub gm: &'a GmManager,
    /// reuse sections pinned to `fm_region`
    pub fm_idxes: &'a BTreeSet<u32>,
    pub fm_region: MemRegion,
    /// zero every new buffer
    pub zero_fill: bool,
}

impl AllocContext<'_> {
    fn is_pinned(&self, index: usize) -> bool {
        self.fm_idxes.contains(&(index as u32))
    }

    fn clear(&self, buf: &BufferDesc) -> Result<()> {
        if self.zero_fill {
            self.mem.zeroize(buf.pa, buf.size)?;
        }
        Ok(())
    }

    fn alloc_slot(&self, section: &GraphSectionDesc, name: &str, region: MemRegion) -> Result<SlotBuffer> {
        let buf = self.mem.malloc(section.size, section.align_in_page, name, region)?;
        if let Err(e) = self.clear(&buf) {
            if let Err(free_err) = self.mem.free(buf) {
                warn!("{}: {}", name, free_err);
            }
            return Err(e);
        }
        Ok(SlotBuffer::allocated(buf))
    }

    fn gm_slot(&self, section: &GraphSectionDesc, name: &str) -> Result<SlotBuffer> {
        let buf = self.gm.malloc(self.mem, section.size, section.align_in_page, name)?;
        Ok(SlotBuffer::allocated(buf))
    }

    fn alloc_printf(&self, out: &mut SubgraphBuffers) -> Result<()> {
        let count = self.graph.subgraph_count() as u64;
        match self.graph.subgraphs.first() {
            Some(sg0) if sg0.printfifo_size > 0 => {
                out.printf = Some(self.mem.malloc(count * PAGE_SIZE, 0, "printf", MemRegion::Default)?);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Offsets of every private section inside one shared pool, and the pool
/// size. Offsets restart at each subgraph that depends on all earlier
/// groups, since nothing before the barrier can still be running.
pub fn private_pool_layout(subgraphs: &[Subgraph]) -> (Vec<Vec<Option<u64>>>, u64, u32) {
    let mut offsets = Vec::with_capacity(subgraphs.len());
    let mut cursor = 0u64;
    let mut size = 0u64;
    let mut align_in_page = 0u32;
    for sg in subgraphs {
        if sg.depends_on_all() {
            cursor = 0;
        }
        let mut sg_offsets = Vec::with_capacity(sg.private_buffers.len());
        for section in &sg.private_buffers {
            if section.size == 0 {
                sg_offsets.push(None);
                continue;
            }
            let at = align_up(cursor, section.align_in_page);
            sg_offsets.push(Some(at));
            cursor = at + page_align(section.size);
            align_in_page = align_in_page.max(section.align_in_page);
        }
        size = size.max(cursor);
        offsets.push(sg_offsets);
    }
    (offsets, size, align_in_page)
}

/// Offsets of the poolable reuse sections (`None` for sections that are
/// empty or excluded) and the pool size.
pub fn reuse_pool_layout(sections: &[GraphSectionDesc], excluded: impl Fn(usize) -> bool) -> (Vec<Option<u64>>, u64, u32) {
    let mut offsets = Vec::with_capacity(sections.len());
    let mut cursor = 0u64;
    let mut align_in_page = 0u32;
    for (k, section) in sections.iter().enumerate() {
        if section.size == 0 || excluded(k) {
            offsets.push(None);
            continue;
        }
        let at = align_up(cursor, section.align_in_page);
        offsets.push(Some(at));
        cursor = at + page_align(section.size);
        align_in_page = align_in_page.max(section.align_in_page);
    }
    (offsets, cursor, align_in_page)
}

pub trait AllocStrategy {
    fn kind(&self) -> StrategyKind;

    /// Fill `out`. Everything allocated is recorded in `out` before the
    /// next allocation, so a failed call can be rolled back from it.
    fn populate(&self, ctx: &AllocContext<'_>, out: &mut SubgraphBuffers) -> std::result::Result<(), AllocOutcome>;

    /// On error, every buffer this call allocated has been released.
    fn allocate(&self, ctx: &AllocContext<'_>) -> std::result::Result<SubgraphBuffers, AllocOutcome> {
        let mut out = SubgraphBuffers::new(self.kind());
        match self.populate(ctx, &mut out) {
            Ok(()) => Ok(out),
            Err(outcome) => {
                if let Err(e) = out.release(ctx.mem) {
                    warn!("{:?} rollback: {}", self.kind(), e);
                }
                Err(outcome)
            }
        }
    }
}

pub struct Scattered;

impl AllocStrategy for Scattered {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Scattered
    }

    fn populate(&self, ctx: &AllocContext<'_>, out: &mut SubgraphBuffers) -> std::result::Result<(), AllocOutcome> {
        for (sg_idx, sg) in ctx.graph.subgraphs.iter().enumerate() {
            out.private.push(Vec::with_capacity(sg.private_buffers.len()));
            for (k, section) in sg.private_buffers.iter().enumerate() {
                let slot = if section.size == 0 {
                    warn!("priv {}_{}: size == 0", sg_idx, k);
                    None
                } else {
                    let name = format!("priv_{}_{}", sg_idx, k);
                    Some(ctx.alloc_slot(section, &name, MemRegion::Default).map_err(AllocOutcome::Fatal)?)
                };
                out.private[sg_idx].push(slot);
            }
        }

        let bss0 = ctx.graph.bss0().map_err(AllocOutcome::Fatal)?;
        for (k, section) in bss0.reuse_sections.iter().enumerate() {
            if section.size == 0 {
                warn!("reuse {}: size == 0", k);
                out.reuses.push(None);
                continue;
            }
            let name = format!("reuse_{}", k);
            let slot = if ctx.gm.is_gm_buffer(k as u32, GmBufType::Reuse) {
                ctx.gm_slot(section, &name)
            } else {
                let region = if ctx.is_pinned(k) || ctx.fm_region != MemRegion::Default {
                    ctx.fm_region
                } else {
                    MemRegion::Default
                };
                ctx.alloc_slot(section, &name, region)
            }
            .map_err(AllocOutcome::Fatal)?;
            out.reuses.push(Some(slot));
        }

        ctx.alloc_printf(out).map_err(AllocOutcome::Fatal)
    }
}

pub struct Centralized;

impl AllocStrategy for Centralized {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Centralized
    }

    fn populate(&self, ctx: &AllocContext<'_>, out: &mut SubgraphBuffers) -> std::result::Result<(), AllocOutcome> {
        if ctx.fm_region != MemRegion::Default {
            return Err(AllocOutcome::Retry(UmdError::BufferAllocFailed {
                reason: format!("feature maps pinned to {:?}", ctx.fm_region),
            }));
        }
        let bss0 = ctx.graph.bss0().map_err(AllocOutcome::Fatal)?;
        let (priv_offsets, priv_size, priv_align) = private_pool_layout(&ctx.graph.subgraphs);
        let excluded = |k: usize| ctx.gm.is_gm_buffer(k as u32, GmBufType::Reuse) || ctx.is_pinned(k);
        let (reuse_offsets, reuse_size, reuse_align) = reuse_pool_layout(&bss0.reuse_sections, excluded);

        if priv_size > 0 {
            let pool = ctx.mem.malloc(priv_size, priv_align, "tot_priv", MemRegion::Default);
            out.priv_pool = Some(pool.map_err(AllocOutcome::Retry)?);
        }
        if reuse_size > 0 {
            let pool = ctx.mem.malloc(reuse_size, reuse_align, "tot_reuse", MemRegion::Default);
            out.reuse_pool = Some(pool.map_err(AllocOutcome::Retry)?);
        }
        debug!("centralized pools: private {:#x}, reuse {:#x}", priv_size, reuse_size);

        for (sg_idx, sg) in ctx.graph.subgraphs.iter().enumerate() {
            let mut slots = Vec::with_capacity(sg.private_buffers.len());
            for (k, section) in sg.private_buffers.iter().enumerate() {
                let (Some(pool), Some(offset)) = (out.priv_pool.as_ref(), priv_offsets[sg_idx][k]) else {
                    warn!("opt priv {}_{}: size == 0", sg_idx, k);
                    slots.push(None);
                    continue;
                };
                let view = pool.view(offset, page_align(section.size), section.size);
                ctx.clear(&view).map_err(AllocOutcome::Fatal)?;
                slots.push(Some(SlotBuffer::pooled(view)));
            }
            out.private.push(slots);
        }

        for (k, section) in bss0.reuse_sections.iter().enumerate() {
            if section.size == 0 {
                warn!("opt reuse {}: size == 0", k);
                out.reuses.push(None);
                continue;
            }
            let name = format!("reuse_{}", k);
            let slot = if ctx.gm.is_gm_buffer(k as u32, GmBufType::Reuse) {
                ctx.gm_slot(section, &name).map_err(AllocOutcome::Fatal)?
            } else if ctx.is_pinned(k) {
                ctx.alloc_slot(section, &name, ctx.fm_region).map_err(AllocOutcome::Fatal)?
            } else {
                let (Some(pool), Some(offset)) = (out.reuse_pool.as_ref(), reuse_offsets[k]) else {
                    return Err(AllocOutcome::Fatal(UmdError::BufferAllocFailed {
                        reason: format!("reuse {} missing from pool layout", k),
                    }));
                };
                let view = pool.view(offset, page_align(section.size), section.size);
                ctx.clear(&view).map_err(AllocOutcome::Fatal)?;
                SlotBuffer::pooled(view)
            };
            out.reuses.push(Some(slot));
        }

        ctx.alloc_printf(out).map_err(AllocOutcome::Fatal)
    }
}

/// Centralized first, scattered on a resource failure.
pub fn allocate_subgraph_buffers(ctx: &AllocContext<'_>, policy: AllocPolicy) -> Result<SubgraphBuffers> {
    if policy == AllocPolicy::Scattered {
        return Scattered.allocate(ctx).map_err(AllocOutcome::into_error);
    }
    match Centralized.allocate(ctx) {
        Ok(buffers) => Ok(buffers),
        Err(AllocOutcome::Retry(e)) => {
            info!("centralized allocation failed ({}), trying scattered", e);
            Scattered.allocate(ctx).map_err(AllocOutcome::into_error)
        }
        Err(AllocOutcome::Fatal(e)) => Err(UmdError::BufferAllocFailed { reason: e.to_string() }),
    }
}

/// Stack and private data of one task.
#[derive(Debug)]
pub struct TaskBuffer {
    pub stack: BufferDesc,
    pub private_data: Option<BufferDesc>,
}

/// Per-task buffers of a job. A subgraph that depends on all earlier groups,
/// and the subgraphs following it, borrow the task sets of the first
/// subgraphs in order instead of allocating new ones.
#[derive(Debug, Default)]
pub struct TaskTable {
    sets: Vec<Vec<TaskBuffer>>,
    owner: Vec<usize>,
}

impl TaskTable {
    pub fn allocate(graph: &Graph, mem: &dyn DeviceMemory, tasks_per_sg: u32) -> Result<TaskTable> {
        let mut table = TaskTable::default();
        match table.populate(graph, mem, tasks_per_sg) {
            Ok(()) => Ok(table),
            Err(e) => {
                if let Err(cleanup) = table.release(mem) {
                    warn!("task buffer rollback: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn populate(&mut self, graph: &Graph, mem: &dyn DeviceMemory, tasks_per_sg: u32) -> Result<()> {
        let bss0 = graph.bss0()?;
        let stack_size = u64::from(bss0.stack_size).max(PAGE_SIZE);
        let mut borrowing = false;
        let mut cursor = 0usize;

        for (i, sg) in graph.subgraphs.iter().enumerate() {
            if i != 0 {
                if sg.depends_on_all() {
                    cursor = 0;
                    borrowing = true;
                }
                if borrowing && cursor < self.sets.len() {
                    self.owner.push(cursor);
                    cursor += 1;
                    continue;
                }
                borrowing = false;
            }

            self.sets.push(Vec::with_capacity(tasks_per_sg as usize));
            let set = self.sets.len() - 1;
            for _ in 0..tasks_per_sg {
                let stack = mem.malloc(stack_size, bss0.stack_align_in_page, "stack", MemRegion::Default)?;
                self.sets[set].push(TaskBuffer { stack, private_data: None });
                if sg.private_data_size != 0 {
                    let dp = mem.malloc(u64::from(sg.private_data_size), 0, "dp_data", MemRegion::Default)?;
                    let dp = self.sets[set].last_mut().map(|t| t.private_data.insert(dp));
                    if let Some(dp) = dp {
                        mem.zeroize(dp.pa, dp.size)?;
                    }
                }
            }
            self.owner.push(set);
        }
        Ok(())
    }

    pub fn tasks(&self, sg: usize) -> &[TaskBuffer] {
        self.owner.get(sg).and_then(|&set| self.sets.get(set)).map_or(&[], Vec::as_slice)
    }

    /// Number of distinct task sets actually allocated.
    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub fn owner(&self, sg: usize) -> Option<usize> {
        self.owner.get(sg).copied()
    }

    pub fn release(self, mem: &dyn DeviceMemory) -> Result<()> {
        let mut first_err = None;
        for task in self.sets.into_iter().flatten() {
            for buf in std::iter::once(task.stack).chain(task.private_data) {
                if let Err(e) = mem.free(buf) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SUBG_DEPEND_PREALL;

    fn section(size: u64) -> GraphSectionDesc {
        GraphSectionDesc { size, ..Default::default() }
    }

    fn sg(precursor_cnt: i32, private: &[u64]) -> Subgraph {
        Subgraph {
            precursor_cnt,
            precursors: if precursor_cnt > 0 { (0..precursor_cnt as u32).collect() } else { Default::default() },
            private_buffers: private.iter().map(|&s| section(s)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn private_pool_restarts_after_barrier() {
        let subgraphs = vec![
            sg(0, &[100, 5000]),
            sg(1, &[4096]),
            sg(SUBG_DEPEND_PREALL, &[8192]),
            sg(1, &[0, 1]),
        ];
        let (offsets, size, align) = private_pool_layout(&subgraphs);
        assert_eq!(vec![Some(0), Some(PAGE_SIZE)], offsets[0]);
        assert_eq!(vec![Some(3 * PAGE_SIZE)], offsets[1]);
        assert_eq!(vec![Some(0)], offsets[2]);
        assert_eq!(vec![None, Some(2 * PAGE_SIZE)], offsets[3]);
        assert_eq!(4 * PAGE_SIZE, size);
        assert_eq!(0, align);
    }

    #[test]
    fn reuse_pool_skips_excluded_and_respects_alignment() {
        let sections = vec![
            section(10),
            section(0),
            GraphSectionDesc { size: 10, align_in_page: 1, ..Default::default() },
            section(10),
        ];
        let (offsets, size, align) = reuse_pool_layout(&sections, |k| k == 3);
        assert_eq!(vec![Some(0), None, Some(2 * PAGE_SIZE), None], offsets);
        assert_eq!(3 * PAGE_SIZE, size);
        assert_eq!(1, align);
    }
}
