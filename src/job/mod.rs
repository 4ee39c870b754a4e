//! One execution instance of a loaded graph.
//!
//! A job owns every per-run buffer (rodata copy, descriptor copy, TCB chain,
//! private/reuse/task buffers) and a range of group ids. Creation allocates
//! and patches all of them and builds the chain; `schedule` hands the chain
//! to the device; `get_status` collects the outcome. Everything is given
//! back on `destroy` or drop.

pub mod alloc;
pub mod chain;
pub mod dump;
pub mod dynshape;
pub mod gm;
pub mod io;
pub mod segmmu;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;

use crate::base::mem::{lo32, BufferDesc, DeviceMemory, MemRegion};
use crate::device::{
    Device, IoctlCmd, IoctlReply, JobDesc, JobOutcome, Qos, JOB_EXEC_FLAG_DBG_DISPATCH, JOB_EXEC_FLAG_QOS_FAST,
    JOB_EXEC_FLAG_QOS_SLOW,
};
use crate::error::{Result, UmdError};
use crate::graph::{Graph, IoKind, ParamLoadType};
use crate::sim::config::{Config, SimConfig};
use crate::tcb::{decode_chain, encode_chain, Tcb, TCB_SIZE};

use alloc::{allocate_subgraph_buffers, AllocContext, AllocPolicy, SlotBuffer, StrategyKind, SubgraphBuffers, TaskTable};
use chain::{build_chain, ChainInputs, ChainLayout};
use dump::{dump_emulation, dump_tcb_chain, DumpConfig, EmulationImage};
use dynshape::DynShape;
use gm::GmManager;
use io::{patch_param_map, DmaBufBinding, IoBuffers, JobIoBuffer, ParamTarget, SharedSource};
use segmmu::{setup_segmmu, SegMmuRegs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Init,
    Scheduled,
    /// submitted with deferred start, waiting for its trigger
    Bound,
    Done,
    Exception,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct JobConfig {
    pub partition_id: u32,
    pub qos: Qos,
    /// region for the reuse sections listed in `fm_idxes`; anything other
    /// than `default` sends every reuse section through scattered placement
    pub fm_mem_region: MemRegion,
    pub fm_idxes: BTreeSet<u32>,
    /// pin the grid to `dbg_core_id`
    pub dbg_dispatch: bool,
    pub dbg_core_id: u32,
    pub tasks_per_group: u32,
    /// zero reuse buffers after allocation
    pub zero_reuse_buffers: bool,
    pub alloc_policy: AllocPolicy,
    /// one dimension list per input of a dynamic-shape graph
    pub dynamic_shapes: Vec<Vec<u32>>,
}

impl Config for JobConfig {}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            partition_id: 0,
            qos: Qos::Slow,
            fm_mem_region: MemRegion::Default,
            fm_idxes: BTreeSet::new(),
            dbg_dispatch: false,
            dbg_core_id: 0,
            tasks_per_group: 4,
            zero_reuse_buffers: false,
            alloc_policy: AllocPolicy::Auto,
            dynamic_shapes: Vec::new(),
        }
    }
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Per-job device buffers outside of the strategy-managed ones.
#[derive(Debug, Default)]
struct JobBuffers {
    global_param: Option<BufferDesc>,
    rodata: Option<BufferDesc>,
    descriptor: Option<BufferDesc>,
    tcbs: Option<BufferDesc>,
    subgraph: Option<SubgraphBuffers>,
    tasks: Option<TaskTable>,
}

impl JobBuffers {
    fn release(&mut self, mem: &dyn DeviceMemory) -> Result<()> {
        let mut first_err = None;
        let plain = [self.global_param.take(), self.rodata.take(), self.descriptor.take(), self.tcbs.take()];
        for buf in plain.into_iter().flatten() {
            if let Err(e) = mem.free(buf) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(Err(e)) = self.subgraph.take().map(|s| s.release(mem)) {
            first_err.get_or_insert(e);
        }
        if let Some(Err(e)) = self.tasks.take().map(|t| t.release(mem)) {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }
}

pub struct Job {
    id: u64,
    graph: Arc<Graph>,
    device: Arc<dyn Device>,
    mem: Arc<dyn DeviceMemory>,
    config: JobConfig,
    dump: DumpConfig,
    state: JobState,
    layout: ChainLayout,
    grid_id: u16,
    start_group: u16,
    holds_group_ids: bool,
    core_count: u32,
    gm: GmManager,
    buffers: JobBuffers,
    io: IoBuffers,
    dyn_shape: DynShape,
    segmmu: Vec<SegMmuRegs>,
    /// chain as built, restored before every run after the first
    backup: Vec<u8>,
    submitted_once: bool,
    is_defer: bool,
    do_trigger: bool,
    desc: JobDesc,
}

impl Job {
    /// Allocate and initialize everything a run of `graph` needs. The graph
    /// must already be loaded to the device's memory.
    pub fn create(graph: Arc<Graph>, device: Arc<dyn Device>, config: JobConfig, dump: DumpConfig) -> Result<Job> {
        graph.loaded()?;
        if graph.is_dynamic_shape() && config.dynamic_shapes.is_empty() {
            return Err(UmdError::ShapeNotConfigured { index: 0 });
        }
        let core_count = device.core_count(config.partition_id)?;
        let tasks_per_group = config.tasks_per_group.max(1);
        let layout = ChainLayout::new(graph.subgraph_count(), tasks_per_group);
        let mem = device.memory();

        let grid_id = device.alloc_grid_id()?;
        let start_group = device.alloc_group_ids(graph.subgraph_count() as u32)?;

        let mut job = Job {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            gm: GmManager::new(&graph, mem.as_ref()),
            dyn_shape: DynShape::new(config.dynamic_shapes.clone()),
            graph,
            device,
            mem,
            config,
            dump,
            state: JobState::Init,
            layout,
            grid_id,
            start_group,
            holds_group_ids: true,
            core_count,
            buffers: JobBuffers::default(),
            io: IoBuffers::default(),
            segmmu: Vec::new(),
            backup: Vec::new(),
            submitted_once: false,
            is_defer: false,
            do_trigger: false,
            desc: JobDesc::default(),
        };
        // on error the job is dropped here and gives everything back
        job.init()?;
        info!(
            "job {}: grid {}, groups {}+{}, {} tcbs",
            job.id,
            job.grid_id,
            job.start_group,
            job.layout.subgraphs,
            job.layout.total()
        );
        Ok(job)
    }

    fn init(&mut self) -> Result<()> {
        self.alloc_load_buffers()?;
        if self.layout.subgraphs == 0 {
            debug!("job {}: no subgraphs, chain skipped", self.id);
            return Ok(());
        }
        self.patch_bss_params()?;
        self.patch_private_params()?;
        let tensors: Vec<(u32, u64)> = self.io.get(IoKind::SegMmu).iter().map(|t| (t.id, t.pa)).collect();
        self.segmmu = setup_segmmu(&self.graph.segmmus, &tensors, self.core_count)?;
        self.write_chain()
    }

    fn alloc_load_buffers(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let mem = Arc::clone(&self.mem);
        let mem = mem.as_ref();
        let bss0 = graph.bss0()?;
        let dynamic = graph.is_dynamic_shape() && self.dyn_shape.is_configured();

        if let (true, Some(blob)) = (dynamic, graph.global_param.as_ref()) {
            let buf = mem.malloc(blob.len() as u64, 0, "modelparam", MemRegion::Default)?;
            let buf = self.buffers.global_param.insert(buf);
            self.dyn_shape.write_global_param(mem, buf, blob, bss0.io.inputs.len())?;
        }
        if !graph.rodata.is_empty() {
            let buf = mem.malloc(graph.rodata.len() as u64, 0, "rodata", MemRegion::Default)?;
            mem.write(self.buffers.rodata.insert(buf).pa, &graph.rodata)?;
        }
        if !graph.descriptor.is_empty() {
            let buf = mem.malloc(graph.descriptor.len() as u64, 0, "dcr", MemRegion::Default)?;
            mem.write(self.buffers.descriptor.insert(buf).pa, &graph.descriptor)?;
        }
        let tcbs = mem.malloc((self.layout.total() * TCB_SIZE) as u64, 0, "tcbs", MemRegion::Default)?;
        let tcbs = self.buffers.tcbs.insert(tcbs);
        mem.zeroize(tcbs.pa, tcbs.size)?;

        let ctx = AllocContext {
            graph: &graph,
            mem,
            gm: &self.gm,
            fm_idxes: &self.config.fm_idxes,
            fm_region: self.config.fm_mem_region,
            zero_fill: self.config.zero_reuse_buffers,
        };
        let subgraph = self.buffers.subgraph.insert(allocate_subgraph_buffers(&ctx, self.config.alloc_policy)?);
        self.io = IoBuffers::build(&bss0.io, &subgraph.reuses)?;
        self.buffers.tasks = Some(TaskTable::allocate(&graph, mem, self.layout.tasks_per_group)?);
        if dynamic {
            self.dyn_shape.apply_input_sizes(&mut self.io)?;
        }
        Ok(())
    }

    fn subgraph_buffers_ref(&self) -> Result<&SubgraphBuffers> {
        self.buffers
            .subgraph
            .as_ref()
            .ok_or_else(|| UmdError::BufferAllocFailed { reason: format!("job {} has no subgraph buffers", self.id) })
    }

    fn param_target(&self) -> ParamTarget<'_> {
        ParamTarget {
            rodata: self.buffers.rodata.as_ref(),
            rodata_len: self.graph.rodata.len() as u64,
            descriptor: self.buffers.descriptor.as_ref(),
        }
    }

    /// Point the bss-level parameter words at this job's reuse, weight and
    /// subgraph-0 private buffers.
    fn patch_bss_params(&self) -> Result<()> {
        let buffers = self.subgraph_buffers_ref()?;
        let weights = self.graph.weight_buffer(0);
        let bss0 = self.graph.bss0()?;
        patch_param_map(self.mem.as_ref(), &self.param_target(), &bss0.param_map, |entry| {
            let index = entry.buf_index as usize;
            let buf = match entry.load_type {
                ParamLoadType::Reuse => buffers.reuse(index),
                ParamLoadType::Static => weights.and_then(|w| {
                    w.sections.get(&entry.buf_index).or_else(|| w.zerocpy_sections.get(&entry.buf_index))
                }),
                ParamLoadType::Private => buffers.private(0, index),
            };
            buf.map(BufferDesc::align_asid_pa).ok_or_else(|| {
                UmdError::invalid_graph(format!("param map names missing {:?} buffer {}", entry.load_type, index))
            })
        })
    }

    fn patch_private_params(&self) -> Result<()> {
        let buffers = self.subgraph_buffers_ref()?;
        let target = self.param_target();
        for (sg_idx, sg) in self.graph.subgraphs.iter().enumerate() {
            patch_param_map(self.mem.as_ref(), &target, &sg.private_buffers_map, |entry| {
                buffers.private(sg_idx, entry.buf_index as usize).map(BufferDesc::align_asid_pa).ok_or_else(|| {
                    UmdError::invalid_graph(format!("subgraph {} has no private buffer {}", sg.id, entry.buf_index))
                })
            })?;
        }
        Ok(())
    }

    fn write_chain(&mut self) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let mem = self.mem.as_ref();
        let text = graph.text_buffer().ok_or_else(|| UmdError::invalid_graph("graph has subgraphs but no text"))?;
        let missing = |what: &str| UmdError::BufferAllocFailed { reason: format!("job {} has no {}", self.id, what) };
        let tcbs = self.buffers.tcbs.as_ref().ok_or_else(|| missing("tcb buffer"))?;
        let subgraph = self.buffers.subgraph.as_ref().ok_or_else(|| missing("subgraph buffers"))?;
        let tasks = self.buffers.tasks.as_ref().ok_or_else(|| missing("task buffers"))?;

        let inputs = ChainInputs {
            graph: &graph,
            layout: self.layout,
            grid_id: self.grid_id,
            start_group: self.start_group,
            tcbs,
            text,
            rodata: self.buffers.rodata.as_ref(),
            crodata: graph.crodata_buffer(),
            tasks,
            printf: subgraph.printf.as_ref(),
            profiler: self.io.get(IoKind::Profiler).first().map(|p| p.align_asid_pa),
            global_param: self.buffers.global_param.as_ref(),
            asid0_base: mem.asid_base(0),
            asid1_base: mem.asid_base(1),
            gm: self.gm.sync_fields(mem.gm_size(), &subgraph.reuses, &graph.bss0()?.io.inputs),
            segmmu: &self.segmmu,
        };
        let bytes = encode_chain(&build_chain(&inputs)?);
        mem.write(tcbs.pa, &bytes)?;

        // text trailer: where the code and this job's rodata were placed
        let trailer = text.pa + graph.text.len() as u64;
        mem.write_u32(trailer, lo32(text.align_asid_pa()))?;
        mem.write_u32(trailer + 4, self.buffers.rodata.as_ref().map_or(0, |r| lo32(r.align_asid_pa())))?;
        self.backup = bytes;
        Ok(())
    }

    fn job_desc(&self) -> Result<JobDesc> {
        let tcbs = self
            .buffers
            .tcbs
            .as_ref()
            .ok_or_else(|| UmdError::BufferAllocFailed { reason: format!("job {} has no tcb buffer", self.id) })?;
        let mut exec_flag = match self.config.qos {
            Qos::Fast => JOB_EXEC_FLAG_QOS_FAST,
            Qos::Slow => JOB_EXEC_FLAG_QOS_SLOW,
        };
        let mut core_id = 0;
        if self.config.dbg_dispatch {
            exec_flag |= JOB_EXEC_FLAG_DBG_DISPATCH;
            core_id = self.config.dbg_core_id;
        }
        Ok(JobDesc {
            job_id: self.id,
            grid_id: self.grid_id,
            version_compatible: true,
            hw_config: self.graph.hw_config,
            hw_version: self.graph.hw_version,
            head_tcb_pa: tcbs.pa,
            tail_tcb_pa: tcbs.pa + (self.layout.last_task_index() * TCB_SIZE) as u64,
            tcb_number: self.layout.total() as u32,
            exec_flag,
            core_id,
            partition_id: self.config.partition_id,
            qos: self.config.qos,
            is_defer_run: self.is_defer,
            do_trigger: self.do_trigger,
        })
    }

    fn submit(&mut self, op: &'static str) -> Result<()> {
        match self.state {
            JobState::Scheduled | JobState::Exception => return Err(UmdError::BadState { op, state: self.state }),
            JobState::Bound if !self.do_trigger => return Err(UmdError::BadState { op, state: self.state }),
            _ => {}
        }
        if self.layout.subgraphs == 0 {
            self.state = JobState::Scheduled;
            return Ok(());
        }

        let mem = Arc::clone(&self.mem);
        if let [err_code] = self.io.get(IoKind::ErrorCode) {
            mem.zeroize(err_code.pa, u64::from(err_code.size))?;
        }
        if self.submitted_once && self.state != JobState::Bound {
            let tcbs = self.buffers.tcbs.as_ref().map_or(0, |t| t.pa);
            mem.write(tcbs, &self.backup)?;
        }
        self.dyn_shape.new_run();

        let desc = self.job_desc()?;
        self.device.schedule(&desc)?;
        self.desc = desc;
        self.submitted_once = true;
        self.state = if self.is_defer && !self.do_trigger { JobState::Bound } else { JobState::Scheduled };
        debug!("job {}: {} -> {:?}", self.id, op, self.state);

        if self.dump.emulation {
            if let Err(e) = self.dump_emulation() {
                warn!("job {}: emulation dump failed: {}", self.id, e);
            }
        }
        if self.dump.tcb {
            if let Err(e) = self.dump_tcbs() {
                warn!("job {}: tcb dump failed: {}", self.id, e);
            }
        }
        Ok(())
    }

    /// Run the job now. From `Bound` this is the trigger of a deferred run.
    pub fn schedule(&mut self) -> Result<()> {
        if self.state == JobState::Bound {
            self.do_trigger = true;
        } else {
            self.is_defer = false;
            self.do_trigger = false;
        }
        self.submit("schedule")
    }

    /// Submit to `partition_id` without starting; a later `schedule` or
    /// `debugger_run` starts the grid.
    pub fn bind_core(&mut self, partition_id: u32) -> Result<()> {
        if matches!(self.state, JobState::Bound) {
            return Err(UmdError::BadState { op: "bind_core", state: self.state });
        }
        let count = self.device.partition_count();
        if partition_id >= count {
            return Err(UmdError::InvalidPartition { partition: partition_id, count });
        }
        self.config.partition_id = partition_id;
        self.is_defer = true;
        self.do_trigger = false;
        self.submit("bind_core")
    }

    /// Trigger a bound job and wait for it.
    pub fn debugger_run(&mut self) -> Result<()> {
        if self.state != JobState::Bound {
            return Err(UmdError::BadState { op: "debugger_run", state: self.state });
        }
        self.do_trigger = true;
        self.submit("debugger_run")?;
        match self.get_status(None)? {
            JobState::Done => Ok(()),
            _ => Err(UmdError::JobException { job_id: self.id }),
        }
    }

    /// Current state; a scheduled job is polled for up to `timeout`
    /// (`None` blocks until it finishes).
    pub fn get_status(&mut self, timeout: Option<Duration>) -> Result<JobState> {
        if self.state != JobState::Scheduled {
            return Ok(self.state);
        }
        if self.layout.subgraphs == 0 {
            self.state = JobState::Done;
            return Ok(self.state);
        }
        match self.device.poll_status(&self.desc, timeout)? {
            JobOutcome::Done => {
                self.state = JobState::Done;
                if self.graph.is_dynamic_shape() && self.dyn_shape.is_configured() {
                    self.dyn_shape.update_output_sizes(self.mem.as_ref(), &mut self.io)?;
                }
            }
            JobOutcome::Exception => {
                warn!("job {}: grid {} raised an exception", self.id, self.grid_id);
                self.state = JobState::Exception;
            }
        }
        Ok(self.state)
    }

    /// Copy `data` into input tensor `index`.
    pub fn load_tensor(&self, index: usize, data: &[u8]) -> Result<()> {
        if self.state == JobState::Scheduled {
            return Err(UmdError::BadState { op: "load_tensor", state: self.state });
        }
        let tensor = self.io.tensor(IoKind::Input, index)?;
        if data.len() != tensor.size as usize {
            return Err(UmdError::TensorSize {
                kind: IoKind::Input.name(),
                index,
                expected: tensor.size,
                actual: data.len(),
            });
        }
        self.mem.write(tensor.pa, data)
    }

    pub fn get_tensor(&self, kind: IoKind, index: usize) -> Result<Vec<u8>> {
        if self.state == JobState::Scheduled {
            return Err(UmdError::BadState { op: "get_tensor", state: self.state });
        }
        let tensor = self.io.tensor(kind, index)?;
        let mut data = vec![0u8; tensor.size as usize];
        self.mem.read(tensor.pa, &mut data)?;
        Ok(data)
    }

    /// Replace the reuse section behind an input or output tensor with
    /// memory supplied by the caller. Every tensor of that section moves
    /// with it. A section holding both an input and an output cannot be
    /// shared.
    pub fn bind_shared_tensor(&mut self, kind: IoKind, index: usize, source: SharedSource) -> Result<()> {
        let other = match kind {
            IoKind::Input => IoKind::Output,
            IoKind::Output => IoKind::Input,
            _ => return Err(UmdError::InvalidTensorId { kind: kind.name(), id: index as u32 }),
        };
        if matches!(self.state, JobState::Scheduled | JobState::Bound) {
            return Err(UmdError::BadState { op: "bind_shared_tensor", state: self.state });
        }
        let section = self.io.tensor(kind, index)?.ref_section;
        if self.io.in_section(other, section).next().is_some() {
            return Err(UmdError::SharedIoConflict { section });
        }

        let (pa, dmabuf) = match source {
            SharedSource::SameProcess { pa } | SharedSource::Customised { pa } => (pa, None),
            SharedSource::DmaBuf { fd, offset } => match self.device.ioctl_cmd(IoctlCmd::DmaBufInfo { fd })? {
                IoctlReply::DmaBuf { pa, bytes } => {
                    let pa = pa.checked_add(offset).ok_or_else(|| UmdError::InvalidArgument {
                        reason: format!("dma-buf fd {}: offset {:#x} overflows", fd, offset),
                    })?;
                    (pa, Some(DmaBufBinding { fd, offset, bytes }))
                }
                reply => return Err(UmdError::transport(format!("dma-buf fd {}: unexpected reply {:?}", fd, reply))),
            },
        };

        let mem = Arc::clone(&self.mem);
        let asid_base = mem.asid_base(0);
        if pa < asid_base {
            return Err(UmdError::InvalidArgument {
                reason: format!("shared buffer @ {:#x} below asid base {:#x}", pa, asid_base),
            });
        }
        let buffers = self
            .buffers
            .subgraph
            .as_mut()
            .ok_or_else(|| UmdError::BufferAllocFailed { reason: format!("job {} has no reuse buffers", self.id) })?;
        let slot = buffers
            .reuses
            .get_mut(section as usize)
            .ok_or_else(|| UmdError::invalid_graph(format!("reuse section {} out of range", section)))?;
        let size = slot.as_ref().map_or(0, |s| s.buf.size);
        let shared = SlotBuffer::imported(BufferDesc::imported(asid_base, pa, size));
        self.io.rebind_section(section, &shared.buf);
        if let Some(old) = slot.replace(shared) {
            old.release(mem.as_ref())?;
        }

        let tensor = self.io.tensor_mut(kind, index)?;
        tensor.dump_ignore = matches!(source, SharedSource::Customised { .. });
        tensor.dmabuf = dmabuf;
        info!("job {}: {} {} shares section {} @ {:#x}", self.id, kind, index, section, pa);

        if self.layout.subgraphs == 0 {
            return Ok(());
        }
        self.patch_bss_params()
    }

    /// Give back every buffer and the group ids. Also done on drop.
    pub fn destroy(mut self) -> Result<()> {
        let result = self.release();
        info!("job {} destroyed", self.id);
        result
    }

    fn release(&mut self) -> Result<()> {
        let result = self.buffers.release(self.mem.as_ref());
        if self.submitted_once {
            self.device.release_job(self.id);
            self.submitted_once = false;
        }
        if self.holds_group_ids {
            self.device.free_group_ids(self.start_group, self.layout.subgraphs as u32);
            self.holds_group_ids = false;
        }
        result
    }

    fn dump_emulation(&self) -> Result<()> {
        let Some(tcbs) = self.buffers.tcbs.as_ref() else {
            return Ok(());
        };
        let default_sim = SimConfig::default();
        let image = EmulationImage {
            config_code: self.device.config_code(),
            sim: self.device.sim_config().unwrap_or(&default_sim),
            gm_size: self.mem.gm_size(),
            graph: &self.graph,
            rodata: self.buffers.rodata.as_ref(),
            descriptor: self.buffers.descriptor.as_ref(),
            tcbs,
            tcb_count: self.layout.total(),
            io: &self.io,
        };
        dump_emulation(self.mem.as_ref(), &self.dump, &image)
    }

    fn dump_tcbs(&self) -> Result<()> {
        if let Some(tcbs) = self.buffers.tcbs.as_ref() {
            let name = format!("{}.job{}.tcb", self.dump.prefix, self.id);
            dump_tcb_chain(self.mem.as_ref(), &self.dump.dir, &name, tcbs, self.layout.total())?;
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn grid_id(&self) -> u16 {
        self.grid_id
    }

    pub fn start_group(&self) -> u16 {
        self.start_group
    }

    pub fn layout(&self) -> ChainLayout {
        self.layout
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Descriptor of the last submission.
    pub fn desc(&self) -> &JobDesc {
        &self.desc
    }

    pub fn tcb_buffer(&self) -> Option<&BufferDesc> {
        self.buffers.tcbs.as_ref()
    }

    pub fn rodata_buffer(&self) -> Option<&BufferDesc> {
        self.buffers.rodata.as_ref()
    }

    pub fn descriptor_buffer(&self) -> Option<&BufferDesc> {
        self.buffers.descriptor.as_ref()
    }

    pub fn global_param_buffer(&self) -> Option<&BufferDesc> {
        self.buffers.global_param.as_ref()
    }

    pub fn subgraph_buffers(&self) -> Option<&SubgraphBuffers> {
        self.buffers.subgraph.as_ref()
    }

    pub fn strategy(&self) -> Option<StrategyKind> {
        self.buffers.subgraph.as_ref().map(|s| s.kind)
    }

    pub fn task_table(&self) -> Option<&TaskTable> {
        self.buffers.tasks.as_ref()
    }

    pub fn io(&self) -> &IoBuffers {
        &self.io
    }

    pub fn tensor(&self, kind: IoKind, index: usize) -> Result<&JobIoBuffer> {
        self.io.tensor(kind, index)
    }

    pub fn segmmu_regs(&self) -> &[SegMmuRegs] {
        &self.segmmu
    }

    /// Chain as currently held in device memory.
    pub fn read_chain(&self) -> Result<Vec<Tcb>> {
        let Some(tcbs) = self.buffers.tcbs.as_ref() else {
            return Ok(Vec::new());
        };
        let mut raw = vec![0u8; self.layout.total() * TCB_SIZE];
        self.mem.read(tcbs.pa, &mut raw)?;
        decode_chain(&raw)
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("job {}: release failed: {}", self.id, e);
        }
    }
}
