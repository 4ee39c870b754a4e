use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::base::mem::{hi32, lo32, DeviceMemory};
use crate::device::ids::{GridIdCounter, GroupIdPool};
use crate::device::{Device, IoctlCmd, IoctlReply, JobDesc, JobOutcome};
use crate::error::{Result, UmdError};
use crate::sim::command_proc::is_cmdpool_full;
use crate::sim::config::{arch_desc, ArchDesc, SimConfig};
use crate::sim::npu::{
    max_cmdpool_cnt, sched_ctrl, SimEvent, SimNpu, SimRunner, CREATE_CMD_POOL, DISPATCH_CMD_POOL, TSM_BUILD_INFO,
    TSM_CMD_SCHED_ADDR_HI, TSM_CMD_SCHED_ADDR_LO, TSM_CMD_SCHED_CTRL, TSM_CMD_TCB_NUMBER, TSM_STATUS,
};

/// Grids the simulator may hold at once across all pools.
pub const MAX_INFLIGHT_GRIDS: usize = 16;
const CLUSTER: u32 = 0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct SchedState {
    /// admitted in order, front first
    pending: VecDeque<JobDesc>,
    /// grid id -> job id
    inflight: HashMap<u16, u64>,
    /// deferred jobs waiting for their trigger
    bound: HashMap<u64, JobDesc>,
    /// destroyed while their grid was still running
    abandoned: HashSet<u64>,
}

#[derive(Debug, Default)]
struct CompletionState {
    grids: Vec<(u16, JobOutcome)>,
    finished: HashMap<u64, JobOutcome>,
}

#[derive(Debug, Default)]
struct Completions {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl Completions {
    fn push_grid(&self, grid_id: u16, outcome: JobOutcome) {
        lock(&self.state).grids.push((grid_id, outcome));
        self.cond.notify_all();
    }

    fn finish(&self, jobs: impl IntoIterator<Item = (u64, JobOutcome)>) {
        let mut state = lock(&self.state);
        state.finished.extend(jobs);
        self.cond.notify_all();
    }
}

/// Simulator transport. Jobs go through command pools of an in-process
/// [`SimNpu`]; jobs that find their pool full wait in a FIFO and are
/// admitted from the poll loop as grids retire.
///
/// Lock order: `poll_lock`, then `sched`, then the npu. `completions` is
/// never held while taking any of the others.
pub struct SimulatorDevice {
    config: SimConfig,
    arch: ArchDesc,
    memory: Arc<dyn DeviceMemory>,
    npu: Arc<Mutex<SimNpu>>,
    sched: RwLock<SchedState>,
    completions: Arc<Completions>,
    poll_lock: Mutex<()>,
    grid_ids: GridIdCounter,
    group_ids: GroupIdPool,
    cmdpool_count: u32,
    _runner: SimRunner,
}

impl SimulatorDevice {
    pub fn new(config: SimConfig, memory: Arc<dyn DeviceMemory>) -> Result<Self> {
        let arch = arch_desc(&config.arch)
            .ok_or_else(|| UmdError::transport(format!("unsupported arch '{}'", config.arch)))?;
        if config.partition_count == 0 {
            return Err(UmdError::transport("simulator configured with no partitions"));
        }

        let completions = Arc::new(Completions::default());
        let mut npu = SimNpu::new(&config, Arc::clone(&memory));
        let sink = Arc::clone(&completions);
        npu.set_event_handler(Box::new(move |event| match event {
            SimEvent::GridEnd { grid_id } => sink.push_grid(grid_id, JobOutcome::Done),
            SimEvent::GridFault { grid_id } => sink.push_grid(grid_id, JobOutcome::Exception),
        }));
        let cmdpool_count = max_cmdpool_cnt(npu.read_register(TSM_BUILD_INFO)?);
        let npu = Arc::new(Mutex::new(npu));
        let runner = SimRunner::spawn(Arc::clone(&npu), Duration::from_micros(config.tick_interval_us));

        info!(
            "simulator {}: {} partitions x {} cores, {} command pools of capacity {}",
            arch.name, config.partition_count, arch.core_count, cmdpool_count, config.cmdpool_capacity
        );
        Ok(Self {
            config,
            arch,
            memory,
            npu,
            sched: RwLock::new(SchedState::default()),
            completions,
            poll_lock: Mutex::new(()),
            grid_ids: GridIdCounter::default(),
            group_ids: GroupIdPool::default(),
            cmdpool_count,
            _runner: runner,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Command pools the NPU reports in its build info register.
    pub fn cmdpool_count(&self) -> u32 {
        self.cmdpool_count
    }

    pub fn pending_len(&self) -> usize {
        self.sched.read().unwrap_or_else(PoisonError::into_inner).pending.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.sched.read().unwrap_or_else(PoisonError::into_inner).inflight.len()
    }

    pub fn bound_len(&self) -> usize {
        self.sched.read().unwrap_or_else(PoisonError::into_inner).bound.len()
    }

    /// Outcomes collected but not yet polled.
    pub fn finished_len(&self) -> usize {
        lock(&self.completions.state).finished.len()
    }

    /// Stop the simulated clock; grids stay in their pools.
    pub fn halt(&self) {
        lock(&self.npu).halt();
    }

    pub fn resume(&self) {
        lock(&self.npu).resume();
    }

    fn sched_mut(&self) -> RwLockWriteGuard<'_, SchedState> {
        self.sched.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, npu: &mut SimNpu, desc: &JobDesc) -> Result<()> {
        let ctrl = sched_ctrl(desc.partition_id, CLUSTER, desc.qos);
        npu.write_register(TSM_CMD_SCHED_ADDR_HI, hi32(desc.head_tcb_pa))?;
        npu.write_register(TSM_CMD_SCHED_ADDR_LO, lo32(desc.head_tcb_pa))?;
        npu.write_register(TSM_CMD_TCB_NUMBER, desc.tcb_number)?;
        npu.write_register(TSM_CMD_SCHED_CTRL, ctrl | CREATE_CMD_POOL)?;
        npu.write_register(TSM_CMD_SCHED_CTRL, ctrl | DISPATCH_CMD_POOL)
    }

    /// Move jobs from the front of the pending FIFO into free pools. Returns
    /// the jobs whose dispatch failed; they are no longer tracked.
    fn admit(&self, sched: &mut SchedState) -> Vec<(u64, UmdError)> {
        let mut failed = Vec::new();
        let mut npu = lock(&self.npu);
        while let Some(desc) = sched.pending.front().copied() {
            if sched.inflight.len() >= MAX_INFLIGHT_GRIDS {
                debug!("sim: {} grids in flight, job {} waits", sched.inflight.len(), desc.job_id);
                break;
            }
            let status = match npu.read_register(TSM_STATUS) {
                Ok(status) => status,
                Err(e) => {
                    error!("sim: status read failed: {}", e);
                    break;
                }
            };
            if is_cmdpool_full(desc.qos, desc.partition_id, self.config.partition_mode, CLUSTER, status) {
                debug!("sim: {:?} pool of partition {} full, job {} waits", desc.qos, desc.partition_id, desc.job_id);
                break;
            }

            sched.pending.pop_front();
            sched.inflight.insert(desc.grid_id, desc.job_id);
            match self.dispatch(&mut npu, &desc) {
                Ok(()) => debug!("sim: job {} admitted as grid {}", desc.job_id, desc.grid_id),
                Err(e) => {
                    sched.inflight.remove(&desc.grid_id);
                    failed.push((desc.job_id, e));
                }
            }
        }
        failed
    }

    /// Match retired grids to their jobs, then refill the pools.
    fn drain(&self) {
        let _poll = lock(&self.poll_lock);
        let grids = std::mem::take(&mut lock(&self.completions.state).grids);

        let mut sched = self.sched_mut();
        let mut finished = Vec::with_capacity(grids.len());
        for (grid_id, outcome) in grids {
            match sched.inflight.remove(&grid_id) {
                Some(job_id) if sched.abandoned.remove(&job_id) => {
                    debug!("sim: grid {} of destroyed job {} retired", grid_id, job_id)
                }
                Some(job_id) => finished.push((job_id, outcome)),
                None => warn!("sim: grid {} retired but no job is waiting on it", grid_id),
            }
        }
        for (job_id, e) in self.admit(&mut sched) {
            error!("sim: dispatch of job {} failed: {}", job_id, e);
            finished.push((job_id, JobOutcome::Exception));
        }
        drop(sched);

        self.completions.finish(finished);
    }
}

impl Device for SimulatorDevice {
    fn name(&self) -> &'static str {
        "simulator"
    }

    fn memory(&self) -> Arc<dyn DeviceMemory> {
        Arc::clone(&self.memory)
    }

    fn config_code(&self) -> &str {
        self.arch.name
    }

    fn partition_count(&self) -> u32 {
        self.config.partition_count
    }

    fn core_count(&self, partition_id: u32) -> Result<u32> {
        if partition_id >= self.config.partition_count {
            return Err(UmdError::InvalidPartition { partition: partition_id, count: self.config.partition_count });
        }
        Ok(self.arch.core_count)
    }

    fn alloc_grid_id(&self) -> Result<u16> {
        Ok(self.grid_ids.next())
    }

    fn alloc_group_ids(&self, count: u32) -> Result<u16> {
        self.group_ids.alloc(count)
    }

    fn free_group_ids(&self, start: u16, count: u32) {
        self.group_ids.free(start, count)
    }

    fn schedule(&self, desc: &JobDesc) -> Result<()> {
        let mut sched = self.sched_mut();
        if desc.is_defer_run && !desc.do_trigger {
            debug!("sim: job {} bound, waiting for trigger", desc.job_id);
            sched.bound.insert(desc.job_id, *desc);
            return Ok(());
        }
        if sched.bound.remove(&desc.job_id).is_some() {
            debug!("sim: job {} triggered", desc.job_id);
        }
        lock(&self.completions.state).finished.remove(&desc.job_id);

        sched.pending.push_back(*desc);
        let mut own = None;
        let mut others = Vec::new();
        for (job_id, e) in self.admit(&mut sched) {
            if job_id == desc.job_id {
                own = Some(e);
            } else {
                error!("sim: dispatch of job {} failed: {}", job_id, e);
                others.push((job_id, JobOutcome::Exception));
            }
        }
        drop(sched);

        if !others.is_empty() {
            self.completions.finish(others);
        }
        own.map_or(Ok(()), Err)
    }

    fn poll_status(&self, desc: &JobDesc, timeout: Option<Duration>) -> Result<JobOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let mut state = lock(&self.completions.state);
                loop {
                    if let Some(outcome) = state.finished.remove(&desc.job_id) {
                        return Ok(outcome);
                    }
                    if !state.grids.is_empty() {
                        break;
                    }
                    state = match deadline {
                        None => self.completions.cond.wait(state).unwrap_or_else(PoisonError::into_inner),
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Err(UmdError::Timeout {
                                    timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
                                });
                            }
                            self.completions
                                .cond
                                .wait_timeout(state, deadline - now)
                                .unwrap_or_else(PoisonError::into_inner)
                                .0
                        }
                    };
                }
            }
            self.drain();
        }
    }

    fn ioctl_cmd(&self, cmd: IoctlCmd) -> Result<IoctlReply> {
        match cmd {
            IoctlCmd::DmaBufInfo { fd } => {
                Err(UmdError::transport(format!("dma-buf fd {} cannot be imported by the simulator", fd)))
            }
            IoctlCmd::EnableTickCounter | IoctlCmd::DisableTickCounter => {
                debug!("sim: {:?} ignored", cmd);
                Ok(IoctlReply::None)
            }
        }
    }

    fn release_job(&self, job_id: u64) {
        let mut sched = self.sched_mut();
        sched.bound.remove(&job_id);
        sched.pending.retain(|desc| desc.job_id != job_id);
        if sched.inflight.values().any(|&id| id == job_id) {
            sched.abandoned.insert(job_id);
        }
        drop(sched);
        lock(&self.completions.state).finished.remove(&job_id);
    }

    fn sim_config(&self) -> Option<&SimConfig> {
        Some(&self.config)
    }
}
