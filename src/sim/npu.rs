use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::base::behavior::ModuleBehaviors;
use crate::base::mem::DeviceMemory;
use crate::device::Qos;
use crate::error::{Result, UmdError};
use crate::sim::command_proc::{CommandProcessor, GridRun};
use crate::sim::config::SimConfig;
use crate::tcb::{decode_chain, Tcb, TCB_SIZE};
use crate::timeq::{Cycle, LatencyModel};

pub const TSM_CMD_SCHED_CTRL: u32 = 0x00;
pub const TSM_CMD_SCHED_ADDR_HI: u32 = 0x08;
pub const TSM_CMD_SCHED_ADDR_LO: u32 = 0x0C;
pub const TSM_BUILD_INFO: u32 = 0x14;
pub const TSM_STATUS: u32 = 0x18;
pub const TSM_CMD_TCB_NUMBER: u32 = 0x1C;

pub const CREATE_CMD_POOL: u32 = 0x1;
pub const DISPATCH_CMD_POOL: u32 = 0x2;
const CMD_POOL_OP_MASK: u32 = 0xFF;

pub fn sched_ctrl(partition_id: u32, pool_id: u32, qos: Qos) -> u32 {
    ((partition_id & 0x3) << 19) | ((pool_id & 0x7) << 16) | ((qos as u32) << 8)
}

pub fn max_cmdpool_cnt(build_info: u32) -> u32 {
    ((build_info >> 16) & 0xF) + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    GridEnd { grid_id: u16 },
    GridFault { grid_id: u16 },
}

pub type EventHandler = Box<dyn Fn(SimEvent) + Send + Sync>;

/// Register-level model of the NPU task scheduler. Grids are accepted into
/// command pools, checked by reading their chain back from device memory,
/// and retired after their ticket expires, raising an event per grid.
pub struct SimNpu {
    cycle: Cycle,
    halted: bool,
    memory: Arc<dyn DeviceMemory>,
    cmd_proc: CommandProcessor,
    latency: LatencyModel,
    rng: StdRng,
    build_info: u32,
    addr_hi: u32,
    addr_lo: u32,
    tcb_number: u32,
    created_pool: Option<u32>,
    handler: Option<EventHandler>,
    retired: u64,
}

impl SimNpu {
    pub fn new(config: &SimConfig, memory: Arc<dyn DeviceMemory>) -> Self {
        let cmdpools = config.max_cmdpool_cnt.clamp(1, 16);
        Self {
            cycle: 0,
            halted: false,
            memory,
            cmd_proc: CommandProcessor::new(config.partition_mode, config.cmdpool_capacity),
            latency: LatencyModel {
                grid_latency: config.grid_latency,
                task_latency: config.task_latency,
                jitter: config.latency_jitter,
            },
            rng: StdRng::from_entropy(),
            build_info: ((cmdpools - 1) & 0xF) << 16,
            addr_hi: 0,
            addr_lo: 0,
            tcb_number: 0,
            created_pool: None,
            handler: None,
            retired: 0,
        }
    }

    pub fn set_event_handler(&mut self, handler: EventHandler) {
        self.handler = Some(handler);
    }

    pub fn read_register(&self, offset: u32) -> Result<u32> {
        match offset {
            TSM_STATUS => Ok(self.cmd_proc.status()),
            TSM_BUILD_INFO => Ok(self.build_info),
            TSM_CMD_SCHED_ADDR_HI => Ok(self.addr_hi),
            TSM_CMD_SCHED_ADDR_LO => Ok(self.addr_lo),
            TSM_CMD_TCB_NUMBER => Ok(self.tcb_number),
            _ => Err(UmdError::transport(format!("read of unmapped register {:#x}", offset))),
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32) -> Result<()> {
        match offset {
            TSM_CMD_SCHED_ADDR_HI => self.addr_hi = value,
            TSM_CMD_SCHED_ADDR_LO => self.addr_lo = value,
            TSM_CMD_TCB_NUMBER => self.tcb_number = value,
            TSM_CMD_SCHED_CTRL => match value & CMD_POOL_OP_MASK {
                CREATE_CMD_POOL => self.created_pool = Some(value & !CMD_POOL_OP_MASK),
                DISPATCH_CMD_POOL => self.dispatch(value & !CMD_POOL_OP_MASK)?,
                op => return Err(UmdError::transport(format!("unknown command pool op {:#x}", op))),
            },
            _ => return Err(UmdError::transport(format!("write of unmapped register {:#x}", offset))),
        }
        Ok(())
    }

    fn dispatch(&mut self, ctrl: u32) -> Result<()> {
        if self.created_pool != Some(ctrl) {
            return Err(UmdError::transport(format!("dispatch to pool {:#x} that was not created", ctrl)));
        }
        let partition_id = (ctrl >> 19) & 0x3;
        let pool_id = (ctrl >> 16) & 0x7;
        let qos = if (ctrl >> 8) & 1 == 1 { Qos::Fast } else { Qos::Slow };
        let head = ((self.addr_hi as u64) << 32) | self.addr_lo as u64;

        let (grid_id, tasks, faulted) = self.inspect_chain(head, self.tcb_number)?;
        let ticket = self.latency.issue(self.cycle, tasks, &mut self.rng);
        let run = GridRun { grid_id, head, tcb_number: self.tcb_number, faulted, ticket };
        if self.cmd_proc.dispatch(run, qos, partition_id, pool_id).is_err() {
            return Err(UmdError::transport(format!("command pool {} full, grid {} dropped", pool_id, grid_id)));
        }
        debug!(
            "sim: grid {} dispatched to pool {} ({:?}), {} tasks, retires @ {}",
            grid_id,
            pool_id,
            qos,
            tasks,
            ticket.ready_at()
        );
        Ok(())
    }

    /// Read the chain back and check its shape. Returns the grid id, the
    /// task count and whether the chain is malformed.
    fn inspect_chain(&self, head: u64, count: u32) -> Result<(u16, u64, bool)> {
        let mut bytes = vec![0u8; count as usize * TCB_SIZE];
        self.memory.read(head, &mut bytes)?;
        let tcbs = decode_chain(&bytes)?;
        let Some(Tcb::GridInit(grid)) = tcbs.first() else {
            return Err(UmdError::transport(format!("chain @ {:#x} does not open with a grid-init tcb", head)));
        };
        let groups = tcbs.iter().filter(|t| matches!(t, Tcb::GroupInit(_))).count() as u32;
        let tasks = tcbs.iter().filter(|t| matches!(t, Tcb::Task(_))).count() as u64;
        let grid_ends = tcbs.iter().filter(|t| t.is_grid_end()).count();
        let closed = matches!(tcbs.last(), Some(t @ Tcb::Task(_)) if t.is_grid_end());
        let faulted = groups != grid.group_num || tasks == 0 || grid_ends != 1 || !closed;
        if faulted {
            warn!("sim: grid {} chain malformed ({} groups declared, {} found)", grid.grid_id, grid.group_num, groups);
        }
        Ok((grid.grid_id, tasks, faulted))
    }

    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn resume(&mut self) {
        self.halted = false;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn inflight(&self) -> usize {
        self.cmd_proc.inflight()
    }

    pub fn retired(&self) -> u64 {
        self.retired
    }
}

impl ModuleBehaviors for SimNpu {
    fn tick_one(&mut self) {
        if self.halted {
            return;
        }
        self.cycle += 1;
        for run in self.cmd_proc.retire(self.cycle) {
            self.retired += 1;
            debug!("sim: grid {} retired after {} cycles", run.grid_id, self.cycle - run.ticket.issued_at());
            let event = if run.faulted {
                SimEvent::GridFault { grid_id: run.grid_id }
            } else {
                SimEvent::GridEnd { grid_id: run.grid_id }
            };
            match &self.handler {
                Some(handler) => handler(event),
                None => error!("sim: {:?} with no event handler installed", event),
            }
        }
    }

    fn reset(&mut self) {
        self.cycle = 0;
        self.cmd_proc.reset();
        self.created_pool = None;
        self.retired = 0;
    }
}

/// Background thread ticking a [`SimNpu`]; stops and joins on drop.
pub struct SimRunner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimRunner {
    pub fn spawn(npu: Arc<Mutex<SimNpu>>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                npu.lock().unwrap_or_else(PoisonError::into_inner).tick_one();
                std::thread::sleep(interval);
            }
        });
        info!("sim: runner started, tick every {:?}", interval);
        Self { stop, handle: Some(handle) }
    }
}

impl Drop for SimRunner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("sim: runner thread panicked");
            }
        }
    }
}
