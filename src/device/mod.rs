//! Transports that take a finished TCB chain to an NPU.

pub mod hardware;
pub mod ids;
pub mod simulator;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::base::mem::DeviceMemory;
use crate::error::Result;
use crate::sim::config::SimConfig;

pub use hardware::{HardwareDevice, KernelCaps, KernelDriver};
pub use simulator::SimulatorDevice;

pub const JOB_EXEC_FLAG_NONE: u32 = 0;
pub const JOB_EXEC_FLAG_QOS_SLOW: u32 = 1 << 1;
pub const JOB_EXEC_FLAG_QOS_FAST: u32 = 1 << 2;
pub const JOB_EXEC_FLAG_DBG_DISPATCH: u32 = 1 << 3;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    #[default]
    Slow = 0,
    Fast = 1,
}

impl FromStr for Qos {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "slow" => Ok(Self::Slow),
            "fast" => Ok(Self::Fast),
            _ => Err(format!("unsupported qos '{}', expected one of: slow, fast", value)),
        }
    }
}

/// What a transport needs to run one grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobDesc {
    pub job_id: u64,
    pub grid_id: u16,
    pub version_compatible: bool,
    pub hw_config: u32,
    pub hw_version: u32,
    pub head_tcb_pa: u64,
    pub tail_tcb_pa: u64,
    pub tcb_number: u32,
    pub exec_flag: u32,
    pub core_id: u32,
    pub partition_id: u32,
    pub qos: Qos,
    pub is_defer_run: bool,
    pub do_trigger: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Exception,
}

/// Auxiliary requests passed straight through to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    /// resolve a dma-buf fd exported by another driver
    DmaBufInfo { fd: i32 },
    EnableTickCounter,
    DisableTickCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    None,
    DmaBuf { pa: u64, bytes: u64 },
}

pub trait Device: Send + Sync {
    fn name(&self) -> &'static str;
    fn memory(&self) -> Arc<dyn DeviceMemory>;
    /// Target configuration string, e.g. `X3_1304MP2`.
    fn config_code(&self) -> &str;
    fn partition_count(&self) -> u32;
    fn core_count(&self, partition_id: u32) -> Result<u32>;

    fn alloc_grid_id(&self) -> Result<u16>;
    fn alloc_group_ids(&self, count: u32) -> Result<u16>;
    fn free_group_ids(&self, start: u16, count: u32);

    fn schedule(&self, desc: &JobDesc) -> Result<()>;
    /// Block until the job finishes; `None` waits forever.
    fn poll_status(&self, desc: &JobDesc, timeout: Option<Duration>) -> Result<JobOutcome>;
    fn ioctl_cmd(&self, cmd: IoctlCmd) -> Result<IoctlReply>;

    /// Drop whatever the transport still tracks for a job being destroyed.
    fn release_job(&self, _job_id: u64) {}

    /// Simulator settings echoed into emulation dumps.
    fn sim_config(&self) -> Option<&SimConfig> {
        None
    }
}
