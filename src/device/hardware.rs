use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::base::mem::DeviceMemory;
use crate::device::ids::{GridIdCounter, GroupIdPool};
use crate::device::{Device, IoctlCmd, IoctlReply, JobDesc, JobOutcome};
use crate::error::{Result, UmdError};

/// What the kernel driver reports at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCaps {
    pub config_code: String,
    /// cores of every partition
    pub partition_cores: Vec<u32>,
}

/// Call boundary of the kernel driver.
pub trait KernelDriver: Send + Sync {
    fn capability(&self) -> Result<KernelCaps>;
    fn schedule_job(&self, desc: &JobDesc) -> Result<()>;
    /// `Ok(None)` when the timeout elapsed first.
    fn poll_job(&self, job_id: u64, timeout: Option<Duration>) -> Result<Option<JobOutcome>>;
    fn ioctl(&self, cmd: IoctlCmd) -> Result<IoctlReply>;
}

/// Hardware transport: one submission per job through the kernel driver,
/// completion through its poll call. Kernel errors pass through unchanged.
pub struct HardwareDevice<K: KernelDriver> {
    driver: K,
    caps: KernelCaps,
    memory: Arc<dyn DeviceMemory>,
    grid_ids: GridIdCounter,
    group_ids: GroupIdPool,
}

impl<K: KernelDriver> HardwareDevice<K> {
    pub fn open(driver: K, memory: Arc<dyn DeviceMemory>) -> Result<Self> {
        let caps = driver.capability()?;
        if caps.partition_cores.is_empty() {
            return Err(UmdError::transport("kernel reports no partitions"));
        }
        info!("hardware {}: {} partitions", caps.config_code, caps.partition_cores.len());
        Ok(Self {
            driver,
            caps,
            memory,
            grid_ids: GridIdCounter::default(),
            group_ids: GroupIdPool::default(),
        })
    }

    pub fn driver(&self) -> &K {
        &self.driver
    }
}

impl<K: KernelDriver> Device for HardwareDevice<K> {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn memory(&self) -> Arc<dyn DeviceMemory> {
        Arc::clone(&self.memory)
    }

    fn config_code(&self) -> &str {
        &self.caps.config_code
    }

    fn partition_count(&self) -> u32 {
        self.caps.partition_cores.len() as u32
    }

    fn core_count(&self, partition_id: u32) -> Result<u32> {
        self.caps
            .partition_cores
            .get(partition_id as usize)
            .copied()
            .ok_or(UmdError::InvalidPartition { partition: partition_id, count: self.partition_count() })
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
        debug!(
            "submit job {} grid {}: head {:#x} tail {:#x} tcbs {}",
            desc.job_id, desc.grid_id, desc.head_tcb_pa, desc.tail_tcb_pa, desc.tcb_number
        );
        self.driver.schedule_job(desc)
    }

    fn poll_status(&self, desc: &JobDesc, timeout: Option<Duration>) -> Result<JobOutcome> {
        match self.driver.poll_job(desc.job_id, timeout)? {
            Some(outcome) => Ok(outcome),
            None => Err(UmdError::Timeout { timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64) }),
        }
    }

    fn ioctl_cmd(&self, cmd: IoctlCmd) -> Result<IoctlReply> {
        self.driver.ioctl(cmd)
    }
}
