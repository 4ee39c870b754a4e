use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::base::mem::{BufferDesc, DeviceMemory, MemRegion};
use crate::device::{
    HardwareDevice, IoctlCmd, IoctlReply, JobDesc, JobOutcome, KernelCaps, KernelDriver, SimulatorDevice,
};
use crate::error::{Result, UmdError};
use crate::graph::{Graph, GraphDesc};
use crate::sim::config::{MemConfig, SimConfig};
use crate::sim::flat_mem::FlatMemory;

/// Two subgraphs, the second waiting on the first; one private section in
/// subgraph 0; params patched in rodata and past it in the descriptor.
pub const TWO_SUBGRAPHS: &str = r#"
arch = "X3_1304"
text = { zeros = 256 }
rodata = { zeros = 64 }
descriptor = { zeros = 32 }
weights = [1, 2, 3, 4, 5, 6, 7, 8]

[[subgraphs]]
id = 0
text = { offset = 0, size = 128 }
rodata = { offset = 0, size = 32 }
private_buffers = [{ size = 256, section_type = "private" }]
private_buffers_map = [{ offset_in_ro = 8, buf_index = 0, offset_in_section = 4 }]

[[subgraphs]]
id = 1
text = { offset = 128, size = 128 }
rodata = { offset = 32, size = 32 }
precursor_cnt = 1
precursors = [0]

[[bss]]
id = 0
stack_size = 4096
reuse_sections = [{ size = 1024 }, { size = 2048 }]
const_sections = [{ slot_index = 0, size = 8, load_offset = 0 }]
param_map = [
    { offset_in_ro = 0, load_type = "reuse", buf_index = 0, offset_in_section = 16 },
    { offset_in_ro = 4, load_type = "static", buf_index = 0 },
    { offset_in_ro = 72, load_type = "reuse", buf_index = 1, addr_mask = 0xFFFF },
]

[[bss.io.inputs]]
id = 0
size = 1024
ref_section = 0

[[bss.io.outputs]]
id = 0
size = 2048
ref_section = 1
"#;

pub fn mem_config() -> MemConfig {
    MemConfig { ddr_size: 0x100_0000, weight_size: 0x10_0000, ..Default::default() }
}

pub fn sim_config() -> SimConfig {
    SimConfig { tick_interval_us: 10, grid_latency: 4, task_latency: 1, ..Default::default() }
}

pub fn graph_desc(text: &str) -> GraphDesc {
    GraphDesc::from_toml(text).expect("graph description")
}

pub fn loaded_graph(desc: GraphDesc, mem: &dyn DeviceMemory) -> Arc<Graph> {
    let mut graph = Graph::from_desc(desc, Path::new(".")).expect("graph");
    graph.load(mem).expect("load");
    Arc::new(graph)
}

/// Device memory that counts allocations by name and can be told to fail
/// one of them.
pub struct TestMemory {
    inner: FlatMemory,
    fail_on: Mutex<Option<String>>,
    mallocs: Mutex<HashMap<String, usize>>,
}

impl TestMemory {
    pub fn new(config: MemConfig) -> Self {
        Self { inner: FlatMemory::new(config), fail_on: Mutex::new(None), mallocs: Mutex::new(HashMap::new()) }
    }

    pub fn fail_on(&self, name: &str) {
        *self.fail_on.lock().unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail_on.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn mallocs(&self, name: &str) -> usize {
        self.mallocs.lock().unwrap_or_else(PoisonError::into_inner).get(name).copied().unwrap_or(0)
    }

    pub fn live_count(&self) -> usize {
        self.inner.live_count()
    }
}

impl DeviceMemory for TestMemory {
    fn malloc(&self, size: u64, align_in_page: u32, name: &str, region: MemRegion) -> Result<BufferDesc> {
        *self.mallocs.lock().unwrap_or_else(PoisonError::into_inner).entry(name.to_string()).or_default() += 1;
        if self.fail_on.lock().unwrap_or_else(PoisonError::into_inner).as_deref() == Some(name) {
            return Err(UmdError::OutOfMemory { name: name.to_string(), size });
        }
        self.inner.malloc(size, align_in_page, name, region)
    }

    fn free(&self, buf: BufferDesc) -> Result<()> {
        self.inner.free(buf)
    }

    fn asid_base(&self, asid: usize) -> u64 {
        self.inner.asid_base(asid)
    }

    fn gm_size(&self) -> u64 {
        self.inner.gm_size()
    }

    fn is_mapped(&self, pa: u64, len: u64) -> bool {
        self.inner.is_mapped(pa, len)
    }

    fn read_impl(&self, pa: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_impl(pa, buf)
    }

    fn write_impl(&self, pa: u64, data: &[u8]) -> Result<()> {
        self.inner.write_impl(pa, data)
    }
}

pub fn simulator(mem: Arc<TestMemory>, config: SimConfig) -> Arc<SimulatorDevice> {
    Arc::new(SimulatorDevice::new(config, mem).expect("simulator"))
}

/// Kernel driver stand-in: records submissions and answers polls with
/// whatever outcome the test set.
#[derive(Default)]
pub struct FakeKernel {
    pub partitions: Vec<u32>,
    pub submitted: Mutex<Vec<JobDesc>>,
    pub outcome: Mutex<Option<JobOutcome>>,
    pub dmabuf: Option<(u64, u64)>,
}

impl FakeKernel {
    pub fn new(partitions: Vec<u32>) -> Self {
        Self { partitions, ..Default::default() }
    }

    pub fn set_outcome(&self, outcome: Option<JobOutcome>) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }

    pub fn submitted(&self) -> Vec<JobDesc> {
        self.submitted.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl KernelDriver for FakeKernel {
    fn capability(&self) -> Result<KernelCaps> {
        Ok(KernelCaps { config_code: "X3_1304MP2".to_string(), partition_cores: self.partitions.clone() })
    }

    fn schedule_job(&self, desc: &JobDesc) -> Result<()> {
        self.submitted.lock().unwrap_or_else(PoisonError::into_inner).push(*desc);
        Ok(())
    }

    fn poll_job(&self, _job_id: u64, _timeout: Option<Duration>) -> Result<Option<JobOutcome>> {
        Ok(*self.outcome.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<IoctlReply> {
        match (cmd, self.dmabuf) {
            (IoctlCmd::DmaBufInfo { .. }, Some((pa, bytes))) => Ok(IoctlReply::DmaBuf { pa, bytes }),
            (IoctlCmd::DmaBufInfo { fd }, None) => Err(UmdError::transport(format!("bad fd {}", fd))),
            _ => Ok(IoctlReply::None),
        }
    }
}

pub fn hardware(mem: Arc<TestMemory>, kernel: FakeKernel) -> Arc<HardwareDevice<FakeKernel>> {
    Arc::new(HardwareDevice::open(kernel, mem).expect("open"))
}
