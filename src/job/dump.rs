//! Files for replaying a job on the standalone emulator: every input image,
//! a `runtime.cfg` naming them, and a `metadata.txt` with the chain as the
//! device holds it.

use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;

use crate::base::mem::{hi32, lo32, BufferDesc, DeviceMemory};
use crate::error::Result;
use crate::graph::{Graph, IoKind};
use crate::job::io::IoBuffers;
use crate::sim::config::{gm_size_name, Config, SimConfig};
use crate::tcb::{decode_chain, Tcb, TCB_SIZE};

pub const DEFAULT_DUMP_PREFIX: &str = "temp";

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DumpConfig {
    pub dir: PathBuf,
    pub prefix: String,
    pub output_prefix: String,
    /// write the emulator files on every schedule
    pub emulation: bool,
    /// write the raw chain of every schedule
    pub tcb: bool,
}

impl Config for DumpConfig {}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            prefix: DEFAULT_DUMP_PREFIX.to_string(),
            output_prefix: DEFAULT_DUMP_PREFIX.to_string(),
            emulation: false,
            tcb: false,
        }
    }
}

/// Everything of one job the emulator needs.
pub struct EmulationImage<'a> {
    pub config_code: &'a str,
    pub sim: &'a SimConfig,
    pub gm_size: u64,
    pub graph: &'a Graph,
    pub rodata: Option<&'a BufferDesc>,
    pub descriptor: Option<&'a BufferDesc>,
    pub tcbs: &'a BufferDesc,
    pub tcb_count: usize,
    pub io: &'a IoBuffers,
}

struct InputFiles<'a> {
    mem: &'a dyn DeviceMemory,
    config: &'a DumpConfig,
    entries: Vec<(String, u64)>,
}

impl InputFiles<'_> {
    fn add(&mut self, suffix: &str, pa: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let name = format!("{}.{}", self.config.prefix, suffix);
        self.mem.dump_file(pa, size, &self.config.dir.join(&name))?;
        self.entries.push((name, pa));
        Ok(())
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

fn common_section(image: &EmulationImage<'_>, lines: &mut Vec<String>) {
    let sim = image.sim;
    lines.push("[COMMON]".to_string());
    lines.push(format!("CONFIG={}", image.config_code));
    lines.push(format!("ENABLE_AVX={}", bool_str(sim.enable_avx)));
    lines.push(format!("LOG_FILEPATH={}", sim.log_file_path.display()));
    lines.push(format!("LOG_LEVEL={}", sim.log_level));
    lines.push(format!("LOG_VERBOSE={}", bool_str(sim.verbose)));
    lines.push(format!("ENABLE_CALLOC={}", bool_str(sim.enable_calloc)));
    lines.push(format!("EN_L2D={}", bool_str(sim.en_l2d)));
    if let Some(name) = gm_size_name(image.gm_size) {
        lines.push(format!("GM_SIZE={}", name));
    }
    if !sim.plugin_name.is_empty() {
        lines.push(format!("PLUGIN_FILENAME={}", sim.plugin_name));
    }
    lines.push(String::new());

    if sim.en_fast_perf {
        lines.push("[PROFILE]".to_string());
        lines.push("EN_FAST_PERF=1".to_string());
        lines.push(format!("FREQ_MHZ={}", sim.freq_mhz));
        lines.push(format!("DDR_LATENCY_RD={}", sim.ddr_latency_rd));
        lines.push(format!("DDR_LATENCY_WR={}", sim.ddr_latency_wr));
        lines.push(format!("DDR_BW_BITS={}", sim.ddr_bw_bits));
        lines.push(format!("DDR_BW_RATIO={}", sim.ddr_bw_ratio));
        if !sim.perf_report.is_empty() {
            lines.push(format!("PERF_REPORT={}", sim.perf_report));
        }
        if let Some(profiler) = image.io.get(IoKind::Profiler).first() {
            lines.push(format!("PROFILE_BUF_ADDR={:#x}", profiler.pa));
            lines.push(format!("PROFILE_BUF_SIZE={:#x}", profiler.size));
        }
        if !sim.json_filename.is_empty() {
            lines.push(format!("JSON_FILENAME={}", sim.json_filename));
        }
        lines.push(String::new());
    }
}

fn runtime_cfg(mem: &dyn DeviceMemory, config: &DumpConfig, image: &EmulationImage<'_>) -> Result<String> {
    let mut lines = Vec::new();
    common_section(image, &mut lines);

    let mut files = InputFiles { mem, config, entries: Vec::new() };
    if let Some(text) = image.graph.text_buffer() {
        files.add("text", text.pa, image.graph.text.len() as u64)?;
    }
    for bss in 0..image.graph.bss.len() {
        let Some(weight) = image.graph.weight_buffer(bss) else {
            continue;
        };
        if let Some(pool) = &weight.pool {
            files.add("weight", pool.pa, pool.req_size)?;
        }
        if let Some(pool) = &weight.zerocpy_pool {
            files.add("zerocpy_const", pool.pa, pool.req_size)?;
        }
    }
    if let Some(rodata) = image.rodata {
        files.add("ro", rodata.pa, rodata.size)?;
    }
    if let Some(dcr) = image.descriptor {
        files.add("dcr", dcr.pa, dcr.size)?;
    }
    files.add("tcb", image.tcbs.pa, (image.tcb_count * TCB_SIZE) as u64)?;
    for (i, input) in image.io.get(IoKind::Input).iter().enumerate() {
        if input.dump_ignore {
            continue;
        }
        files.add(&format!("input{}", i), input.pa, u64::from(input.size))?;
    }

    lines.push("[INPUT]".to_string());
    lines.push(format!("COUNT={}", files.entries.len()));
    for (id, (name, pa)) in files.entries.iter().enumerate() {
        lines.push(format!("FILE{}={}", id, name));
        lines.push(format!("BASE{}={:#x}", id, pa));
    }
    lines.push(String::new());

    lines.push("[HOST]".to_string());
    lines.push(format!("TCBP_HI={:#x}", hi32(image.tcbs.pa)));
    lines.push(format!("TCBP_LO={:#x}", lo32(image.tcbs.pa)));
    lines.push(format!("TCB_NUM={:#x}", image.tcb_count));
    lines.push(String::new());

    let outputs = image.io.get(IoKind::Output);
    let default_prefix = config.output_prefix.starts_with(DEFAULT_DUMP_PREFIX);
    lines.push("[OUTPUT]".to_string());
    lines.push(format!("COUNT={}", outputs.len()));
    for (i, output) in outputs.iter().enumerate() {
        if output.dump_ignore {
            continue;
        }
        let file = match (default_prefix, i) {
            (true, _) => format!("{}.output{}", config.output_prefix, i),
            (false, 0) => config.output_prefix.clone(),
            (false, _) => format!("{}{}", config.output_prefix, i),
        };
        lines.push(format!("FILE{}={}", i, file));
        lines.push(format!("BASE{}={:#x}", i, output.pa));
        lines.push(format!("SIZE{}={:#x}", i, output.size));
    }
    lines.push(String::new());
    Ok(lines.join("\n"))
}

fn describe_tcb(index: usize, tcb: &Tcb, lines: &mut Vec<String>) {
    match tcb {
        Tcb::GridInit(t) => {
            lines.push(format!("\n***GRID INIT TCB {} ***", index));
            lines.push(format!("flag: {:#x}", t.flag));
            lines.push(format!("group_num: {}", t.group_num));
            lines.push(format!("grid_interrupt_en: {:#x}", t.interrupt_en));
            lines.push(format!("grid_groupid: {}", t.group_id));
            lines.push(format!("grid_gridid: {}", t.grid_id));
            lines.push(format!("gm_ctrl: {:#x}", t.gm_ctrl));
            lines.push(format!("gm_sync: {:#x}", t.gm_sync));
            lines.push(format!("gm_addr_low: {:#x}", t.gm_addr_low));
            lines.push(format!("gm_addr_high: {:#x}", t.gm_addr_high));
        }
        Tcb::GroupInit(t) => {
            lines.push(format!("\n***GROUP INIT TCB {} ***", index));
            lines.push(format!("flag: {:#x}", t.flag));
            lines.push(format!("segmmu_ctrl: {:#x}", t.segmmu_ctrl));
            lines.push(format!("segmmu_remap_ctrl0: {:#x}", t.segmmu_remap_ctrl0));
            lines.push(format!("segmmu_remap_ctrl1: {:#x}", t.segmmu_remap_ctrl1));
            lines.push(format!("group_interrupt_en: {:#x}", t.interrupt_en));
            lines.push(format!("group_groupid: {}", t.group_id));
            lines.push(format!("group_gridid: {}", t.grid_id));
            for j in 0..4 {
                lines.push(format!("segmmu_seg{}_ctrl0: {:#x}", j, t.segmmu_seg_ctrl[2 * j]));
                lines.push(format!("segmmu_seg{}_ctrl1: {:#x}", j, t.segmmu_seg_ctrl[2 * j + 1]));
            }
            for j in 0..4 {
                lines.push(format!("ASID{}_LO: {:#x}", j, t.asids[2 * j]));
                lines.push(format!("ASID{}_HI: {:#x}", j, t.asids[2 * j + 1]));
            }
        }
        Tcb::Task(t) => {
            lines.push(format!("\n***TASK TCB {} ***", index));
            lines.push(format!("flag: {:#x}", t.flag));
            lines.push(format!("start_pc: {:#x}", t.spc));
            lines.push(format!("interrupt_en: {:#x}", t.interrupt_en));
            lines.push(format!("group_id: {}", t.group_id));
            lines.push(format!("grid_id: {}", t.grid_id));
            lines.push(format!("task_id: {}", t.task_id));
            lines.push(format!("warm_len: {}", t.warmup_len));
            for (name, dims) in [("grid_dim", t.grid_dim), ("group_dim", t.group_dim), ("group_id", t.group_idx), ("task_id", t.task_idx)] {
                for (axis, v) in ["x", "y", "z"].iter().zip(dims) {
                    lines.push(format!("{}_{}: {}", name, axis, v));
                }
            }
            lines.push(format!("sp: {:#x}", t.sp));
            lines.push(format!("pp: {:#x}", t.pp));
            lines.push(format!("dp: {:#x}", t.dp));
            lines.push(format!("cp: {:#x}", t.cp));
            lines.push(format!("pprint: {:#x}", t.pprint));
            lines.push(format!("pprofiler: {:#x}", t.pprofiler));
            lines.push(format!("dsize: {:#x}", t.dsize));
            lines.push(format!("tcbp: {:#x}", t.tcbp));
            for (j, dep) in t.group_deps.iter().enumerate() {
                lines.push(format!("group_deps[{}]: {:#x}", j, dep));
            }
        }
    }
}

fn metadata(mem: &dyn DeviceMemory, image: &EmulationImage<'_>) -> Result<String> {
    let mut raw = vec![0u8; image.tcb_count * TCB_SIZE];
    mem.read(image.tcbs.pa, &mut raw)?;
    let chain = decode_chain(&raw)?;

    let mut lines = vec![format!("Total TCBs Count: {}", image.tcb_count)];
    for (j, tcb) in chain.iter().enumerate() {
        describe_tcb(j, tcb, &mut lines);
    }
    lines.push("\n***IO Tensors***".to_string());
    for (kind, label) in [(IoKind::Input, "input"), (IoKind::Output, "output")] {
        for (i, tensor) in image.io.get(kind).iter().enumerate() {
            lines.push(format!("{}{}_addr: {:#x}", label, i, tensor.pa));
            lines.push(format!("{}{}_size: {:#x}", label, i, tensor.size));
        }
    }
    lines.push(String::new());
    Ok(lines.join("\n"))
}

/// Write `runtime.cfg`, `metadata.txt` and the input images into
/// `config.dir`.
pub fn dump_emulation(mem: &dyn DeviceMemory, config: &DumpConfig, image: &EmulationImage<'_>) -> Result<()> {
    std::fs::create_dir_all(&config.dir)?;
    let cfg = runtime_cfg(mem, config, image)?;
    std::fs::write(config.dir.join("runtime.cfg"), cfg)?;
    let meta = metadata(mem, image)?;
    std::fs::write(config.dir.join("metadata.txt"), meta)?;
    info!("emulation files written to {}", config.dir.display());
    Ok(())
}

/// Raw copy of a chain as submitted.
pub fn dump_tcb_chain(mem: &dyn DeviceMemory, dir: &Path, name: &str, tcbs: &BufferDesc, count: usize) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    mem.dump_file(tcbs.pa, (count * TCB_SIZE) as u64, &path)?;
    debug!("{} tcbs dumped to {}", count, path.display());
    Ok(path)
}
