use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use toml::Table;

use crate::base::mem::DeviceMemory;
use crate::device::{Device, Qos, SimulatorDevice};
use crate::error::Result;
use crate::graph::{Graph, GraphDesc, IoKind};
use crate::job::dump::DumpConfig;
use crate::job::{Job, JobConfig, JobState};
use crate::sim::config::{Config, MemConfig, SimConfig};
use crate::sim::flat_mem::FlatMemory;

#[derive(Parser)]
#[command(version, about)]
pub struct UmdArgs {
    #[arg(help = "Path to config.toml")]
    pub config_path: PathBuf,
    #[arg(long, help = "Override graph description path")]
    pub graph: Option<PathBuf>,
    #[arg(long, help = "Override target arch, e.g. X3_1304MP2")]
    pub arch: Option<String>,
    #[arg(long, help = "Override partition to run on")]
    pub partition: Option<u32>,
    #[arg(long, help = "Override qos (slow, fast)")]
    pub qos: Option<Qos>,
    #[arg(long, help = "Override number of runs")]
    pub runs: Option<u32>,
    #[arg(long, help = "Override poll timeout in milliseconds")]
    pub timeout_ms: Option<u64>,
    #[arg(long, help = "Write emulator input files on every run")]
    pub dump: Option<bool>,
    #[arg(long, help = "Emulator log level written to dumps")]
    pub log: Option<u64>,
}

/// What to run and where the tensors come from.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    pub graph: PathBuf,
    /// one raw file per input tensor, in tensor order
    pub inputs: Vec<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub runs: u32,
    pub timeout_ms: Option<u64>,
}

impl Config for RunConfig {}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            graph: PathBuf::from("graph.toml"),
            inputs: Vec::new(),
            output_dir: None,
            runs: 1,
            timeout_ms: Some(10_000),
        }
    }
}

pub struct UmdSetup {
    pub sim: SimConfig,
    pub mem: MemConfig,
    pub job: JobConfig,
    pub dump: DumpConfig,
    pub run: RunConfig,
}

/// Read every section of the TOML configuration.
/// If `cli_args` is given, override TOML options with CLI arguments.
pub fn make_setup(toml_string: &str, cli_args: Option<UmdArgs>) -> std::result::Result<UmdSetup, toml::de::Error> {
    let config_table: Table = toml::from_str(toml_string)?;
    let mut sim = SimConfig::from_section(config_table.get("sim"));
    let mem = MemConfig::from_section(config_table.get("mem"));
    let mut job = JobConfig::from_section(config_table.get("job"));
    let mut dump = DumpConfig::from_section(config_table.get("dump"));
    let mut run = RunConfig::from_section(config_table.get("run"));

    if let Some(args) = cli_args {
        run.graph = args.graph.unwrap_or(run.graph);
        sim.arch = args.arch.unwrap_or(sim.arch);
        job.partition_id = args.partition.unwrap_or(job.partition_id);
        job.qos = args.qos.unwrap_or(job.qos);
        run.runs = args.runs.unwrap_or(run.runs);
        run.timeout_ms = args.timeout_ms.or(run.timeout_ms);
        dump.emulation = args.dump.unwrap_or(dump.emulation);
        sim.log_level = args.log.unwrap_or(sim.log_level);
    }

    Ok(UmdSetup { sim, mem, job, dump, run })
}

pub fn make_device(setup: &UmdSetup) -> Result<Arc<SimulatorDevice>> {
    let memory: Arc<dyn DeviceMemory> = Arc::new(FlatMemory::new(setup.mem));
    Ok(Arc::new(SimulatorDevice::new(setup.sim.clone(), memory)?))
}

#[derive(Debug, Serialize, Default)]
pub struct RunSummary {
    pub graph: String,
    pub job_id: u64,
    pub grid_id: u16,
    pub tcb_count: usize,
    pub strategy: String,
    pub runs: Vec<RunRecord>,
}

#[derive(Debug, Serialize)]
pub struct RunRecord {
    pub state: String,
    pub elapsed_us: u128,
    pub output_bytes: Vec<u32>,
}

pub fn load_graph(path: &Path, mem: &dyn DeviceMemory) -> Result<Graph> {
    let desc = GraphDesc::from_path(path)?;
    let mut graph = Graph::from_desc(desc, path.parent().unwrap_or(Path::new(".")))?;
    graph.load(mem)?;
    Ok(graph)
}

/// Load the graph, run one job on it `setup.run.runs` times and release
/// everything again.
pub fn run(setup: &UmdSetup, device: Arc<dyn Device>) -> Result<RunSummary> {
    let mem = device.memory();
    let mut graph = Arc::new(load_graph(&setup.run.graph, mem.as_ref())?);

    let result = run_job(setup, Arc::clone(&graph), device);
    match Arc::get_mut(&mut graph) {
        Some(graph) => graph.unload(mem.as_ref())?,
        None => warn!("graph still referenced, left loaded"),
    }
    result
}

fn run_job(setup: &UmdSetup, graph: Arc<Graph>, device: Arc<dyn Device>) -> Result<RunSummary> {
    let mut job = Job::create(graph, device, setup.job.clone(), setup.dump.clone())?;
    for (index, path) in setup.run.inputs.iter().enumerate() {
        job.load_tensor(index, &std::fs::read(path)?)?;
    }

    let mut summary = RunSummary {
        graph: setup.run.graph.display().to_string(),
        job_id: job.id(),
        grid_id: job.grid_id(),
        tcb_count: job.layout().total(),
        strategy: job.strategy().map_or_else(|| "none".to_string(), |k| format!("{:?}", k)),
        runs: Vec::new(),
    };
    let timeout = setup.run.timeout_ms.map(Duration::from_millis);
    for round in 0..setup.run.runs {
        let start = Instant::now();
        job.schedule()?;
        let state = job.get_status(timeout)?;
        let elapsed_us = start.elapsed().as_micros();
        info!("run {}: {:?} after {}us", round, state, elapsed_us);
        summary.runs.push(RunRecord {
            state: format!("{:?}", state),
            elapsed_us,
            output_bytes: job.io().get(IoKind::Output).iter().map(|t| t.size).collect(),
        });
        if state != JobState::Done {
            break;
        }
    }

    if let Some(dir) = &setup.run.output_dir {
        std::fs::create_dir_all(dir)?;
        for index in 0..job.io().get(IoKind::Output).len() {
            let data = job.get_tensor(IoKind::Output, index)?;
            std::fs::write(dir.join(format!("output{}.bin", index)), data)?;
        }
    }
    job.destroy()?;
    Ok(summary)
}
