use std::path::PathBuf;
use std::str::FromStr;

use log::warn;
use phf::phf_map;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::*;

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Self::default()
            }
        }
    }
}

/// Target description selected by the `arch` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchDesc {
    pub name: &'static str,
    pub config: u32,
    pub core_count: u32,
}

static ARCH_DESCS: phf::Map<&'static str, ArchDesc> = phf_map! {
    "X3_1304" => ArchDesc { name: "X3_1304", config: 1304, core_count: 1 },
    "X3_1304MP2" => ArchDesc { name: "X3_1304MP2", config: 1304, core_count: 2 },
    "X3_1304MP4" => ArchDesc { name: "X3_1304MP4", config: 1304, core_count: 4 },
};

pub fn arch_desc(name: &str) -> Option<ArchDesc> {
    ARCH_DESCS.get(name).copied()
}

static GM_SIZE_NAMES: phf::Map<u64, &'static str> = phf_map! {
    0x8_0000u64 => "512K",
    0x10_0000u64 => "1M",
    0x20_0000u64 => "2M",
    0x40_0000u64 => "4M",
    0x80_0000u64 => "8M",
    0x100_0000u64 => "16M",
    0x200_0000u64 => "32M",
    0x400_0000u64 => "64M",
};

pub fn gm_size_name(size: u64) -> Option<&'static str> {
    GM_SIZE_NAMES.get(&size).copied()
}

/// Command pool sharing between the two partitions of a cluster.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMode {
    /// one private pool set per partition
    #[default]
    Pcp,
    /// pools shared, partition 1 uses the upper status bits
    Scp,
}

impl FromStr for PartitionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pcp" => Ok(Self::Pcp),
            "scp" => Ok(Self::Scp),
            _ => Err(format!("unsupported partition mode '{}', expected one of: pcp, scp", value)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub arch: String,
    pub log_level: u64,
    pub verbose: bool,
    pub log_file_path: PathBuf,
    pub enable_avx: bool,
    pub enable_calloc: bool,
    pub en_l2d: bool,
    pub plugin_name: String,
    pub json_filename: String,
    pub en_fast_perf: bool,
    pub freq_mhz: u32,
    pub ddr_latency_rd: u32,
    pub ddr_latency_wr: u32,
    pub ddr_bw_bits: u32,
    pub ddr_bw_ratio: f32,
    pub perf_report: String,
    pub partition_mode: PartitionMode,
    pub partition_count: u32,
    pub max_cmdpool_cnt: u32,
    pub cmdpool_capacity: usize,
    pub grid_latency: u64,
    pub task_latency: u64,
    pub latency_jitter: u64,
    pub tick_interval_us: u64,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            arch: "X3_1304".to_string(),
            log_level: 0,
            verbose: false,
            log_file_path: PathBuf::from("./"),
            enable_avx: false,
            enable_calloc: false,
            en_l2d: false,
            plugin_name: String::new(),
            json_filename: String::new(),
            en_fast_perf: false,
            freq_mhz: 1000,
            ddr_latency_rd: 0,
            ddr_latency_wr: 0,
            ddr_bw_bits: 256,
            ddr_bw_ratio: 1.0,
            perf_report: String::new(),
            partition_mode: PartitionMode::Pcp,
            partition_count: 1,
            max_cmdpool_cnt: 4,
            cmdpool_capacity: 4,
            grid_latency: 8,
            task_latency: 2,
            latency_jitter: 0,
            tick_interval_us: 50,
        }
    }
}

/// Device address map of the simulated memory.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct MemConfig {
    pub asid0_base: u64,
    pub asid1_base: u64,
    pub ddr_base: u64,
    pub ddr_size: u64,
    pub weight_base: u64,
    pub weight_size: u64,
    pub sram_base: u64,
    pub sram_size: u64,
    pub dtcm_base: u64,
    pub dtcm_size: u64,
    pub gm_base: u64,
    pub gm_size: u64,
}

impl Config for MemConfig {}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            asid0_base: 0,
            asid1_base: 0,
            ddr_base: 0x8000_0000,
            ddr_size: 0x1000_0000,
            weight_base: 0x9000_0000,
            weight_size: 0x400_0000,
            sram_base: 0x0800_0000,
            sram_size: 0x10_0000,
            dtcm_base: 0x0C00_0000,
            dtcm_size: 0,
            gm_base: 0xC000_0000,
            gm_size: 0,
        }
    }
}
