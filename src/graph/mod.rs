//! In-memory model of a parsed executable graph.
//!
//! A graph is built once from a [`desc::GraphDesc`] and is read-only
//! afterwards, except for [`Graph::load`]/[`Graph::unload`] which place its
//! shared sections (text, constant rodata, weights) in device memory.

pub mod desc;
pub mod load;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer};
use smallvec::SmallVec;

use crate::base::mem::BufferDesc;
use crate::error::{Result, UmdError};

pub use desc::{Blob, GraphDesc};
pub use load::{LoadedGraph, WeightBuffer};

/// Precursor tag meaning "depends on every earlier group".
pub const SUBG_DEPEND_PREALL: i32 = -1;
pub const SUBG_DEPEND_NONE: i32 = 0;
pub const MAX_PRECURSORS: usize = 4;

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct SectionRange {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    #[default]
    Reuse,
    Static,
    ZeroCopyStatic,
    Private,
}

/// One declared memory section.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct GraphSectionDesc {
    pub slot_index: u32,
    pub size: u64,
    /// `PAGE_SIZE << align_in_page` byte alignment
    pub align_in_page: u32,
    /// offset inside the owning pooled buffer, set once laid out
    pub relative_addr: u64,
    /// offset of the initial contents inside the graph's weight image
    pub load_offset: u64,
    pub section_type: SectionType,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamLoadType {
    #[default]
    Reuse,
    Static,
    Private,
}

/// A word in rodata (or, past the end of rodata, in the descriptor section)
/// that receives the address of a buffer at job init.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ParamMapEntry {
    pub offset_in_ro: u32,
    pub load_type: ParamLoadType,
    pub buf_index: u32,
    pub offset_in_section: u32,
    pub addr_mask: u32,
}

impl Default for ParamMapEntry {
    fn default() -> Self {
        Self {
            offset_in_ro: 0,
            load_type: ParamLoadType::Reuse,
            buf_index: 0,
            offset_in_section: 0,
            addr_mask: u32::MAX,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    U8,
    S8,
    U16,
    S16,
    F16,
    Bf16,
    U32,
    S32,
    F32,
}

impl DataType {
    pub fn size(self) -> u32 {
        match self {
            DataType::U8 | DataType::S8 => 1,
            DataType::U16 | DataType::S16 | DataType::F16 | DataType::Bf16 => 2,
            DataType::U32 | DataType::S32 | DataType::F32 => 4,
        }
    }
}

/// A tensor living inside one reuse section.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct IoTensorDesc {
    pub id: u32,
    pub size: u32,
    pub ref_section: u32,
    pub offset_in_section: u32,
    pub data_type: DataType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IoKind {
    Input,
    Output,
    InterDump,
    Profiler,
    Printf,
    LayerCounter,
    ErrorCode,
    SegMmu,
    OutputShape,
}

impl IoKind {
    pub fn name(self) -> &'static str {
        match self {
            IoKind::Input => "input",
            IoKind::Output => "output",
            IoKind::InterDump => "inter_dump",
            IoKind::Profiler => "profiler",
            IoKind::Printf => "printf",
            IoKind::LayerCounter => "layer_counter",
            IoKind::ErrorCode => "err_code",
            IoKind::SegMmu => "segmmu",
            IoKind::OutputShape => "outputs_shape",
        }
    }
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct IoTensors {
    pub inputs: Vec<IoTensorDesc>,
    pub outputs: Vec<IoTensorDesc>,
    pub inter_dumps: Vec<IoTensorDesc>,
    pub profiler: Vec<IoTensorDesc>,
    pub printf: Vec<IoTensorDesc>,
    pub layer_counter: Vec<IoTensorDesc>,
    pub err_code: Vec<IoTensorDesc>,
    pub segmmus: Vec<IoTensorDesc>,
    pub outputs_shape: Vec<IoTensorDesc>,
}

impl IoTensors {
    pub fn get(&self, kind: IoKind) -> &[IoTensorDesc] {
        match kind {
            IoKind::Input => &self.inputs,
            IoKind::Output => &self.outputs,
            IoKind::InterDump => &self.inter_dumps,
            IoKind::Profiler => &self.profiler,
            IoKind::Printf => &self.printf,
            IoKind::LayerCounter => &self.layer_counter,
            IoKind::ErrorCode => &self.err_code,
            IoKind::SegMmu => &self.segmmus,
            IoKind::OutputShape => &self.outputs_shape,
        }
    }

    fn get_mut(&mut self, kind: IoKind) -> &mut Vec<IoTensorDesc> {
        match kind {
            IoKind::Input => &mut self.inputs,
            IoKind::Output => &mut self.outputs,
            IoKind::InterDump => &mut self.inter_dumps,
            IoKind::Profiler => &mut self.profiler,
            IoKind::Printf => &mut self.printf,
            IoKind::LayerCounter => &mut self.layer_counter,
            IoKind::ErrorCode => &mut self.err_code,
            IoKind::SegMmu => &mut self.segmmus,
            IoKind::OutputShape => &mut self.outputs_shape,
        }
    }

    pub const KINDS: [IoKind; 9] = [
        IoKind::Input,
        IoKind::Output,
        IoKind::InterDump,
        IoKind::Profiler,
        IoKind::Printf,
        IoKind::LayerCounter,
        IoKind::ErrorCode,
        IoKind::SegMmu,
        IoKind::OutputShape,
    ];

    /// Order every tensor group by id; ids must be dense from 0. SegMMU ids
    /// are bit fields and keep their declared order.
    pub fn sort_by_id(&mut self) -> Result<()> {
        for kind in Self::KINDS {
            if kind == IoKind::SegMmu {
                continue;
            }
            let tensors = self.get_mut(kind);
            let len = tensors.len();
            if let Some(bad) = tensors.iter().find(|t| t.id as usize >= len) {
                return Err(UmdError::InvalidTensorId { kind: kind.name(), id: bad.id });
            }
            tensors.sort_by_key(|t| t.id);
            if tensors.windows(2).any(|w| w[0].id == w[1].id) {
                return Err(UmdError::invalid_graph(format!("duplicate {} tensor id", kind)));
            }
        }
        Ok(())
    }
}

/// Dependency of a subgraph on earlier groups of the same grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    None,
    Groups(SmallVec<[u32; MAX_PRECURSORS]>),
    PreAll,
}

/// One schedulable unit of compute.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Subgraph {
    pub id: u32,
    pub bss_idx: u32,
    pub text: SectionRange,
    pub rodata: SectionRange,
    pub dcr: SectionRange,
    pub printfifo_size: u32,
    pub profiler_buf_size: u32,
    pub private_data_size: u32,
    pub warmup_len: u16,
    pub precursors: SmallVec<[u32; MAX_PRECURSORS]>,
    pub precursor_cnt: i32,
    pub private_buffers_map: Vec<ParamMapEntry>,
    pub private_buffers: Vec<GraphSectionDesc>,
}

impl Subgraph {
    pub fn depends_on_all(&self) -> bool {
        self.precursor_cnt == SUBG_DEPEND_PREALL
    }

    pub fn dependency(&self) -> Result<Dependency> {
        match self.precursor_cnt {
            SUBG_DEPEND_NONE => Ok(Dependency::None),
            SUBG_DEPEND_PREALL => Ok(Dependency::PreAll),
            cnt if cnt > 0 && cnt as usize <= MAX_PRECURSORS => {
                let cnt = cnt as usize;
                if self.precursors.len() < cnt {
                    return Err(UmdError::InvalidDependency {
                        subgraph: self.id,
                        reason: format!("count {} but {} precursors listed", cnt, self.precursors.len()),
                    });
                }
                Ok(Dependency::Groups(self.precursors[..cnt].iter().copied().collect()))
            }
            cnt => Err(UmdError::InvalidDependency {
                subgraph: self.id,
                reason: format!("precursor count {}", cnt),
            }),
        }
    }
}

/// Buffer-section-sector: one relocatable bundle of constant and reuse
/// sections.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Bss {
    pub id: u32,
    pub stack_size: u32,
    pub stack_align_in_page: u32,
    pub param_map: Vec<ParamMapEntry>,
    #[serde(deserialize_with = "sections_by_slot")]
    pub const_sections: BTreeMap<u32, GraphSectionDesc>,
    #[serde(deserialize_with = "sections_by_slot")]
    pub zerocpy_const_sections: BTreeMap<u32, GraphSectionDesc>,
    pub reuse_sections: Vec<GraphSectionDesc>,
    pub io: IoTensors,
    #[serde(skip)]
    pub const_size: u64,
    #[serde(skip)]
    pub zerocpy_const_size: u64,
}

fn sections_by_slot<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<u32, GraphSectionDesc>, D::Error>
where
    D: Deserializer<'de>,
{
    let sections = Vec::<GraphSectionDesc>::deserialize(deserializer)?;
    Ok(sections.into_iter().map(|s| (s.slot_index, s)).collect())
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GmBufType {
    #[default]
    Reuse,
    Weight,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BssBufferIndex {
    pub fm_index: u32,
    pub buf_type: GmBufType,
    pub buf_index: u32,
}

/// Sections the compiler placed in on-chip global memory.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct GmConfig {
    /// Compiler control word; the remap mode is always 0 regardless.
    pub control: u32,
    pub region_ctrl: [u32; 2],
    pub buffers: Vec<BssBufferIndex>,
}

/// Segment MMU windows of one core.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct SegMmuConfig {
    pub seg: [[u32; 2]; 4],
    pub segmmu_ctl: u32,
    pub segmmu_remap: u32,
}

#[derive(Debug, Default)]
pub struct Graph {
    pub arch: String,
    pub hw_config: u32,
    pub hw_version: u32,
    pub text: Vec<u8>,
    pub rodata: Vec<u8>,
    pub descriptor: Vec<u8>,
    pub crodata: Vec<u8>,
    pub weights: Vec<u8>,
    pub global_param: Option<Vec<u8>>,
    pub subgraphs: Vec<Subgraph>,
    pub bss: Vec<Bss>,
    pub gm: Option<GmConfig>,
    pub segmmus: Vec<SegMmuConfig>,
    pub(crate) loaded: Option<LoadedGraph>,
}

impl Graph {
    pub fn subgraph_count(&self) -> usize {
        self.subgraphs.len()
    }

    pub fn is_dynamic_shape(&self) -> bool {
        self.global_param.is_some()
    }

    pub fn has_weights(&self) -> bool {
        self.bss.iter().any(|b| !b.const_sections.is_empty())
    }

    pub fn bss0(&self) -> Result<&Bss> {
        self.bss.first().ok_or_else(|| UmdError::invalid_graph("graph has no bss"))
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn loaded(&self) -> Result<&LoadedGraph> {
        self.loaded.as_ref().ok_or_else(|| UmdError::invalid_graph("graph not loaded to device"))
    }

    pub fn text_buffer(&self) -> Option<&BufferDesc> {
        self.loaded.as_ref().and_then(|l| l.text.as_ref())
    }

    pub fn crodata_buffer(&self) -> Option<&BufferDesc> {
        self.loaded.as_ref().and_then(|l| l.crodata.as_ref())
    }

    pub fn weight_buffer(&self, bss_idx: usize) -> Option<&WeightBuffer> {
        self.loaded.as_ref().and_then(|l| l.weights.get(bss_idx))
    }
}
