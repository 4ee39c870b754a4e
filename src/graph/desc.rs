use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Deserialize;

use crate::base::mem::PAGE_SIZE;
use crate::error::{Result, UmdError};
use crate::graph::{Bss, GmConfig, Graph, SectionType, SegMmuConfig, Subgraph};

/// Binary section contents in a graph description.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Blob {
    Bytes(Vec<u8>),
    Zeros { zeros: usize },
    File { path: PathBuf },
}

impl Default for Blob {
    fn default() -> Self {
        Blob::Bytes(Vec::new())
    }
}

impl Blob {
    pub fn resolve(&self, base_dir: &Path) -> Result<Vec<u8>> {
        match self {
            Blob::Bytes(bytes) => Ok(bytes.clone()),
            Blob::Zeros { zeros } => Ok(vec![0u8; *zeros]),
            Blob::File { path } => Ok(std::fs::read(base_dir.join(path))?),
        }
    }
}

/// Parser output: the graph as the compiler described it.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GraphDesc {
    pub arch: String,
    pub hw_config: u32,
    pub hw_version: u32,
    pub text: Blob,
    pub rodata: Blob,
    pub descriptor: Blob,
    pub crodata: Blob,
    pub weights: Blob,
    pub global_param: Option<Blob>,
    pub subgraphs: Vec<Subgraph>,
    pub bss: Vec<Bss>,
    pub gm: Option<GmConfig>,
    pub segmmus: Vec<SegMmuConfig>,
}

impl GraphDesc {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| UmdError::invalid_graph(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| UmdError::invalid_graph(e.to_string()))
    }

    /// Read a `.json` or `.toml` description.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_toml(&text),
        }
    }
}

fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

/// Lay out a bss's constant sections back to back, each at its own
/// alignment, and return the pooled size (at least one page).
fn layout_consts<'a>(sections: impl Iterator<Item = &'a mut crate::graph::GraphSectionDesc>) -> u64 {
    let mut cursor = 0u64;
    for section in sections {
        let align = PAGE_SIZE << section.align_in_page.min(20);
        section.relative_addr = align_up(cursor, align);
        cursor = section.relative_addr + section.size;
    }
    if cursor == 0 {
        PAGE_SIZE
    } else {
        align_up(cursor, PAGE_SIZE)
    }
}

impl Graph {
    /// Build and validate the in-memory model. Relative blob paths resolve
    /// against `base_dir`.
    pub fn from_desc(desc: GraphDesc, base_dir: &Path) -> Result<Graph> {
        let mut graph = Graph {
            arch: desc.arch,
            hw_config: desc.hw_config,
            hw_version: desc.hw_version,
            text: desc.text.resolve(base_dir)?,
            rodata: desc.rodata.resolve(base_dir)?,
            descriptor: desc.descriptor.resolve(base_dir)?,
            crodata: desc.crodata.resolve(base_dir)?,
            weights: desc.weights.resolve(base_dir)?,
            global_param: desc.global_param.map(|b| b.resolve(base_dir)).transpose()?,
            subgraphs: desc.subgraphs,
            bss: desc.bss,
            gm: desc.gm,
            segmmus: desc.segmmus,
            loaded: None,
        };

        if graph.bss.is_empty() {
            graph.bss.push(Bss::default());
        }

        // reuse sections of every bss are owned through bss 0
        let mirrored: Vec<_> = graph.bss[1..].iter().flat_map(|b| b.reuse_sections.iter().cloned()).collect();
        graph.bss[0].reuse_sections.extend(mirrored);

        let weight_len = graph.weights.len() as u64;
        for bss in graph.bss.iter_mut() {
            for section in bss.const_sections.values().chain(bss.zerocpy_const_sections.values()) {
                if section.size == 0 {
                    warn!("bss {} const slot {} has zero size", bss.id, section.slot_index);
                }
            }
            for section in bss.const_sections.values_mut() {
                section.section_type = SectionType::Static;
                if section.load_offset + section.size > weight_len {
                    return Err(UmdError::invalid_graph(format!(
                        "bss {} const slot {} loads past the weight image",
                        bss.id, section.slot_index
                    )));
                }
            }
            for section in bss.zerocpy_const_sections.values_mut() {
                section.section_type = SectionType::ZeroCopyStatic;
            }
            bss.const_size = layout_consts(bss.const_sections.values_mut());
            bss.zerocpy_const_size = layout_consts(bss.zerocpy_const_sections.values_mut());
            bss.io.sort_by_id()?;
        }

        let bss_count = graph.bss.len();
        let reuse_count = graph.bss[0].reuse_sections.len();
        for (i, sg) in graph.subgraphs.iter().enumerate() {
            if sg.bss_idx as usize >= bss_count {
                return Err(UmdError::invalid_graph(format!("subgraph {} refers to bss {}", sg.id, sg.bss_idx)));
            }
            if i > 0 && sg.printfifo_size != graph.subgraphs[0].printfifo_size {
                warn!("subgraph {} printf fifo differs from subgraph 0", sg.id);
            }
            let end = sg.text.offset as u64 + sg.text.size as u64;
            if end > graph.text.len() as u64 {
                return Err(UmdError::invalid_graph(format!("subgraph {} text past end of image", sg.id)));
            }
            sg.dependency()?;
        }
        for kind in crate::graph::IoTensors::KINDS {
            for tensor in graph.bss[0].io.get(kind) {
                if tensor.ref_section as usize >= reuse_count {
                    return Err(UmdError::invalid_graph(format!(
                        "{} tensor {} refers to reuse section {}",
                        kind, tensor.id, tensor.ref_section
                    )));
                }
            }
        }

        debug!(
            "graph: {} subgraphs, {} bss, {} reuse sections, text {:#x} bytes",
            graph.subgraphs.len(),
            bss_count,
            reuse_count,
            graph.text.len()
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESC: &str = r#"
arch = "X3_1304"
text = { zeros = 256 }
rodata = { zeros = 64 }
weights = [1, 2, 3, 4, 5, 6, 7, 8]

[[subgraphs]]
id = 0
text = { offset = 0, size = 128 }

[[subgraphs]]
id = 1
text = { offset = 128, size = 128 }
precursor_cnt = 1
precursors = [0]

[[bss]]
id = 0
stack_size = 4096
reuse_sections = [{ size = 1024 }, { size = 2048 }]
const_sections = [{ slot_index = 0, size = 4, load_offset = 0 }, { slot_index = 1, size = 4, load_offset = 4, align_in_page = 1 }]

[[bss.io.inputs]]
id = 0
size = 1024
ref_section = 0

[[bss.io.outputs]]
id = 0
size = 2048
ref_section = 1
"#;

    #[test]
    fn toml_description_builds_graph() {
        let desc = GraphDesc::from_toml(DESC).expect("parse");
        let graph = Graph::from_desc(desc, Path::new(".")).expect("build");
        assert_eq!(2, graph.subgraph_count());
        assert_eq!(256, graph.text.len());
        let bss = &graph.bss[0];
        assert_eq!(0, bss.const_sections[&0].relative_addr);
        assert_eq!(2 * PAGE_SIZE, bss.const_sections[&1].relative_addr);
        assert_eq!(3 * PAGE_SIZE, bss.const_size);
        assert_eq!(PAGE_SIZE, bss.zerocpy_const_size);
        assert!(graph.has_weights());
    }

    #[test]
    fn out_of_range_io_section_is_rejected() {
        let mut desc = GraphDesc::from_toml(DESC).expect("parse");
        desc.bss[0].io.outputs[0].ref_section = 7;
        assert!(Graph::from_desc(desc, Path::new(".")).expect_err("bad ref").is_format_error());
    }

    #[test]
    fn secondary_bss_reuse_is_mirrored() {
        let mut desc = GraphDesc::from_toml(DESC).expect("parse");
        let mut extra = Bss { id: 1, ..Default::default() };
        extra.reuse_sections.push(crate::graph::GraphSectionDesc { size: 512, ..Default::default() });
        desc.bss.push(extra);
        let graph = Graph::from_desc(desc, Path::new(".")).expect("build");
        assert_eq!(3, graph.bss[0].reuse_sections.len());
        assert_eq!(1, graph.bss[1].reuse_sections.len());
    }

    #[test]
    fn json_description() {
        let json = r#"{ "text": [0, 0, 0, 0], "subgraphs": [{ "id": 0, "precursor_cnt": -1 }] }"#;
        let graph = Graph::from_desc(GraphDesc::from_json(json).expect("json"), Path::new(".")).expect("build");
        assert!(graph.subgraphs[0].depends_on_all());
        assert_eq!(1, graph.bss.len());
    }
}
