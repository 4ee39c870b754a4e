use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::base::mem::{BufferDesc, DeviceMemory, MemRegion};
use crate::error::{Result, UmdError};
use crate::graph::Graph;

/// Bytes reserved after the text image for the text/rodata base trailer.
pub const TEXT_TRAILER_SIZE: u64 = 8;

/// Constant sections of one bss in device memory.
#[derive(Debug, Default)]
pub struct WeightBuffer {
    pub pool: Option<BufferDesc>,
    /// views into `pool`, keyed by slot index
    pub sections: BTreeMap<u32, BufferDesc>,
    pub zerocpy_pool: Option<BufferDesc>,
    pub zerocpy_sections: BTreeMap<u32, BufferDesc>,
}

impl WeightBuffer {
    pub fn asid_base(&self) -> Option<u64> {
        self.pool.as_ref().map(|p| p.asid_base)
    }

    fn release(self, mem: &dyn DeviceMemory) -> Result<()> {
        let mut first_err = None;
        for pool in [self.pool, self.zerocpy_pool].into_iter().flatten() {
            if let Err(e) = mem.free(pool) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Graph sections resident on the device, shared by every job of the graph.
#[derive(Debug, Default)]
pub struct LoadedGraph {
    pub text: Option<BufferDesc>,
    pub crodata: Option<BufferDesc>,
    pub weights: Vec<WeightBuffer>,
}

impl LoadedGraph {
    fn release(self, mem: &dyn DeviceMemory) -> Result<()> {
        let mut first_err = None;
        for buf in [self.text, self.crodata].into_iter().flatten() {
            if let Err(e) = mem.free(buf) {
                first_err.get_or_insert(e);
            }
        }
        for weight in self.weights {
            if let Err(e) = weight.release(mem) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Graph {
    /// Place text, constant rodata and weights in device memory.
    pub fn load(&mut self, mem: &dyn DeviceMemory) -> Result<()> {
        if self.loaded.is_some() {
            return Err(UmdError::invalid_graph("graph already loaded"));
        }
        let mut loaded = LoadedGraph::default();
        match self.load_sections(mem, &mut loaded) {
            Ok(()) => {
                info!("graph loaded: {} subgraphs, {} bss", self.subgraphs.len(), self.bss.len());
                self.loaded = Some(loaded);
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = loaded.release(mem) {
                    warn!("graph load rollback: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn load_sections(&self, mem: &dyn DeviceMemory, loaded: &mut LoadedGraph) -> Result<()> {
        if !self.text.is_empty() {
            let text = mem.malloc(self.text.len() as u64 + TEXT_TRAILER_SIZE, 0, "text", MemRegion::Default)?;
            let text = loaded.text.insert(text);
            mem.write(text.pa, &self.text)?;
        }
        if !self.crodata.is_empty() {
            let crodata = mem.malloc(self.crodata.len() as u64, 0, "crodata", MemRegion::Default)?;
            let crodata = loaded.crodata.insert(crodata);
            mem.write(crodata.pa, &self.crodata)?;
        }

        for (i, bss) in self.bss.iter().enumerate() {
            loaded.weights.push(WeightBuffer::default());
            let weight = &mut loaded.weights[i];
            if !bss.const_sections.is_empty() {
                let pool = mem.malloc(bss.const_size, 0, "weight", MemRegion::Weight)?;
                let pool = weight.pool.insert(pool);
                for (slot, section) in &bss.const_sections {
                    let view = pool.view(section.relative_addr, section.size, section.size);
                    let start = section.load_offset as usize;
                    mem.write(view.pa, &self.weights[start..start + section.size as usize])?;
                    weight.sections.insert(*slot, view);
                }
            }
            if !bss.zerocpy_const_sections.is_empty() {
                let pool = mem.malloc(bss.zerocpy_const_size, 0, "zerocpy_const", MemRegion::Weight)?;
                let pool = weight.zerocpy_pool.insert(pool);
                mem.zeroize(pool.pa, pool.size)?;
                for (slot, section) in &bss.zerocpy_const_sections {
                    weight.zerocpy_sections.insert(*slot, pool.view(section.relative_addr, section.size, section.size));
                }
            }
            debug!("bss {}: {} weight sections", bss.id, weight.sections.len());
        }
        Ok(())
    }

    /// Release the device copies. No job of this graph may still exist.
    pub fn unload(&mut self, mem: &dyn DeviceMemory) -> Result<()> {
        match self.loaded.take() {
            Some(loaded) => loaded.release(mem),
            None => Ok(()),
        }
    }
}
