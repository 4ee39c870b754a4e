use std::collections::BTreeSet;

use log::debug;

use crate::base::mem::{BufferDesc, DeviceMemory, MemRegion};
use crate::error::Result;
use crate::graph::{GmBufType, Graph, IoTensorDesc};
use crate::job::alloc::SlotBuffer;
use crate::tcb::{GM_CTRL_REMAP_EN, GM_SYNC_DDR_TO_GM, GM_SYNC_ONLY_UPDATE_REG};

/// Grid-init fields programming the global-memory remap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GmSync {
    pub ctrl: u32,
    pub sync: u32,
    pub base: u64,
}

/// Which reuse sections of a job live in on-chip global memory.
#[derive(Debug, Clone, Default)]
pub struct GmManager {
    enabled: bool,
    reuse_slots: BTreeSet<u32>,
}

impl GmManager {
    pub fn new(graph: &Graph, mem: &dyn DeviceMemory) -> Self {
        let Some(config) = graph.gm.as_ref().filter(|_| mem.is_gm_enabled()) else {
            return Self::default();
        };
        let mut reuse_slots = BTreeSet::new();
        for index in &config.buffers {
            match index.buf_type {
                GmBufType::Reuse => {
                    reuse_slots.insert(index.buf_index);
                }
                GmBufType::Weight => debug!("gm: weight slot {} stays in ddr", index.buf_index),
            }
        }
        Self { enabled: true, reuse_slots }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_gm_buffer(&self, index: u32, buf_type: GmBufType) -> bool {
        self.enabled && buf_type == GmBufType::Reuse && self.reuse_slots.contains(&index)
    }

    pub fn malloc(&self, mem: &dyn DeviceMemory, size: u64, align_in_page: u32, name: &str) -> Result<BufferDesc> {
        mem.malloc(size, align_in_page, &format!("gm_{}", name), MemRegion::Gm)
    }

    pub fn need_remap(&self) -> bool {
        self.enabled && !self.reuse_slots.is_empty()
    }

    /// `None` when nothing was placed in GM. Inputs living in GM make the
    /// NPU copy them in from DDR before the grid starts.
    pub fn sync_fields(&self, gm_size: u64, reuses: &[Option<SlotBuffer>], inputs: &[IoTensorDesc]) -> Option<GmSync> {
        if !self.need_remap() {
            return None;
        }
        let base = self
            .reuse_slots
            .iter()
            .filter_map(|&slot| reuses.get(slot as usize).and_then(Option::as_ref))
            .map(|slot| slot.buf.pa)
            .min()?;
        let remap_size = ((gm_size >> 18).saturating_sub(1) & 0xFF) as u32;
        let synced = inputs.iter().any(|t| self.reuse_slots.contains(&t.ref_section));
        Some(GmSync {
            ctrl: (remap_size << 8) | GM_CTRL_REMAP_EN,
            sync: if synced { GM_SYNC_DDR_TO_GM } else { GM_SYNC_ONLY_UPDATE_REG },
            base,
        })
    }
}
