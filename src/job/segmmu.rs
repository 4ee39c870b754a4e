use log::debug;

use crate::error::{Result, UmdError};
use crate::graph::SegMmuConfig;
use crate::tcb::{SEGMMU_MEM_CTRL_EN, SEGMMU_REMAP_SHARE_EN};

pub const SEGMMU_SEGMENTS: usize = 4;
const SEG_CTRL_ATTR_MASK: u32 = 0x3fff;

/// Fields of a SegMMU IO tensor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegMmuId {
    pub ctrl_idx: u32,
    pub seg_idx: u32,
    pub core_mask: u32,
}

impl SegMmuId {
    pub fn decode(id: u32) -> Self {
        Self {
            ctrl_idx: id & 0xFF,
            seg_idx: (id >> 8) & 0xFF,
            core_mask: id >> 16,
        }
    }
}

/// SegMMU registers of one core as programmed by its group-init TCBs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegMmuRegs {
    pub ctrl: u32,
    pub remap: u32,
    pub seg: [[u32; 2]; SEGMMU_SEGMENTS],
}

impl SegMmuRegs {
    /// Segment controls in group-init order: `seg[j][0]`, `seg[j][1]`, ...
    pub fn seg_ctrl_words(&self) -> [u32; 2 * SEGMMU_SEGMENTS] {
        std::array::from_fn(|i| self.seg[i / 2][i % 2])
    }
}

/// Build per-core registers from the graph's configs and point the windows
/// named by each SegMMU tensor at that tensor's buffer. `tensors` holds
/// (tensor id, buffer pa) pairs. A single config is shared by every core.
pub fn setup_segmmu(configs: &[SegMmuConfig], tensors: &[(u32, u64)], core_count: u32) -> Result<Vec<SegMmuRegs>> {
    if configs.is_empty() {
        return Ok(Vec::new());
    }
    let mut regs = Vec::with_capacity(core_count as usize);
    for core in 0..core_count as usize {
        let config = if configs.len() == 1 { configs.first() } else { configs.get(core) };
        let config = config.ok_or_else(|| {
            UmdError::invalid_segmmu(format!("{} configs for {} cores", configs.len(), core_count))
        })?;
        regs.push(SegMmuRegs {
            ctrl: SEGMMU_REMAP_SHARE_EN | SEGMMU_MEM_CTRL_EN,
            remap: 0,
            seg: config.seg,
        });
    }

    let cores = (1u32 << core_count.min(16)) - 1;
    for &(id, pa) in tensors {
        let sid = SegMmuId::decode(id);
        if sid.core_mask & cores == 0 {
            return Err(UmdError::invalid_segmmu(format!("tensor {:#x}: core mask {:#x} selects no core", id, sid.core_mask)));
        }
        if sid.seg_idx as usize >= SEGMMU_SEGMENTS {
            return Err(UmdError::invalid_segmmu(format!("tensor {:#x}: segment {}", id, sid.seg_idx)));
        }
        if sid.ctrl_idx > 1 {
            return Err(UmdError::invalid_segmmu(format!("tensor {:#x}: ctrl slot {}", id, sid.ctrl_idx)));
        }
        for (core, reg) in regs.iter_mut().enumerate() {
            if sid.core_mask & (1 << core) == 0 {
                continue;
            }
            let ctrl = &mut reg.seg[sid.seg_idx as usize][sid.ctrl_idx as usize];
            *ctrl = (*ctrl & SEG_CTRL_ATTR_MASK) | (pa as u32 & !SEG_CTRL_ATTR_MASK);
            debug!("segmmu core {} seg {} ctrl{} = {:#x}", core, sid.seg_idx, sid.ctrl_idx, *ctrl);
        }
    }
    Ok(regs)
}
