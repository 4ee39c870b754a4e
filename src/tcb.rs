//! Task control blocks, generation 3.1 layout.
//!
//! Every record is 128 bytes, little endian. The first word is always the
//! flag word and the last eight bytes are always the four dependency slots;
//! the 116 bytes in between are a union whose shape is selected by the task
//! type in the low nibble of the flag word. Records are packed and unpacked
//! field by field at the offsets listed in the layout tables below, so the
//! device image never depends on host struct layout.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::{Result, UmdError};

pub const TCB_SIZE: usize = 128;

pub const TCB_FLAG_TASK_TYPE_MASK: u32 = 0xF;
pub const TCB_FLAG_DEP_TYPE_MASK: u32 = 0x30;
pub const TCB_FLAG_END_TYPE_GROUP_END: u32 = 1 << 6;
pub const TCB_FLAG_END_TYPE_GRID_END: u32 = 1 << 7;
pub const TCB_FLAG_GRID_INIT: u32 = 1 << 21;
pub const TCB_FLAG_L2D_FLUSH: u32 = 1 << 22;

pub const EN_INTERRUPT_TEC_DONE: u32 = 1;
pub const EN_INTERRUPT_TEC_SIGNAL: u32 = 1 << 1;
pub const EN_INTERRUPT_TEC_EXCEPTION: u32 = 1 << 2;
pub const EN_INTERRUPT_TEC_FAULT: u32 = 1 << 3;
pub const EN_INTERRUPT_TEC_ALL: u32 = 0xF;

pub const EN_INTERRUPT_GRID_DONE: u32 = 1;
pub const EN_INTERRUPT_GRID_GM_FAULT: u32 = 1 << 3;
pub const EN_INTERRUPT_GRID_ALL: u32 = EN_INTERRUPT_GRID_DONE | EN_INTERRUPT_GRID_GM_FAULT;

pub const EN_GROUP_DEPEND: u16 = 1 << 15;
pub const GROUP_ID_MASK: u32 = 0x7FFF;

pub const ASID_WR: u32 = 1 << 5;
pub const ASID_RD: u32 = 1 << 6;

pub const GM_CTRL_REMAP_EN: u32 = 1;
pub const GM_SYNC_ONLY_UPDATE_REG: u32 = 0;
pub const GM_SYNC_DDR_TO_GM: u32 = 1 << 30;

pub const SEGMMU_MEM_CTRL_EN: u32 = 1;
pub const SEGMMU_REMAP_SHARE_EN: u32 = 1 << 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum TcbType {
    GridInit = 0,
    GroupInit = 1,
    Task = 2,
}

impl TcbType {
    pub fn from_flag(flag: u32) -> Option<Self> {
        Self::from_u32(flag & TCB_FLAG_TASK_TYPE_MASK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum DepType {
    None = 0,
    Group = 1,
    PreAll = 2,
}

impl DepType {
    pub fn bits(self) -> u32 {
        (self as u32) << 4
    }

    pub fn from_flag(flag: u32) -> Option<Self> {
        Self::from_u32((flag & TCB_FLAG_DEP_TYPE_MASK) >> 4)
    }
}

trait Field: Sized {
    fn get(raw: &[u8; TCB_SIZE], off: usize) -> Self;
    fn put(&self, raw: &mut [u8; TCB_SIZE], off: usize);
}

impl Field for u16 {
    fn get(raw: &[u8; TCB_SIZE], off: usize) -> Self {
        u16::from_le_bytes([raw[off], raw[off + 1]])
    }

    fn put(&self, raw: &mut [u8; TCB_SIZE], off: usize) {
        raw[off..off + 2].copy_from_slice(&self.to_le_bytes());
    }
}

impl Field for u32 {
    fn get(raw: &[u8; TCB_SIZE], off: usize) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&raw[off..off + 4]);
        u32::from_le_bytes(word)
    }

    fn put(&self, raw: &mut [u8; TCB_SIZE], off: usize) {
        raw[off..off + 4].copy_from_slice(&self.to_le_bytes());
    }
}

impl<const N: usize> Field for [u16; N] {
    fn get(raw: &[u8; TCB_SIZE], off: usize) -> Self {
        std::array::from_fn(|i| u16::get(raw, off + 2 * i))
    }

    fn put(&self, raw: &mut [u8; TCB_SIZE], off: usize) {
        for (i, v) in self.iter().enumerate() {
            v.put(raw, off + 2 * i);
        }
    }
}

impl<const N: usize> Field for [u32; N] {
    fn get(raw: &[u8; TCB_SIZE], off: usize) -> Self {
        std::array::from_fn(|i| u32::get(raw, off + 4 * i))
    }

    fn put(&self, raw: &mut [u8; TCB_SIZE], off: usize) {
        for (i, v) in self.iter().enumerate() {
            v.put(raw, off + 4 * i);
        }
    }
}

/// arguments: record name, then `field: type = byte offset` for every named
/// field; bytes not covered by a field are reserved and stay zero
macro_rules! tcb_layout {
    ($(#[$meta:meta])* $name:ident { $($field:ident: $ty:ty = $off:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl $name {
            pub fn write_to(&self, raw: &mut [u8; TCB_SIZE]) {
                $(<$ty as Field>::put(&self.$field, raw, $off);)*
            }

            pub fn read_from(raw: &[u8; TCB_SIZE]) -> Self {
                Self {
                    $($field: <$ty as Field>::get(raw, $off),)*
                }
            }
        }
    };
}

tcb_layout! {
    /// One per job; opens the grid.
    GridInitTcb {
        flag: u32 = 0,
        group_num: u32 = 8,
        interrupt_en: u32 = 16,
        group_id: u16 = 20,
        grid_id: u16 = 22,
        gm_ctrl: u32 = 48,
        gm_sync: u32 = 52,
        gm_addr_low: u32 = 56,
        gm_addr_high: u32 = 60,
        group_deps: [u16; 4] = 120,
    }
}

tcb_layout! {
    /// One per subgraph; address space and dependency setup for its group.
    GroupInitTcb {
        flag: u32 = 0,
        segmmu_ctrl: u32 = 4,
        segmmu_remap_ctrl0: u32 = 8,
        segmmu_remap_ctrl1: u32 = 12,
        interrupt_en: u32 = 16,
        group_id: u16 = 20,
        grid_id: u16 = 22,
        segmmu_seg_ctrl: [u32; 16] = 24,
        asids: [u32; 8] = 88,
        group_deps: [u16; 4] = 120,
    }
}

tcb_layout! {
    /// One per task of a group.
    TaskTcb {
        flag: u32 = 0,
        next: u32 = 4,
        spc: u32 = 12,
        interrupt_en: u32 = 16,
        group_id: u16 = 20,
        grid_id: u16 = 22,
        task_id: u16 = 24,
        warmup_len: u16 = 26,
        grid_dim: [u16; 3] = 28,
        group_dim: [u16; 3] = 34,
        group_idx: [u16; 3] = 40,
        task_idx: [u16; 3] = 46,
        sp: u32 = 52,
        pp: u32 = 56,
        dp: u32 = 60,
        cp: u32 = 64,
        pprint: u32 = 68,
        pprofiler: u32 = 72,
        core_id: u16 = 76,
        cluster_id: u16 = 78,
        tec_id: u16 = 80,
        dsize: u32 = 104,
        tcbp: u32 = 108,
        global_param: u32 = 112,
        group_deps: [u16; 4] = 120,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tcb {
    GridInit(GridInitTcb),
    GroupInit(GroupInitTcb),
    Task(TaskTcb),
}

impl Tcb {
    pub fn flag(&self) -> u32 {
        match self {
            Tcb::GridInit(t) => t.flag,
            Tcb::GroupInit(t) => t.flag,
            Tcb::Task(t) => t.flag,
        }
    }

    pub fn tcb_type(&self) -> TcbType {
        match self {
            Tcb::GridInit(_) => TcbType::GridInit,
            Tcb::GroupInit(_) => TcbType::GroupInit,
            Tcb::Task(_) => TcbType::Task,
        }
    }

    pub fn dep_type(&self) -> Option<DepType> {
        DepType::from_flag(self.flag())
    }

    pub fn group_deps(&self) -> [u16; 4] {
        match self {
            Tcb::GridInit(t) => t.group_deps,
            Tcb::GroupInit(t) => t.group_deps,
            Tcb::Task(t) => t.group_deps,
        }
    }

    pub fn is_group_end(&self) -> bool {
        self.flag() & TCB_FLAG_END_TYPE_GROUP_END != 0
    }

    pub fn is_grid_end(&self) -> bool {
        self.flag() & TCB_FLAG_END_TYPE_GRID_END != 0
    }

    pub fn encode(&self) -> [u8; TCB_SIZE] {
        let mut raw = [0u8; TCB_SIZE];
        match self {
            Tcb::GridInit(t) => t.write_to(&mut raw),
            Tcb::GroupInit(t) => t.write_to(&mut raw),
            Tcb::Task(t) => t.write_to(&mut raw),
        }
        raw
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw: &[u8; TCB_SIZE] = bytes.try_into().map_err(|_| {
            UmdError::invalid_graph(format!("tcb record of {} bytes", bytes.len()))
        })?;
        let flag = u32::get(raw, 0);
        match TcbType::from_flag(flag) {
            Some(TcbType::GridInit) => Ok(Tcb::GridInit(GridInitTcb::read_from(raw))),
            Some(TcbType::GroupInit) => Ok(Tcb::GroupInit(GroupInitTcb::read_from(raw))),
            Some(TcbType::Task) => Ok(Tcb::Task(TaskTcb::read_from(raw))),
            None => Err(UmdError::invalid_graph(format!("unknown tcb type in flag {:#x}", flag))),
        }
    }
}

pub fn encode_chain(tcbs: &[Tcb]) -> Vec<u8> {
    tcbs.iter().flat_map(|t| t.encode()).collect()
}

pub fn decode_chain(bytes: &[u8]) -> Result<Vec<Tcb>> {
    if bytes.len() % TCB_SIZE != 0 {
        return Err(UmdError::invalid_graph(format!(
            "tcb chain of {} bytes is not a whole number of records",
            bytes.len()
        )));
    }
    bytes.chunks_exact(TCB_SIZE).map(Tcb::decode).collect()
}
