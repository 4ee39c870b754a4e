use std::collections::BTreeMap;

use log::debug;

use crate::base::mem::{lo32, BufferDesc, DeviceMemory};
use crate::error::{Result, UmdError};
use crate::graph::{DataType, IoKind, IoTensorDesc, IoTensors, ParamMapEntry};
use crate::job::alloc::SlotBuffer;

/// Where a shared tensor's memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedSource {
    /// buffer of another job or graph in this process
    SameProcess { pa: u64 },
    /// caller-managed memory; skipped by the emulation dump
    Customised { pa: u64 },
    /// dma-buf exported by another driver
    DmaBuf { fd: i32, offset: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBufBinding {
    pub fd: i32,
    pub offset: u64,
    pub bytes: u64,
}

/// An IO tensor resolved against the job's reuse buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobIoBuffer {
    pub id: u32,
    pub size: u32,
    pub ref_section: u32,
    pub offset_in_section: u32,
    pub data_type: DataType,
    pub pa: u64,
    pub align_asid_pa: u64,
    pub dump_ignore: bool,
    pub dmabuf: Option<DmaBufBinding>,
}

impl JobIoBuffer {
    fn resolve(desc: &IoTensorDesc, slot: &BufferDesc) -> Self {
        let offset = u64::from(desc.offset_in_section);
        Self {
            id: desc.id,
            size: desc.size,
            ref_section: desc.ref_section,
            offset_in_section: desc.offset_in_section,
            data_type: desc.data_type,
            pa: slot.pa + offset,
            align_asid_pa: slot.align_asid_pa() + offset,
            dump_ignore: false,
            dmabuf: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct IoBuffers {
    tensors: BTreeMap<IoKind, Vec<JobIoBuffer>>,
}

impl IoBuffers {
    pub fn build(io: &IoTensors, reuses: &[Option<SlotBuffer>]) -> Result<Self> {
        let mut tensors = BTreeMap::new();
        for kind in IoTensors::KINDS {
            let descs = io.get(kind);
            if descs.is_empty() {
                continue;
            }
            let mut resolved = Vec::with_capacity(descs.len());
            for desc in descs {
                let slot = reuses.get(desc.ref_section as usize).and_then(Option::as_ref).ok_or_else(|| {
                    UmdError::invalid_graph(format!(
                        "{} tensor {} refers to unallocated reuse section {}",
                        kind, desc.id, desc.ref_section
                    ))
                })?;
                resolved.push(JobIoBuffer::resolve(desc, &slot.buf));
            }
            debug!("{} {} tensors bound", resolved.len(), kind);
            tensors.insert(kind, resolved);
        }
        Ok(Self { tensors })
    }

    pub fn get(&self, kind: IoKind) -> &[JobIoBuffer] {
        self.tensors.get(&kind).map_or(&[], Vec::as_slice)
    }

    pub fn tensor(&self, kind: IoKind, index: usize) -> Result<&JobIoBuffer> {
        self.get(kind).get(index).ok_or(UmdError::InvalidTensorId { kind: kind.name(), id: index as u32 })
    }

    pub fn tensor_mut(&mut self, kind: IoKind, index: usize) -> Result<&mut JobIoBuffer> {
        self.tensors
            .get_mut(&kind)
            .and_then(|t| t.get_mut(index))
            .ok_or(UmdError::InvalidTensorId { kind: kind.name(), id: index as u32 })
    }

    /// Tensors of `kind` living in reuse section `section`.
    pub fn in_section(&self, kind: IoKind, section: u32) -> impl Iterator<Item = &JobIoBuffer> {
        self.get(kind).iter().filter(move |t| t.ref_section == section)
    }

    /// Re-resolve every tensor of `section` after its buffer was replaced.
    pub fn rebind_section(&mut self, section: u32, slot: &BufferDesc) {
        for tensor in self.tensors.values_mut().flatten().filter(|t| t.ref_section == section) {
            let offset = u64::from(tensor.offset_in_section);
            tensor.pa = slot.pa + offset;
            tensor.align_asid_pa = slot.align_asid_pa() + offset;
        }
    }
}

/// Rodata and, past its end, the descriptor section of one job.
pub struct ParamTarget<'a> {
    /// `None` when the graph has no rodata
    pub rodata: Option<&'a BufferDesc>,
    pub rodata_len: u64,
    pub descriptor: Option<&'a BufferDesc>,
}

impl ParamTarget<'_> {
    fn locate(&self, offset_in_ro: u32) -> Result<u64> {
        let offset = u64::from(offset_in_ro);
        if let (Some(rodata), true) = (self.rodata, offset < self.rodata_len) {
            return Ok(rodata.pa + offset);
        }
        match self.descriptor {
            Some(dcr) => Ok(dcr.pa + (offset - self.rodata_len)),
            None => Err(UmdError::invalid_graph(format!(
                "param at {:#x} past rodata ({:#x} bytes) with no descriptor section",
                offset, self.rodata_len
            ))),
        }
    }
}

/// Write the address of each entry's buffer into the words named by `map`.
/// `base` returns the buffer's ASID-relative address; only the bits of
/// `addr_mask` are replaced.
pub fn patch_param_map(
    mem: &dyn DeviceMemory,
    target: &ParamTarget<'_>,
    map: &[ParamMapEntry],
    base: impl Fn(&ParamMapEntry) -> Result<u64>,
) -> Result<()> {
    for entry in map {
        let addr = lo32(base(entry)? + u64::from(entry.offset_in_section));
        let pa = target.locate(entry.offset_in_ro)?;
        let old = mem.read_u32(pa)?;
        let word = (old & !entry.addr_mask) | (addr & entry.addr_mask);
        debug!("param @ {:#x}: {:#010x} -> {:#010x}", pa, old, word);
        mem.write_u32(pa, word)?;
    }
    Ok(())
}
