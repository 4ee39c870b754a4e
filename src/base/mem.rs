use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Result, UmdError};

pub const PAGE_SIZE: u64 = 4096;

pub fn page_align(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub fn lo32(v: u64) -> u32 {
    v as u32
}

pub fn hi32(v: u64) -> u32 {
    (v >> 32) as u32
}

/// Where a buffer is carved from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemRegion {
    #[default]
    Default,
    Sram,
    Dtcm,
    Weight,
    Gm,
}

impl FromStr for MemRegion {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "default" => Ok(Self::Default),
            "sram" => Ok(Self::Sram),
            "dtcm" => Ok(Self::Dtcm),
            "weight" => Ok(Self::Weight),
            "gm" => Ok(Self::Gm),
            _ => Err(format!(
                "unsupported memory region '{}', expected one of: default, sram, dtcm, weight, gm",
                value
            )),
        }
    }
}

/// Handle to a device buffer. Owned exclusively; either handed back through
/// [`DeviceMemory::free`] or, for views into a pooled region and imported
/// buffers, simply dropped.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub asid_base: u64,
    pub pa: u64,
    pub size: u64,
    pub req_size: u64,
    pub region: MemRegion,
}

impl BufferDesc {
    /// Address as seen by the NPU through the buffer's ASID window.
    pub fn align_asid_pa(&self) -> u64 {
        self.pa - self.asid_base
    }

    pub fn end(&self) -> u64 {
        self.pa + self.size
    }

    /// Sub-buffer at `offset` inside this one.
    pub fn view(&self, offset: u64, size: u64, req_size: u64) -> BufferDesc {
        BufferDesc {
            asid_base: self.asid_base,
            pa: self.pa + offset,
            size,
            req_size,
            region: self.region,
        }
    }

    /// Buffer owned by someone else (shared tensors, dma-buf imports).
    pub fn imported(asid_base: u64, pa: u64, size: u64) -> BufferDesc {
        BufferDesc { asid_base, pa, size, req_size: size, region: MemRegion::Default }
    }

    pub fn contains(&self, pa: u64, len: u64) -> bool {
        pa >= self.pa && pa + len <= self.end()
    }
}

/// Device memory allocator and accessor.
pub trait DeviceMemory: Send + Sync {
    /// Allocate `size` bytes aligned to `PAGE_SIZE << align_in_page`.
    fn malloc(&self, size: u64, align_in_page: u32, name: &str, region: MemRegion) -> Result<BufferDesc>;
    fn free(&self, buf: BufferDesc) -> Result<()>;

    fn asid_base(&self, asid: usize) -> u64;
    /// Bytes of on-chip global memory; zero when the device has none.
    fn gm_size(&self) -> u64;
    fn is_gm_enabled(&self) -> bool {
        self.gm_size() > 0
    }

    /// Whether `[pa, pa + len)` lies inside one live allocation.
    fn is_mapped(&self, pa: u64, len: u64) -> bool;

    fn read_impl(&self, pa: u64, buf: &mut [u8]) -> Result<()>;
    fn read(&self, pa: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if !self.is_mapped(pa, buf.len() as u64) {
            return Err(UmdError::BadAccess { pa, size: buf.len() as u64 });
        }
        self.read_impl(pa, buf)
    }

    fn write_impl(&self, pa: u64, data: &[u8]) -> Result<()>;
    fn write(&self, pa: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if !self.is_mapped(pa, data.len() as u64) {
            return Err(UmdError::BadAccess { pa, size: data.len() as u64 });
        }
        self.write_impl(pa, data)
    }

    fn zeroize(&self, pa: u64, size: u64) -> Result<()> {
        self.write(pa, &vec![0u8; size as usize])
    }

    fn read_u32(&self, pa: u64) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read(pa, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    fn write_u32(&self, pa: u64, value: u32) -> Result<()> {
        self.write(pa, &value.to_le_bytes())
    }

    fn dump_file(&self, pa: u64, size: u64, path: &Path) -> Result<()> {
        let mut bytes = vec![0u8; size as usize];
        self.read(pa, &mut bytes)?;
        std::fs::write(path, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment() {
        assert_eq!(0, page_align(0));
        assert_eq!(PAGE_SIZE, page_align(1));
        assert_eq!(PAGE_SIZE, page_align(PAGE_SIZE));
        assert_eq!(2 * PAGE_SIZE, page_align(PAGE_SIZE + 1));
    }

    #[test]
    fn views_share_asid_window() {
        let pool = BufferDesc {
            asid_base: 0x8000_0000,
            pa: 0x8010_0000,
            size: 0x4000,
            req_size: 0x4000,
            region: MemRegion::Default,
        };
        let view = pool.view(0x1000, 0x2000, 0x1800);
        assert_eq!(0x8010_1000, view.pa);
        assert_eq!(0x10_1000, view.align_asid_pa());
        assert!(pool.contains(view.pa, view.size));
        assert!(!pool.contains(view.pa, 0x4000));
    }
}
