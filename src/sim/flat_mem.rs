use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};

use crate::base::mem::{page_align, BufferDesc, DeviceMemory, MemRegion, PAGE_SIZE};
use crate::error::{Result, UmdError};
use crate::sim::config::MemConfig;

/// First-fit allocator over one address window.
#[derive(Debug)]
struct RegionHeap {
    asid_base: u64,
    // start -> length of every free block, coalesced
    free: BTreeMap<u64, u64>,
}

impl RegionHeap {
    fn new(base: u64, size: u64, asid_base: u64) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(base, size);
        }
        Self { asid_base, free }
    }

    fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let (start, len, at) = self.free.iter().find_map(|(&start, &len)| {
            let at = (start + align - 1) & !(align - 1);
            (at + size <= start + len).then_some((start, len, at))
        })?;
        self.free.remove(&start);
        if at > start {
            self.free.insert(start, at - start);
        }
        if at + size < start + len {
            self.free.insert(at + size, start + len - at - size);
        }
        Some(at)
    }

    fn release(&mut self, pa: u64, size: u64) {
        let mut start = pa;
        let mut len = size;
        if let Some((&prev, &prev_len)) = self.free.range(..pa).next_back() {
            if prev + prev_len == pa {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(pa + size)) {
            len += next_len;
        }
        self.free.insert(start, len);
    }
}

#[derive(Debug, Default)]
struct FlatState {
    // sparse page store, anything never written reads as 0
    pages: HashMap<u64, Box<[u8]>>,
    heaps: HashMap<MemRegion, RegionHeap>,
    // pa -> (size, region) of every live allocation
    live: BTreeMap<u64, (u64, MemRegion)>,
}

impl FlatState {
    fn page(&mut self, index: u64) -> &mut [u8] {
        self.pages
            .entry(index)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice())
    }
}

/// Simulated device memory: region heaps laid out per [`MemConfig`] backed
/// by lazily materialised pages.
#[derive(Debug)]
pub struct FlatMemory {
    config: MemConfig,
    state: Mutex<FlatState>,
}

impl FlatMemory {
    pub fn new(config: MemConfig) -> Self {
        let mut heaps = HashMap::new();
        heaps.insert(MemRegion::Default, RegionHeap::new(config.ddr_base, config.ddr_size, config.asid0_base));
        heaps.insert(MemRegion::Weight, RegionHeap::new(config.weight_base, config.weight_size, config.asid1_base));
        heaps.insert(MemRegion::Sram, RegionHeap::new(config.sram_base, config.sram_size, config.asid0_base));
        heaps.insert(MemRegion::Dtcm, RegionHeap::new(config.dtcm_base, config.dtcm_size, config.asid0_base));
        heaps.insert(MemRegion::Gm, RegionHeap::new(config.gm_base, config.gm_size, config.asid0_base));
        Self {
            config,
            state: Mutex::new(FlatState { heaps, ..Default::default() }),
        }
    }

    pub fn config(&self) -> &MemConfig {
        &self.config
    }

    /// Number of live allocations.
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceMemory for FlatMemory {
    fn malloc(&self, size: u64, align_in_page: u32, name: &str, region: MemRegion) -> Result<BufferDesc> {
        if size == 0 {
            return Err(UmdError::BufferAllocFailed { reason: format!("zero sized request for '{}'", name) });
        }
        let align = PAGE_SIZE << align_in_page.min(20);
        let alloc_size = page_align(size);
        let mut state = self.lock();
        let heap = state
            .heaps
            .get_mut(&region)
            .ok_or_else(|| UmdError::BufferAllocFailed { reason: format!("region {:?} not present", region) })?;
        let asid_base = heap.asid_base;
        let Some(pa) = heap.alloc(alloc_size, align) else {
            warn!("{:?} region exhausted allocating '{}' ({:#x} bytes)", region, name, size);
            return Err(UmdError::OutOfMemory { name: name.to_string(), size });
        };
        state.live.insert(pa, (alloc_size, region));
        debug!("malloc '{}' {:#x} bytes @ {:#x} ({:?})", name, alloc_size, pa, region);
        Ok(BufferDesc { asid_base, pa, size: alloc_size, req_size: size, region })
    }

    fn free(&self, buf: BufferDesc) -> Result<()> {
        let mut state = self.lock();
        let Some((size, region)) = state.live.remove(&buf.pa) else {
            return Err(UmdError::InvalidFree { pa: buf.pa });
        };
        if let Some(heap) = state.heaps.get_mut(&region) {
            heap.release(buf.pa, size);
        }
        let first = buf.pa / PAGE_SIZE;
        let last = (buf.pa + size - 1) / PAGE_SIZE;
        for index in first..=last {
            state.pages.remove(&index);
        }
        debug!("free {:#x} bytes @ {:#x}", size, buf.pa);
        Ok(())
    }

    fn asid_base(&self, asid: usize) -> u64 {
        match asid {
            0 => self.config.asid0_base,
            _ => self.config.asid1_base,
        }
    }

    fn gm_size(&self) -> u64 {
        self.config.gm_size
    }

    fn is_mapped(&self, pa: u64, len: u64) -> bool {
        let state = self.lock();
        match state.live.range(..=pa).next_back() {
            Some((&start, &(size, _))) => pa + len <= start + size,
            None => false,
        }
    }

    fn read_impl(&self, pa: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.lock();
        let mut done = 0usize;
        while done < buf.len() {
            let addr = pa + done as u64;
            let offset = (addr % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - offset).min(buf.len() - done);
            match state.pages.get(&(addr / PAGE_SIZE)) {
                Some(page) => buf[done..done + n].copy_from_slice(&page[offset..offset + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write_impl(&self, pa: u64, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let mut done = 0usize;
        while done < data.len() {
            let addr = pa + done as u64;
            let offset = (addr % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - offset).min(data.len() - done);
            state.page(addr / PAGE_SIZE)[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }
}
