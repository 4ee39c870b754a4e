use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, PoisonError};

use log::debug;

use crate::error::{Result, UmdError};

/// Group ids are 15 bits wide in the dependency slots.
pub const MAX_GROUP_ID: usize = 1 << 15;

/// Bitmap of group ids handed out to live jobs. Every job takes one
/// contiguous range (one id per subgraph) and returns it when its buffers
/// are freed.
#[derive(Debug)]
pub struct GroupIdPool {
    used: Mutex<Vec<u64>>,
    capacity: usize,
}

impl Default for GroupIdPool {
    fn default() -> Self {
        Self::new(MAX_GROUP_ID)
    }
}

impl GroupIdPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            used: Mutex::new(vec![0u64; capacity.div_ceil(64)]),
            capacity,
        }
    }

    fn is_set(bits: &[u64], id: usize) -> bool {
        bits[id / 64] & (1 << (id % 64)) != 0
    }

    fn set(bits: &mut [u64], id: usize, value: bool) {
        if value {
            bits[id / 64] |= 1 << (id % 64);
        } else {
            bits[id / 64] &= !(1 << (id % 64));
        }
    }

    /// First-fit contiguous range of `count` ids.
    pub fn alloc(&self, count: u32) -> Result<u16> {
        if count == 0 {
            return Ok(0);
        }
        let count = count as usize;
        let mut bits = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let mut start = 0usize;
        while start + count <= self.capacity {
            match (start..start + count).find(|&id| Self::is_set(&bits, id)) {
                Some(taken) => start = taken + 1,
                None => {
                    for id in start..start + count {
                        Self::set(&mut bits, id, true);
                    }
                    debug!("group ids {}..{} allocated", start, start + count);
                    return Ok(start as u16);
                }
            }
        }
        Err(UmdError::AllocGroupId { count: count as u32 })
    }

    pub fn free(&self, start: u16, count: u32) {
        let mut bits = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let end = (start as usize + count as usize).min(self.capacity);
        for id in start as usize..end {
            Self::set(&mut bits, id, false);
        }
    }

    pub fn in_use(&self) -> usize {
        let bits = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Monotonic grid id source; ids wrap at 16 bits.
#[derive(Debug, Default)]
pub struct GridIdCounter {
    next: AtomicU16,
}

impl GridIdCounter {
    pub fn next(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_contiguous_and_reused() {
        let pool = GroupIdPool::new(128);
        assert_eq!(0, pool.alloc(3).expect("a"));
        assert_eq!(3, pool.alloc(70).expect("b"));
        assert_eq!(73, pool.in_use());
        pool.free(0, 3);
        assert_eq!(0, pool.alloc(2).expect("fits the hole"));
        assert_eq!(73, pool.alloc(4).expect("hole too small for 4"));
        assert_eq!(76, pool.in_use());
    }

    #[test]
    fn exhaustion_is_an_error() {
        let pool = GroupIdPool::new(8);
        pool.alloc(6).expect("a");
        assert!(matches!(pool.alloc(3), Err(UmdError::AllocGroupId { count: 3 })));
        assert_eq!(6, pool.alloc(2).expect("tail"));
        assert_eq!(0, pool.alloc(0).expect("empty range"));
    }

    #[test]
    fn grid_ids_increment() {
        let ids = GridIdCounter::default();
        assert_eq!(0, ids.next());
        assert_eq!(1, ids.next());
    }
}
