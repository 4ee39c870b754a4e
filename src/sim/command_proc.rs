use crate::builtin::queue::BoundedQueue;
use crate::device::Qos;
use crate::sim::config::PartitionMode;
use crate::timeq::{Cycle, Ticket};

/// Command pools per QoS class, four clusters each for the lower and upper
/// partition: sixteen pools, one status bit apiece.
pub const CMDPOOL_COUNT: usize = 16;
pub const MAX_CLUSTERS: u32 = 4;

/// Bit of the TSM status register that reads 1 when the pool serving
/// (`qos`, `partition_id`, `cluster`) cannot take another grid.
pub fn cmdpool_full_bit(qos: Qos, partition_id: u32, mode: PartitionMode, cluster: u32) -> u32 {
    let upper = mode == PartitionMode::Scp && partition_id == 1;
    match (qos, upper) {
        (Qos::Slow, false) => cluster,
        (Qos::Slow, true) => cluster + 4,
        (Qos::Fast, false) => cluster + 8,
        (Qos::Fast, true) => cluster + 12,
    }
}

pub fn is_cmdpool_full(qos: Qos, partition_id: u32, mode: PartitionMode, cluster: u32, status: u32) -> bool {
    status & (1 << cmdpool_full_bit(qos, partition_id, mode, cluster)) != 0
}

/// A grid accepted by a command pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRun {
    pub grid_id: u16,
    pub head: u64,
    pub tcb_number: u32,
    pub faulted: bool,
    pub ticket: Ticket,
}

/// Command pool occupancy of the simulated task scheduler.
///
/// Assumptions:
/// - grids in one pool retire independently of each other
/// - a pool frees its slot the cycle its grid retires
#[derive(Debug)]
pub struct CommandProcessor {
    mode: PartitionMode,
    pools: Vec<BoundedQueue<GridRun>>,
}

impl CommandProcessor {
    pub fn new(mode: PartitionMode, capacity: usize) -> Self {
        Self {
            mode,
            pools: (0..CMDPOOL_COUNT).map(|_| BoundedQueue::new(capacity.max(1))).collect(),
        }
    }

    pub fn status(&self) -> u32 {
        self.pools
            .iter()
            .enumerate()
            .filter(|(_, pool)| pool.is_full())
            .fold(0u32, |acc, (bit, _)| acc | (1 << bit))
    }

    /// Hands the run back when the target pool is full.
    pub fn dispatch(&mut self, run: GridRun, qos: Qos, partition_id: u32, cluster: u32) -> Result<(), GridRun> {
        if cluster >= MAX_CLUSTERS {
            return Err(run);
        }
        let bit = cmdpool_full_bit(qos, partition_id, self.mode, cluster) as usize;
        self.pools[bit].try_enq(run)
    }

    /// Every grid whose ticket is ready at `now`, in pool order.
    pub fn retire(&mut self, now: Cycle) -> Vec<GridRun> {
        self.pools
            .iter_mut()
            .flat_map(|pool| pool.drain_where(|run| run.ticket.is_ready(now)))
            .collect()
    }

    pub fn inflight(&self) -> usize {
        self.pools.iter().map(|p| p.len()).sum()
    }

    pub fn reset(&mut self) {
        self.pools.iter_mut().for_each(|p| p.clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(grid_id: u16, ready_at: Cycle) -> GridRun {
        GridRun { grid_id, head: 0, tcb_number: 3, faulted: false, ticket: Ticket::new(0, ready_at) }
    }

    #[test]
    fn status_bits_follow_qos_and_partition() {
        assert_eq!(0, cmdpool_full_bit(Qos::Slow, 0, PartitionMode::Pcp, 0));
        assert_eq!(1, cmdpool_full_bit(Qos::Slow, 1, PartitionMode::Pcp, 1));
        assert_eq!(5, cmdpool_full_bit(Qos::Slow, 1, PartitionMode::Scp, 1));
        assert_eq!(10, cmdpool_full_bit(Qos::Fast, 0, PartitionMode::Scp, 2));
        assert_eq!(12, cmdpool_full_bit(Qos::Fast, 1, PartitionMode::Scp, 0));
    }

    #[test]
    fn full_pool_sets_its_bit_only() {
        let mut cp = CommandProcessor::new(PartitionMode::Pcp, 1);
        cp.dispatch(run(1, 5), Qos::Fast, 0, 0).expect("free pool");
        let status = cp.status();
        assert!(is_cmdpool_full(Qos::Fast, 0, PartitionMode::Pcp, 0, status));
        assert!(!is_cmdpool_full(Qos::Slow, 0, PartitionMode::Pcp, 0, status));
        assert!(cp.dispatch(run(2, 5), Qos::Fast, 0, 0).is_err());
        assert!(cp.dispatch(run(2, 5), Qos::Slow, 0, 0).is_ok());

        assert!(cp.retire(4).is_empty());
        let retired: Vec<u16> = cp.retire(5).iter().map(|r| r.grid_id).collect();
        assert_eq!(vec![2, 1], retired);
        assert_eq!(0, cp.status());
        assert_eq!(0, cp.inflight());
    }
}
