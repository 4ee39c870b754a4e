//! Tick-based timing for the simulator model.
//!
//! A grid admitted to a command pool receives a `Ticket` carrying the cycle at
//! which it retires; the latency law is a fixed grid cost, a per-task cost and
//! an optional uniformly distributed jitter.

use rand::Rng;

pub type Cycle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
}

impl Ticket {
    pub fn new(issued_at: Cycle, ready_at: Cycle) -> Self {
        Self { issued_at, ready_at }
    }

    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyModel {
    pub grid_latency: Cycle,
    pub task_latency: Cycle,
    pub jitter: Cycle,
}

impl LatencyModel {
    pub fn issue<R: Rng>(&self, now: Cycle, tasks: u64, rng: &mut R) -> Ticket {
        let jitter = if self.jitter > 0 { rng.gen_range(0..=self.jitter) } else { 0 };
        let latency = self
            .grid_latency
            .saturating_add(self.task_latency.saturating_mul(tasks))
            .saturating_add(jitter)
            .max(1);
        Ticket::new(now, now.saturating_add(latency))
    }
}
