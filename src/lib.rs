pub mod base;
pub mod builtin;
pub mod device;
pub mod error;
pub mod graph;
pub mod job;
pub mod sim;
pub mod tcb;
pub mod timeq;
pub mod ui;

#[cfg(test)]
mod unit_tests;

pub use device::{Device, HardwareDevice, SimulatorDevice};
pub use error::{Result, UmdError};
pub use graph::Graph;
pub use job::{Job, JobConfig, JobState};
