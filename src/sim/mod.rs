pub mod command_proc;
pub mod config;
pub mod flat_mem;
pub mod npu;
