pub mod behavior;
pub mod mem;
