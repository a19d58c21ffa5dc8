pub mod core;
pub mod execution;
pub mod types;

pub use core::Cpu;
pub use execution::{Retired, StepEvent};
pub use types::{BlockSize, CpuState, Fault, HaltKind, HaltReason};
