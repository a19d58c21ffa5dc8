pub mod cpu;
pub mod devices;
pub mod dump;
pub mod emulator;
pub mod isa;
pub mod loader;
pub mod memory;
pub mod snapshot;
pub mod timing;
pub mod trace;

pub use cpu::{BlockSize, Cpu, CpuState, Fault, HaltKind, HaltReason, StepEvent};
pub use devices::{Port, SerialConsole};
pub use emulator::{Emulator, EmulatorConfig, EmulatorError, RunExit};
pub use memory::Memory;
