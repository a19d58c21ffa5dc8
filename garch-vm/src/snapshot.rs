use crate::cpu::CpuState;
use serde::{Deserialize, Serialize};

/// Version identifier for snapshot compatibility checks.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Full machine snapshot: CPU registers plus paged memory.
///
/// Device ports are host objects and are not captured; the ports attached
/// to the restoring emulator stay in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub cpu: CpuSnapshot,
    pub memory: MemorySnapshot,
}

/// Serializable CPU state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub pc: u32,
    pub regs: [u64; 3],
    pub carry: bool,
    pub zero: bool,
    pub block_size: u8,
    pub state: CpuState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub stack_base: Option<u32>,
    pub stack_pos: u32,
    pub ivt_base: Option<u32>,
    /// `(page, frame)` for every ordinary mapping.
    pub pages: Vec<(u32, u32)>,
    pub frames: Vec<FrameSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub id: u32,
    /// Hex SHA-256 of `data`.
    pub hash: String,
    pub data: Vec<u8>,
}
