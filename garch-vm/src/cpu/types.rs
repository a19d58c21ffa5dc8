use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Interrupt vector taken for an interrupt id that has no handler.
pub const VEC_UNDEFINED_INTERRUPT: u32 = 0x100;
/// Interrupt vector taken for an opcode missing from the table.
pub const VEC_UNKNOWN_OPCODE: u32 = 0x101;
/// Interrupt vector taken on an access to an unmapped page.
pub const VEC_PAGE_FAULT: u32 = 0x102;
/// Interrupt vector taken for an interrupt id past the end of the IVT.
pub const VEC_IVT_OVERFLOW: u32 = 0x103;

/// Recoverable CPU faults.
///
/// Faults never leave `Cpu::step`: they are routed through the interrupt
/// vector table, or halt the CPU when no handler can take them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Fault {
    #[error("page fault at {0:#010x}")]
    PageFault(u32),

    #[error("undefined interrupt {0:#x}")]
    UndefinedInterrupt(u32),

    #[error("interrupt id {0:#x} overflows the IVT")]
    IvtOverflow(u32),

    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),
}

impl Fault {
    /// Vector id the fault is delivered to.
    pub fn vector(self) -> u32 {
        match self {
            Fault::UndefinedInterrupt(_) => VEC_UNDEFINED_INTERRUPT,
            Fault::UnknownOpcode(_) => VEC_UNKNOWN_OPCODE,
            Fault::PageFault(_) => VEC_PAGE_FAULT,
            Fault::IvtOverflow(_) => VEC_IVT_OVERFLOW,
        }
    }
}

/// Which halt instruction stopped the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltKind {
    /// `HALT` (0xFF)
    Halt,
    /// `HALTZ` (0x00)
    HaltZ,
}

impl HaltKind {
    pub fn opcode(self) -> u16 {
        match self {
            HaltKind::Halt => 0xFF,
            HaltKind::HaltZ => 0x00,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    Instruction(HaltKind),
    /// No handler could service `fault`; `cause` is the fault raised while
    /// trying to deliver it to the undefined-interrupt vector.
    Fatal { fault: Fault, cause: Fault },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuState {
    Running,
    Halted(HaltReason),
}

impl CpuState {
    pub fn is_running(self) -> bool {
        matches!(self, CpuState::Running)
    }
}

/// Operand granularity in units of 16 bits.
///
/// Registers are `16 * n` bits wide and instruction operands are `2 * n`
/// bytes, with `n` one of 1, 2 or 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSize(u8);

impl BlockSize {
    pub const MIN: BlockSize = BlockSize(1);
    pub const MAX: BlockSize = BlockSize(4);

    pub fn new(n: u8) -> Option<Self> {
        match n {
            1 | 2 | 4 => Some(Self(n)),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Operand width in bytes.
    #[inline(always)]
    pub fn bytes(self) -> usize {
        2 * self.0 as usize
    }

    /// Register width in bits.
    #[inline(always)]
    pub fn bits(self) -> u32 {
        16 * self.0 as u32
    }

    /// All-ones mask of the register width.
    #[inline(always)]
    pub fn mask(self) -> u64 {
        if self.0 >= 4 {
            u64::MAX
        } else {
            (1u64 << self.bits()) - 1
        }
    }

    pub fn halved(self) -> Self {
        Self((self.0 / 2).max(Self::MIN.0))
    }

    pub fn doubled(self) -> Self {
        Self((self.0 * 2).min(Self::MAX.0))
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(2)
    }
}
