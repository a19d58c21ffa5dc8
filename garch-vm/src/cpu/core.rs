use crate::isa::Register;
use crate::memory::Memory;

use super::execution::StepEvent;
use super::types::{BlockSize, CpuState, Fault, HaltReason, VEC_UNDEFINED_INTERRUPT};

/// gArch64 CPU core.
pub struct Cpu {
    /// A, X, Y. Always masked to the active register width.
    pub regs: [u64; 3],
    pub pc: u32,
    pub carry: bool,
    pub zero: bool,
    block_size: BlockSize,
    pub state: CpuState,
}

impl Cpu {
    /// Create a CPU that starts fetching at `pc` with the default block size.
    pub fn new(pc: u32) -> Self {
        Self::with_block_size(pc, BlockSize::default())
    }

    pub fn with_block_size(pc: u32, block_size: BlockSize) -> Self {
        Self {
            regs: [0; 3],
            pc,
            carry: false,
            zero: false,
            block_size,
            state: CpuState::Running,
        }
    }

    #[inline(always)]
    pub fn read_reg(&self, reg: Register) -> u64 {
        self.regs[reg.to_usize()]
    }

    #[inline(always)]
    pub fn write_reg(&mut self, reg: Register, value: u64) {
        self.regs[reg.to_usize()] = value & self.block_size.mask();
    }

    #[inline(always)]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Change the register width. Register contents are truncated to the new
    /// width when it shrinks.
    pub fn set_block_size(&mut self, block_size: BlockSize) {
        self.block_size = block_size;
        let mask = block_size.mask();
        for reg in self.regs.iter_mut() {
            *reg &= mask;
        }
    }

    pub fn is_halted(&self) -> bool {
        !self.state.is_running()
    }

    /// Write an ALU result to A and derive both flags from it.
    ///
    /// `carry` is set when masking to the register width changed the value,
    /// `zero` when the stored value is 0.
    pub(super) fn settle(&mut self, wide: u128) {
        let masked = wide & self.block_size.mask() as u128;
        self.regs[Register::A.to_usize()] = masked as u64;
        self.carry = masked != wide;
        self.zero = masked == 0;
    }

    pub(super) fn compare(&mut self, lhs: u64, rhs: u64) {
        self.carry = lhs < rhs;
        self.zero = lhs == rhs;
    }

    /// Push the current PC and jump to the handler of `vector`.
    ///
    /// An empty entry counts as an undefined interrupt, even in the user
    /// range.
    pub(super) fn enter_vector(&mut self, mem: &mut Memory, vector: u32) -> Result<u32, Fault> {
        let target = mem.find_int(vector)?;
        if target == 0 {
            return Err(Fault::UndefinedInterrupt(vector));
        }
        mem.push_double(self.pc)?;
        self.pc = target;
        Ok(target)
    }

    /// Deliver `fault` to its vector, escalating to the undefined-interrupt
    /// vector when that fails. When no handler can be entered the CPU halts.
    pub fn route_fault(&mut self, mem: &mut Memory, fault: Fault) -> StepEvent {
        let pc = self.pc;
        let mut vector = fault.vector();
        loop {
            match self.enter_vector(mem, vector) {
                Ok(target) => {
                    log::debug!(
                        "{} at pc={:#010x} -> vector {:#x} handler {:#010x}",
                        fault,
                        pc,
                        vector,
                        target
                    );
                    return StepEvent::Routed { fault, vector };
                }
                Err(cause) if vector != VEC_UNDEFINED_INTERRUPT => {
                    log::debug!(
                        "{}: vector {:#x} unavailable ({}), escalating",
                        fault,
                        vector,
                        cause
                    );
                    vector = VEC_UNDEFINED_INTERRUPT;
                }
                Err(cause) => {
                    log::debug!("{}: no handler ({}), halting", fault, cause);
                    let reason = HaltReason::Fatal { fault, cause };
                    self.state = CpuState::Halted(reason);
                    return StepEvent::Halted(reason);
                }
            }
        }
    }
}
