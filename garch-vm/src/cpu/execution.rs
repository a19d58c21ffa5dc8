use crate::isa::{self, AluOp, Condition, Mnemonic, OpcodeInfo, Register, Target, Width};
use crate::memory::Memory;

use super::core::Cpu;
use super::types::{CpuState, Fault, HaltKind, HaltReason};

/// An instruction that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired {
    /// Address of the opcode's first byte.
    pub start: u32,
    pub info: &'static OpcodeInfo,
    /// Operand words as fetched (unused slots are zero).
    pub operands: [u64; 2],
    /// PC differs from the address right after the instruction.
    pub jumped: bool,
}

/// Outcome of one [`Cpu::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Retired(Retired),
    /// The instruction faulted and the CPU entered the handler of `vector`.
    Routed { fault: Fault, vector: u32 },
    Halted(HaltReason),
}

/// Sign-extend the low `bits` of `value`.
#[inline]
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Operand value converted to an interrupt id. Values past `u32` stay out of
/// range instead of wrapping back into the table.
#[inline]
fn interrupt_id(operand: u64) -> u32 {
    u32::try_from(operand).unwrap_or(u32::MAX)
}

/// Operand value converted to a page number. Values past `u32` saturate so
/// the memory manager still sees them as out of range.
#[inline]
fn page_number(operand: u64) -> u32 {
    u32::try_from(operand).unwrap_or(u32::MAX)
}

impl Cpu {
    /// Execute one instruction.
    ///
    /// Faults raised while fetching or executing are routed through the IVT
    /// before this returns; they never reach the caller as errors.
    pub fn step(&mut self, mem: &mut Memory) -> StepEvent {
        if let CpuState::Halted(reason) = self.state {
            return StepEvent::Halted(reason);
        }
        match self.execute_one(mem) {
            Ok(event) => event,
            Err(fault) => self.route_fault(mem, fault),
        }
    }

    #[inline]
    fn fetch_byte(&mut self, mem: &mut Memory) -> Result<u8, Fault> {
        let byte = mem.load(self.pc)?;
        self.pc = self.pc.wrapping_add(1);
        Ok(byte)
    }

    /// Fetch an operand word: `2 * block_size` bytes, little-endian.
    fn fetch_operand(&mut self, mem: &mut Memory) -> Result<u64, Fault> {
        let mut value = 0u64;
        for i in 0..self.block_size().bytes() {
            value |= (self.fetch_byte(mem)? as u64) << (8 * i);
        }
        Ok(value)
    }

    fn execute_one(&mut self, mem: &mut Memory) -> Result<StepEvent, Fault> {
        let start = self.pc;
        let lo = self.fetch_byte(mem)?;
        let hi = self.fetch_byte(mem)?;
        let opcode = u16::from_le_bytes([lo, hi]);
        let info = isa::lookup(opcode).ok_or(Fault::UnknownOpcode(opcode))?;

        let mut operands = [0u64; 2];
        for slot in operands.iter_mut().take(info.operands as usize) {
            *slot = self.fetch_operand(mem)?;
        }
        let next = self.pc;

        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "{:08x}: {:<6} {:x?} A={:x} X={:x} Y={:x}",
                start,
                info.name,
                &operands[..info.operands as usize],
                self.regs[0],
                self.regs[1],
                self.regs[2]
            );
        }

        if let Some(kind) = self.execute(mem, info, start, operands)? {
            let reason = HaltReason::Instruction(kind);
            self.state = CpuState::Halted(reason);
            return Ok(StepEvent::Halted(reason));
        }

        Ok(StepEvent::Retired(Retired {
            start,
            info,
            operands,
            jumped: self.pc != next,
        }))
    }

    #[inline]
    fn holds(&self, cond: Condition) -> bool {
        match cond {
            Condition::Always => true,
            Condition::Zero => self.zero,
            Condition::NotZero => !self.zero,
            Condition::Carry => self.carry,
            Condition::NotCarry => !self.carry,
        }
    }

    fn target(&self, kind: Target, operand: u64, start: u32) -> u32 {
        match kind {
            Target::Relative => {
                let disp = sign_extend(operand, self.block_size().bits());
                start.wrapping_add(disp as u32)
            }
            Target::Absolute => operand as u32,
        }
    }

    fn call(&mut self, mem: &mut Memory, target: u32) -> Result<(), Fault> {
        mem.push_double(self.pc)?;
        self.pc = target;
        Ok(())
    }

    /// Run a decoded instruction. Returns the halt kind for halt
    /// instructions.
    fn execute(
        &mut self,
        mem: &mut Memory,
        info: &'static OpcodeInfo,
        start: u32,
        ops: [u64; 2],
    ) -> Result<Option<HaltKind>, Fault> {
        match info.mnemonic {
            Mnemonic::Halt => return Ok(Some(HaltKind::Halt)),
            Mnemonic::HaltZ => return Ok(Some(HaltKind::HaltZ)),

            Mnemonic::SetStack => mem.set_stack_base(self.read_reg(Register::A) as u32),
            Mnemonic::SetIvt => mem.set_ivt_base(self.read_reg(Register::A) as u32),

            Mnemonic::Alu(op) => self.alu(op),

            Mnemonic::CompareImm(reg) => self.compare(self.read_reg(reg), ops[0]),
            Mnemonic::CompareReg(lhs, rhs) => self.compare(self.read_reg(lhs), self.read_reg(rhs)),

            Mnemonic::Jump(kind, cond) => {
                if self.holds(cond) {
                    self.pc = self.target(kind, ops[0], start);
                }
            }
            Mnemonic::Call(kind, cond) => {
                if self.holds(cond) {
                    let target = self.target(kind, ops[0], start);
                    self.call(mem, target)?;
                }
            }
            Mnemonic::JumpA => self.pc = self.read_reg(Register::A) as u32,
            Mnemonic::CallA => {
                let target = self.read_reg(Register::A) as u32;
                self.call(mem, target)?;
            }
            Mnemonic::Ret => self.pc = mem.pop_double()?,

            Mnemonic::LoadImm(reg) => self.write_reg(reg, ops[0]),
            Mnemonic::Transfer { from, to } => self.write_reg(to, self.read_reg(from)),

            // Register slots are always doubles, whatever the block size.
            Mnemonic::Push(reg) => mem.push_double(self.read_reg(reg) as u32)?,
            Mnemonic::Pop(reg) => {
                let value = mem.pop_double()?;
                self.write_reg(reg, value as u64);
            }
            Mnemonic::PushAll => {
                for reg in Register::ALL {
                    mem.push_double(self.read_reg(reg) as u32)?;
                }
            }
            Mnemonic::PopAll => {
                for reg in Register::ALL.into_iter().rev() {
                    let value = mem.pop_double()?;
                    self.write_reg(reg, value as u64);
                }
            }

            Mnemonic::Int => {
                // An empty user entry means nothing is installed.
                let target = mem.find_int(interrupt_id(ops[0]))?;
                if target != 0 {
                    self.call(mem, target)?;
                }
            }
            Mnemonic::IntDefine => {
                let disp = sign_extend(ops[1], self.block_size().bits());
                let target = start.wrapping_add(disp as u32);
                mem.register_int(interrupt_id(ops[0]), target)?;
            }

            Mnemonic::Load(reg, width) => {
                let value = mem.load_sized(ops[0] as u32, width.bytes())?;
                self.write_reg(reg, value);
            }
            Mnemonic::Store(reg, width) => {
                mem.store_sized(ops[0] as u32, width.bytes(), self.read_reg(reg))?
            }
            Mnemonic::LoadIndirect(width) => {
                let addr = self.read_reg(Register::X) as u32;
                let value = mem.load_sized(addr, width.bytes())?;
                self.write_reg(Register::A, value);
            }
            Mnemonic::StoreIndirect(width) => {
                let addr = self.read_reg(Register::X) as u32;
                mem.store_sized(addr, width.bytes(), self.read_reg(Register::A))?;
            }
            Mnemonic::Copy(width) => self.copy(mem, width, ops[0] as u32, ops[1] as u32)?,

            Mnemonic::Page => {
                mem.allocate_page(page_number(ops[0]), None)?;
            }
            Mnemonic::Free => mem.free_page(page_number(ops[0])),
            Mnemonic::Relocate => {
                mem.relocate_page(page_number(ops[0]), page_number(ops[1]))?;
            }

            Mnemonic::Reduce => self.set_block_size(self.block_size().halved()),
            Mnemonic::Extend => self.set_block_size(self.block_size().doubled()),
        }

        Ok(None)
    }

    fn copy(&mut self, mem: &mut Memory, width: Width, dst: u32, src: u32) -> Result<(), Fault> {
        let value = mem.load_sized(src, width.bytes())?;
        mem.store_sized(dst, width.bytes(), value)
    }

    fn alu(&mut self, op: AluOp) {
        let x = self.read_reg(Register::X) as u128;
        let y = self.read_reg(Register::Y) as u128;
        let a = self.read_reg(Register::A);
        let mask = self.block_size().mask();

        let wide = match op {
            AluOp::Add => x + y,
            AluOp::Sub => x.wrapping_sub(y),
            AluOp::Mul => x * y,
            AluOp::Div | AluOp::Mod if y == 0 => {
                self.settle(0);
                self.carry = true;
                return;
            }
            AluOp::Div => x / y,
            AluOp::Mod => x % y,
            AluOp::And => x & y,
            AluOp::Or => x | y,
            AluOp::Xor => x ^ y,
            AluOp::Not => !x & mask as u128,
            // Every bit leaves the register; carry if any was set.
            AluOp::Shl if y >= self.block_size().bits() as u128 => {
                self.settle(0);
                self.carry = x != 0;
                return;
            }
            AluOp::Shl => x << y,
            AluOp::Shr => x.checked_shr(y.min(u32::MAX as u128) as u32).unwrap_or(0),
            AluOp::ShlByte => x << 8,
            AluOp::ShrByte => x >> 8,
            AluOp::SignExtendByte => (sign_extend(a, 8) as u64 & mask) as u128,
            AluOp::SignExtendWord => (sign_extend(a, 16) as u64 & mask) as u128,
            AluOp::SignExtendDouble => (sign_extend(a, 32) as u64 & mask) as u128,
        };

        self.settle(wide);
    }
}
