//! Execution trace.
//!
//! Records every retired instruction once the program proper is reached,
//! and renders the log in a fixed-column text layout:
//!
//! ```text
//! > 00000010: [71] JZ          -8,        0   //   A:        0 , X:        3 , Y:        1   //
//! ```
//!
//! A leading `>` marks an instruction reached by a jump.

use crate::cpu::{Cpu, Retired};
use crate::cpu::execution::sign_extend;
use crate::isa::Mnemonic;
use crate::memory::Memory;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub start: u32,
    pub opcode: u16,
    pub name: &'static str,
    /// Operands, sign-extended where the instruction treats them as
    /// displacements.
    pub operands: [i64; 2],
    /// Registers after the instruction.
    pub regs: [u64; 3],
    /// Memory cell touched by a load/store/copy, read after the instruction.
    pub cell: Option<(u32, u8)>,
    pub jumped: bool,
}

/// Collects [`TraceEntry`] values once armed.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    entries: Vec<TraceEntry>,
    armed: bool,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the recorder when execution reaches `start_pc`.
    pub fn observe_pc(&mut self, pc: u32, start_pc: u32) {
        if pc == start_pc {
            self.armed = true;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn record(&mut self, retired: &Retired, cpu: &Cpu, mem: &Memory) {
        if !self.armed {
            return;
        }
        let info = retired.info;
        let bits = cpu.block_size().bits();
        let mut operands = [0i64; 2];
        for (idx, slot) in operands.iter_mut().enumerate() {
            let raw = retired.operands[idx];
            *slot = if info.is_signed_operand(idx) {
                sign_extend(raw, bits)
            } else {
                raw as i64
            };
        }

        let cell_addr = match info.mnemonic {
            Mnemonic::Load(..) | Mnemonic::Store(..) | Mnemonic::Copy(_) => {
                Some(retired.operands[0] as u32)
            }
            Mnemonic::LoadIndirect(_) | Mnemonic::StoreIndirect(_) => Some(cpu.regs[1] as u32),
            _ => None,
        };
        let cell = cell_addr.map(|addr| (addr, mem.load_bypass_devices(addr).unwrap_or(0)));

        self.entries.push(TraceEntry {
            start: retired.start,
            opcode: info.opcode,
            name: info.name,
            operands,
            regs: cpu.regs,
            cell,
            jumped: retired.jumped,
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut prev_jumped = false;
        for entry in &self.entries {
            let marker = if prev_jumped { "> " } else { "  " };
            write!(
                out,
                "{}{:08X}: [{:02X}] {:<5} {}, {}   //   A: {:8X} , X: {:8X} , Y: {:8X}   //",
                marker,
                entry.start,
                entry.opcode,
                entry.name,
                hex_operand(entry.operands[0]),
                hex_operand(entry.operands[1]),
                entry.regs[0],
                entry.regs[1],
                entry.regs[2],
            )?;
            if let Some((addr, value)) = entry.cell {
                write!(out, "    x{:08X} =       {:2X}", addr, value)?;
            }
            writeln!(out)?;
            prev_jumped = entry.jumped;
        }
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_to(&mut out)?;
        out.flush()
    }
}

/// Hex right-aligned in 8 columns, with a leading minus for negatives.
fn hex_operand(value: i64) -> String {
    if value < 0 {
        format!("{:>8}", format!("-{:X}", value.unsigned_abs()))
    } else {
        format!("{:8X}", value)
    }
}
