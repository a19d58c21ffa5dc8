//! gArch64 opcode table.
//!
//! Every instruction is a 2-byte little-endian opcode followed by zero, one
//! or two operand words. An operand word is `2 * block_size` bytes wide and
//! little-endian. The table below is the only place that says how many
//! operand words follow a given opcode; the fetch stage trusts it blindly.

use serde::{Deserialize, Serialize};

/// General purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Register {
    A,
    X,
    Y,
}

impl Register {
    pub const ALL: [Register; 3] = [Register::A, Register::X, Register::Y];

    #[inline(always)]
    pub fn to_usize(self) -> usize {
        match self {
            Register::A => 0,
            Register::X => 1,
            Register::Y => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::A => "A",
            Register::X => "X",
            Register::Y => "Y",
        }
    }
}

/// Memory access granularity used by load/store/copy instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Double,
    Quad,
}

impl Width {
    /// Number of bytes moved by an access of this width.
    pub fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Double => 4,
            Width::Quad => 8,
        }
    }
}

/// Branch condition, evaluated against the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Always,
    Zero,
    NotZero,
    Carry,
    NotCarry,
}

/// How a control-flow operand is turned into a target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Signed displacement from the first byte of the instruction.
    Relative,
    /// Operand is the target address.
    Absolute,
}

/// Accumulator operations. All of them write A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    ShlByte,
    ShrByte,
    SignExtendByte,
    SignExtendWord,
    SignExtendDouble,
}

/// Decoded instruction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Halt,
    HaltZ,
    SetStack,
    SetIvt,
    Alu(AluOp),
    CompareImm(Register),
    CompareReg(Register, Register),
    Jump(Target, Condition),
    Call(Target, Condition),
    JumpA,
    CallA,
    Ret,
    LoadImm(Register),
    Transfer { from: Register, to: Register },
    Push(Register),
    Pop(Register),
    PushAll,
    PopAll,
    Int,
    IntDefine,
    Load(Register, Width),
    Store(Register, Width),
    LoadIndirect(Width),
    StoreIndirect(Width),
    Copy(Width),
    Page,
    Free,
    Relocate,
    Reduce,
    Extend,
}

/// One row of the opcode table.
#[derive(Debug, PartialEq, Eq)]
pub struct OpcodeInfo {
    pub opcode: u16,
    pub name: &'static str,
    pub mnemonic: Mnemonic,
    /// Number of operand words that follow the opcode.
    pub operands: u8,
    pub desc: &'static str,
}

impl OpcodeInfo {
    const fn new(
        opcode: u16,
        name: &'static str,
        mnemonic: Mnemonic,
        operands: u8,
        desc: &'static str,
    ) -> Self {
        Self { opcode, name, mnemonic, operands, desc }
    }

    /// Whether operand `idx` is a two's-complement displacement rather than
    /// an unsigned value.
    pub fn is_signed_operand(&self, idx: usize) -> bool {
        match self.mnemonic {
            Mnemonic::Jump(Target::Relative, _) | Mnemonic::Call(Target::Relative, _) => idx == 0,
            Mnemonic::IntDefine => idx == 1,
            _ => false,
        }
    }
}

use AluOp::*;
use Condition::*;
use Mnemonic as M;
use Register::{A, X, Y};
use Target::{Absolute, Relative};
use Width::{Byte, Double, Quad, Word};

/// The opcode table, sorted by opcode value.
pub static OPCODES: &[OpcodeInfo] = &[
    OpcodeInfo::new(0x00, "HALTZ", M::HaltZ, 0, "Stop execution"),
    // --- Special registers ---
    OpcodeInfo::new(0x10, "SETST", M::SetStack, 0, "Set top of stack to A"),
    OpcodeInfo::new(0x11, "SETIV", M::SetIvt, 0, "Set beginning of IVT to A"),
    // --- Arithmetic / logic ---
    OpcodeInfo::new(0x20, "ADD", M::Alu(Add), 0, "A = X + Y"),
    OpcodeInfo::new(0x21, "SUB", M::Alu(Sub), 0, "A = X - Y"),
    OpcodeInfo::new(0x22, "MUL", M::Alu(Mul), 0, "A = X * Y"),
    OpcodeInfo::new(0x23, "DIV", M::Alu(Div), 0, "A = X / Y"),
    OpcodeInfo::new(0x24, "AND", M::Alu(And), 0, "A = X & Y"),
    OpcodeInfo::new(0x25, "OR", M::Alu(Or), 0, "A = X | Y"),
    OpcodeInfo::new(0x26, "XOR", M::Alu(Xor), 0, "A = X ^ Y"),
    OpcodeInfo::new(0x27, "NOT", M::Alu(Not), 0, "A = ~X"),
    OpcodeInfo::new(0x28, "SHL", M::Alu(Shl), 0, "A = X << Y"),
    OpcodeInfo::new(0x29, "SHR", M::Alu(Shr), 0, "A = X >> Y"),
    OpcodeInfo::new(0x2A, "SHLB", M::Alu(ShlByte), 0, "A = X << 8"),
    OpcodeInfo::new(0x2B, "SHRB", M::Alu(ShrByte), 0, "A = X >> 8"),
    OpcodeInfo::new(0x2C, "MOD", M::Alu(Mod), 0, "A = X % Y"),
    OpcodeInfo::new(0x2D, "SXTW", M::Alu(SignExtendByte), 0, "A (i8) -> A (i16)"),
    OpcodeInfo::new(0x2E, "SXTD", M::Alu(SignExtendWord), 0, "A (i16) -> A (i32)"),
    OpcodeInfo::new(0x2F, "SXTQ", M::Alu(SignExtendDouble), 0, "A (i32) -> A (i64)"),
    // --- Absolute control flow, compare, return ---
    OpcodeInfo::new(0x30, "AJMP", M::Jump(Absolute, Always), 1, "Jump to address"),
    OpcodeInfo::new(0x31, "AJZ", M::Jump(Absolute, Zero), 1, "Jump if Z flag set"),
    OpcodeInfo::new(0x32, "AJNZ", M::Jump(Absolute, NotZero), 1, "Jump if Z flag not set"),
    OpcodeInfo::new(0x33, "AJC", M::Jump(Absolute, Carry), 1, "Jump if carry"),
    OpcodeInfo::new(0x34, "AJNC", M::Jump(Absolute, NotCarry), 1, "Jump if not carry"),
    OpcodeInfo::new(0x35, "CMPA", M::CompareImm(A), 1, "A ? imm"),
    OpcodeInfo::new(0x36, "CMPX", M::CompareImm(X), 1, "X ? imm"),
    OpcodeInfo::new(0x37, "RET", M::Ret, 0, "Pop return address and jump to it"),
    OpcodeInfo::new(0x38, "ACALL", M::Call(Absolute, Always), 1, "Call address"),
    OpcodeInfo::new(0x39, "ABZ", M::Call(Absolute, Zero), 1, "Call if Z flag set"),
    OpcodeInfo::new(0x3A, "ABNZ", M::Call(Absolute, NotZero), 1, "Call if Z flag not set"),
    OpcodeInfo::new(0x3B, "ABC", M::Call(Absolute, Carry), 1, "Call if carry"),
    OpcodeInfo::new(0x3C, "ABNC", M::Call(Absolute, NotCarry), 1, "Call if not carry"),
    OpcodeInfo::new(0x3D, "CMPY", M::CompareImm(Y), 1, "Y ? imm"),
    OpcodeInfo::new(0x3E, "CALLV", M::CallA, 0, "Call address held in A"),
    OpcodeInfo::new(0x3F, "JMPV", M::JumpA, 0, "Jump to address held in A"),
    // --- Load immediate ---
    OpcodeInfo::new(0x47, "LDAI", M::LoadImm(A), 1, "Load immediate into A"),
    OpcodeInfo::new(0x48, "LDXI", M::LoadImm(X), 1, "Load immediate into X"),
    OpcodeInfo::new(0x49, "LDYI", M::LoadImm(Y), 1, "Load immediate into Y"),
    // --- Register to register ---
    OpcodeInfo::new(0x50, "MVAX", M::Transfer { from: A, to: X }, 0, "Copy A to X"),
    OpcodeInfo::new(0x51, "MVAY", M::Transfer { from: A, to: Y }, 0, "Copy A to Y"),
    OpcodeInfo::new(0x52, "MVXY", M::Transfer { from: X, to: Y }, 0, "Copy X to Y"),
    OpcodeInfo::new(0x53, "MVXA", M::Transfer { from: X, to: A }, 0, "Copy X to A"),
    OpcodeInfo::new(0x54, "MVYX", M::Transfer { from: Y, to: X }, 0, "Copy Y to X"),
    OpcodeInfo::new(0x55, "MVYA", M::Transfer { from: Y, to: A }, 0, "Copy Y to A"),
    // --- Stack ---
    OpcodeInfo::new(0x60, "PUSHA", M::Push(A), 0, "Push A"),
    OpcodeInfo::new(0x61, "POPA", M::Pop(A), 0, "Pop into A"),
    OpcodeInfo::new(0x62, "PUSHX", M::Push(X), 0, "Push X"),
    OpcodeInfo::new(0x63, "POPX", M::Pop(X), 0, "Pop into X"),
    OpcodeInfo::new(0x64, "PUSHY", M::Push(Y), 0, "Push Y"),
    OpcodeInfo::new(0x65, "POPY", M::Pop(Y), 0, "Pop into Y"),
    OpcodeInfo::new(0x66, "PUSHR", M::PushAll, 0, "Push A, X, Y"),
    OpcodeInfo::new(0x67, "POPR", M::PopAll, 0, "Pop Y, X, A"),
    // --- Relative control flow, register compare ---
    OpcodeInfo::new(0x70, "JMP", M::Jump(Relative, Always), 1, "Jump by displacement"),
    OpcodeInfo::new(0x71, "JZ", M::Jump(Relative, Zero), 1, "Jump if Z flag set"),
    OpcodeInfo::new(0x72, "JNZ", M::Jump(Relative, NotZero), 1, "Jump if Z flag not set"),
    OpcodeInfo::new(0x73, "JC", M::Jump(Relative, Carry), 1, "Jump if carry"),
    OpcodeInfo::new(0x74, "JNC", M::Jump(Relative, NotCarry), 1, "Jump if not carry"),
    OpcodeInfo::new(0x75, "CMAX", M::CompareReg(A, X), 0, "A ? X"),
    OpcodeInfo::new(0x76, "CMAY", M::CompareReg(A, Y), 0, "A ? Y"),
    OpcodeInfo::new(0x77, "CMXY", M::CompareReg(X, Y), 0, "X ? Y"),
    OpcodeInfo::new(0x78, "CALL", M::Call(Relative, Always), 1, "Call by displacement"),
    OpcodeInfo::new(0x79, "BZ", M::Call(Relative, Zero), 1, "Call if Z flag set"),
    OpcodeInfo::new(0x7A, "BNZ", M::Call(Relative, NotZero), 1, "Call if Z flag not set"),
    OpcodeInfo::new(0x7B, "BC", M::Call(Relative, Carry), 1, "Call if carry"),
    OpcodeInfo::new(0x7C, "BNC", M::Call(Relative, NotCarry), 1, "Call if not carry"),
    OpcodeInfo::new(0x7D, "CMXA", M::CompareReg(X, A), 0, "X ? A"),
    OpcodeInfo::new(0x7E, "CMYA", M::CompareReg(Y, A), 0, "Y ? A"),
    OpcodeInfo::new(0x7F, "CMYX", M::CompareReg(Y, X), 0, "Y ? X"),
    // --- Interrupts, byte memory access ---
    OpcodeInfo::new(0x80, "INT", M::Int, 1, "Raise interrupt"),
    OpcodeInfo::new(0x81, "LDA", M::Load(A, Byte), 1, "Load byte into A"),
    OpcodeInfo::new(0x82, "LDX", M::Load(X, Byte), 1, "Load byte into X"),
    OpcodeInfo::new(0x83, "LDY", M::Load(Y, Byte), 1, "Load byte into Y"),
    OpcodeInfo::new(0x84, "STA", M::Store(A, Byte), 1, "Store A as byte"),
    OpcodeInfo::new(0x85, "STX", M::Store(X, Byte), 1, "Store X as byte"),
    OpcodeInfo::new(0x86, "STY", M::Store(Y, Byte), 1, "Store Y as byte"),
    OpcodeInfo::new(0x87, "LDV", M::LoadIndirect(Byte), 0, "A = byte at [X]"),
    OpcodeInfo::new(0x88, "STV", M::StoreIndirect(Byte), 0, "byte at [X] = A"),
    OpcodeInfo::new(0x89, "MOV", M::Copy(Byte), 2, "Copy byte: [dst] = [src]"),
    // --- Interrupt definition, word memory access, paging ---
    OpcodeInfo::new(0x90, "INTR", M::IntDefine, 2, "Map int_id to a subroutine"),
    OpcodeInfo::new(0x91, "LDAW", M::Load(A, Word), 1, "Load word into A"),
    OpcodeInfo::new(0x92, "LDXW", M::Load(X, Word), 1, "Load word into X"),
    OpcodeInfo::new(0x93, "LDYW", M::Load(Y, Word), 1, "Load word into Y"),
    OpcodeInfo::new(0x94, "STAW", M::Store(A, Word), 1, "Store A as word"),
    OpcodeInfo::new(0x95, "STXW", M::Store(X, Word), 1, "Store X as word"),
    OpcodeInfo::new(0x96, "STYW", M::Store(Y, Word), 1, "Store Y as word"),
    OpcodeInfo::new(0x97, "LDVW", M::LoadIndirect(Word), 0, "A = word at [X]"),
    OpcodeInfo::new(0x98, "STVW", M::StoreIndirect(Word), 0, "word at [X] = A"),
    OpcodeInfo::new(0x99, "MOVW", M::Copy(Word), 2, "Copy word: [dst] = [src]"),
    OpcodeInfo::new(0x9A, "PAGE", M::Page, 1, "Allocate page"),
    OpcodeInfo::new(0x9B, "FREE", M::Free, 1, "Free page"),
    OpcodeInfo::new(0x9C, "MOVE", M::Relocate, 2, "Move page mapping old -> new"),
    // --- Block size, double memory access ---
    OpcodeInfo::new(0xA0, "REDUCE", M::Reduce, 0, "Halve block size"),
    OpcodeInfo::new(0xA1, "LDAD", M::Load(A, Double), 1, "Load double into A"),
    OpcodeInfo::new(0xA2, "LDXD", M::Load(X, Double), 1, "Load double into X"),
    OpcodeInfo::new(0xA3, "LDYD", M::Load(Y, Double), 1, "Load double into Y"),
    OpcodeInfo::new(0xA4, "STAD", M::Store(A, Double), 1, "Store A as double"),
    OpcodeInfo::new(0xA5, "STXD", M::Store(X, Double), 1, "Store X as double"),
    OpcodeInfo::new(0xA6, "STYD", M::Store(Y, Double), 1, "Store Y as double"),
    OpcodeInfo::new(0xA7, "LDVD", M::LoadIndirect(Double), 0, "A = double at [X]"),
    OpcodeInfo::new(0xA8, "STVD", M::StoreIndirect(Double), 0, "double at [X] = A"),
    OpcodeInfo::new(0xA9, "MOVD", M::Copy(Double), 2, "Copy double: [dst] = [src]"),
    // Assemblers emit 0xA1 for EXTEND, which is LDAD here; 0xAA is this
    // table's own value.
    OpcodeInfo::new(0xAA, "EXTEND", M::Extend, 0, "Double block size"),
    // --- Quad memory access ---
    OpcodeInfo::new(0xB1, "LDAQ", M::Load(A, Quad), 1, "Load quad into A"),
    OpcodeInfo::new(0xB2, "LDXQ", M::Load(X, Quad), 1, "Load quad into X"),
    OpcodeInfo::new(0xB3, "LDYQ", M::Load(Y, Quad), 1, "Load quad into Y"),
    OpcodeInfo::new(0xB4, "STAQ", M::Store(A, Quad), 1, "Store A as quad"),
    OpcodeInfo::new(0xB5, "STXQ", M::Store(X, Quad), 1, "Store X as quad"),
    OpcodeInfo::new(0xB6, "STYQ", M::Store(Y, Quad), 1, "Store Y as quad"),
    OpcodeInfo::new(0xB7, "LDVQ", M::LoadIndirect(Quad), 0, "A = quad at [X]"),
    OpcodeInfo::new(0xB8, "STVQ", M::StoreIndirect(Quad), 0, "quad at [X] = A"),
    OpcodeInfo::new(0xB9, "MOVQ", M::Copy(Quad), 2, "Copy quad: [dst] = [src]"),
    OpcodeInfo::new(0xFF, "HALT", M::Halt, 0, "Stop execution"),
];

/// Look up an opcode. `None` means the value is not a gArch64 instruction.
pub fn lookup(opcode: u16) -> Option<&'static OpcodeInfo> {
    OPCODES
        .binary_search_by_key(&opcode, |info| info.opcode)
        .ok()
        .map(|idx| &OPCODES[idx])
}

/// Look up an instruction by its assembler name (case-insensitive).
pub fn by_name(name: &str) -> Option<&'static OpcodeInfo> {
    OPCODES.iter().find(|info| info.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_and_unique() {
        for pair in OPCODES.windows(2) {
            assert!(
                pair[0].opcode < pair[1].opcode,
                "{} (0x{:02X}) is out of order before {} (0x{:02X})",
                pair[0].name,
                pair[0].opcode,
                pair[1].name,
                pair[1].opcode
            );
        }
    }

    #[test]
    fn names_are_unique() {
        for (i, a) in OPCODES.iter().enumerate() {
            for b in &OPCODES[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn lookup_hits_and_misses() {
        let jmp = lookup(0x70).unwrap();
        assert_eq!(jmp.name, "JMP");
        assert_eq!(jmp.operands, 1);
        assert!(jmp.is_signed_operand(0));

        let ajmp = lookup(0x30).unwrap();
        assert!(!ajmp.is_signed_operand(0));

        assert_eq!(lookup(0xFF).unwrap().mnemonic, Mnemonic::Halt);
        assert_eq!(lookup(0x00).unwrap().mnemonic, Mnemonic::HaltZ);
        assert!(lookup(0x01).is_none());
        assert!(lookup(0xFFFF).is_none());
    }

    #[test]
    fn operand_counts_match_mnemonic_shape() {
        for info in OPCODES {
            let expected = match info.mnemonic {
                Mnemonic::Copy(_) | Mnemonic::IntDefine | Mnemonic::Relocate => 2,
                Mnemonic::Jump(..)
                | Mnemonic::Call(..)
                | Mnemonic::CompareImm(_)
                | Mnemonic::LoadImm(_)
                | Mnemonic::Load(..)
                | Mnemonic::Store(..)
                | Mnemonic::Int
                | Mnemonic::Page
                | Mnemonic::Free => 1,
                _ => 0,
            };
            assert_eq!(info.operands, expected, "{}", info.name);
        }
    }

    #[test]
    fn intr_displacement_is_second_operand() {
        let intr = by_name("intr").unwrap();
        assert_eq!(intr.opcode, 0x90);
        assert!(!intr.is_signed_operand(0));
        assert!(intr.is_signed_operand(1));
    }

    #[test]
    fn width_families_share_offsets() {
        for (base, width) in [(0x81u16, Width::Byte), (0x91, Width::Word), (0xA1, Width::Double), (0xB1, Width::Quad)] {
            assert_eq!(lookup(base).unwrap().mnemonic, Mnemonic::Load(Register::A, width));
            assert_eq!(lookup(base + 3).unwrap().mnemonic, Mnemonic::Store(Register::A, width));
            assert_eq!(lookup(base + 8).unwrap().mnemonic, Mnemonic::Copy(width));
        }
    }
}
