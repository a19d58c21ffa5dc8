//! Post-mortem dumps: a human-readable core dump and a raw memory image.

use crate::cpu::{BlockSize, Cpu, CpuState, HaltKind, HaltReason};
use crate::memory::{DEVICE_PAGE, Memory, PAGE_SHIFT, PAGE_SIZE};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Write the state, register and RAM sections of a core dump.
///
/// With `emulation_error` set only the header is written, since the CPU
/// state is not meaningful after the driver gave up.
pub fn core_dump<W: Write>(
    out: &mut W,
    cpu: &Cpu,
    mem: &Memory,
    emulation_error: bool,
) -> io::Result<()> {
    writeln!(out, "Stopped at x{:X}", cpu.pc)?;
    writeln!(out, "\n<--- STATE DUMP --->")?;
    if emulation_error {
        writeln!(out, "Internal emulation error")?;
        return Ok(());
    }
    match cpu.state {
        CpuState::Running => writeln!(out, "Interrupted")?,
        CpuState::Halted(HaltReason::Instruction(HaltKind::Halt)) => {
            writeln!(out, "Halted via 0xFF (HALT)")?
        }
        CpuState::Halted(HaltReason::Instruction(HaltKind::HaltZ)) => {
            writeln!(out, "Halted via 0x00 (HALTZ)")?
        }
        CpuState::Halted(HaltReason::Fatal { fault, cause }) => {
            writeln!(out, "Halted by unhandled {} ({})", fault, cause)?
        }
    }
    writeln!(out)?;
    writeln!(out, "Stack Top     : {}", hex_or_unset(mem.stack_base()))?;
    writeln!(out, "Stack Position: {:8X}", mem.stack_pos())?;
    writeln!(out, "IVT zero      : {}", hex_or_unset(mem.ivt_base()))?;

    writeln!(out, "\n<--- REGISTER DUMP --->")?;
    for (name, value) in ["A", "X", "Y"].iter().zip(cpu.regs) {
        writeln!(out, "{}: {:03}  (x{:02X})", name, value, value)?;
    }

    ram_dump(out, mem, cpu.block_size() != BlockSize::default())
}

fn hex_or_unset(value: Option<u32>) -> String {
    match value {
        Some(v) => format!("{:8X}", v),
        None => format!("{:>8}", "unset"),
    }
}

/// Non-zero bytes of every mapped page except the device page.
///
/// The short layout packs four cells per line with their ASCII rendering;
/// the long one prints one full address per line.
pub fn ram_dump<W: Write>(out: &mut W, mem: &Memory, long: bool) -> io::Result<()> {
    writeln!(out, "\n<--- RAM DUMP --->")?;
    for page in mem.mapped_pages() {
        if page == DEVICE_PAGE {
            continue;
        }
        let Some(data) = mem.page_frame(page).and_then(|f| mem.frame(f)) else {
            continue;
        };
        let cells = data.iter().enumerate().filter(|(_, v)| **v != 0);
        for (idx, (offset, &value)) in cells.enumerate() {
            if long {
                let addr = (page << PAGE_SHIFT) | offset as u32;
                writeln!(out, "{:016X}: {:02X}", addr, value)?;
            } else {
                let shown = ascii_repr(value);
                write!(
                    out,
                    "{:05X}{:03X}: {:02X} : {:<8}",
                    page, offset, value, shown
                )?;
                if idx % 4 == 3 {
                    writeln!(out)?;
                }
            }
        }
        write!(out, "\n\n")?;
    }
    Ok(())
}

/// Quoted ASCII rendering of a byte, escaping anything non-printable.
fn ascii_repr(value: u8) -> String {
    match value {
        b'\'' => "\"'\"".to_string(),
        b'\\' => "'\\\\'".to_string(),
        b'\t' => "'\\t'".to_string(),
        b'\n' => "'\\n'".to_string(),
        b'\r' => "'\\r'".to_string(),
        0x20..=0x7E => format!("'{}'", value as char),
        _ => format!("'\\x{:02x}'", value),
    }
}

pub fn save_core_dump<P: AsRef<Path>>(
    path: P,
    cpu: &Cpu,
    mem: &Memory,
    emulation_error: bool,
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    core_dump(&mut out, cpu, mem, emulation_error)?;
    out.flush()
}

/// Bytes of the contiguous run of mapped pages starting at page 0.
pub fn raw_image(mem: &Memory) -> Vec<u8> {
    let mut image = Vec::new();
    let mut page = 0u32;
    while page != DEVICE_PAGE {
        let Some(data) = mem.page_frame(page).and_then(|f| mem.frame(f)) else {
            break;
        };
        image.extend_from_slice(&data[..PAGE_SIZE]);
        page += 1;
    }
    image
}

pub fn save_raw_dump<P: AsRef<Path>>(path: P, mem: &Memory) -> io::Result<()> {
    std::fs::write(path, raw_image(mem))
}
