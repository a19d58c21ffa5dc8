use crate::cpu::{BlockSize, Cpu, CpuState, Fault, HaltKind, HaltReason, StepEvent};
use crate::devices::SerialConsole;
use crate::loader::{self, BIOS_BASE, PROGRAM_BASE};
use crate::memory::{DEVICE_PAGE, Memory, PAGE_SIZE};
use crate::snapshot::{CpuSnapshot, FrameSnapshot, MemorySnapshot, SNAPSHOT_VERSION, Snapshot};
use crate::timing::TimingStats;
use crate::trace::TraceRecorder;

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

/// Driver-level failures. Guest faults never show up here unless they
/// halted the CPU.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("BIOS binary not found: {0}")]
    MissingBios(String),

    #[error("image of {len} bytes at {base:#010x} overlaps the device page")]
    ImageOverlapsDevice { base: u32, len: usize },

    #[error("image of {len} bytes at {base:#010x} runs past the end of the address space")]
    ImageTooLarge { base: u32, len: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    SnapshotVersion { expected: String, found: String },

    #[error("snapshot frame {frame:#07x} failed its hash check")]
    HashMismatch { frame: u32 },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("recursion/infinite loop blocked: instruction at {addr:#010x} executed more than {limit} times")]
    RecursionLimit { addr: u32, limit: u32 },

    #[error(transparent)]
    Fault(#[from] Fault),

    #[error("unrecoverable {fault}: no handler could be entered ({cause})")]
    Fatal { fault: Fault, cause: Fault },
}

/// Run-time options of the driver.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub block_size: BlockSize,
    /// Stop once any address has been executed more than this many times.
    pub recursion_limit: Option<u32>,
    pub trace: bool,
    pub timing: bool,
    pub max_steps: Option<u64>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            block_size: BlockSize::default(),
            recursion_limit: None,
            trace: false,
            timing: false,
            max_steps: None,
        }
    }
}

/// Why [`Emulator::run`] returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Halted(HaltKind),
    StepLimit,
}

/// CPU, memory and the operator-facing instrumentation around them.
///
/// ```ignore
/// let mut emu = Emulator::new(EmulatorConfig::default());
/// emu.attach_console(SerialConsole::new());
/// emu.boot(&program, &bios)?;
/// let exit = emu.run()?;
/// ```
pub struct Emulator {
    pub cpu: Cpu,
    pub memory: Memory,
    config: EmulatorConfig,

    console: Option<SerialConsole>,
    /// Invoked once per byte the guest writes to the console.
    console_callback: Option<Box<dyn FnMut(u8) + 'static>>,

    trace: Option<TraceRecorder>,
    timing: Option<TimingStats>,
    /// Executions per address, for the recursion guard.
    visits: HashMap<u32, u32>,
    steps: u64,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            cpu: Cpu::with_block_size(BIOS_BASE, config.block_size),
            memory: Memory::new(),
            trace: config.trace.then(TraceRecorder::new),
            timing: config.timing.then(TimingStats::new),
            config,
            console: None,
            console_callback: None,
            visits: HashMap::new(),
            steps: 0,
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Register a serial console as the next device port. Returns its
    /// offset in the device page.
    pub fn attach_console(&mut self, console: SerialConsole) -> usize {
        let offset = self.memory.register_port(Box::new(console.clone()));
        self.console = Some(console);
        offset
    }

    pub fn set_console_callback<F>(&mut self, cb: F)
    where
        F: FnMut(u8) + 'static,
    {
        self.console_callback = Some(Box::new(cb));
    }

    pub fn push_input(&mut self, byte: u8) {
        if let Some(console) = &self.console {
            console.push_input(byte);
        }
    }

    /// Drain console output not yet delivered to a callback.
    pub fn drain_console_output(&mut self) -> Vec<u8> {
        self.console
            .as_ref()
            .map(|c| c.drain_output())
            .unwrap_or_default()
    }

    /// Flash the program at address 0 and the BIOS at `0xFFFF_0000`, and
    /// start executing the BIOS.
    pub fn boot(&mut self, program: &[u8], bios: &[u8]) -> Result<(), EmulatorError> {
        loader::flash(&mut self.memory, PROGRAM_BASE, program)?;
        loader::flash(&mut self.memory, BIOS_BASE, bios)?;
        self.cpu.pc = BIOS_BASE;
        log::debug!(
            "booting: program {} bytes, BIOS {} bytes, pc={:#010x}",
            program.len(),
            bios.len(),
            self.cpu.pc
        );
        Ok(())
    }

    /// Flash the program at address 0 and start executing it directly.
    pub fn boot_bare(&mut self, program: &[u8]) -> Result<(), EmulatorError> {
        loader::flash(&mut self.memory, PROGRAM_BASE, program)?;
        self.cpu.pc = PROGRAM_BASE;
        log::debug!("booting bare: program {} bytes", program.len());
        Ok(())
    }

    /// Read both boot images from disk and [`boot`](Self::boot).
    pub fn boot_from_files<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        program: P,
        bios: Q,
    ) -> Result<(), EmulatorError> {
        let program = loader::read_image(program)?;
        let bios_path = bios.as_ref();
        let bios = match loader::read_image(bios_path) {
            Err(EmulatorError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EmulatorError::MissingBios(bios_path.display().to_string()));
            }
            other => other?,
        };
        self.boot(&program, &bios)
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn trace(&self) -> Option<&TraceRecorder> {
        self.trace.as_ref()
    }

    pub fn timing(&self) -> Option<&TimingStats> {
        self.timing.as_ref()
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        match self.cpu.state {
            CpuState::Running => None,
            CpuState::Halted(reason) => Some(reason),
        }
    }

    /// Execute a single instruction.
    ///
    /// Routed faults are ordinary events. A fatal halt or a tripped
    /// recursion guard is reported as an error.
    pub fn step(&mut self) -> Result<StepEvent, EmulatorError> {
        if let Some(trace) = self.trace.as_mut() {
            trace.observe_pc(self.cpu.pc, PROGRAM_BASE);
        }

        let started = self.timing.is_some().then(Instant::now);
        let event = self.cpu.step(&mut self.memory);
        if let (Some(timing), Some(started)) = (self.timing.as_mut(), started) {
            timing.record(started.elapsed());
        }
        self.steps += 1;

        match event {
            StepEvent::Retired(retired) => {
                if let Some(trace) = self.trace.as_mut() {
                    trace.record(&retired, &self.cpu, &self.memory);
                }
            }
            StepEvent::Halted(HaltReason::Fatal { fault, cause }) => {
                return Err(EmulatorError::Fatal { fault, cause });
            }
            StepEvent::Routed { .. } | StepEvent::Halted(HaltReason::Instruction(_)) => {}
        }

        if let (Some(cb), Some(console)) = (self.console_callback.as_mut(), self.console.as_ref()) {
            while let Some(byte) = console.pop_output() {
                cb(byte);
            }
        }

        if let Some(limit) = self.config.recursion_limit {
            let count = self.visits.entry(self.cpu.pc).or_insert(0);
            *count += 1;
            if *count > limit {
                log::warn!("recursion guard tripped at {:#010x}", self.cpu.pc);
                return Err(EmulatorError::RecursionLimit { addr: self.cpu.pc, limit });
            }
        }

        Ok(event)
    }

    /// Step until the CPU halts or the step budget runs out.
    pub fn run(&mut self) -> Result<RunExit, EmulatorError> {
        loop {
            if let Some(max) = self.config.max_steps {
                if self.steps >= max {
                    return Ok(RunExit::StepLimit);
                }
            }
            if let StepEvent::Halted(HaltReason::Instruction(kind)) = self.step()? {
                log::debug!("halted by {:?} after {} steps", kind, self.steps);
                return Ok(RunExit::Halted(kind));
            }
        }
    }
}

impl Emulator {
    /// Capture CPU state and every frame with backing storage.
    pub fn snapshot(&self) -> Snapshot {
        let cpu = CpuSnapshot {
            pc: self.cpu.pc,
            regs: self.cpu.regs,
            carry: self.cpu.carry,
            zero: self.cpu.zero,
            block_size: self.cpu.block_size().get(),
            state: self.cpu.state,
        };

        let pages = self
            .memory
            .mapped_pages()
            .into_iter()
            .filter(|&page| page != DEVICE_PAGE)
            .filter_map(|page| self.memory.page_frame(page).map(|frame| (page, frame)))
            .collect();

        let frames = self
            .memory
            .frame_ids()
            .into_iter()
            .filter_map(|id| {
                self.memory.frame(id).map(|data| FrameSnapshot {
                    id,
                    hash: frame_hash(data),
                    data: data.to_vec(),
                })
            })
            .collect();

        Snapshot {
            version: SNAPSHOT_VERSION.to_string(),
            cpu,
            memory: MemorySnapshot {
                stack_base: self.memory.stack_base(),
                stack_pos: self.memory.stack_pos(),
                ivt_base: self.memory.ivt_base(),
                pages,
                frames,
            },
        }
    }

    /// Replace CPU and memory state with `snapshot`. Device ports stay
    /// attached.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), EmulatorError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EmulatorError::SnapshotVersion {
                expected: SNAPSHOT_VERSION.to_string(),
                found: snapshot.version.clone(),
            });
        }
        let block_size = BlockSize::new(snapshot.cpu.block_size).ok_or_else(|| {
            EmulatorError::InvalidSnapshot(format!("block size {}", snapshot.cpu.block_size))
        })?;

        // Validate every frame before touching live state.
        let mut frames = Vec::with_capacity(snapshot.memory.frames.len());
        for frame in &snapshot.memory.frames {
            let data: &[u8; PAGE_SIZE] = frame.data.as_slice().try_into().map_err(|_| {
                EmulatorError::InvalidSnapshot(format!(
                    "frame {:#07x} has {} bytes",
                    frame.id,
                    frame.data.len()
                ))
            })?;
            if frame_hash(data) != frame.hash {
                return Err(EmulatorError::HashMismatch { frame: frame.id });
            }
            frames.push((frame.id, data));
        }

        self.memory.clear();
        for (id, data) in frames {
            self.memory.install_frame(id, data);
        }
        for &(page, frame) in &snapshot.memory.pages {
            self.memory.allocate_page(page, Some(frame))?;
        }
        if let Some(base) = snapshot.memory.stack_base {
            self.memory.set_stack_base(base);
        }
        if let Some(base) = snapshot.memory.ivt_base {
            self.memory.set_ivt_base(base);
        }
        self.memory.set_stack_pos(snapshot.memory.stack_pos);

        self.cpu.set_block_size(block_size);
        self.cpu.pc = snapshot.cpu.pc;
        self.cpu.regs = snapshot.cpu.regs;
        self.cpu.carry = snapshot.cpu.carry;
        self.cpu.zero = snapshot.cpu.zero;
        self.cpu.state = snapshot.cpu.state;
        self.visits.clear();

        log::debug!(
            "restored snapshot: pc={:#010x}, {} pages, {} frames",
            self.cpu.pc,
            snapshot.memory.pages.len(),
            snapshot.memory.frames.len()
        );
        Ok(())
    }

    /// Save a snapshot to disk using bincode.
    pub fn save_snapshot_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), EmulatorError> {
        let snap = self.snapshot();
        let mut file = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut file, &snap)?;
        file.flush()?;
        Ok(())
    }

    /// Load a snapshot from disk into this emulator.
    pub fn load_snapshot_from_path<P: AsRef<Path>>(&mut self, path: P) -> Result<(), EmulatorError> {
        let file = BufReader::new(File::open(path)?);
        let snapshot: Snapshot = bincode::deserialize_from(file)?;
        self.apply_snapshot(&snapshot)
    }
}

fn frame_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa;
    use crate::memory::DEVICE_BASE;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn encode(name: &str, operands: &[u64]) -> Vec<u8> {
        let mut out = isa::by_name(name).unwrap().opcode.to_le_bytes().to_vec();
        for v in operands {
            // Default block size: 4-byte operands.
            out.extend_from_slice(&v.to_le_bytes()[..4]);
        }
        out
    }

    fn program(insns: &[(&str, &[u64])]) -> Vec<u8> {
        insns.iter().flat_map(|(n, ops)| encode(n, ops)).collect()
    }

    /// Print `text` through the console port at `DEVICE_BASE`.
    fn hello_program(text: &[u8]) -> Vec<u8> {
        let mut insns: Vec<(&str, Vec<u64>)> = vec![("LDAI", vec![0x10]), ("STA", vec![DEVICE_BASE as u64])];
        for &b in text {
            insns.push(("LDAI", vec![b as u64]));
            insns.push(("STA", vec![DEVICE_BASE as u64]));
        }
        insns.push(("LDAI", vec![0]));
        insns.push(("STA", vec![DEVICE_BASE as u64]));
        insns.push(("HALT", vec![]));
        insns.iter().flat_map(|(n, ops)| encode(n, ops)).collect()
    }

    #[test]
    fn bios_hands_over_to_program() {
        let bios = program(&[("AJMP", &[0])]);
        let code = program(&[("LDAI", &[5]), ("HALT", &[])]);
        let mut emu = Emulator::new(EmulatorConfig::default());
        emu.boot(&code, &bios).unwrap();
        assert_eq!(emu.cpu.pc, BIOS_BASE);

        assert_eq!(emu.run().unwrap(), RunExit::Halted(HaltKind::Halt));
        assert_eq!(emu.cpu.regs[0], 5);
        assert_eq!(emu.steps(), 3);
    }

    #[test]
    fn console_output_reaches_callback() {
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = out.clone();

        let mut emu = Emulator::new(EmulatorConfig::default());
        assert_eq!(emu.attach_console(SerialConsole::new()), 0);
        emu.set_console_callback(move |b| sink.borrow_mut().push(b));
        emu.boot_bare(&hello_program(b"ok\n")).unwrap();

        assert_eq!(emu.run().unwrap(), RunExit::Halted(HaltKind::Halt));
        assert_eq!(*out.borrow(), b"ok\n");
        assert!(emu.drain_console_output().is_empty());
    }

    #[test]
    fn console_output_can_be_drained_without_callback() {
        let mut emu = Emulator::new(EmulatorConfig::default());
        emu.attach_console(SerialConsole::new());
        emu.boot_bare(&hello_program(b"hi")).unwrap();
        emu.run().unwrap();
        assert_eq!(emu.drain_console_output(), b"hi");
    }

    #[test]
    fn console_input_is_readable() {
        let code = program(&[("LDA", &[DEVICE_BASE as u64]), ("LDX", &[DEVICE_BASE as u64]), ("HALT", &[])]);
        let mut emu = Emulator::new(EmulatorConfig::default());
        emu.attach_console(SerialConsole::with_input(b"Q"));
        emu.boot_bare(&code).unwrap();
        emu.run().unwrap();
        assert_eq!(emu.cpu.regs[0], b'Q' as u64);
        assert_eq!(emu.cpu.regs[1], 0);
    }

    #[test]
    fn recursion_guard_stops_self_loop() {
        let code = program(&[("JMP", &[0])]);
        let config = EmulatorConfig { recursion_limit: Some(1000), ..Default::default() };
        let mut emu = Emulator::new(config);
        emu.boot_bare(&code).unwrap();
        match emu.run() {
            Err(EmulatorError::RecursionLimit { addr, limit }) => {
                assert_eq!(addr, 0);
                assert_eq!(limit, 1000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(emu.steps(), 1001);
    }

    #[test]
    fn step_budget() {
        let code = program(&[("JMP", &[0])]);
        let config = EmulatorConfig { max_steps: Some(50), ..Default::default() };
        let mut emu = Emulator::new(config);
        emu.boot_bare(&code).unwrap();
        assert_eq!(emu.run().unwrap(), RunExit::StepLimit);
        assert_eq!(emu.steps(), 50);
    }

    #[test]
    fn fatal_fault_surfaces_as_error() {
        let mut emu = Emulator::new(EmulatorConfig::default());
        emu.boot_bare(&[0x34, 0x12]).unwrap();
        match emu.run() {
            Err(EmulatorError::Fatal { fault, .. }) => assert_eq!(fault, Fault::UnknownOpcode(0x1234)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(emu.halt_reason(), Some(HaltReason::Fatal { .. })));
    }

    #[test]
    fn trace_skips_bios() {
        let bios = program(&[("LDXI", &[1]), ("AJMP", &[0])]);
        let code = program(&[("LDAI", &[2]), ("HALT", &[])]);
        let config = EmulatorConfig { trace: true, timing: true, ..Default::default() };
        let mut emu = Emulator::new(config);
        emu.boot(&code, &bios).unwrap();
        emu.run().unwrap();

        let names: Vec<&str> = emu.trace().unwrap().entries().iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["LDAI"]);
        assert_eq!(emu.timing().unwrap().len(), 4);
    }

    #[test]
    fn snapshot_roundtrip_preserves_state() {
        let code = program(&[
            ("LDAI", &[0x2000]),
            ("SETST", &[]),
            ("LDAI", &[0xBEEF]),
            ("PUSHA", &[]),
            ("HALT", &[]),
        ]);
        let mut emu = Emulator::new(EmulatorConfig::default());
        emu.memory.allocate_page(1, None).unwrap();
        emu.boot_bare(&code).unwrap();
        emu.run().unwrap();

        let snap = emu.snapshot();
        let bytes = bincode::serialize(&snap).unwrap();
        let snap2: Snapshot = bincode::deserialize(&bytes).unwrap();

        let mut emu2 = Emulator::new(EmulatorConfig::default());
        emu2.apply_snapshot(&snap2).unwrap();

        assert_eq!(emu2.cpu.pc, emu.cpu.pc);
        assert_eq!(emu2.cpu.regs, emu.cpu.regs);
        assert_eq!(emu2.cpu.state, emu.cpu.state);
        assert_eq!(emu2.memory.mapped_pages(), emu.memory.mapped_pages());
        assert_eq!(emu2.memory.stack_base(), Some(0x2000));
        assert_eq!(emu2.memory.stack_pos(), 4);
        assert_eq!(emu2.memory.pop_double().unwrap(), 0xBEEF);
    }

    #[test]
    fn snapshot_rejects_tampered_frame() {
        let mut emu = Emulator::new(EmulatorConfig::default());
        emu.boot_bare(&[0xFF, 0x00]).unwrap();
        let mut snap = emu.snapshot();
        let frame = snap.memory.frames.iter_mut().find(|f| f.id == 0).unwrap();
        frame.data[0] = 0x00;

        let mut emu2 = Emulator::new(EmulatorConfig::default());
        assert!(matches!(
            emu2.apply_snapshot(&snap),
            Err(EmulatorError::HashMismatch { frame: 0 })
        ));

        snap.version = "0.0".into();
        assert!(matches!(
            emu2.apply_snapshot(&snap),
            Err(EmulatorError::SnapshotVersion { .. })
        ));
    }
}
