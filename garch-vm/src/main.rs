use clap::Parser;
use garch_vm::dump;
use garch_vm::timing::group_thousands;
use garch_vm::{BlockSize, Emulator, EmulatorConfig, EmulatorError, RunExit, SerialConsole};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the program image flashed at address 0
    #[arg(default_value = "main.bin")]
    source: PathBuf,

    /// Path to the BIOS image flashed at 0xFFFF0000
    #[arg(long, default_value = "bios.bin")]
    bios: PathBuf,

    /// Skip the BIOS and start executing the program at address 0
    #[arg(long)]
    bare: bool,

    /// Print extra info before and after execution
    #[arg(short, long)]
    verbose: bool,

    /// Print max/mid/min/mean instruction time on halt and write samples to .data
    #[arg(short, long)]
    time: bool,

    /// Trace execution and write it to .trace (not recommended without --stdin)
    #[arg(short = 'd', long)]
    trace: bool,

    /// Dump state and memory to the console
    #[arg(short = 'm', long)]
    dump: bool,

    /// Dump state and memory to .dump
    #[arg(short = 'M', long)]
    dump_file: bool,

    /// Write the first contiguous pages of memory to .ram
    #[arg(short = 'r', long)]
    dump_raw: bool,

    /// Console input exposed to the guest; prompts when given without a value.
    /// `\` is read as a newline
    #[arg(short, long, num_args = 0..=1)]
    stdin: Option<Option<String>>,

    /// Stop when an address is executed 1,000 times
    #[arg(long, group = "recursion")]
    block_small_recursion: bool,

    /// Stop when an address is executed 10,000 times
    #[arg(short = 'R', long, group = "recursion")]
    block_recursion: bool,

    /// Stop when an address is executed 1,000,000 times
    #[arg(long, group = "recursion")]
    block_large_recursion: bool,

    /// Register width in 16-bit blocks (1, 2 or 4)
    #[arg(long, default_value_t = 2, value_parser = parse_block_size)]
    block_size: u8,

    /// Stop after this many instructions
    #[arg(long)]
    max_steps: Option<u64>,

    /// Save a machine snapshot here when execution stops
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Resume from a snapshot instead of flashing images
    #[arg(long, conflicts_with = "bare")]
    resume: Option<PathBuf>,
}

fn parse_block_size(s: &str) -> Result<u8, String> {
    let n: u8 = s.parse().map_err(|e| format!("{e}"))?;
    BlockSize::new(n)
        .map(BlockSize::get)
        .ok_or_else(|| format!("block size must be 1, 2 or 4, got {n}"))
}

impl Args {
    fn recursion_limit(&self) -> Option<u32> {
        if self.block_small_recursion {
            Some(1_000)
        } else if self.block_recursion {
            Some(10_000)
        } else if self.block_large_recursion {
            Some(1_000_000)
        } else {
            None
        }
    }
}

fn print_vm_banner() {
    const BANNER: &str = r#"
    ┌─────────────────────────────────────────────────────────────────────────┐
    │                                                                         │
    │    ██████╗  █████╗ ██████╗  ██████╗██╗  ██╗ ██████╗ ██╗  ██╗            │
    │   ██╔════╝ ██╔══██╗██╔══██╗██╔════╝██║  ██║██╔════╝ ██║  ██║            │
    │   ██║  ███╗███████║██████╔╝██║     ███████║███████╗ ███████║            │
    │   ██║   ██║██╔══██║██╔══██╗██║     ██╔══██║██╔═══██╗╚════██║            │
    │   ╚██████╔╝██║  ██║██║  ██║╚██████╗██║  ██║╚██████╔╝     ██║            │
    │    ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝ ╚═════╝╚═╝  ╚═╝ ╚═════╝      ╚═╝            │
    │                                                                         │
    │   gArch64 Virtual Machine                                               │
    │   Paged 32-bit address space, IVT interrupts, serial console            │
    │                                                                         │
    └─────────────────────────────────────────────────────────────────────────┘
"#;
    eprintln!("{}", BANNER);
}

fn print_section(title: &str) {
    eprintln!("\n\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
    eprintln!("\x1b[1;33m  ▸ {}\x1b[0m", title);
    eprintln!("\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
}

fn print_status(component: &str, status: &str, ok: bool) {
    let status_color = if ok { "\x1b[1;32m" } else { "\x1b[1;31m" };
    let check = if ok { "✓" } else { "✗" };
    eprintln!("    \x1b[0;37m{:<40}\x1b[0m {}[{}] {}\x1b[0m", component, status_color, check, status);
}

fn print_info(key: &str, value: &str) {
    eprintln!("    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m", key, value);
}

/// Resolve `--stdin`: prompt when the flag has no value, then turn every
/// `\` into a newline and terminate the input with one.
fn console_input(arg: &Option<Option<String>>) -> io::Result<Option<String>> {
    let raw = match arg {
        None => return Ok(None),
        Some(Some(text)) => text.clone(),
        Some(None) => {
            eprint!("stdin> ");
            io::stderr().flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    Ok(Some(format!("{raw}\\").replace('\\', "\n")))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let verbose = args.verbose;

    if verbose {
        print_vm_banner();
    }
    let input = console_input(&args.stdin)?;

    let block_size = BlockSize::new(args.block_size).unwrap_or_default();
    let config = EmulatorConfig {
        block_size,
        recursion_limit: args.recursion_limit(),
        trace: args.trace,
        timing: args.time,
        max_steps: args.max_steps,
    };

    if verbose {
        print_section("CPU INITIALIZATION");
        print_info("Version", env!("CARGO_PKG_VERSION"));
        print_info("Block Size", &format!("{} ({}-bit registers)", block_size.get(), block_size.bits()));
        if let Some(limit) = config.recursion_limit {
            print_info("Recursion Guard", &group_thousands(limit as u64));
        }
        if let Some(max) = config.max_steps {
            print_info("Step Budget", &group_thousands(max));
        }
        print_status("CPU Core", "INITIALIZED", true);
    }

    let mut emulator = Emulator::new(config);
    let console = match &input {
        Some(text) => SerialConsole::with_input(text.as_bytes()),
        None => SerialConsole::new(),
    };
    let port = emulator.attach_console(console);
    emulator.set_console_callback(|byte| {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(&[byte]);
        let _ = stdout.flush();
    });

    if verbose {
        print_section("DEVICES");
        print_info("Serial Console", &format!("port {} (0x{:08X})", port, garch_vm::memory::DEVICE_BASE + port as u32));
        if let Some(text) = &input {
            print_info("Console Input", &format!("{} bytes", text.len()));
        }
        print_status("Device Page", "MAPPED", true);
        print_section("BOOT");
    }

    if let Some(path) = &args.resume {
        emulator.load_snapshot_from_path(path)?;
        if verbose {
            print_info("Snapshot", &path.display().to_string());
            print_info("Resume PC", &format!("0x{:08X}", emulator.cpu.pc));
        }
    } else if args.bare {
        let program = garch_vm::loader::read_image(&args.source)?;
        emulator.boot_bare(&program)?;
        if verbose {
            print_info("Program", &format!("{} ({} bytes)", args.source.display(), program.len()));
        }
    } else {
        if let Err(e) = emulator.boot_from_files(&args.source, &args.bios) {
            print_status("Boot Images", "FAILED", false);
            return Err(e.into());
        }
        if verbose {
            print_info("Program", &args.source.display().to_string());
            print_info("BIOS", &args.bios.display().to_string());
        }
    }
    if verbose {
        print_info("Entry Point", &format!("0x{:08X}", emulator.cpu.pc));
        print_status("Boot Images", "LOADED", true);
        eprintln!();
    }

    let mut emulation_error = false;
    match emulator.run() {
        Ok(RunExit::Halted(kind)) => log::debug!("guest halted via {:?}", kind),
        Ok(RunExit::StepLimit) => eprintln!("\x1b[1;33mstep budget exhausted\x1b[0m"),
        Err(e @ EmulatorError::Fatal { .. }) => eprintln!("\x1b[1;31m{}\x1b[0m", e),
        Err(e) => {
            eprintln!("\x1b[1;31m{}\x1b[0m", e);
            emulation_error = true;
        }
    }
    let leftover = emulator.drain_console_output();
    if !leftover.is_empty() {
        io::stdout().write_all(&leftover)?;
    }
    io::stdout().flush()?;

    if verbose {
        print_section("SHUTDOWN");
        print_info("Instructions", &group_thousands(emulator.steps()));
        print_info("Stopped At", &format!("0x{:08X}", emulator.cpu.pc));
    }

    if args.dump {
        let mut stdout = io::stdout().lock();
        dump::core_dump(&mut stdout, &emulator.cpu, &emulator.memory, emulation_error)?;
        stdout.flush()?;
    }
    if args.dump_file {
        if verbose {
            print_status("Writing dump log", ".dump", true);
        }
        dump::save_core_dump(".dump", &emulator.cpu, &emulator.memory, emulation_error)?;
    }

    if let Some(timing) = emulator.timing() {
        timing.save(".data")?;
        if let Some(report) = timing.report() {
            println!("\nTime spent executing instruction");
            println!("\x1b[31mMax :\x1b[0m {}ns", group_thousands(report.max));
            println!("\x1b[32mMid :\x1b[0m {}ns", group_thousands(report.median));
            println!("\x1b[34mMin :\x1b[0m {}ns", group_thousands(report.min));
            println!("\x1b[90mMean:\x1b[0m {}ns", group_thousands(report.mean));
        }
    }

    if let Some(trace) = emulator.trace() {
        if verbose {
            print_status("Writing traceback", &format!(".trace ({} entries)", trace.entries().len()), true);
        }
        trace.save(".trace")?;
    }

    if args.dump_raw {
        if verbose {
            print_status("Writing raw dump", ".ram", true);
        }
        dump::save_raw_dump(".ram", &emulator.memory)?;
    }

    if let Some(path) = &args.snapshot {
        emulator.save_snapshot_to_path(path)?;
        if verbose {
            print_status("Snapshot", &path.display().to_string(), true);
        }
    }

    Ok(())
}
