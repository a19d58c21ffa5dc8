use super::Port;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

// Command-mode bytes.
const CMD_WRITE: u8 = 0x10;
const CMD_LISTEN: u8 = 0x12;
const CMD_UNLISTEN: u8 = 0x13;
/// Leaves write mode.
const END_OF_TEXT: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    Write,
}

struct ConsoleState {
    mode: Mode,
    listening: bool,
    /// Host -> guest.
    input: VecDeque<u8>,
    /// Guest -> host.
    output: VecDeque<u8>,
}

/// Serial console port.
///
/// The guest drives it with a tiny command protocol: writing `0x10` switches
/// to write mode, after which every non-zero byte is console output until a
/// `0x00` returns to command mode. `0x12` / `0x13` toggle listening. Reads
/// pop one byte of host input, or return 0 when none is queued.
///
/// The handle is cheap to clone; one clone is registered with memory and the
/// host keeps another to feed input and drain output.
#[derive(Clone)]
pub struct SerialConsole {
    state: Arc<Mutex<ConsoleState>>,
}

impl SerialConsole {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConsoleState {
                mode: Mode::Command,
                listening: false,
                input: VecDeque::new(),
                output: VecDeque::new(),
            })),
        }
    }

    /// Create a console with `input` already queued.
    pub fn with_input(input: &[u8]) -> Self {
        let console = Self::new();
        for &b in input {
            console.push_input(b);
        }
        console
    }

    pub fn push_input(&self, byte: u8) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.input.push_back(byte);
    }

    pub fn pop_output(&self) -> Option<u8> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.output.pop_front()
    }

    pub fn drain_output(&self) -> Vec<u8> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.output.drain(..).collect()
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().map(|s| s.listening).unwrap_or(false)
    }

    pub fn pending_input(&self) -> usize {
        self.state.lock().map(|s| s.input.len()).unwrap_or(0)
    }
}

impl Default for SerialConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for SerialConsole {
    fn read(&mut self) -> u8 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.input.pop_front().unwrap_or(0)
    }

    fn write(&mut self, value: u8) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.mode {
            Mode::Write if value == END_OF_TEXT => state.mode = Mode::Command,
            Mode::Write => state.output.push_back(value),
            Mode::Command => match value {
                CMD_WRITE => state.mode = Mode::Write,
                CMD_LISTEN => state.listening = true,
                CMD_UNLISTEN => state.listening = false,
                other => log::trace!("console: ignoring command byte {:#04x}", other),
            },
        }
    }
}
