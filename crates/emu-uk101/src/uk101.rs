//! Machine assembly: memory map, peripherals, and the CPU thread.
//!
//! # Memory map
//!
//! | Range         | Contents                         |
//! |---------------|----------------------------------|
//! | $0000-...     | RAM (size from configuration)    |
//! | $A000-$BFFF   | BASIC ROM (if fitted)            |
//! | $D000-$D3FF   | Video RAM (shared with renderer) |
//! | $DF00         | Keyboard matrix port             |
//! | $F000-$F001   | MC6850 ACIA                      |
//! | $F800-$FFFF   | Monitor ROM (holds the vectors)  |
//!
//! Two threads run the core: the CPU loop spawned by `start()` and the
//! ACIA's own worker. `std::thread` exposes no priority control; the CPU
//! thread keeps its effective priority because the worker is blocked on
//! its condition variable or a pacing sleep whenever it isn't posting
//! status.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use emu_6502::{Cpu6502, CpuControl, DebugHandler, Registers, TraceSink};
use emu_core::{Bus, BusDevice, SerialPeer, TimingProfile};
use motorola_6850::{Acia6850, AciaDevice};

use crate::address_space::AddressSpace;
use crate::config::Uk101Config;
use crate::keyboard::{KeyboardHandle, KeyboardPort};
use crate::video::{VideoHandle, VideoRam};

/// RAM base address.
pub const RAM_BASE: u16 = 0x0000;

/// BASIC ROM base address.
pub const BASIC_BASE: u16 = 0xA000;

/// BASIC ROM size in bytes.
pub const BASIC_SIZE: usize = 0x2000;

/// Video RAM base address.
pub const VIDEO_BASE: u16 = 0xD000;

/// Video RAM size in bytes.
pub const VIDEO_SIZE: usize = 0x0400;

/// Keyboard port base address.
pub const KEYBOARD_BASE: u16 = 0xDF00;

/// ACIA base address (status/control at +0, data at +1).
pub const ACIA_BASE: u16 = 0xF000;

/// Monitor ROM base address.
pub const MONITOR_BASE: u16 = 0xF800;

/// Monitor ROM size in bytes.
pub const MONITOR_SIZE: usize = 0x0800;

/// The CPU and its bus, moved onto the CPU thread while running.
struct MachineCore {
    cpu: Cpu6502,
    bus: AddressSpace,
}

/// A UK101-class machine.
pub struct Uk101 {
    control: Arc<CpuControl>,
    acia: Acia6850,
    keyboard: KeyboardHandle,
    video: VideoHandle,
    core: Option<MachineCore>,
    thread: Option<JoinHandle<MachineCore>>,
}

impl std::fmt::Debug for Uk101 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uk101")
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl Uk101 {
    /// Build a machine from its configuration.
    ///
    /// All configuration faults (wrong ROM sizes, RAM overlapping ROM)
    /// are reported here, before anything runs.
    pub fn new(config: &Uk101Config) -> Result<Self, String> {
        if config.monitor_rom.len() != MONITOR_SIZE {
            return Err(format!(
                "monitor ROM is {} bytes, expected {MONITOR_SIZE}",
                config.monitor_rom.len()
            ));
        }
        if let Some(basic) = &config.basic_rom
            && basic.len() != BASIC_SIZE
        {
            return Err(format!(
                "BASIC ROM is {} bytes, expected {BASIC_SIZE}",
                basic.len()
            ));
        }
        if config.ram_size > BASIC_BASE as usize {
            return Err(format!(
                "RAM of {} bytes would overlap the BASIC ROM area",
                config.ram_size
            ));
        }

        let mut bus = AddressSpace::new();
        bus.map_ram(RAM_BASE, config.ram_size)?;
        if let Some(basic) = &config.basic_rom {
            bus.map_rom(BASIC_BASE, basic.clone())?;
        }

        let (video_ram, video) = VideoRam::new(VIDEO_SIZE);
        bus.map_device(VIDEO_BASE, VIDEO_SIZE / 256, Box::new(video_ram))?;

        let (keyboard_port, keyboard) = KeyboardPort::new();
        bus.map_device(KEYBOARD_BASE, 1, Box::new(keyboard_port))?;

        let acia = Acia6850::new(config.acia_clock_hz);
        if config.quirks.swallow_stray_data_read {
            bus.map_device(ACIA_BASE, 1, Box::new(StrayReadShim::new(acia.device())))?;
        } else {
            bus.map_device(ACIA_BASE, 1, Box::new(acia.device()))?;
        }

        bus.map_rom(MONITOR_BASE, config.monitor_rom.clone())?;

        let control = Arc::new(CpuControl::new(config.clock_mhz));
        let mut cpu = Cpu6502::new(Arc::clone(&control), TimingProfile::calibrate());
        cpu.reset(&mut bus);

        log::debug!(
            "machine built: {} bytes RAM, {} MHz, BASIC {}",
            config.ram_size,
            config.clock_mhz,
            if config.basic_rom.is_some() { "fitted" } else { "absent" },
        );

        Ok(Self {
            control,
            acia,
            keyboard,
            video,
            core: Some(MachineCore { cpu, bus }),
            thread: None,
        })
    }

    /// Spawn the CPU thread and start executing.
    pub fn start(&mut self) -> Result<(), String> {
        let mut core = self
            .core
            .take()
            .ok_or_else(|| "machine is already running".to_string())?;

        let handle = thread::Builder::new()
            .name("cpu".into())
            .spawn(move || {
                core.cpu.run(&mut core.bus);
                core
            })
            .map_err(|e| format!("failed to spawn CPU thread: {e}"))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stop the CPU thread and reclaim the core. Cooperative: the loop
    /// exits at the next instruction boundary.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.control.request_stop();
            match handle.join() {
                Ok(core) => self.core = Some(core),
                Err(_) => log::warn!("CPU thread panicked"),
            }
        }
    }

    /// Whether the CPU thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Execute one instruction on the calling thread (machine must not be
    /// started). Returns the instruction's cycle count.
    pub fn step(&mut self) -> Result<u64, String> {
        let core = self
            .core
            .as_mut()
            .ok_or_else(|| "machine is running; stop it to single-step".to_string())?;
        Ok(core.cpu.step(&mut core.bus))
    }

    /// Non-destructive bus read, for inspection while stopped.
    pub fn peek(&self, address: u16) -> Result<u8, String> {
        let core = self
            .core
            .as_ref()
            .ok_or_else(|| "machine is running; stop it to inspect".to_string())?;
        Ok(core.bus.peek(address))
    }

    /// Register snapshot, for inspection while stopped.
    pub fn registers(&self) -> Result<Registers, String> {
        let core = self
            .core
            .as_ref()
            .ok_or_else(|| "machine is running; stop it to inspect".to_string())?;
        Ok(core.cpu.regs)
    }

    /// The CPU control surface (clock rate, signals, trace, throughput).
    #[must_use]
    pub fn control(&self) -> &Arc<CpuControl> {
        &self.control
    }

    /// The serial adapter, for attaching a tape recorder or other peer.
    #[must_use]
    pub fn acia(&self) -> &Acia6850 {
        &self.acia
    }

    /// Attach a serial peer (tape recorder, file bridge, ...).
    pub fn connect_tape(&self, peer: Box<dyn SerialPeer>) {
        self.acia.connect_peer(peer);
    }

    /// Front-end handle for the keyboard matrix.
    #[must_use]
    pub fn keyboard(&self) -> KeyboardHandle {
        self.keyboard.clone()
    }

    /// Renderer handle for the video memory.
    #[must_use]
    pub fn video(&self) -> VideoHandle {
        self.video.clone()
    }

    /// Attach an instruction trace sink (machine must not be started).
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) -> Result<(), String> {
        let core = self
            .core
            .as_mut()
            .ok_or_else(|| "machine is running; stop it first".to_string())?;
        core.cpu.set_trace_sink(sink);
        Ok(())
    }

    /// Attach the debug-opcode handler (machine must not be started).
    pub fn set_debug_handler(&mut self, handler: Box<dyn DebugHandler>) -> Result<(), String> {
        let core = self
            .core
            .as_mut()
            .ok_or_else(|| "machine is running; stop it first".to_string())?;
        core.cpu.set_debug_handler(handler);
        Ok(())
    }
}

impl Drop for Uk101 {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wraps the ACIA registers to swallow the first read of the data
/// register, working around a monitor ROM that performs one stray
/// receive-read during init (see
/// [`QuirksConfig::swallow_stray_data_read`]).
///
/// [`QuirksConfig::swallow_stray_data_read`]: crate::config::QuirksConfig
struct StrayReadShim {
    inner: AciaDevice,
    armed: bool,
}

impl StrayReadShim {
    fn new(inner: AciaDevice) -> Self {
        Self { inner, armed: true }
    }
}

impl BusDevice for StrayReadShim {
    fn read(&mut self, offset: u16) -> u8 {
        if self.armed && offset & 1 == 1 {
            self.armed = false;
            self.inner.peek(offset)
        } else {
            self.inner.read(offset)
        }
    }

    fn write(&mut self, offset: u16, value: u8) {
        self.inner.write(offset, value);
    }

    fn peek(&self, offset: u16) -> u8 {
        self.inner.peek(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motorola_6850::{RDRF, TDRE};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Build a 2 KB monitor image with `program` at $F800 and the reset
    /// vector pointing at it.
    fn monitor_with(program: &[u8]) -> Vec<u8> {
        let mut rom = vec![0u8; MONITOR_SIZE];
        rom[..program.len()].copy_from_slice(program);
        // $FFFC/$FFFD live at offsets $7FC/$7FD.
        rom[0x07FC] = 0x00;
        rom[0x07FD] = 0xF8;
        rom
    }

    fn machine_with(program: &[u8]) -> Uk101 {
        let config = Uk101Config {
            monitor_rom: monitor_with(program),
            clock_mhz: 0.0,
            acia_clock_hz: 1_000_000,
            ..Uk101Config::default()
        };
        Uk101::new(&config).expect("machine")
    }

    struct OneShotPeer {
        byte: Arc<Mutex<Option<u8>>>,
    }

    impl SerialPeer for OneShotPeer {
        fn read_byte(&mut self) -> Option<u8> {
            self.byte.lock().expect("peer lock").take()
        }

        fn write_byte(&mut self, _value: u8) {}
    }

    #[test]
    fn wrong_monitor_size_is_rejected() {
        let config = Uk101Config {
            monitor_rom: vec![0; 1024],
            ..Uk101Config::default()
        };
        let err = Uk101::new(&config).expect_err("must reject");
        assert!(err.contains("monitor ROM"));
    }

    #[test]
    fn wrong_basic_size_is_rejected() {
        let config = Uk101Config {
            monitor_rom: vec![0; MONITOR_SIZE],
            basic_rom: Some(vec![0; 4096]),
            ..Uk101Config::default()
        };
        assert!(Uk101::new(&config).is_err());
    }

    #[test]
    fn oversized_ram_is_rejected() {
        let config = Uk101Config {
            monitor_rom: vec![0; MONITOR_SIZE],
            ram_size: 0xC000,
            ..Uk101Config::default()
        };
        assert!(Uk101::new(&config).is_err());
    }

    #[test]
    fn reset_vector_starts_execution_in_monitor() {
        let machine = machine_with(&[0xEA]);
        assert_eq!(machine.registers().expect("regs").pc, 0xF800);
    }

    #[test]
    fn cpu_writes_reach_video_ram() {
        // LDA #$41; STA $D000; JMP *.
        let mut machine = machine_with(&[
            0xA9, 0x41, // LDA #$41
            0x8D, 0x00, 0xD0, // STA $D000
            0x4C, 0x05, 0xF8, // JMP $F805
        ]);
        machine.step().expect("step");
        machine.step().expect("step");
        assert_eq!(machine.video().read(0), 0x41);
    }

    #[test]
    fn cpu_sees_acia_status() {
        // LDA $F000 - the ACIA comes up ready to transmit.
        let mut machine = machine_with(&[0xAD, 0x00, 0xF0]);
        machine.step().expect("step");
        let a = machine.registers().expect("regs").a;
        assert_eq!(a & TDRE, TDRE);
        assert_eq!(a & RDRF, 0);
    }

    #[test]
    fn cpu_reads_keyboard_port() {
        // LDA $DF00 with no keys pressed and all rows deselected.
        let mut machine = machine_with(&[0xAD, 0x00, 0xDF]);
        machine.step().expect("step");
        assert_eq!(machine.registers().expect("regs").a, 0xFF);
    }

    #[test]
    fn open_bus_reads_high_byte() {
        // LDA $4321 - nothing is mapped between RAM and BASIC.
        let mut machine = machine_with(&[0xAD, 0x21, 0x43]);
        machine.step().expect("step");
        assert_eq!(machine.registers().expect("regs").a, 0x43);
    }

    #[test]
    fn stray_data_read_quirk_swallows_first_read() {
        let program = [
            0xAD, 0x01, 0xF0, // LDA $F001 (the monitor's stray read)
            0xAD, 0x01, 0xF0, // LDA $F001 (the real read)
        ];
        let config = Uk101Config {
            monitor_rom: monitor_with(&program),
            clock_mhz: 0.0,
            acia_clock_hz: 1_000_000,
            quirks: crate::config::QuirksConfig {
                swallow_stray_data_read: true,
            },
            ..Uk101Config::default()
        };
        let mut machine = Uk101::new(&config).expect("machine");

        let byte = Arc::new(Mutex::new(Some(0x99)));
        machine.connect_tape(Box::new(OneShotPeer {
            byte: Arc::clone(&byte),
        }));
        assert!(
            machine.acia().wait_status(RDRF, true, Duration::from_secs(2)),
            "byte should arrive"
        );

        machine.step().expect("stray read");
        assert_eq!(
            machine.peek(ACIA_BASE).expect("peek") & RDRF,
            RDRF,
            "first read must not consume the byte"
        );

        machine.step().expect("real read");
        assert_eq!(machine.registers().expect("regs").a, 0x99);
        assert_eq!(
            machine.peek(ACIA_BASE).expect("peek") & RDRF,
            0,
            "second read consumes"
        );
    }

    #[test]
    fn without_quirk_first_read_consumes() {
        let mut machine = machine_with(&[0xAD, 0x01, 0xF0]);
        let byte = Arc::new(Mutex::new(Some(0x42)));
        machine.connect_tape(Box::new(OneShotPeer {
            byte: Arc::clone(&byte),
        }));
        assert!(machine.acia().wait_status(RDRF, true, Duration::from_secs(2)));

        machine.step().expect("read");
        assert_eq!(machine.registers().expect("regs").a, 0x42);
        assert_eq!(machine.peek(ACIA_BASE).expect("peek") & RDRF, 0);
    }

    #[test]
    fn step_while_running_is_rejected() {
        // JMP * keeps the CPU busy.
        let mut machine = machine_with(&[0x4C, 0x00, 0xF8]);
        machine.start().expect("start");
        assert!(machine.step().is_err());
        assert!(machine.is_running());
        machine.stop();
        assert!(!machine.is_running());
        // Core returned: stepping works again... after the stop flag, the
        // run loop has exited, but single-stepping is still valid.
        machine.step().expect("step after stop");
    }

    /// Peer that queues everything the machine transmits.
    struct CapturePeer {
        sent: Arc<Mutex<VecDeque<u8>>>,
    }

    impl SerialPeer for CapturePeer {
        fn read_byte(&mut self) -> Option<u8> {
            None
        }

        fn write_byte(&mut self, value: u8) {
            self.sent.lock().expect("peer lock").push_back(value);
        }
    }

    #[test]
    fn transmit_reaches_peer_through_bus() {
        // LDA #$55; STA $F001; JMP *.
        let mut machine = machine_with(&[
            0xA9, 0x55, // LDA #$55
            0x8D, 0x01, 0xF0, // STA $F001
            0x4C, 0x05, 0xF8, // JMP $F805
        ]);
        let sent = Arc::new(Mutex::new(VecDeque::new()));
        machine.connect_tape(Box::new(CapturePeer {
            sent: Arc::clone(&sent),
        }));

        machine.step().expect("lda");
        machine.step().expect("sta");
        assert!(
            machine.acia().wait_status(TDRE, true, Duration::from_secs(2)),
            "worker should complete the transmit"
        );
        assert_eq!(sent.lock().expect("peer lock").pop_front(), Some(0x55));
    }
}
