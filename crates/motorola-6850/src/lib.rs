//! Motorola MC6850 ACIA (asynchronous communications interface adapter).
//!
//! The ACIA occupies two bus addresses. The CPU-facing registers are backed
//! by a worker thread that paces byte transfer at the baud rate derived from
//! the control register, bridging to an abstract [`SerialPeer`] (a tape
//! recorder, a file, or nothing at all).
//!
//! # Registers
//!
//! | Offset | Read              | Write            |
//! |--------|-------------------|------------------|
//! | even   | Status (RDRF/TDRE)| Control          |
//! | odd    | Receive data      | Transmit data    |
//!
//! Reading the data register consumes the received byte (clears RDRF);
//! writing it queues a byte (clears TDRE). Both wake the worker. A control
//! write of %xxxxxx11 is a master reset.
//!
//! # Concurrency
//!
//! All register state is guarded by one mutex per adapter. The worker
//! blocks on a condition variable until there is either a byte to transmit
//! or an attached peer with room to receive; the predicates are re-checked
//! after every wake. The worker snapshots its work under the lock, releases
//! it for the (sleeping) transfer, then re-acquires it to post status and
//! notify any thread waiting on a status change.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use emu_core::{BusDevice, SerialPeer};

/// Receive data register full: a received byte is waiting.
pub const RDRF: u8 = 0x01;

/// Transmit data register empty: ready for the next byte.
pub const TDRE: u8 = 0x02;

/// Control value (divisor bits both set) that performs a master reset.
const MASTER_RESET: u8 = 0x03;

/// Adapter register state. One instance per adapter, behind one mutex.
struct AciaState {
    /// Status register (RDRF, TDRE).
    status: u8,
    /// Last written control register value.
    control: u8,
    /// Pending transmit byte, if any.
    tx: Option<u8>,
    /// Last received byte (valid while RDRF is set).
    rx_data: u8,
    /// External clock in Hz, divided down by the control register.
    clock_hz: u32,
    /// Time to transfer one character at the current control settings.
    char_duration: Duration,
    /// Attached peer, if any. Taken out by the worker during a transfer.
    peer: Option<Box<dyn SerialPeer>>,
    /// Bumped on connect/disconnect so the worker can tell whether the
    /// peer it borrowed is still current.
    peer_generation: u64,
    /// Worker shutdown flag.
    stop: bool,
}

impl AciaState {
    /// Recompute the character transfer time from the control register.
    fn derive_timing(&mut self) {
        let divisor = match self.control & 0x03 {
            0b00 => 1,
            0b01 => 16,
            _ => 64,
        };
        let baud = self.clock_hz / divisor;
        let bits = frame_bits(self.control);
        self.char_duration = Duration::from_secs_f64(f64::from(bits) / f64::from(baud.max(1)));
    }
}

/// Total bits per character frame (start + data + parity + stop) for the
/// word-select bits 2-4 of the control register.
const fn frame_bits(control: u8) -> u32 {
    match (control >> 2) & 0x07 {
        0b000 | 0b001 => 11, // 7 data, parity, 2 stop
        0b010 | 0b011 => 10, // 7 data, parity, 1 stop
        0b100 => 11,         // 8 data, 2 stop
        0b101 => 10,         // 8 data, 1 stop
        _ => 11,             // 8 data, parity, 1 stop
    }
}

struct AciaShared {
    state: Mutex<AciaState>,
    /// Worker waits here for something to do.
    work: Condvar,
    /// Signalled whenever the worker posts a status change.
    status_changed: Condvar,
}

impl AciaShared {
    fn lock(&self) -> MutexGuard<'_, AciaState> {
        self.state.lock().expect("ACIA state lock poisoned")
    }
}

/// The MC6850 adapter: owns the worker thread and hands out bus-mappable
/// register handles.
pub struct Acia6850 {
    shared: Arc<AciaShared>,
    worker: Option<JoinHandle<()>>,
}

impl Acia6850 {
    /// Create an adapter clocked at `clock_hz` and start its worker thread.
    ///
    /// Status comes up with TDRE set and timing derived from a zero control
    /// value (divide-by-1).
    #[must_use]
    pub fn new(clock_hz: u32) -> Self {
        let mut state = AciaState {
            status: TDRE,
            control: 0,
            tx: None,
            rx_data: 0,
            clock_hz,
            char_duration: Duration::ZERO,
            peer: None,
            peer_generation: 0,
            stop: false,
        };
        state.derive_timing();

        let shared = Arc::new(AciaShared {
            state: Mutex::new(state),
            work: Condvar::new(),
            status_changed: Condvar::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("acia-worker".into())
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn ACIA worker")
        };

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// A bus-mappable handle to this adapter's registers.
    #[must_use]
    pub fn device(&self) -> AciaDevice {
        AciaDevice {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Attach a peer. Any previous peer is dropped.
    pub fn connect_peer(&self, peer: Box<dyn SerialPeer>) {
        let mut state = self.shared.lock();
        state.peer = Some(peer);
        state.peer_generation += 1;
        log::debug!("ACIA peer connected");
        self.shared.work.notify_all();
    }

    /// Detach the current peer, if any.
    pub fn disconnect_peer(&self) {
        let mut state = self.shared.lock();
        if state.peer.take().is_some() {
            log::debug!("ACIA peer disconnected");
        }
        state.peer_generation += 1;
        self.shared.work.notify_all();
    }

    /// Effective baud rate under the current control register.
    #[must_use]
    pub fn baud(&self) -> u32 {
        let state = self.shared.lock();
        let divisor = match state.control & 0x03 {
            0b00 => 1,
            0b01 => 16,
            _ => 64,
        };
        state.clock_hz / divisor
    }

    /// Time to transfer one character at the current control settings.
    #[must_use]
    pub fn char_duration(&self) -> Duration {
        self.shared.lock().char_duration
    }

    /// Block until `mask` status bits match `set`, or the timeout expires.
    /// Returns whether the condition was met.
    pub fn wait_status(&self, mask: u8, set: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            let matched = if set {
                state.status & mask == mask
            } else {
                state.status & mask == 0
            };
            if matched {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, result) = self
                .shared
                .status_changed
                .wait_timeout(state, remaining)
                .expect("ACIA state lock poisoned");
            state = guard;
            if result.timed_out() {
                return false;
            }
        }
    }

    /// Stop the worker thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.lock();
            state.stop = true;
            self.shared.work.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Acia6850 {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bus-mappable view of an adapter's two registers.
///
/// Cloning yields another handle to the same adapter.
#[derive(Clone)]
pub struct AciaDevice {
    shared: Arc<AciaShared>,
}

impl BusDevice for AciaDevice {
    fn read(&mut self, offset: u16) -> u8 {
        let mut state = self.shared.lock();
        if offset & 1 == 0 {
            state.status
        } else {
            // Consuming the byte frees the receive register; tell the
            // worker there is room again.
            state.status &= !RDRF;
            self.shared.work.notify_all();
            state.rx_data
        }
    }

    fn write(&mut self, offset: u16, value: u8) {
        let mut state = self.shared.lock();
        if offset & 1 == 0 {
            if value & MASTER_RESET == MASTER_RESET {
                state.status = TDRE;
                state.tx = None;
                state.control = 0;
            } else {
                state.control = value;
            }
            state.derive_timing();
        } else {
            state.tx = Some(value);
            state.status &= !TDRE;
        }
        self.shared.work.notify_all();
    }

    fn peek(&self, offset: u16) -> u8 {
        let state = self.shared.lock();
        if offset & 1 == 0 {
            state.status
        } else {
            state.rx_data
        }
    }
}

/// The adapter's worker loop.
///
/// Each pass waits for work, snapshots it under the lock, pays one
/// character time of line activity outside the lock, performs the peer
/// I/O, then posts the resulting status bits.
fn worker_loop(shared: &AciaShared) {
    log::debug!("ACIA worker started");
    loop {
        // Wait for work; predicates re-checked after every wake to guard
        // against spurious wakeups.
        let (tx, mut peer, generation, duration, want_rx) = {
            let mut state = shared.lock();
            loop {
                if state.stop {
                    return;
                }
                let has_tx = state.tx.is_some();
                let can_rx = state.peer.is_some() && state.status & RDRF == 0;
                if has_tx || can_rx {
                    break;
                }
                state = shared
                    .work
                    .wait(state)
                    .expect("ACIA state lock poisoned");
            }
            let tx = state.tx.take();
            let want_rx = state.status & RDRF == 0;
            (
                tx,
                state.peer.take(),
                state.peer_generation,
                state.char_duration,
                want_rx,
            )
        };

        // One character of line time. With no peer attached this is the
        // whole transfer: a write to a detached adapter still paces.
        thread::sleep(duration);

        let mut received = None;
        if let Some(peer) = peer.as_mut() {
            if let Some(byte) = tx {
                peer.write_byte(byte);
            }
            if want_rx {
                received = peer.read_byte();
            }
        }

        // Post results and wake status waiters.
        let mut state = shared.lock();
        if state.peer_generation == generation {
            state.peer = peer;
        }
        // A fresh transmit byte may have been queued while the line was
        // busy; only raise TDRE if the register is actually free.
        if tx.is_some() && state.tx.is_none() {
            state.status |= TDRE;
        }
        if let Some(byte) = received {
            state.rx_data = byte;
            state.status |= RDRF;
        }
        shared.status_changed.notify_all();
    }
}
