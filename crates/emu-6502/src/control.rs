//! Thread-shared CPU control surface.
//!
//! The debug/GUI layer drives a running CPU through this handle: raising
//! RESET/NMI/IRQ, changing the virtual clock rate, toggling the trace sink,
//! sampling throughput, and waking a halted CPU. The CPU thread consumes
//! signals between instructions; nothing here blocks it mid-instruction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// Shared control state between the CPU thread and the outside world.
pub struct CpuControl {
    reset: AtomicBool,
    nmi: AtomicBool,
    irq: AtomicBool,
    /// Mirror of the I flag, refreshed by the CPU after every instruction.
    /// An IRQ raise is captured at signal time: it is dropped here, not
    /// re-checked at service time.
    irq_masked: AtomicBool,
    stop: AtomicBool,
    trace: AtomicBool,
    /// Per-cycle duration in nanoseconds; 0 = unregulated.
    nanos_per_cycle: AtomicU64,
    /// Instructions executed since the window was last sampled.
    instr_count: AtomicU64,
    window_start: Mutex<Instant>,
    /// Halt gate for the reserved halt opcode.
    halted: Mutex<bool>,
    wake: Condvar,
}

impl CpuControl {
    /// Create a control block with the given virtual clock rate in MHz
    /// (0 = unregulated, run flat out).
    #[must_use]
    pub fn new(clock_mhz: f64) -> Self {
        let control = Self {
            reset: AtomicBool::new(false),
            nmi: AtomicBool::new(false),
            irq: AtomicBool::new(false),
            irq_masked: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            trace: AtomicBool::new(false),
            nanos_per_cycle: AtomicU64::new(0),
            instr_count: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
            halted: Mutex::new(false),
            wake: Condvar::new(),
        };
        control.set_clock_mhz(clock_mhz);
        control
    }

    /// Set the virtual clock rate in MHz; 0 means unregulated.
    pub fn set_clock_mhz(&self, mhz: f64) {
        let nanos = if mhz > 0.0 {
            (1000.0 / mhz).round() as u64
        } else {
            0
        };
        self.nanos_per_cycle.store(nanos, Ordering::SeqCst);
    }

    /// Current virtual clock rate in MHz; 0 means unregulated.
    #[must_use]
    pub fn clock_mhz(&self) -> f64 {
        let nanos = self.nanos_per_cycle.load(Ordering::SeqCst);
        if nanos == 0 { 0.0 } else { 1000.0 / nanos as f64 }
    }

    pub(crate) fn nanos_per_cycle(&self) -> u64 {
        self.nanos_per_cycle.load(Ordering::SeqCst)
    }

    /// Raise the RESET signal.
    pub fn raise_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
    }

    /// Raise the non-maskable interrupt signal.
    pub fn raise_nmi(&self) {
        self.nmi.store(true, Ordering::SeqCst);
    }

    /// Raise the interrupt-request signal.
    ///
    /// A no-op while the I flag is set: the signal is not latched for
    /// later, matching the original adapter-facing behaviour.
    pub fn raise_irq(&self) {
        if !self.irq_masked.load(Ordering::SeqCst) {
            self.irq.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_nmi(&self) -> bool {
        self.nmi.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_irq(&self) -> bool {
        self.irq.swap(false, Ordering::SeqCst)
    }

    /// RESET discards any pending interrupt.
    pub(crate) fn discard_pending_interrupts(&self) {
        self.nmi.store(false, Ordering::SeqCst);
        self.irq.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_irq_masked(&self, masked: bool) {
        self.irq_masked.store(masked, Ordering::SeqCst);
    }

    /// Whether a pending IRQ is latched (visible for tests/inspection).
    #[must_use]
    pub fn irq_pending(&self) -> bool {
        self.irq.load(Ordering::SeqCst)
    }

    /// Ask the CPU loop to stop at the next instruction boundary. Also
    /// wakes a halted CPU so it can observe the request.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _guard = self.halted.lock().expect("halt lock poisoned");
        self.wake.notify_all();
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Enable or disable the instruction trace sink.
    pub fn set_trace_enabled(&self, enabled: bool) {
        self.trace.store(enabled, Ordering::SeqCst);
    }

    /// Whether instruction tracing is enabled.
    #[must_use]
    pub fn trace_enabled(&self) -> bool {
        self.trace.load(Ordering::SeqCst)
    }

    pub(crate) fn count_instruction(&self) {
        self.instr_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Effective instructions per second since the last sample.
    ///
    /// Sampling resets the averaging window.
    #[must_use]
    pub fn instructions_per_second(&self) -> f64 {
        let mut window = self.window_start.lock().expect("window lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(*window).as_secs_f64();
        *window = now;
        let count = self.instr_count.swap(0, Ordering::Relaxed);
        if elapsed > 0.0 { count as f64 / elapsed } else { 0.0 }
    }

    /// Block the calling (CPU) thread until woken or stopped. Used by the
    /// reserved halt opcode.
    pub(crate) fn halt_wait(&self) {
        let mut halted = self.halted.lock().expect("halt lock poisoned");
        *halted = true;
        while *halted && !self.stop_requested() {
            halted = self.wake.wait(halted).expect("halt lock poisoned");
        }
    }

    /// Wake a CPU halted by the reserved halt opcode.
    pub fn wake(&self) {
        let mut halted = self.halted.lock().expect("halt lock poisoned");
        *halted = false;
        self.wake.notify_all();
    }

    /// Whether the CPU is currently parked in the halt instruction.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        *self.halted.lock().expect("halt lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_mhz_round_trips() {
        let control = CpuControl::new(1.0);
        assert!((control.clock_mhz() - 1.0).abs() < 1e-9);

        control.set_clock_mhz(0.0);
        assert_eq!(control.clock_mhz(), 0.0);

        control.set_clock_mhz(2.0);
        assert!((control.clock_mhz() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn irq_raise_is_noop_while_masked() {
        let control = CpuControl::new(0.0);
        control.set_irq_masked(true);
        control.raise_irq();
        assert!(!control.take_irq());

        control.set_irq_masked(false);
        control.raise_irq();
        assert!(control.take_irq());
        // take consumed it
        assert!(!control.take_irq());
    }

    #[test]
    fn reset_discards_pending_interrupts() {
        let control = CpuControl::new(0.0);
        control.set_irq_masked(false);
        control.raise_nmi();
        control.raise_irq();
        control.discard_pending_interrupts();
        assert!(!control.take_nmi());
        assert!(!control.take_irq());
    }

    #[test]
    fn instructions_per_second_resets_window() {
        let control = CpuControl::new(0.0);
        for _ in 0..1000 {
            control.count_instruction();
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
        let ips = control.instructions_per_second();
        assert!(ips > 0.0);
        // Window was reset: an immediate re-sample sees no instructions.
        let ips2 = control.instructions_per_second();
        assert!(ips2 < ips);
    }

    #[test]
    fn stop_wakes_halted_thread() {
        use std::sync::Arc;
        let control = Arc::new(CpuControl::new(0.0));
        let worker = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || control.halt_wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        control.request_stop();
        worker.join().expect("halted thread should exit on stop");
    }
}
