//! Instruction-stepped 6502 CPU emulator.
//!
//! Each `step()` services pending RESET/NMI/IRQ signals, then fetches,
//! decodes and executes one whole instruction and returns its cycle count.
//! The run loop converts cycle counts into wall-clock time at a configurable
//! virtual clock rate, sleeping or spinning to keep emulated and real time
//! aligned.

pub mod alu;
mod control;
mod cpu;
mod flags;
mod registers;

pub use control::CpuControl;
pub use cpu::{Cpu6502, DebugHandler, TraceEntry, TraceSink};
pub use flags::Status;
pub use registers::Registers;
