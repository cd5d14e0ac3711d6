//! UK101-class 8-bit home computer emulator.
//!
//! A 6502 paced against the wall clock, a block-granular address space
//! routing the 64 KB map to RAM/ROM/devices, an MC6850 ACIA with its own
//! worker thread, and (via `format-kansas-city`) the cassette codec the
//! ACIA ultimately talks to. Video rendering and keyboard mapping live in
//! an external front-end that consumes the [`VideoHandle`] and
//! [`KeyboardHandle`] boundaries.

mod address_space;
pub mod config;
mod keyboard;
mod uk101;
mod video;

pub use address_space::{AddressSpace, BLOCK_COUNT, BLOCK_SIZE, Region};
pub use config::{QuirksConfig, Uk101Config};
pub use keyboard::{KeyboardHandle, KeyboardPort};
pub use uk101::{
    ACIA_BASE, BASIC_BASE, BASIC_SIZE, KEYBOARD_BASE, MONITOR_BASE, MONITOR_SIZE, RAM_BASE, Uk101,
    VIDEO_BASE, VIDEO_SIZE,
};
pub use video::{VideoHandle, VideoRam};
