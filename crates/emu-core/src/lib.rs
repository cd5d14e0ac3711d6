//! Core traits and types for the emulator.
//!
//! The CPU drives memory and peripherals through the [`Bus`] trait; each
//! memory-mapped peripheral implements [`BusDevice`]; serial chips bridge to
//! the outside world through [`SerialPeer`]. Real-time pacing is built on a
//! one-time [`TimingProfile`] measurement and the [`Pacer`] it feeds.

mod bus;
mod clock;
mod device;
mod peer;

pub use bus::Bus;
pub use clock::{Pacer, TimingProfile};
pub use device::BusDevice;
pub use peer::SerialPeer;
