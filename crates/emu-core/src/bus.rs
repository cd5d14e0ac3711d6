//! Memory bus interface.

/// Memory bus interface.
///
/// The CPU accesses memory and peripherals through this trait. The bus
/// handles address decoding and routing to the appropriate region or device.
pub trait Bus {
    /// Read a byte from the given address.
    fn read(&mut self, address: u16) -> u8;

    /// Write a byte to the given address.
    fn write(&mut self, address: u16, value: u8);

    /// Read a byte without side effects.
    ///
    /// Identical to `read` for plain memory, but a device whose normal read
    /// has side effects (e.g. a status bit cleared on read) must return the
    /// value without triggering them. Used by trace and inspection paths.
    fn peek(&self, address: u16) -> u8;
}
