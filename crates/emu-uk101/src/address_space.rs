//! Block-granular address space.
//!
//! The 64 KB address space is divided into 256-byte blocks; each block is
//! owned by at most one region (plain RAM, read-only ROM, or a
//! memory-mapped device). Dispatch is O(1): block index -> region ->
//! region-relative offset. Registration order matters: a region mapped
//! later takes the blocks from whatever was there before, which is how
//! gap-filling RAM is installed first and ROM/devices layered on top.
//!
//! Unmapped addresses behave like an open bus: reads return the high byte
//! of the address (residual bus capacitance, approximately), writes are
//! discarded.

use emu_core::{Bus, BusDevice};

/// Bytes per block.
pub const BLOCK_SIZE: usize = 256;

/// Blocks in the 16-bit address space.
pub const BLOCK_COUNT: usize = 256;

/// One mapped region: a closed set of variants, with a trait object only
/// for the device case.
pub enum Region {
    /// Read/write memory.
    Ram(Vec<u8>),
    /// Read-only memory; writes are discarded.
    Rom(Vec<u8>),
    /// Memory-mapped peripheral with its own read/write behaviour.
    Device(Box<dyn BusDevice>),
}

struct Mapping {
    base: u16,
    region: Region,
}

/// The machine's address space. Built once at machine construction;
/// regions are never resized or remapped afterwards.
pub struct AddressSpace {
    regions: Vec<Mapping>,
    /// Block index -> index into `regions`. Last registration wins.
    blocks: [Option<usize>; BLOCK_COUNT],
}

impl AddressSpace {
    /// An address space with nothing mapped.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            blocks: [None; BLOCK_COUNT],
        }
    }

    /// Map zero-filled RAM of `size` bytes at `base`.
    pub fn map_ram(&mut self, base: u16, size: usize) -> Result<(), String> {
        self.map(base, size, Region::Ram(vec![0; size]))
    }

    /// Map a ROM image at `base`.
    pub fn map_rom(&mut self, base: u16, image: Vec<u8>) -> Result<(), String> {
        let size = image.len();
        self.map(base, size, Region::Rom(image))
    }

    /// Map a device over `blocks` 256-byte blocks at `base`.
    pub fn map_device(
        &mut self,
        base: u16,
        blocks: usize,
        device: Box<dyn BusDevice>,
    ) -> Result<(), String> {
        self.map(base, blocks * BLOCK_SIZE, Region::Device(device))
    }

    fn map(&mut self, base: u16, size: usize, region: Region) -> Result<(), String> {
        if base as usize % BLOCK_SIZE != 0 {
            return Err(format!("region base {base:#06X} is not block-aligned"));
        }
        if size == 0 || size % BLOCK_SIZE != 0 {
            return Err(format!(
                "region size {size} is not a whole number of {BLOCK_SIZE}-byte blocks"
            ));
        }
        let first_block = base as usize / BLOCK_SIZE;
        let block_count = size / BLOCK_SIZE;
        if first_block + block_count > BLOCK_COUNT {
            return Err(format!(
                "region at {base:#06X} ({size} bytes) exceeds the address space"
            ));
        }

        let index = self.regions.len();
        self.regions.push(Mapping { base, region });
        for block in first_block..first_block + block_count {
            self.blocks[block] = Some(index);
        }
        Ok(())
    }

    fn lookup(&self, address: u16) -> Option<(usize, u16)> {
        let slot = self.blocks[address as usize / BLOCK_SIZE]?;
        let offset = address - self.regions[slot].base;
        Some((slot, offset))
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for AddressSpace {
    fn read(&mut self, address: u16) -> u8 {
        match self.lookup(address) {
            Some((slot, offset)) => match &mut self.regions[slot].region {
                Region::Ram(data) | Region::Rom(data) => data[offset as usize],
                Region::Device(device) => device.read(offset),
            },
            // Open bus.
            None => (address >> 8) as u8,
        }
    }

    fn write(&mut self, address: u16, value: u8) {
        if let Some((slot, offset)) = self.lookup(address) {
            match &mut self.regions[slot].region {
                Region::Ram(data) => data[offset as usize] = value,
                // ROM and open bus both discard writes.
                Region::Rom(_) => {}
                Region::Device(device) => device.write(offset, value),
            }
        }
    }

    fn peek(&self, address: u16) -> u8 {
        match self.lookup(address) {
            Some((slot, offset)) => match &self.regions[slot].region {
                Region::Ram(data) | Region::Rom(data) => data[offset as usize],
                Region::Device(device) => device.peek(offset),
            },
            None => (address >> 8) as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Device whose normal read has a side effect, to prove peek doesn't.
    struct CountingDevice {
        reads: u16,
    }

    impl BusDevice for CountingDevice {
        fn read(&mut self, _offset: u16) -> u8 {
            self.reads += 1;
            self.reads as u8
        }

        fn write(&mut self, _offset: u16, _value: u8) {}

        fn peek(&self, _offset: u16) -> u8 {
            self.reads as u8
        }
    }

    #[test]
    fn ram_reads_back_writes() {
        let mut space = AddressSpace::new();
        space.map_ram(0x0000, 0x2000).expect("map");
        space.write(0x1234, 0xAB);
        assert_eq!(space.read(0x1234), 0xAB);
    }

    #[test]
    fn rom_discards_writes() {
        let mut space = AddressSpace::new();
        space.map_rom(0xF800, vec![0x12; 0x0800]).expect("map");
        space.write(0xF900, 0xFF);
        assert_eq!(space.read(0xF900), 0x12);
    }

    #[test]
    fn unmapped_read_returns_address_high_byte() {
        let mut space = AddressSpace::new();
        assert_eq!(space.read(0x8234), 0x82);
        assert_eq!(space.read(0x00FF), 0x00);
        assert_eq!(space.peek(0xC101), 0xC1);
        // Write to nowhere is discarded without effect.
        space.write(0x8234, 0x55);
        assert_eq!(space.read(0x8234), 0x82);
    }

    #[test]
    fn later_registration_wins_overlap() {
        let mut space = AddressSpace::new();
        space.map_ram(0x0000, 0x10000 >> 1).expect("map base RAM");
        space.write(0x7F00, 0x11);
        // ROM over the top of the last RAM block.
        space.map_rom(0x7F00, vec![0x22; 0x100]).expect("map ROM");
        assert_eq!(space.read(0x7F00), 0x22, "ROM wins the overlap");
        assert_eq!(space.read(0x7EFF), 0x00, "RAM keeps the rest");
    }

    #[test]
    fn device_dispatch_uses_relative_offset() {
        struct OffsetEcho;
        impl BusDevice for OffsetEcho {
            fn read(&mut self, offset: u16) -> u8 {
                offset as u8
            }
            fn write(&mut self, _offset: u16, _value: u8) {}
            fn peek(&self, offset: u16) -> u8 {
                offset as u8
            }
        }

        let mut space = AddressSpace::new();
        space
            .map_device(0xF000, 2, Box::new(OffsetEcho))
            .expect("map");
        assert_eq!(space.read(0xF000), 0x00);
        assert_eq!(space.read(0xF001), 0x01);
        assert_eq!(space.read(0xF1FF), 0xFF);
    }

    #[test]
    fn peek_does_not_disturb_devices() {
        let mut space = AddressSpace::new();
        space
            .map_device(0xF000, 1, Box::new(CountingDevice { reads: 0 }))
            .expect("map");

        assert_eq!(space.peek(0xF000), 0, "peek sees state without touching it");
        assert_eq!(space.read(0xF000), 1, "read has the side effect");
        assert_eq!(space.peek(0xF000), 1);
    }

    #[test]
    fn bad_layouts_are_setup_errors() {
        let mut space = AddressSpace::new();
        assert!(space.map_ram(0x0010, 0x100).is_err(), "unaligned base");
        assert!(space.map_ram(0x0000, 0x80).is_err(), "partial block");
        assert!(space.map_ram(0x0000, 0).is_err(), "empty region");
        assert!(
            space.map_rom(0xFF00, vec![0; 0x200]).is_err(),
            "runs off the end of the address space"
        );
    }
}
