//! Memory-mapped keyboard matrix port.
//!
//! The keyboard is an 8x8 switch matrix behind a single port: writing
//! selects rows (active low), reading returns the column bits of every
//! pressed key in the selected rows (also active low). Scan-code mapping
//! and everything above it is the front-end's concern; it pokes the
//! matrix through a [`KeyboardHandle`].

use std::sync::{Arc, Mutex};

use emu_core::BusDevice;

/// The bus-mapped port. One per machine.
pub struct KeyboardPort {
    matrix: Arc<Mutex<[u8; 8]>>,
    row_select: u8,
}

/// Front-end handle for pressing and releasing keys.
#[derive(Clone)]
pub struct KeyboardHandle {
    matrix: Arc<Mutex<[u8; 8]>>,
}

impl KeyboardPort {
    #[must_use]
    pub fn new() -> (Self, KeyboardHandle) {
        let matrix = Arc::new(Mutex::new([0u8; 8]));
        let port = Self {
            matrix: Arc::clone(&matrix),
            row_select: 0xFF,
        };
        (port, KeyboardHandle { matrix })
    }

    fn scan(&self) -> u8 {
        let matrix = self.matrix.lock().expect("keyboard matrix lock poisoned");
        let mut columns = 0xFF;
        for (row, &keys) in matrix.iter().enumerate() {
            // Row selected when its bit is low.
            if self.row_select & (1 << row) == 0 {
                columns &= !keys;
            }
        }
        columns
    }
}

impl BusDevice for KeyboardPort {
    fn read(&mut self, _offset: u16) -> u8 {
        self.scan()
    }

    fn write(&mut self, _offset: u16, value: u8) {
        self.row_select = value;
    }

    fn peek(&self, _offset: u16) -> u8 {
        self.scan()
    }
}

impl KeyboardHandle {
    /// Press or release the key at (row, column).
    pub fn set_key(&self, row: usize, column: u8, down: bool) {
        let mut matrix = self.matrix.lock().expect("keyboard matrix lock poisoned");
        if down {
            matrix[row & 7] |= 1 << (column & 7);
        } else {
            matrix[row & 7] &= !(1 << (column & 7));
        }
    }

    /// Release every key.
    pub fn clear(&self) {
        let mut matrix = self.matrix.lock().expect("keyboard matrix lock poisoned");
        *matrix = [0; 8];
    }
}
