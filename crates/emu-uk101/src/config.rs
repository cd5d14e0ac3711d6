//! Machine configuration: ROM images, RAM size, clock rate, quirk flags.

/// Hardware-quirk toggles, threaded explicitly into machine construction
/// rather than kept as global state.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuirksConfig {
    /// Swallow the first read of the ACIA data register after power-on:
    /// one monitor ROM performs a stray receive-read during init that
    /// would otherwise consume the first tape byte. A workaround for that
    /// ROM's behaviour, not general hardware semantics; default off.
    pub swallow_stray_data_read: bool,
}

/// Configuration for constructing a machine instance.
pub struct Uk101Config {
    /// Monitor ROM (2,048 bytes, mapped at $F800; holds the vectors).
    pub monitor_rom: Vec<u8>,
    /// BASIC ROM (8,192 bytes, mapped at $A000), if fitted.
    pub basic_rom: Option<Vec<u8>>,
    /// RAM size in bytes, mapped from $0000.
    pub ram_size: usize,
    /// Virtual CPU clock in MHz; 0 = unregulated, run flat out.
    pub clock_mhz: f64,
    /// ACIA external clock in Hz (4,800 Hz gives 300 baud at divide-by-16).
    pub acia_clock_hz: u32,
    /// Hardware-quirk toggles.
    pub quirks: QuirksConfig,
}

impl Default for Uk101Config {
    fn default() -> Self {
        Self {
            monitor_rom: Vec::new(),
            basic_rom: None,
            ram_size: 8 * 1024,
            clock_mhz: 1.0,
            acia_clock_hz: 4800,
            quirks: QuirksConfig::default(),
        }
    }
}
