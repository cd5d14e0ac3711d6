//! Byte stream to tone-cycle sample stream.

use std::f64::consts::TAU;
use std::io::{self, Read, Write};

use crate::{BitDepth, CodecConfig, Waveform};

/// Peak amplitude as a fraction of full scale.
const AMPLITUDE: f64 = 0.9;

/// RC time constant as a fraction of a half-cycle, for the hardware
/// waveform. Small enough that the wave saturates well before the edge.
const RC_FRACTION: f64 = 0.2;

/// Kansas City encoder: writes framed bytes as tone cycles into a PCM
/// sample stream.
pub struct KansasCityEncoder<W: Write> {
    cfg: CodecConfig,
    out: W,
    /// Last emitted level, for waveform continuity across cycles.
    level: f64,
}

impl<W: Write> KansasCityEncoder<W> {
    #[must_use]
    pub fn new(cfg: CodecConfig, out: W) -> Self {
        Self {
            cfg,
            out,
            level: 0.0,
        }
    }

    /// Encode a whole session: lead-in carrier, every byte from `src`,
    /// lead-out carrier.
    pub fn encode_stream<R: Read>(&mut self, src: R) -> io::Result<()> {
        self.lead()?;
        for byte in src.bytes() {
            self.encode_byte(byte?)?;
        }
        self.lead()
    }

    /// Emit the configured lead-in/lead-out: a run of mark bits.
    pub fn lead(&mut self) -> io::Result<()> {
        let bits = (self.cfg.lead_seconds * self.cfg.baud as f32).ceil() as u32;
        for _ in 0..bits {
            self.write_bit(true)?;
        }
        Ok(())
    }

    /// Emit one byte: start bit, 8 data bits LSB-first, 2 stop bits.
    pub fn encode_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_bit(false)?;
        for bit in 0..8 {
            self.write_bit(byte & (1 << bit) != 0)?;
        }
        self.write_bit(true)?;
        self.write_bit(true)
    }

    /// Consume the encoder, returning the output stream.
    pub fn into_inner(self) -> W {
        self.out
    }

    /// One bit: a burst of mark or space tone cycles. Space uses half the
    /// frequency and half the cycle count, so bit duration is constant.
    fn write_bit(&mut self, bit: bool) -> io::Result<()> {
        let (freq, cycles) = if bit {
            (self.cfg.mark_freq, self.cfg.mark_cycles())
        } else {
            (self.cfg.space_freq(), self.cfg.space_cycles())
        };
        for _ in 0..cycles {
            self.write_cycle(freq)?;
        }
        Ok(())
    }

    /// Render one full tone cycle at the given frequency.
    fn write_cycle(&mut self, freq: u32) -> io::Result<()> {
        let samples = (self.cfg.sample_rate / freq) as usize;
        match self.cfg.waveform {
            Waveform::Sine => {
                for i in 0..samples {
                    let value = AMPLITUDE * (TAU * i as f64 / samples as f64).sin();
                    self.put_sample(value)?;
                }
                self.level = 0.0;
            }
            Waveform::Hardware => {
                // Square wave through an RC low-pass: exponential charge
                // toward +amplitude for the first half-cycle, discharge
                // toward -amplitude for the second.
                let half = samples / 2;
                let k = 1.0 - (-1.0 / (RC_FRACTION * half as f64)).exp();
                for i in 0..samples {
                    let target = if i < half { AMPLITUDE } else { -AMPLITUDE };
                    self.level += (target - self.level) * k;
                    self.put_sample(self.level)?;
                }
            }
        }
        Ok(())
    }

    /// Scale a [-1, 1] value to the configured bit depth and fan it out to
    /// every channel. Samples are signed, big-endian.
    fn put_sample(&mut self, value: f64) -> io::Result<()> {
        match self.cfg.bit_depth {
            BitDepth::Sixteen => {
                let sample = (value * f64::from(i16::MAX)) as i16;
                for _ in 0..self.cfg.channels {
                    self.out.write_all(&sample.to_be_bytes())?;
                }
            }
            BitDepth::Eight => {
                let sample = (value * f64::from(i8::MAX)) as i8;
                for _ in 0..self.cfg.channels {
                    self.out.write_all(&sample.to_be_bytes())?;
                }
            }
        }
        Ok(())
    }
}
