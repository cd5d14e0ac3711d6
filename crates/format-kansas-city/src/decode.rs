//! Tone-cycle sample stream back to bytes.

use std::io::{self, Read};

use crate::CodecConfig;

/// Tone classification for one measured cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    /// Mark: the higher frequency, shorter cycles. Also the fallback for
    /// cycles far from both expectations (blank carrier is safe).
    Mark,
    /// Space: half the mark frequency, cycles twice as long.
    Space,
}

/// Kansas City decoder: reads canonical PCM (16-bit signed big-endian,
/// mono) and reassembles the byte stream.
///
/// Create one decoder per decode session: the adaptive thresholds start
/// from the configured expectations and live only as long as the decoder.
pub struct KansasCityDecoder<R: Read> {
    cfg: CodecConfig,
    src: R,

    /// Expected samples per mark cycle (the shorter one).
    count_lo: f64,
    /// Expected samples per space cycle; tracked as exactly double
    /// `count_lo`.
    count_hi: f64,

    /// Tone of the current run of identical classifications.
    run_tone: Tone,
    /// Length of the current run.
    run_len: u32,

    /// Previous sample, for boundary detection.
    prev: i16,
    /// Previous sample delta, for peak detection.
    prev_delta: i32,
    have_prev: bool,
    /// Samples seen since the last cycle boundary.
    samples_in_cycle: u32,
    /// A first boundary has been seen; measurements are cycle-aligned.
    synced: bool,
}

impl<R: Read> KansasCityDecoder<R> {
    #[must_use]
    pub fn new(cfg: CodecConfig, src: R) -> Self {
        let count_lo = cfg.samples_per_mark_cycle();
        let count_hi = cfg.samples_per_space_cycle();
        Self {
            cfg,
            src,
            count_lo,
            count_hi,
            run_tone: Tone::Mark,
            run_len: 0,
            prev: 0,
            prev_delta: 0,
            have_prev: false,
            samples_in_cycle: 0,
            synced: false,
        }
    }

    /// Decode the next framed byte.
    ///
    /// Scans for a start bit, reads 8 data bits LSB-first, and discards
    /// the two stop bits (slack for minor transmission errors). Returns
    /// `Ok(None)` when the input ends during the scan; that is the normal
    /// end of tape, not an error.
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        // Hunt for the start bit; leading mark carrier is skipped here.
        loop {
            match self.next_bit()? {
                None => return Ok(None),
                Some(false) => break,
                Some(true) => {}
            }
        }

        let mut byte = 0u8;
        for bit in 0..8 {
            match self.next_bit()? {
                None => return Ok(None),
                Some(true) => byte |= 1 << bit,
                Some(false) => {}
            }
        }

        // Stop bits: discarded, and end-of-input here does not invalidate
        // the byte already assembled.
        let _ = self.next_bit()?;
        let _ = self.next_bit()?;

        Ok(Some(byte))
    }

    /// Decode every remaining byte into a vector.
    pub fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        while let Some(byte) = self.read_byte()? {
            bytes.push(byte);
        }
        Ok(bytes)
    }

    /// The next accepted logical bit.
    ///
    /// A bit is accepted once the same classification has repeated for the
    /// expected number of consecutive cycles (fewer for space than mark,
    /// mirroring the encoder's cycle counts). A classification change
    /// restarts the run at 1.
    fn next_bit(&mut self) -> io::Result<Option<bool>> {
        loop {
            let Some(length) = self.next_cycle()? else {
                return Ok(None);
            };
            let tone = self.classify(length);

            if tone == self.run_tone {
                self.run_len += 1;
            } else {
                self.run_tone = tone;
                self.run_len = 1;
            }

            let needed = match tone {
                Tone::Mark => self.cfg.mark_cycles(),
                Tone::Space => self.cfg.space_cycles(),
            };
            if self.run_len >= needed {
                self.run_len = 0;
                return Ok(Some(tone == Tone::Mark));
            }
        }
    }

    /// Classify a cycle length as mark or space.
    ///
    /// The closer expectation wins when the measurement is within half of
    /// it; anything far from both is treated as mark (blank carrier).
    /// Confident measurements nudge the expectations when adaptive
    /// tracking is on: a 3:1 history-weighted average, with the other
    /// expectation derived as exactly double/half.
    fn classify(&mut self, length: u32) -> Tone {
        let n = f64::from(length);
        let err_lo = (n - self.count_lo).abs();
        let err_hi = (n - self.count_hi).abs();

        if err_lo <= err_hi {
            if err_lo < self.count_lo / 2.0 {
                if self.cfg.adaptive {
                    self.count_lo = (3.0 * self.count_lo + n) / 4.0;
                    self.count_hi = self.count_lo * 2.0;
                }
                Tone::Mark
            } else {
                // Far from both: safe blank-carrier tone.
                Tone::Mark
            }
        } else if err_hi < self.count_hi / 2.0 {
            if self.cfg.adaptive {
                self.count_hi = (3.0 * self.count_hi + n) / 4.0;
                self.count_lo = self.count_hi / 2.0;
            }
            Tone::Space
        } else {
            Tone::Mark
        }
    }

    /// Measure the next complete tone cycle in samples.
    ///
    /// The first boundary after construction only synchronises; partial
    /// leading cycles are never reported.
    fn next_cycle(&mut self) -> io::Result<Option<u32>> {
        loop {
            let Some(sample) = self.read_sample()? else {
                return Ok(None);
            };

            let delta = i32::from(sample) - i32::from(self.prev);
            let boundary = if !self.have_prev {
                false
            } else if self.cfg.phase.peak_boundaries() {
                // Positive peak: rising then no-longer-rising.
                self.prev_delta > 0 && delta <= 0 && self.prev > 0
            } else {
                // Upward zero crossing.
                self.prev < 0 && sample >= 0
            };

            self.prev = sample;
            self.prev_delta = delta;
            self.have_prev = true;
            self.samples_in_cycle += 1;

            if boundary {
                let length = self.samples_in_cycle - 1;
                self.samples_in_cycle = 1;
                if self.synced && length > 0 {
                    return Ok(Some(length));
                }
                self.synced = true;
            }
        }
    }

    /// Next canonical sample: 16-bit signed big-endian, inverted when the
    /// configured phase asks for it. `None` at end of input.
    fn read_sample(&mut self) -> io::Result<Option<i16>> {
        let mut buf = [0u8; 2];
        let mut filled = 0;
        while filled < 2 {
            let n = self.src.read(&mut buf[filled..])?;
            if n == 0 {
                // A trailing odd byte is discarded with the tail.
                return Ok(None);
            }
            filled += n;
        }
        let mut sample = i16::from_be_bytes(buf);
        if self.cfg.phase.inverted() {
            sample = sample.saturating_neg();
        }
        Ok(Some(sample))
    }
}
