//! WAV import/export for tape audio.
//!
//! Bridges WAV files to the codec's canonical stream form: loading folds
//! any channel count and sample width down to signed 16-bit big-endian
//! mono; saving writes the encoder's output stream at its configured
//! sample rate, width and channel count.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::{BitDepth, CodecConfig};

/// Write an encoder output stream to a WAV file.
pub fn save_wav(path: &Path, cfg: &CodecConfig, pcm: &[u8]) -> Result<(), String> {
    let spec = WavSpec {
        channels: cfg.channels,
        sample_rate: cfg.sample_rate,
        bits_per_sample: match cfg.bit_depth {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
        },
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .map_err(|e| format!("cannot create {}: {e}", path.display()))?;

    match cfg.bit_depth {
        BitDepth::Sixteen => {
            for pair in pcm.chunks_exact(2) {
                let sample = i16::from_be_bytes([pair[0], pair[1]]);
                writer
                    .write_sample(sample)
                    .map_err(|e| format!("WAV write failed: {e}"))?;
            }
        }
        BitDepth::Eight => {
            for &byte in pcm {
                writer
                    .write_sample(byte as i8)
                    .map_err(|e| format!("WAV write failed: {e}"))?;
            }
        }
    }

    writer
        .finalize()
        .map_err(|e| format!("WAV finalize failed: {e}"))
}

/// Load a WAV file as a canonical decoder stream.
///
/// Returns the 16-bit big-endian mono samples and the file's sample rate;
/// feed the latter into the decoder's configuration.
pub fn load_wav(path: &Path) -> Result<(Vec<u8>, u32), String> {
    let mut reader =
        WavReader::open(path).map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    // Widen or narrow every sample to i16.
    let samples: Vec<i16> = match spec.sample_format {
        SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| {
                        if bits >= 16 {
                            (v >> (bits - 16)) as i16
                        } else {
                            (v << (16 - bits)) as i16
                        }
                    })
                })
                .collect::<Result<_, _>>()
        }
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16))
            .collect::<Result<_, _>>(),
    }
    .map_err(|e| format!("WAV read failed: {e}"))?;

    // Fold frames down to mono.
    let mut out = Vec::with_capacity(samples.len() / channels * 2);
    for frame in samples.chunks_exact(channels) {
        let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
        let mono = (sum / channels as i32) as i16;
        out.extend_from_slice(&mono.to_be_bytes());
    }

    Ok((out, spec.sample_rate))
}
