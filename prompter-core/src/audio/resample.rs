//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Response audio arrives at whatever rate the TTS service produced
//! (commonly 22.05 or 24 kHz) while the output device runs at its own rate
//! (commonly 48 kHz). Every decoded chunk goes through [`resample`] before it
//! is scheduled, so the playback timeline can count output frames exactly.
//!
//! When the rates match, `RateConverter` is a passthrough and no rubato
//! session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::buffering::PcmBuffer;
use crate::error::{PrompterError, Result};

/// Input frames per rubato call.
const CHUNK_SIZE: usize = 1_024;

/// Upper bound on zero-padded flush rounds when draining the resampler tail.
const MAX_FLUSH_ROUNDS: usize = 8;

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// Returns `PrompterError::AudioOutput` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }
        if source_rate == 0 || target_rate == 0 {
            return Err(PrompterError::AudioOutput(format!(
                "invalid resample rates {source_rate} -> {target_rate}"
            )));
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| PrompterError::AudioOutput(format!("resampler init: {e}")))?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        debug!(source_rate, target_rate, chunk_size, "resampler created");
        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    /// A remainder shorter than one chunk is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }
        result
    }

    /// Push one zero-padded chunk through to release buffered output.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() {
            return std::mem::take(&mut self.input_buf);
        }
        let pad = self.chunk_size - self.input_buf.len() % self.chunk_size;
        self.process(&vec![0.0; pad])
    }

    /// Frames of latency the resampler adds at the start of its output.
    pub fn output_delay(&self) -> usize {
        self.resampler.as_ref().map_or(0, |r| r.output_delay())
    }
}

/// Convert a whole buffer to `target_rate`, compensating for the resampler's
/// delay so the output length is `round(len * target / source)`.
pub fn resample(pcm: PcmBuffer, target_rate: u32) -> Result<PcmBuffer> {
    if pcm.sample_rate == target_rate || pcm.is_empty() {
        return Ok(PcmBuffer::new(pcm.samples, target_rate));
    }
    let ratio = target_rate as f64 / pcm.sample_rate as f64;
    let expected = (pcm.samples.len() as f64 * ratio).round() as usize;

    let mut rc = RateConverter::new(pcm.sample_rate, target_rate, CHUNK_SIZE)?;
    let delay = rc.output_delay();
    let mut out = rc.process(&pcm.samples);
    for _ in 0..MAX_FLUSH_ROUNDS {
        if out.len() >= delay + expected {
            break;
        }
        out.extend(rc.flush());
    }

    out.drain(..delay.min(out.len()));
    out.truncate(expected);
    Ok(PcmBuffer::new(out, target_rate))
}
