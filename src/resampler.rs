//! Per-channel sample-rate/format conversion, wrapping `rubato`.
//!
//! An audio channel (see [`crate::audio_channel`]) owns exactly one
//! [`ChannelResampler`] and rebuilds it whenever the describing
//! [`AudioDesc`] of its input changes. The wrapper hides rubato's own
//! chunk-size bookkeeping behind a single `process` call that accepts
//! however many frames the producer handed over.

use anyhow::{Context, Result};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

/// Sample formats a producer may hand to an audio channel. Float is the
/// mix engine's native currency; the others are converted to planar f32
/// before resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
    U8,
}

/// Describes one side (input or output) of a resampling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioDesc {
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub channels: usize,
}

impl AudioDesc {
    pub fn new(sample_rate: u32, format: SampleFormat, channels: usize) -> Self {
        Self { sample_rate, format, channels }
    }
}

/// Converts interleaved or planar input of arbitrary rate/format into
/// planar f32 at a fixed output rate and channel count.
pub struct ChannelResampler {
    in_desc: AudioDesc,
    out_desc: AudioDesc,
    inner: Option<SincFixedIn<f32>>,
    /// Output samples produced beyond what the input would yield at a 1:1
    /// rate, accumulated across calls. Subtracted from timestamps by the
    /// audio channel to compensate for resampler-introduced drift.
    resample_offset: u64,
}

impl ChannelResampler {
    /// Builds a resampler converting from `in_desc` to `out_desc`. When the
    /// rates match this is a cheap format/layout converter with no rubato
    /// instance behind it.
    pub fn new(in_desc: AudioDesc, out_desc: AudioDesc) -> Result<Self> {
        let inner = if in_desc.sample_rate == out_desc.sample_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let ratio = out_desc.sample_rate as f64 / in_desc.sample_rate as f64;
            let resampler = SincFixedIn::<f32>::new(
                ratio,
                2.0,
                params,
                1024,
                out_desc.channels.max(1),
            )
            .context("failed to construct sample-rate converter")?;
            Some(resampler)
        };

        Ok(Self { in_desc, out_desc, inner, resample_offset: 0 })
    }

    pub fn in_desc(&self) -> AudioDesc {
        self.in_desc
    }

    pub fn out_desc(&self) -> AudioDesc {
        self.out_desc
    }

    pub fn resample_offset(&self) -> u64 {
        self.resample_offset
    }

    /// Converts `frames` frames of `data` (one slice per input channel,
    /// already de-interleaved by the caller) into planar f32 at the output
    /// rate/channel count. Returns the produced frame count.
    pub fn process(&mut self, data: &[&[u8]], frames: usize, out: &mut [Vec<f32>]) -> Result<usize> {
        let planar_in = self.to_planar_f32(data, frames);

        let out_frames = match &mut self.inner {
            None => {
                for (ch, plane) in out.iter_mut().enumerate() {
                    plane.clear();
                    if let Some(src) = planar_in.get(ch.min(planar_in.len().saturating_sub(1))) {
                        plane.extend_from_slice(src);
                    }
                }
                frames
            }
            Some(resampler) => {
                let produced = resampler
                    .process(&planar_in, None)
                    .context("sample-rate conversion failed")?;
                let produced_frames = produced.first().map(|p| p.len()).unwrap_or(0);
                for (ch, plane) in out.iter_mut().enumerate() {
                    plane.clear();
                    if let Some(src) = produced.get(ch) {
                        plane.extend_from_slice(src);
                    }
                }
                let expected = (frames as f64 * self.out_desc.sample_rate as f64
                    / self.in_desc.sample_rate as f64) as i64;
                let drift = produced_frames as i64 - expected;
                if drift > 0 {
                    self.resample_offset = self.resample_offset.saturating_add(drift as u64);
                }
                produced_frames
            }
        };

        Ok(out_frames)
    }

    fn to_planar_f32(&self, data: &[&[u8]], frames: usize) -> Vec<Vec<f32>> {
        data.iter()
            .map(|plane| match self.in_desc.format {
                SampleFormat::F32 => plane
                    .chunks_exact(4)
                    .take(frames)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
                SampleFormat::I16 => plane
                    .chunks_exact(2)
                    .take(frames)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
                    .collect(),
                SampleFormat::U8 => plane
                    .iter()
                    .take(frames)
                    .map(|&b| (b as f32 - 128.0) / 128.0)
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_rates_match() {
        let desc = AudioDesc::new(48_000, SampleFormat::F32, 1);
        let mut r = ChannelResampler::new(desc, desc).unwrap();
        let samples: Vec<f32> = vec![0.1, -0.2, 0.3, -0.4];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut out = vec![Vec::new()];
        let n = r.process(&[&bytes], samples.len(), &mut out).unwrap();
        assert_eq!(n, samples.len());
        assert_eq!(out[0], samples);
        assert_eq!(r.resample_offset(), 0);
    }

    #[test]
    fn rate_change_constructs_inner_resampler() {
        let in_desc = AudioDesc::new(44_100, SampleFormat::I16, 1);
        let out_desc = AudioDesc::new(48_000, SampleFormat::F32, 1);
        let r = ChannelResampler::new(in_desc, out_desc).unwrap();
        assert!(r.inner.is_some());
    }
}
