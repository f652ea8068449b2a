use std::f32::consts::PI;
use std::ops::Range;

use rustfft::{num_complex::Complex32, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::types::Channel;

/// Longest input fed to one transform; longer regions are truncated.
pub const MAX_TRANSFORM_SIZE: usize = 32_768;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WindowFunction {
    #[default]
    Rectangular,
    Hann,
    Hamming,
    Blackman,
}

impl WindowFunction {
    /// Symmetric weight of sample `i` out of `n`.
    pub fn weight(self, i: usize, n: usize) -> f32 {
        if n <= 1 {
            return 1.0;
        }
        let x = 2.0 * PI * i as f32 / (n - 1) as f32;
        match self {
            WindowFunction::Rectangular => 1.0,
            WindowFunction::Hann => 0.5 - 0.5 * x.cos(),
            WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
            WindowFunction::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpectralBin {
    pub index: usize,
    pub frequency_hz: f32,
    pub magnitude: f32,
}

/// Magnitude spectrum of one channel region.
#[derive(Clone, Debug)]
pub struct SpectralResult {
    pub sample_rate_hz: f32,
    pub transform_size: usize,
    pub bins: Vec<SpectralBin>,
}

impl SpectralResult {
    pub fn bin_width_hz(&self) -> f32 {
        self.sample_rate_hz / self.transform_size as f32
    }

    /// Frequency of the largest bin, DC excluded.
    pub fn dominant_frequency(&self) -> Option<f32> {
        self.bins
            .iter()
            .skip(1)
            .max_by(|a, b| a.magnitude.total_cmp(&b.magnitude))
            .map(|bin| bin.frequency_hz)
    }
}

/// Computes FFTs, reusing plans across calls.
pub struct SpectralEngine {
    planner: FftPlanner<f32>,
}

impl Default for SpectralEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectralEngine {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    /// Windows `samples`, zero-pads to the next power of two and returns
    /// the first half of the spectrum with magnitudes `|X[k]| / N`.
    pub fn transform(
        &mut self,
        samples: &[f32],
        window: WindowFunction,
        sample_rate_hz: f32,
    ) -> SpectralResult {
        let samples = &samples[..samples.len().min(MAX_TRANSFORM_SIZE)];
        if samples.is_empty() {
            return SpectralResult {
                sample_rate_hz,
                transform_size: 0,
                bins: Vec::new(),
            };
        }
        let fft_size = samples.len().next_power_of_two();
        let fft = self.planner.plan_fft_forward(fft_size);
        let mut buffer: Vec<Complex32> = samples
            .iter()
            .enumerate()
            .map(|(i, v)| Complex32::new(v * window.weight(i, samples.len()), 0.0))
            .collect();
        buffer.resize(fft_size, Complex32::ZERO);
        fft.process(&mut buffer);
        let bin_width = sample_rate_hz / fft_size as f32;
        let bins = buffer
            .iter()
            .take(fft_size / 2)
            .enumerate()
            .map(|(k, c)| SpectralBin {
                index: k,
                frequency_hz: k as f32 * bin_width,
                magnitude: c.norm() / fft_size as f32,
            })
            .collect();
        SpectralResult {
            sample_rate_hz,
            transform_size: fft_size,
            bins,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct CacheKey {
    generation: u64,
    channel: Channel,
    region: Range<usize>,
    window: WindowFunction,
}

/// Keeps the most recent spectrum so repeated requests on the same capture
/// do not recompute it.
#[derive(Default)]
pub struct SpectralCache {
    engine: SpectralEngine,
    last: Option<(CacheKey, SpectralResult)>,
}

impl SpectralCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cached(&self, generation: u64, channel: Channel) -> bool {
        matches!(&self.last, Some((key, _)) if key.generation == generation && key.channel == channel)
    }

    /// Returns the cached result for the key or computes it with `volts`.
    pub fn get_or_compute<F>(
        &mut self,
        generation: u64,
        channel: Channel,
        region: Range<usize>,
        window: WindowFunction,
        sample_rate_hz: f32,
        volts: F,
    ) -> SpectralResult
    where
        F: FnOnce() -> Vec<f32>,
    {
        let key = CacheKey {
            generation,
            channel,
            region,
            window,
        };
        if let Some((cached, result)) = &self.last {
            if *cached == key {
                return result.clone();
            }
        }
        let result = self.engine.transform(&volts(), window, sample_rate_hz);
        self.last = Some((key, result.clone()));
        result
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}
