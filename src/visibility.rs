//! Visibility buffers, the forward-only visibility source and a simulator.

use std::f64::consts::PI;

use log::{debug, info};
use nalgebra::Complex;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthesisError};

/// Speed of light. \[m/s\]
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// One chunk of visibility rows; every row is one baseline at one frequency.
#[derive(Clone, Debug, PartialEq)]
pub struct VisBuffer {
    uvw: Vec<[f64; 3]>,
    frequency_hz: Vec<f64>,
    data: Vec<Complex<f32>>,
    model: Vec<Complex<f32>>,
    weight: Vec<f32>,
}

impl VisBuffer {
    /// Builds a buffer with a zeroed model column. `uvw` is in metres.
    pub fn new(
        uvw: Vec<[f64; 3]>,
        frequency_hz: Vec<f64>,
        data: Vec<Complex<f32>>,
        weight: Vec<f32>,
    ) -> Result<Self> {
        let rows = uvw.len();
        for (context, len) in [
            ("visibility frequencies", frequency_hz.len()),
            ("visibility data", data.len()),
            ("visibility weights", weight.len()),
        ] {
            if len != rows {
                return Err(SynthesisError::dimension_mismatch(context, rows, len));
            }
        }
        if let Some(bad) = frequency_hz.iter().find(|f| !(f.is_finite() && **f > 0.0)) {
            return Err(SynthesisError::InvalidParameter {
                name: "frequency",
                value: *bad,
                reason: "must be positive",
            });
        }
        if let Some(bad) = weight.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
            return Err(SynthesisError::InvalidParameter {
                name: "weight",
                value: (*bad).into(),
                reason: "must be finite and non-negative",
            });
        }
        Ok(Self {
            model: vec![Complex::new(0.0, 0.0); rows],
            uvw,
            frequency_hz,
            data,
            weight,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.uvw.len()
    }

    pub fn uvw(&self) -> &[[f64; 3]] {
        &self.uvw
    }

    pub fn frequency_hz(&self) -> &[f64] {
        &self.frequency_hz
    }

    pub fn data(&self) -> &[Complex<f32>] {
        &self.data
    }

    pub fn model(&self) -> &[Complex<f32>] {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut [Complex<f32>] {
        &mut self.model
    }

    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    /// `(u, v)` of a row in wavelengths.
    pub fn uv_wavelengths(&self, row: usize) -> (f64, f64) {
        let scale = self.frequency_hz[row] / SPEED_OF_LIGHT;
        (self.uvw[row][0] * scale, self.uvw[row][1] * scale)
    }

    /// Observed minus model visibility of a row.
    pub fn residual(&self, row: usize) -> Complex<f32> {
        self.data[row] - self.model[row]
    }

    /// Zeroes the model column before a prediction pass.
    pub fn clear_model(&mut self) {
        self.model.fill(Complex::new(0.0, 0.0));
    }
}

/// Forward-only iteration over the selected visibility data.
pub trait VisibilitySource: Send {
    /// Rewinds to the first buffer. Fails if the data cannot be opened.
    fn origin(&mut self) -> Result<()>;

    /// The next buffer of the current pass, or `None` at the end.
    fn next_buffer(&mut self) -> Result<Option<&mut VisBuffer>>;
}

/// Visibility data held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryVisibilities {
    buffers: Vec<VisBuffer>,
    cursor: Option<usize>,
}

impl MemoryVisibilities {
    /// Wraps buffers that are already in memory.
    pub fn new(buffers: Vec<VisBuffer>) -> Self {
        Self {
            buffers,
            cursor: None,
        }
    }

    pub fn buffers(&self) -> &[VisBuffer] {
        &self.buffers
    }

    pub fn n_rows(&self) -> usize {
        self.buffers.iter().map(VisBuffer::n_rows).sum()
    }

    /// Observes point sources with random (Gaussian) uv coverage.
    pub fn simulate(config: &SimulationConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let mut buffers = Vec::with_capacity(config.n_buffers);
        for _ in 0..config.n_buffers {
            let rows = config.baselines_per_buffer * config.frequencies_hz.len();
            let mut uvw = Vec::with_capacity(rows);
            let mut frequency_hz = Vec::with_capacity(rows);
            let mut data = Vec::with_capacity(rows);
            for _ in 0..config.baselines_per_buffer {
                let u: f64 = StandardNormal.sample(&mut rng);
                let v: f64 = StandardNormal.sample(&mut rng);
                let baseline = [
                    u * config.baseline_sigma_m,
                    v * config.baseline_sigma_m,
                    0.0,
                ];
                for &frequency in &config.frequencies_hz {
                    let mut visibility = config.sky_visibility(baseline, frequency);
                    if config.noise_sigma > 0.0 {
                        let re: f32 = StandardNormal.sample(&mut rng);
                        let im: f32 = StandardNormal.sample(&mut rng);
                        visibility += Complex::new(re, im) * config.noise_sigma;
                    }
                    uvw.push(baseline);
                    frequency_hz.push(frequency);
                    data.push(visibility);
                }
            }
            buffers.push(VisBuffer::new(uvw, frequency_hz, data, vec![1.0; rows])?);
        }
        let simulated = Self::new(buffers);
        info!(
            "Simulated {} visibility rows for {} point source(s)",
            simulated.n_rows(),
            config.sources.len()
        );
        Ok(simulated)
    }
}

impl VisibilitySource for MemoryVisibilities {
    fn origin(&mut self) -> Result<()> {
        if self.buffers.is_empty() {
            return Err(SynthesisError::VisibilityUnavailable {
                reason: "no visibility data selected".to_string(),
            });
        }
        debug!("Rewinding {} visibility buffers", self.buffers.len());
        self.cursor = Some(0);
        Ok(())
    }

    fn next_buffer(&mut self) -> Result<Option<&mut VisBuffer>> {
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| SynthesisError::VisibilityUnavailable {
                reason: "iteration was not started with origin()".to_string(),
            })?;
        let index = *cursor;
        if index >= self.buffers.len() {
            return Ok(None);
        }
        *cursor += 1;
        Ok(self.buffers.get_mut(index))
    }
}

/// An unresolved source with a power-law spectrum.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointSource {
    /// Flux density at the reference frequency.
    pub flux: f32,
    /// Direction cosines relative to the phase centre. \[rad\]
    pub l: f64,
    pub m: f64,
    pub spectral_index: f64,
}

/// Settings of [`MemoryVisibilities::simulate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub n_buffers: usize,
    pub baselines_per_buffer: usize,
    /// Standard deviation of the u and v baseline coordinates. \[m\]
    pub baseline_sigma_m: f64,
    pub frequencies_hz: Vec<f64>,
    pub reference_freq_hz: f64,
    pub sources: Vec<PointSource>,
    /// Per-component standard deviation of added Gaussian noise.
    pub noise_sigma: f32,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            n_buffers: 4,
            baselines_per_buffer: 50,
            baseline_sigma_m: 100.0,
            frequencies_hz: vec![1.4e9],
            reference_freq_hz: 1.4e9,
            sources: Vec::new(),
            noise_sigma: 0.0,
            seed: 42,
        }
    }
}

impl SimulationConfig {
    /// Adds a point source to the simulated sky.
    pub fn with_source(mut self, source: PointSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Sets the channel frequencies and the reference frequency of the spectral model.
    pub fn with_frequencies(mut self, frequencies_hz: Vec<f64>, reference_freq_hz: f64) -> Self {
        self.frequencies_hz = frequencies_hz;
        self.reference_freq_hz = reference_freq_hz;
        self
    }

    /// Sets the number of buffers and the baselines in each.
    pub fn with_layout(mut self, n_buffers: usize, baselines_per_buffer: usize) -> Self {
        self.n_buffers = n_buffers;
        self.baselines_per_buffer = baselines_per_buffer;
        self
    }

    /// Standard deviation of the simulated baseline coordinates, in metres.
    pub fn with_baseline_sigma(mut self, baseline_sigma_m: f64) -> Self {
        self.baseline_sigma_m = baseline_sigma_m;
        self
    }

    /// Standard deviation of the Gaussian noise added to each component.
    pub fn with_noise(mut self, noise_sigma: f32) -> Self {
        self.noise_sigma = noise_sigma;
        self
    }

    /// Seed of the uv-coverage and noise generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.frequencies_hz.is_empty() {
            return Err(SynthesisError::dimension_mismatch("simulated frequencies", 1, 0));
        }
        if !(self.reference_freq_hz.is_finite() && self.reference_freq_hz > 0.0) {
            return Err(SynthesisError::InvalidParameter {
                name: "reference_freq_hz",
                value: self.reference_freq_hz,
                reason: "must be positive",
            });
        }
        if !(self.baseline_sigma_m.is_finite() && self.baseline_sigma_m > 0.0) {
            return Err(SynthesisError::InvalidParameter {
                name: "baseline_sigma_m",
                value: self.baseline_sigma_m,
                reason: "must be positive",
            });
        }
        if !(self.noise_sigma.is_finite() && self.noise_sigma >= 0.0) {
            return Err(SynthesisError::InvalidParameter {
                name: "noise_sigma",
                value: self.noise_sigma.into(),
                reason: "must be finite and non-negative",
            });
        }
        Ok(())
    }

    /// Noise-free visibility of the configured sky on one baseline.
    fn sky_visibility(&self, baseline_m: [f64; 3], frequency_hz: f64) -> Complex<f32> {
        let scale = frequency_hz / SPEED_OF_LIGHT;
        let (u, v) = (baseline_m[0] * scale, baseline_m[1] * scale);
        let mut sum = Complex::new(0.0_f64, 0.0);
        for source in &self.sources {
            let flux = source.flux as f64
                * (frequency_hz / self.reference_freq_hz).powf(source.spectral_index);
            let (sin, cos) = (-2.0 * PI * (u * source.l + v * source.m)).sin_cos();
            sum += Complex::new(flux * cos, flux * sin);
        }
        Complex::new(sum.re as f32, sum.im as f32)
    }
}
