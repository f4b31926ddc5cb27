//! Configuration for the major/minor cycle iteration controller.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::Record;

/// Stopping and loop-gain parameters for one imaging run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationOptions {
    /// Total minor-cycle iteration budget across the whole run.
    pub niter: usize,
    /// Absolute stopping flux; the run converges once the peak residual reaches it.
    pub threshold: f32,
    /// Fraction of the peak removed per minor-cycle iteration, in (0, 1].
    pub loop_gain: f32,
    /// Per-major-cycle iteration cap; 0 means unlimited.
    pub max_cycle_niter: usize,
    /// Multiplier on the PSF sidelobe level used to derive the cycle threshold.
    pub cycle_factor: f32,
    /// Lower bound on the derived PSF fraction.
    pub min_psf_fraction: f32,
    /// Upper bound on the derived PSF fraction.
    pub max_psf_fraction: f32,
    /// Initial cycle threshold, usually overwritten after the first major cycle.
    pub cycle_threshold: f32,
}

impl Default for IterationOptions {
    fn default() -> Self {
        Self {
            niter: 0,
            threshold: 0.0,
            loop_gain: 0.1,
            max_cycle_niter: 0,
            cycle_factor: 1.0,
            min_psf_fraction: 0.05,
            max_psf_fraction: 0.8,
            cycle_threshold: 0.0,
        }
    }
}

impl IterationOptions {
    /// Reads options from a control record, keeping defaults for absent keys.
    ///
    /// Recognised keys are `niter`, `threshold`, `loopgain`, `cycleniter`,
    /// `cyclefactor`, `minpsffraction`, `maxpsffraction` and `cyclethreshold`.
    pub fn from_record(record: &Record) -> Result<Self> {
        let mut options = Self::default();
        if let Some(niter) = record.get_count("niter")? {
            options.niter = niter;
        }
        if let Some(threshold) = record.get_float("threshold")? {
            options.threshold = threshold as f32;
        }
        if let Some(gain) = record.get_float("loopgain")? {
            options.loop_gain = gain as f32;
        }
        if let Some(cycle_niter) = record.get_count("cycleniter")? {
            options.max_cycle_niter = cycle_niter;
        }
        if let Some(factor) = record.get_float("cyclefactor")? {
            options.cycle_factor = factor as f32;
        }
        if let Some(fraction) = record.get_float("minpsffraction")? {
            options.min_psf_fraction = fraction as f32;
        }
        if let Some(fraction) = record.get_float("maxpsffraction")? {
            options.max_psf_fraction = fraction as f32;
        }
        if let Some(cycle_threshold) = record.get_float("cyclethreshold")? {
            options.cycle_threshold = cycle_threshold as f32;
        }
        Ok(options)
    }

    /// Set the total iteration budget.
    pub fn with_niter(mut self, niter: usize) -> Self {
        self.niter = niter;
        self
    }

    /// Set the absolute stopping threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the loop gain.
    pub fn with_loop_gain(mut self, loop_gain: f32) -> Self {
        self.loop_gain = loop_gain;
        self
    }

    /// Cap the number of iterations in a single minor cycle (0 disables the cap).
    pub fn with_max_cycle_niter(mut self, max_cycle_niter: usize) -> Self {
        self.max_cycle_niter = max_cycle_niter;
        self
    }

    /// Set the multiplier applied to the PSF sidelobe level.
    pub fn with_cycle_factor(mut self, cycle_factor: f32) -> Self {
        self.cycle_factor = cycle_factor;
        self
    }

    /// Bound the derived PSF fraction to `[min, max]`.
    pub fn with_psf_fraction_bounds(mut self, min: f32, max: f32) -> Self {
        self.min_psf_fraction = min;
        self.max_psf_fraction = max;
        self
    }
}
