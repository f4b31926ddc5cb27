//! Iteration state and the per-cycle diagnostics recorded while imaging.

use serde::{Deserialize, Serialize};

use crate::options::IterationOptions;

/// Progress and configuration of one imaging run.
///
/// Only [`IterationController`](crate::controller::IterationController)
/// mutates this; everyone else receives a shared reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationState {
    /// Total iteration budget of the run.
    pub niter: usize,
    /// Global stopping threshold on the peak residual.
    pub threshold: f32,
    /// Fraction of the peak removed per iteration.
    pub loop_gain: f32,
    /// Per-burst iteration cap; 0 means unlimited.
    pub max_cycle_niter: usize,
    /// Multiplier on the PSF sidelobe level when deriving the cycle threshold.
    pub cycle_factor: f32,
    /// Sidelobe-derived threshold of the current minor cycle.
    pub cycle_threshold: f32,
    /// Lower clamp on the PSF fraction.
    pub min_psf_fraction: f32,
    /// Upper clamp on the PSF fraction.
    pub max_psf_fraction: f32,

    /// Set once the run has ended, for whatever reason.
    pub stop: bool,
    /// Set when the peak residual reached `threshold`.
    pub converged: bool,
    /// The model changed since the last major cycle.
    pub updated_model: bool,
    /// Cumulative number of minor-cycle iterations.
    pub niter_done: usize,
    /// Peak residual of the latest measurement.
    pub peak_residual: f32,
    /// Total model flux of the latest measurement.
    pub model_flux: f32,
    /// Cumulative number of major cycles.
    pub nmajor_done: usize,
    /// Largest PSF sidelobe, floored when degenerate.
    pub psf_sidelobe: f32,

    /// One row per minor cycle per target.
    pub summary_minor: Vec<MinorSummaryRow>,
    /// `niter_done` at the end of every major cycle.
    pub summary_major: Vec<usize>,
}

impl IterationState {
    /// Fresh state for a new run.
    pub fn new(options: &IterationOptions) -> Self {
        Self {
            niter: options.niter,
            threshold: options.threshold,
            loop_gain: options.loop_gain,
            max_cycle_niter: options.max_cycle_niter,
            cycle_factor: options.cycle_factor,
            cycle_threshold: options.cycle_threshold,
            min_psf_fraction: options.min_psf_fraction,
            max_psf_fraction: options.max_psf_fraction,
            stop: false,
            converged: false,
            updated_model: false,
            niter_done: 0,
            peak_residual: 0.0,
            model_flux: 0.0,
            nmajor_done: 0,
            psf_sidelobe: 0.0,
            summary_minor: Vec::new(),
            summary_major: Vec::new(),
        }
    }
}

impl Default for IterationState {
    fn default() -> Self {
        Self::new(&IterationOptions::default())
    }
}

/// One row of the minor-cycle history.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinorSummaryRow {
    /// Cumulative iteration count when the row was recorded.
    pub niter_done: usize,
    /// Peak residual at the end of the burst.
    pub peak_residual: f32,
    /// Model flux at the end of the burst.
    pub model_flux: f32,
    /// Which deconvolution target (field, facet) produced the row.
    pub mapper_id: usize,
    /// Effective cycle threshold in force when the row was recorded.
    pub cycle_threshold: f32,
}

/// Image-domain measurements taken after a major cycle.
///
/// These are the only inputs from which a cycle threshold is derived, so
/// they travel together as one value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleMeasurement {
    /// Largest absolute residual of Taylor term 0.
    pub peak_residual: f32,
    /// Sum of the Taylor-term-0 model.
    pub model_flux: f32,
    /// PSF sidelobe level after flooring.
    pub psf_sidelobe: f32,
}

impl CycleMeasurement {
    /// Combines measurements of two deconvolution targets: the worst peak and
    /// sidelobe win, model fluxes add up.
    pub fn merge(self, other: CycleMeasurement) -> CycleMeasurement {
        CycleMeasurement {
            peak_residual: self.peak_residual.max(other.peak_residual),
            model_flux: self.model_flux + other.model_flux,
            psf_sidelobe: self.psf_sidelobe.max(other.psf_sidelobe),
        }
    }
}
