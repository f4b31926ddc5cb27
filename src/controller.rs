//! Convergence and stopping decisions for the major/minor cycle loop.
//!
//! [`IterationController`] is the single writer of [`IterationState`]. It
//! derives the cycle threshold from the PSF sidelobe level after every major
//! cycle, decides when a minor cycle must hand back to a major cycle, and
//! decides when the whole run stops.
//!
//! Deconvolution kernels never see the controller itself. They receive a
//! [`MinorCycleBurst`], which exclusively borrows the controller for the
//! duration of one minor cycle and exposes only the polling and bookkeeping
//! operations. The interactive `change_*` operations therefore cannot be
//! reached while a burst is in progress.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthesisError};
use crate::options::IterationOptions;
use crate::record::Record;
use crate::state::{CycleMeasurement, IterationState, MinorSummaryRow};

/// Owns the iteration state of one imaging run.
#[derive(Clone, Debug)]
pub struct IterationController {
    state: IterationState,
}

impl IterationController {
    /// Creates a controller after validating the loop gain and thresholds.
    pub fn new(options: IterationOptions) -> Result<Self> {
        validate_loop_gain(options.loop_gain)?;
        validate_flux("threshold", options.threshold)?;
        validate_flux("cyclethreshold", options.cycle_threshold)?;
        Ok(Self {
            state: IterationState::new(&options),
        })
    }

    /// Read-only view of the current state.
    pub fn state(&self) -> &IterationState {
        &self.state
    }

    /// Records the peak residual of the latest major cycle.
    pub fn set_peak_residual(&mut self, peak_residual: f32) {
        self.state.peak_residual = peak_residual;
    }

    /// Records the total model flux.
    pub fn set_model_flux(&mut self, model_flux: f32) {
        self.state.model_flux = model_flux;
    }

    /// Records the PSF sidelobe level used by the next threshold derivation.
    pub fn set_psf_sidelobe(&mut self, psf_sidelobe: f32) {
        self.state.psf_sidelobe = psf_sidelobe;
    }

    /// Stores the measurement of the latest major cycle and derives the cycle
    /// threshold from it.
    ///
    /// `psffraction = clamp(psf_sidelobe * cycle_factor, min, max)` and
    /// `cycle_threshold = peak_residual * psffraction`. The raw cycle
    /// threshold is returned; see [`cycle_threshold`](Self::cycle_threshold)
    /// for the value that gates the minor cycle.
    pub fn calculate_cycle_threshold(&mut self, measurement: &CycleMeasurement) -> f32 {
        self.set_peak_residual(measurement.peak_residual);
        self.set_model_flux(measurement.model_flux);
        self.set_psf_sidelobe(measurement.psf_sidelobe);

        let state = &mut self.state;
        // Applied as max-then-min so that inverted bounds cannot panic.
        let psf_fraction = (state.psf_sidelobe * state.cycle_factor)
            .max(state.min_psf_fraction)
            .min(state.max_psf_fraction);
        state.cycle_threshold = state.peak_residual * psf_fraction;

        info!(
            "Peak residual {:e}, PSF sidelobe {:.4} -> PSF fraction {:.4}, cycle threshold {:e}",
            state.peak_residual, state.psf_sidelobe, psf_fraction, state.cycle_threshold
        );
        state.cycle_threshold
    }

    /// Effective threshold of the minor cycle: the higher of the user's
    /// threshold and the sidelobe-derived cycle threshold.
    pub fn cycle_threshold(&self) -> f32 {
        self.state.threshold.max(self.state.cycle_threshold)
    }

    /// Whether the minor cycle must stop before performing another iteration.
    pub fn check_minor_stop(&self, iters_so_far: usize, current_peak_residual: f32) -> bool {
        minor_stop(
            &self.state,
            self.cycle_threshold(),
            self.state.max_cycle_niter,
            iters_so_far,
            current_peak_residual,
        )
    }

    /// Updates the global `stop` and `converged` flags and returns `stop`.
    pub fn check_stop(&mut self) -> bool {
        let state = &mut self.state;
        let reached_threshold = state.peak_residual <= state.threshold;
        let exhausted = state.niter_done >= state.niter;
        state.converged = reached_threshold;
        state.stop = reached_threshold || exhausted;

        if reached_threshold {
            info!(
                "Reached global stopping threshold {:e} (peak residual {:e})",
                state.threshold, state.peak_residual
            );
        } else if exhausted {
            info!(
                "Reached niter limit: {} of {} iterations done",
                state.niter_done, state.niter
            );
        }
        state.stop
    }

    /// Ends the run without touching `converged`, for a driver that cannot
    /// make further progress.
    pub fn force_stop(&mut self) {
        self.state.stop = true;
    }

    /// Counts one completed major cycle.
    pub fn increment_major_cycle_count(&mut self) {
        self.state.nmajor_done += 1;
        self.state.updated_model = false;
    }

    /// Counts one completed minor-cycle iteration.
    pub fn increment_minor_cycle_count(&mut self) {
        self.state.niter_done += 1;
        self.state.updated_model = true;
    }

    /// Appends a row to the minor-cycle history, capturing the current
    /// iteration count and effective cycle threshold.
    pub fn add_summary_minor(&mut self, mapper_id: usize, model_flux: f32, peak_residual: f32) {
        let cycle_threshold = self.cycle_threshold();
        self.push_summary_minor(mapper_id, model_flux, peak_residual, cycle_threshold);
    }

    fn push_summary_minor(
        &mut self,
        mapper_id: usize,
        model_flux: f32,
        peak_residual: f32,
        cycle_threshold: f32,
    ) {
        self.state.summary_minor.push(MinorSummaryRow {
            niter_done: self.state.niter_done,
            peak_residual,
            model_flux,
            mapper_id,
            cycle_threshold,
        });
    }

    /// Appends the current iteration count to the major-cycle history.
    pub fn add_summary_major(&mut self) {
        self.state.summary_major.push(self.state.niter_done);
    }

    /// Iterations left before niter is reached.
    pub fn remaining_niter(&self) -> usize {
        self.state.niter.saturating_sub(self.state.niter_done)
    }

    /// Minor-cycle iterations done so far, across all cycles.
    pub fn completed_niter(&self) -> usize {
        self.state.niter_done
    }

    /// Per-burst iteration cap; 0 means unlimited.
    pub fn max_cycle_niter(&self) -> usize {
        self.state.max_cycle_niter
    }

    /// Fraction of the peak removed per iteration.
    pub fn loop_gain(&self) -> f32 {
        self.state.loop_gain
    }

    /// Sets the global stopping threshold. Rejects negative or non-finite values.
    pub fn change_threshold(&mut self, threshold: f32) -> Result<()> {
        validate_flux("threshold", threshold)?;
        info!(
            "Changing threshold from {:e} to {:e}",
            self.state.threshold, threshold
        );
        self.state.threshold = threshold;
        Ok(())
    }

    /// Sets the total iteration budget. A value below the iterations already
    /// done is accepted and ends the run at the next stop check.
    pub fn change_niter(&mut self, niter: usize) {
        info!("Changing niter from {} to {}", self.state.niter, niter);
        if niter < self.state.niter_done {
            warn!(
                "New niter {} is below the {} iterations already done; the run will stop",
                niter, self.state.niter_done
            );
        }
        self.state.niter = niter;
    }

    /// Sets the per-burst iteration cap; 0 lifts it.
    pub fn change_max_cycle_niter(&mut self, max_cycle_niter: usize) {
        info!(
            "Changing cycleniter from {} to {}",
            self.state.max_cycle_niter, max_cycle_niter
        );
        self.state.max_cycle_niter = max_cycle_niter;
    }

    /// Sets the loop gain, which must lie in (0, 1].
    pub fn change_loop_gain(&mut self, loop_gain: f32) -> Result<()> {
        validate_loop_gain(loop_gain)?;
        info!(
            "Changing loop gain from {} to {}",
            self.state.loop_gain, loop_gain
        );
        self.state.loop_gain = loop_gain;
        Ok(())
    }

    /// Overrides the derived cycle threshold until the next major cycle.
    pub fn change_cycle_threshold(&mut self, cycle_threshold: f32) -> Result<()> {
        validate_flux("cyclethreshold", cycle_threshold)?;
        info!(
            "Changing cycle threshold from {:e} to {:e}",
            self.state.cycle_threshold, cycle_threshold
        );
        self.state.cycle_threshold = cycle_threshold;
        Ok(())
    }

    /// Snapshot of the parameters a minor cycle runs with.
    pub fn minor_cycle_controls(&self) -> MinorCycleControls {
        MinorCycleControls {
            cycle_threshold: self.cycle_threshold(),
            loop_gain: self.state.loop_gain,
            max_cycle_niter: self.state.max_cycle_niter,
            remaining_niter: self.remaining_niter(),
        }
    }

    /// Starts a minor cycle. The controller is borrowed until the burst is dropped.
    ///
    /// The burst never gates below the global threshold, whatever cycle
    /// threshold the controls carry.
    pub fn begin_minor_cycle(&mut self, controls: &MinorCycleControls) -> MinorCycleBurst<'_> {
        let mut controls = *controls;
        controls.cycle_threshold = controls.cycle_threshold.max(self.state.threshold);
        debug!(
            "Starting minor cycle: cycle threshold {:e}, loop gain {}, cycleniter {}, {} iterations left",
            controls.cycle_threshold,
            controls.loop_gain,
            controls.max_cycle_niter,
            controls.remaining_niter
        );
        MinorCycleBurst {
            controller: self,
            controls,
            iterations: 0,
        }
    }

    /// Serializable summary of the run so far.
    pub fn report(&self) -> IterationReport {
        IterationReport {
            stop: self.state.stop,
            converged: self.state.converged,
            niter: self.state.niter,
            niter_done: self.state.niter_done,
            nmajor_done: self.state.nmajor_done,
            peak_residual: self.state.peak_residual,
            model_flux: self.state.model_flux,
            cycle_threshold: self.cycle_threshold(),
            summary_minor: self.state.summary_minor.clone(),
            summary_major: self.state.summary_major.clone(),
        }
    }
}

fn minor_stop(
    state: &IterationState,
    cycle_threshold: f32,
    max_cycle_niter: usize,
    iters_so_far: usize,
    peak_residual: f32,
) -> bool {
    peak_residual < cycle_threshold
        || state.niter_done >= state.niter
        || (max_cycle_niter > 0 && iters_so_far > max_cycle_niter)
}

fn validate_loop_gain(loop_gain: f32) -> Result<()> {
    if loop_gain > 0.0 && loop_gain <= 1.0 {
        Ok(())
    } else {
        Err(SynthesisError::InvalidParameter {
            name: "loopgain",
            value: loop_gain.into(),
            reason: "must lie in (0, 1]",
        })
    }
}

fn validate_flux(name: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SynthesisError::InvalidParameter {
            name,
            value: value.into(),
            reason: "must be finite and non-negative",
        })
    }
}

/// Parameters handed to one minor cycle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinorCycleControls {
    /// Effective threshold at which the burst returns to the major cycle.
    pub cycle_threshold: f32,
    /// Fraction of the peak removed per iteration, in (0, 1].
    pub loop_gain: f32,
    /// 0 means unlimited.
    pub max_cycle_niter: usize,
    /// Informational; the live count is read from the controller.
    pub remaining_niter: usize,
}

impl MinorCycleControls {
    /// Reads controls from a record; `cyclethreshold` is required.
    ///
    /// The loop gain and cycle threshold are checked the same way the
    /// controller checks them.
    pub fn from_record(record: &Record) -> Result<Self> {
        let cycle_threshold = record
            .get_float("cyclethreshold")?
            .ok_or_else(|| SynthesisError::missing_field("cyclethreshold"))?
            as f32;
        validate_flux("cyclethreshold", cycle_threshold)?;
        let loop_gain = record.get_float("loopgain")?.unwrap_or(0.1) as f32;
        validate_loop_gain(loop_gain)?;
        Ok(Self {
            cycle_threshold,
            loop_gain,
            max_cycle_niter: record.get_count("cycleniter")?.unwrap_or(0),
            remaining_niter: record.get_count("niter")?.unwrap_or(0),
        })
    }

    /// Writes the controls under the same keys `from_record` reads.
    pub fn to_record(&self) -> Record {
        Record::new()
            .with("cyclethreshold", self.cycle_threshold)
            .with("loopgain", self.loop_gain)
            .with("cycleniter", self.max_cycle_niter)
            .with("niter", self.remaining_niter)
    }
}

/// Exclusive handle on the controller for the duration of one minor cycle.
#[derive(Debug)]
pub struct MinorCycleBurst<'a> {
    controller: &'a mut IterationController,
    controls: MinorCycleControls,
    iterations: usize,
}

impl MinorCycleBurst<'_> {
    /// Loop gain of this burst.
    pub fn loop_gain(&self) -> f32 {
        self.controls.loop_gain
    }

    /// Threshold this burst gates on: the cycle threshold of its controls,
    /// raised to the global threshold if it was lower.
    pub fn cycle_threshold(&self) -> f32 {
        self.controls.cycle_threshold
    }

    /// Iterations performed in this burst so far.
    pub fn iterations_done(&self) -> usize {
        self.iterations
    }

    /// Same rule as [`IterationController::check_minor_stop`], gated on the
    /// controls this burst was opened with.
    pub fn check_minor_stop(&self, iters_so_far: usize, current_peak_residual: f32) -> bool {
        minor_stop(
            &self.controller.state,
            self.controls.cycle_threshold,
            self.controls.max_cycle_niter,
            iters_so_far,
            current_peak_residual,
        )
    }

    /// Counts one iteration of this burst against the run's budget.
    pub fn increment_minor_cycle_count(&mut self) {
        self.iterations += 1;
        self.controller.increment_minor_cycle_count();
    }

    /// Appends a summary row stamped with this burst's threshold.
    pub fn add_summary_minor(&mut self, mapper_id: usize, model_flux: f32, peak_residual: f32) {
        let cycle_threshold = self.controls.cycle_threshold;
        self.controller
            .push_summary_minor(mapper_id, model_flux, peak_residual, cycle_threshold);
    }

    /// Cumulative iteration count of the run.
    pub fn niter_done(&self) -> usize {
        self.controller.state.niter_done
    }
}

/// Outcome of one minor cycle, handed back to the run driver.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Peak residual after the burst.
    pub peak_residual: f32,
    /// Model flux after the burst.
    pub model_flux: f32,
    /// Threshold the burst actually gated on.
    pub cycle_threshold: f32,
    /// Iterations performed during this minor cycle.
    pub iterations: usize,
    /// Cumulative iterations of the run.
    pub niter_done: usize,
}

impl CycleRecord {
    /// Writes `peakresidual`, `modelflux`, `cyclethreshold`, `iterdone` and `niterdone`.
    pub fn to_record(&self) -> Record {
        Record::new()
            .with("peakresidual", self.peak_residual)
            .with("modelflux", self.model_flux)
            .with("cyclethreshold", self.cycle_threshold)
            .with("iterdone", self.iterations)
            .with("niterdone", self.niter_done)
    }
}

/// End-of-run view of the iteration state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    pub stop: bool,
    pub converged: bool,
    /// Iteration budget at the end of the run, after any interactive change.
    pub niter: usize,
    pub niter_done: usize,
    pub nmajor_done: usize,
    pub peak_residual: f32,
    pub model_flux: f32,
    /// Effective cycle threshold at the end of the run.
    pub cycle_threshold: f32,
    /// Minor-cycle history, one row per burst per target.
    pub summary_minor: Vec<MinorSummaryRow>,
    /// Cumulative iterations at the end of each major cycle.
    pub summary_major: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn controller(niter: usize, threshold: f32) -> IterationController {
        IterationController::new(
            IterationOptions::default()
                .with_niter(niter)
                .with_threshold(threshold),
        )
        .unwrap()
    }

    fn run_iterations(controller: &mut IterationController, n: usize) {
        for _ in 0..n {
            controller.increment_minor_cycle_count();
        }
    }

    #[test]
    fn keeps_going_above_threshold_with_budget_left() {
        let mut c = controller(100, 0.01);
        c.set_peak_residual(0.5);
        assert!(!c.check_stop());
        assert!(!c.state().converged);
    }

    #[test]
    fn stops_without_converging_when_niter_is_exhausted() {
        let mut c = controller(100, 0.01);
        run_iterations(&mut c, 100);
        c.set_peak_residual(0.5);
        assert!(c.check_stop());
        assert!(!c.state().converged);
    }

    #[test]
    fn stops_and_converges_at_threshold() {
        let mut c = controller(100, 0.01);
        run_iterations(&mut c, 10);
        c.set_peak_residual(0.005);
        assert!(c.check_stop());
        assert!(c.state().converged);
    }

    #[test]
    fn converged_ignores_the_niter_condition() {
        let mut c = controller(5, 0.01);
        run_iterations(&mut c, 5);
        c.set_peak_residual(0.01);
        assert!(c.check_stop());
        assert!(c.state().converged);
    }

    #[test]
    fn stop_flags_follow_the_latest_check() {
        let mut c = controller(100, 0.01);
        c.set_peak_residual(0.005);
        assert!(c.check_stop());
        c.change_threshold(0.001).unwrap();
        assert!(!c.check_stop());
        assert!(!c.state().converged);
    }

    #[test]
    fn cycle_threshold_within_bounds() {
        let mut c = IterationController::new(
            IterationOptions::default()
                .with_cycle_factor(1.5)
                .with_psf_fraction_bounds(0.01, 0.2),
        )
        .unwrap();
        let measurement = CycleMeasurement {
            peak_residual: 2.0,
            model_flux: 0.0,
            psf_sidelobe: 0.05,
        };
        let cycle_threshold = c.calculate_cycle_threshold(&measurement);
        assert_relative_eq!(cycle_threshold, 0.15, epsilon = 1e-6);
        assert_relative_eq!(c.state().cycle_threshold, 0.15, epsilon = 1e-6);
        assert_eq!(c.state().peak_residual, 2.0);
        assert_eq!(c.state().psf_sidelobe, 0.05);
    }

    #[test]
    fn cycle_threshold_is_clamped_at_both_ends() {
        let options = IterationOptions::default().with_psf_fraction_bounds(0.01, 0.2);
        let mut c = IterationController::new(options).unwrap();

        for (sidelobe, factor, expected_fraction) in [
            (0.0, 1.0, 0.01),
            (0.001, 2.0, 0.01),
            (0.5, 1.0, 0.2),
            (0.3, 4.0, 0.2),
            (0.1, 1.0, 0.1),
        ] {
            c.state.cycle_factor = factor;
            let measurement = CycleMeasurement {
                peak_residual: 3.0,
                model_flux: 0.0,
                psf_sidelobe: sidelobe,
            };
            let cycle_threshold = c.calculate_cycle_threshold(&measurement);
            assert_relative_eq!(cycle_threshold, 3.0 * expected_fraction, epsilon = 1e-6);
            assert!(cycle_threshold >= 0.01 * 3.0 - 1e-6);
            assert!(cycle_threshold <= 0.2 * 3.0 + 1e-6);
        }
    }

    #[test]
    fn inverted_fraction_bounds_do_not_panic() {
        let options = IterationOptions::default().with_psf_fraction_bounds(0.5, 0.1);
        let mut c = IterationController::new(options).unwrap();
        let measurement = CycleMeasurement {
            peak_residual: 1.0,
            model_flux: 0.0,
            psf_sidelobe: 0.3,
        };
        assert_relative_eq!(c.calculate_cycle_threshold(&measurement), 0.1);
    }

    #[test]
    fn effective_threshold_is_the_larger_of_the_two() {
        let mut c = controller(100, 0.2);
        c.change_cycle_threshold(0.05).unwrap();
        assert_eq!(c.cycle_threshold(), 0.2);
        c.change_cycle_threshold(0.7).unwrap();
        assert_eq!(c.cycle_threshold(), 0.7);
        assert!(c.cycle_threshold() >= c.state().threshold);
        assert!(c.cycle_threshold() >= c.state().cycle_threshold);
    }

    #[test]
    fn minor_stop_conditions() {
        let mut c = controller(10, 0.1);
        c.change_cycle_threshold(0.3).unwrap();
        assert!(!c.check_minor_stop(1, 0.5));
        assert!(c.check_minor_stop(1, 0.29));

        c.change_max_cycle_niter(5);
        assert!(!c.check_minor_stop(5, 0.5));
        assert!(c.check_minor_stop(6, 0.5));

        run_iterations(&mut c, 10);
        assert!(c.check_minor_stop(1, 0.5));
    }

    #[test]
    fn force_stop_leaves_convergence_alone() {
        let mut c = controller(100, 0.01);
        c.set_peak_residual(0.5);
        assert!(!c.check_stop());
        c.force_stop();
        assert!(c.state().stop);
        assert!(!c.state().converged);
        assert!(c.report().stop);
    }

    #[test]
    fn counters_increase_by_exactly_one() {
        let mut c = controller(100, 0.0);
        for expected in 1..=7 {
            c.increment_minor_cycle_count();
            assert_eq!(c.completed_niter(), expected);
        }
        for expected in 1..=3 {
            c.increment_major_cycle_count();
            assert_eq!(c.state().nmajor_done, expected);
        }
        assert_eq!(c.remaining_niter(), 93);
    }

    #[test]
    fn updated_model_tracks_minor_then_major_cycles() {
        let mut c = controller(100, 0.0);
        assert!(!c.state().updated_model);
        c.increment_minor_cycle_count();
        assert!(c.state().updated_model);
        c.increment_major_cycle_count();
        assert!(!c.state().updated_model);
    }

    #[test]
    fn summaries_are_append_only() {
        let mut c = controller(100, 0.0);
        c.change_cycle_threshold(0.4).unwrap();
        c.increment_minor_cycle_count();
        c.add_summary_minor(0, 1.0, 0.9);
        let first = c.state().summary_minor[0];

        run_iterations(&mut c, 4);
        c.change_cycle_threshold(0.2).unwrap();
        c.add_summary_minor(1, 1.5, 0.3);
        c.add_summary_major();

        assert_eq!(c.state().summary_minor.len(), 2);
        assert_eq!(c.state().summary_minor[0], first);
        assert_eq!(first.niter_done, 1);
        assert_eq!(first.cycle_threshold, 0.4);
        assert_eq!(c.state().summary_minor[1].niter_done, 5);
        assert_eq!(c.state().summary_minor[1].mapper_id, 1);
        assert_eq!(c.state().summary_minor[1].cycle_threshold, 0.2);
        assert_eq!(c.state().summary_major, vec![5]);
    }

    #[test]
    fn change_operations_validate_input() {
        let mut c = controller(100, 0.0);
        assert!(c.change_loop_gain(0.0).is_err());
        assert!(c.change_loop_gain(1.5).is_err());
        c.change_loop_gain(1.0).unwrap();
        assert_eq!(c.loop_gain(), 1.0);
        assert!(c.change_threshold(-1.0).is_err());
        assert!(c.change_cycle_threshold(f32::NAN).is_err());
        c.change_niter(3);
        assert_eq!(c.state().niter, 3);
    }

    #[test]
    fn constructor_rejects_invalid_gain() {
        let result = IterationController::new(IterationOptions::default().with_loop_gain(0.0));
        assert!(matches!(
            result,
            Err(SynthesisError::InvalidParameter {
                name: "loopgain",
                ..
            })
        ));
    }

    #[test]
    fn burst_gates_on_its_controls_and_counts_iterations() {
        let mut c = IterationController::new(
            IterationOptions::default()
                .with_niter(3)
                .with_max_cycle_niter(10),
        )
        .unwrap();
        c.change_cycle_threshold(0.25).unwrap();
        let controls = c.minor_cycle_controls();
        assert_eq!(controls.cycle_threshold, 0.25);
        assert_eq!(controls.remaining_niter, 3);

        let mut burst = c.begin_minor_cycle(&controls);
        assert!(!burst.check_minor_stop(1, 0.3));
        assert!(burst.check_minor_stop(1, 0.2));
        burst.increment_minor_cycle_count();
        burst.increment_minor_cycle_count();
        assert!(!burst.check_minor_stop(3, 0.3));
        burst.increment_minor_cycle_count();
        assert!(burst.check_minor_stop(4, 0.3));
        assert_eq!(burst.iterations_done(), 3);
        burst.add_summary_minor(0, 0.7, 0.3);
        drop(burst);

        assert_eq!(c.completed_niter(), 3);
        assert_eq!(c.state().summary_minor.len(), 1);
        assert_eq!(c.state().summary_minor[0].niter_done, 3);
    }

    #[test]
    fn burst_never_gates_below_the_global_threshold() {
        let mut c = controller(1000, 0.5);
        let controls = MinorCycleControls::from_record(
            &Record::new().with("cyclethreshold", 0.0).with("loopgain", 0.1),
        )
        .unwrap();

        let mut burst = c.begin_minor_cycle(&controls);
        assert_eq!(burst.cycle_threshold(), 0.5);
        assert!(!burst.check_minor_stop(1, 0.6));
        assert!(burst.check_minor_stop(1, 0.45));
        burst.increment_minor_cycle_count();
        burst.add_summary_minor(0, 0.1, 0.45);
        drop(burst);

        assert_eq!(c.state().summary_minor[0].cycle_threshold, 0.5);
    }

    #[test]
    fn burst_summary_rows_use_the_burst_threshold() {
        let mut c = controller(100, 0.1);
        let controls = MinorCycleControls {
            cycle_threshold: 0.3,
            loop_gain: 0.1,
            max_cycle_niter: 0,
            remaining_niter: 100,
        };
        let mut burst = c.begin_minor_cycle(&controls);
        burst.add_summary_minor(2, 0.0, 0.35);
        drop(burst);

        let row = c.state().summary_minor[0];
        assert_eq!(row.cycle_threshold, 0.3);
        assert_eq!(row.mapper_id, 2);
    }

    #[test]
    fn controls_from_records_are_validated() {
        for gain in [0.0, -0.2, 1.5] {
            let result = MinorCycleControls::from_record(
                &Record::new().with("cyclethreshold", 0.1).with("loopgain", gain),
            );
            assert!(matches!(
                result,
                Err(SynthesisError::InvalidParameter {
                    name: "loopgain",
                    ..
                })
            ));
        }

        let negative = MinorCycleControls::from_record(&Record::new().with("cyclethreshold", -0.1));
        assert!(matches!(
            negative,
            Err(SynthesisError::InvalidParameter {
                name: "cyclethreshold",
                ..
            })
        ));
    }

    #[test]
    fn controls_round_trip_through_records() {
        let controls = MinorCycleControls {
            cycle_threshold: 0.5,
            loop_gain: 0.2,
            max_cycle_niter: 50,
            remaining_niter: 400,
        };
        let back = MinorCycleControls::from_record(&controls.to_record()).unwrap();
        assert_eq!(back, controls);

        let missing = MinorCycleControls::from_record(&Record::new().with("loopgain", 0.1));
        assert!(matches!(
            missing,
            Err(SynthesisError::MissingField {
                field: "cyclethreshold"
            })
        ));
    }

    #[test]
    fn report_serializes_to_json() {
        let mut c = controller(10, 0.1);
        c.increment_minor_cycle_count();
        c.add_summary_minor(0, 1.0, 0.5);
        c.add_summary_major();
        let json = serde_json::to_value(c.report()).unwrap();
        assert_eq!(json["niter_done"], 1);
        assert_eq!(json["summary_major"], serde_json::json!([1]));
        assert_eq!(json["summary_minor"][0]["mapper_id"], 0);
    }
}
