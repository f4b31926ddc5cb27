//! The top-level major/minor cycle loop.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::controller::{IterationController, IterationReport};
use crate::deconvolver::DeconvolutionDispatcher;
use crate::error::{Result, SynthesisError};
use crate::imager::ImagingOrchestrator;
use crate::state::CycleMeasurement;

/// Outcome of a complete imaging run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Always set once `run` returns; a stalled run also sets it.
    pub stop: bool,
    /// Whether the peak residual reached the global threshold.
    pub converged: bool,
    /// Minor-cycle iterations over the whole run.
    pub niter_done: usize,
    /// Residual major cycles; the PSF pass is not counted.
    pub nmajor_done: usize,
    /// Peak residual after the last major cycle.
    pub peak_residual: f32,
    /// Model flux after the last major cycle.
    pub model_flux: f32,
    /// Full iteration history.
    pub report: IterationReport,
}

/// One imaging session: the imager, its deconvolution targets and the
/// iteration controller that arbitrates between them.
#[derive(Debug)]
pub struct ImagingRun {
    imager: ImagingOrchestrator,
    deconvolvers: Vec<DeconvolutionDispatcher>,
    controller: IterationController,
}

impl ImagingRun {
    /// Pairs an imager with the controller that will drive it.
    pub fn new(imager: ImagingOrchestrator, controller: IterationController) -> Self {
        Self {
            imager,
            deconvolvers: Vec::new(),
            controller,
        }
    }

    /// Adds a configured deconvolution target.
    pub fn add_deconvolver(&mut self, deconvolver: DeconvolutionDispatcher) {
        self.deconvolvers.push(deconvolver);
    }

    pub fn controller(&self) -> &IterationController {
        &self.controller
    }

    pub fn imager(&mut self) -> &mut ImagingOrchestrator {
        &mut self.imager
    }

    pub fn deconvolvers(&self) -> &[DeconvolutionDispatcher] {
        &self.deconvolvers
    }

    /// Runs to completion without interaction.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.run_with(|_| {})
    }

    /// Runs to completion, calling `between_cycles` before every minor cycle.
    ///
    /// The callback sees the controller after the cycle threshold has been
    /// derived and may change niter, thresholds, cycleniter or the loop gain.
    /// Shrinking niter or raising the threshold is how a run is cut short.
    pub fn run_with<F>(&mut self, mut between_cycles: F) -> Result<RunSummary>
    where
        F: FnMut(&mut IterationController),
    {
        if self.deconvolvers.is_empty() {
            return Err(SynthesisError::NoImageDefined);
        }

        self.imager.make_psf()?;
        self.residual_major_cycle()?;

        loop {
            let measurement = self.init_minor_cycles()?;
            self.controller.calculate_cycle_threshold(&measurement);
            if self.controller.check_stop() {
                break;
            }

            between_cycles(&mut self.controller);
            if self.controller.check_stop() {
                break;
            }

            let controls = self.controller.minor_cycle_controls();
            for deconvolver in &mut self.deconvolvers {
                deconvolver.execute_minor_cycle(&mut self.controller, &controls)?;
            }
            if !self.controller.state().updated_model {
                warn!("Minor cycle made no progress; stopping");
                self.controller.force_stop();
                break;
            }

            self.residual_major_cycle()?;
        }

        for deconvolver in &mut self.deconvolvers {
            deconvolver.restore()?;
        }

        let state = self.controller.state();
        info!(
            "Finished after {} iterations and {} major cycles: peak residual {:e}, model flux {:e}{}",
            state.niter_done,
            state.nmajor_done,
            state.peak_residual,
            state.model_flux,
            if state.converged { " (converged)" } else { "" }
        );
        Ok(RunSummary {
            stop: state.stop,
            converged: state.converged,
            niter_done: state.niter_done,
            nmajor_done: state.nmajor_done,
            peak_residual: state.peak_residual,
            model_flux: state.model_flux,
            report: self.controller.report(),
        })
    }

    fn residual_major_cycle(&mut self) -> Result<()> {
        self.imager.execute_major_cycle()?;
        self.controller.increment_major_cycle_count();
        self.controller.add_summary_major();
        Ok(())
    }

    /// Measures every target and merges the results.
    fn init_minor_cycles(&mut self) -> Result<CycleMeasurement> {
        let mut merged: Option<CycleMeasurement> = None;
        for deconvolver in &mut self.deconvolvers {
            let measurement = deconvolver.init_minor_cycle()?;
            merged = Some(match merged {
                Some(previous) => previous.merge(measurement),
                None => measurement,
            });
        }
        merged.ok_or(SynthesisError::NoImageDefined)
    }
}
