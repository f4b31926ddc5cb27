//! Hogbom point-source CLEAN.

use log::{debug, trace};

use crate::algorithm::{DeconvolutionAlgorithm, MinorCycleReport};
use crate::controller::MinorCycleBurst;
use crate::error::{Result, SynthesisError};
use crate::image::{ImagePlane, ImageStore};
use crate::restore::restore_images;

/// Single-plane CLEAN: one delta component per iteration at the residual peak.
#[derive(Clone, Debug, Default)]
pub struct Hogbom;

impl Hogbom {
    pub fn new() -> Self {
        Self
    }
}

impl DeconvolutionAlgorithm for Hogbom {
    fn algorithm_name(&self) -> &'static str {
        "hogbom"
    }

    fn n_taylor_terms(&self) -> usize {
        1
    }

    fn deconvolve(
        &mut self,
        burst: &mut MinorCycleBurst<'_>,
        store: &mut dyn ImageStore,
        id: usize,
    ) -> Result<MinorCycleReport> {
        let images = store.images()?;
        let (residuals, psfs, models) = images.deconvolution_planes();
        let residual = &mut residuals[0];
        let model = &mut models[0];
        let psf = &psfs[0];

        let centre = psf_centre(psf);
        let psf_peak = psf[centre];
        if !(psf_peak.is_finite() && psf_peak > 0.0) {
            return Err(SynthesisError::NumericalError {
                context: "PSF normalisation",
            });
        }

        let gain = burst.loop_gain();
        let mut iterations = 0;
        let (mut position, mut peak) = find_peak(residual);
        while !burst.check_minor_stop(iterations + 1, peak.abs()) {
            let flux = gain * peak / psf_peak;
            model[position] += flux;
            subtract_psf(residual, psf, centre, position, flux);
            iterations += 1;
            burst.increment_minor_cycle_count();

            (position, peak) = find_peak(residual);
            if !peak.is_finite() {
                return Err(SynthesisError::NumericalError {
                    context: "Hogbom residual update",
                });
            }
            trace!(
                "[{id}] iteration {iterations}: component {flux:e} at {position:?}, peak now {peak:e}"
            );
        }

        let model_flux = model.sum();
        let peak_residual = peak.abs();
        burst.add_summary_minor(id, model_flux, peak_residual);
        debug!(
            "[{id}] Hogbom ran {iterations} iterations; peak residual {peak_residual:e}, model flux {model_flux:e}"
        );
        Ok(MinorCycleReport {
            iterations,
            peak_residual,
            model_flux,
        })
    }

    fn restore(&mut self, store: &mut dyn ImageStore) -> Result<()> {
        restore_images(store)
    }
}

/// Position and signed value of the largest-magnitude pixel.
pub(crate) fn find_peak(plane: &ImagePlane) -> ((usize, usize), f32) {
    let mut best = ((0, 0), 0.0_f32);
    for y in 0..plane.ncols() {
        for x in 0..plane.nrows() {
            let value = plane[(x, y)];
            if value.abs() > best.1.abs() {
                best = ((x, y), value);
            }
        }
    }
    best
}

/// Position of the (signed) maximum of a PSF.
pub(crate) fn psf_centre(psf: &ImagePlane) -> (usize, usize) {
    let mut best = ((0, 0), f32::NEG_INFINITY);
    for y in 0..psf.ncols() {
        for x in 0..psf.nrows() {
            if psf[(x, y)] > best.1 {
                best = ((x, y), psf[(x, y)]);
            }
        }
    }
    best.0
}

/// Subtracts `amplitude` times the PSF, re-centred from `centre` onto `at`,
/// over the region where the shifted PSF overlaps the image.
pub(crate) fn subtract_psf(
    image: &mut ImagePlane,
    psf: &ImagePlane,
    centre: (usize, usize),
    at: (usize, usize),
    amplitude: f32,
) {
    let (x_range, dx) = overlap(image.nrows(), psf.nrows(), centre.0, at.0);
    let (y_range, dy) = overlap(image.ncols(), psf.ncols(), centre.1, at.1);
    for y in y_range {
        let py = (y as isize + dy) as usize;
        for x in x_range.clone() {
            let px = (x as isize + dx) as usize;
            image[(x, y)] -= amplitude * psf[(px, py)];
        }
    }
}

/// Image index range covered by the shifted PSF along one axis, and the
/// offset from image to PSF index.
fn overlap(
    image_len: usize,
    psf_len: usize,
    centre: usize,
    at: usize,
) -> (std::ops::Range<usize>, isize) {
    let offset = centre as isize - at as isize;
    let start = (-offset).max(0) as usize;
    let end = (psf_len as isize - offset).clamp(0, image_len as isize) as usize;
    (start.min(end)..end, offset)
}
