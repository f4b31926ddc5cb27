//! Multi-term multi-frequency CLEAN restricted to point components.
//!
//! The sky is modelled per pixel as a Taylor polynomial in frequency, one
//! model image per coefficient. For `n` terms the gridder provides `n`
//! Taylor-weighted residuals `r_t` and `2n - 1` spectral PSFs `P_k`, related
//! by `r_t = sum_j P_{t+j} * m_j`. Each iteration solves the `n x n` system
//! `H x = r(p)` with `H_ij = P_{i+j}(0)` at every pixel `p`, takes the pixel
//! whose solution reduces chi-squared the most (`x . r` largest), and
//! subtracts the matching combination of PSFs from all residual terms.

use log::{debug, trace};
use nalgebra::{Cholesky, DMatrix, DVector};

use crate::algorithm::{DeconvolutionAlgorithm, MinorCycleReport};
use crate::controller::MinorCycleBurst;
use crate::error::{Result, SynthesisError};
use crate::hogbom::{psf_centre, subtract_psf};
use crate::image::{ImagePlane, ImageStore};
use crate::restore::restore_images;

#[derive(Clone, Debug)]
pub struct MultiTermClean {
    n_taylor_terms: usize,
}

impl MultiTermClean {
    pub fn new(n_taylor_terms: usize) -> Self {
        Self { n_taylor_terms }
    }
}

impl DeconvolutionAlgorithm for MultiTermClean {
    fn algorithm_name(&self) -> &'static str {
        "msmfs"
    }

    fn n_taylor_terms(&self) -> usize {
        self.n_taylor_terms
    }

    fn deconvolve(
        &mut self,
        burst: &mut MinorCycleBurst<'_>,
        store: &mut dyn ImageStore,
        id: usize,
    ) -> Result<MinorCycleReport> {
        let n = self.n_taylor_terms;
        let images = store.images()?;
        let stored_terms = images.kind().n_taylor_terms();
        if stored_terms != n {
            return Err(SynthesisError::dimension_mismatch(
                "Taylor terms",
                n,
                stored_terms,
            ));
        }
        let (residuals, psfs, models) = images.deconvolution_planes();

        let centre = psf_centre(&psfs[0]);
        let hessian = DMatrix::<f64>::from_fn(n, n, |i, j| psfs[i + j][centre] as f64);
        let inverse = Cholesky::new(hessian)
            .ok_or_else(|| SynthesisError::singular("Taylor-term Hessian"))?
            .inverse();

        let gain = burst.loop_gain();
        let mut iterations = 0;
        let mut peak = residuals[0].amax();
        while !burst.check_minor_stop(iterations + 1, peak) {
            let (position, solution) = best_component(residuals, &inverse)?;
            for (term, model) in models.iter_mut().enumerate() {
                model[position] += gain * solution[term] as f32;
            }
            for (t, residual) in residuals.iter_mut().enumerate() {
                for (j, coefficient) in solution.iter().enumerate() {
                    let amplitude = gain * *coefficient as f32;
                    subtract_psf(residual, &psfs[t + j], centre, position, amplitude);
                }
            }
            iterations += 1;
            burst.increment_minor_cycle_count();

            peak = residuals[0].amax();
            if !peak.is_finite() {
                return Err(SynthesisError::NumericalError {
                    context: "multi-term residual update",
                });
            }
            trace!("[{id}] iteration {iterations}: component at {position:?}, peak now {peak:e}");
        }

        let model_flux = models[0].sum();
        burst.add_summary_minor(id, model_flux, peak);
        debug!(
            "[{id}] MS-MFS ({n} terms) ran {iterations} iterations; peak residual {peak:e}, model flux {model_flux:e}"
        );
        Ok(MinorCycleReport {
            iterations,
            peak_residual: peak,
            model_flux,
        })
    }

    fn restore(&mut self, store: &mut dyn ImageStore) -> Result<()> {
        restore_images(store)
    }
}

/// Pixel with the largest chi-squared reduction and its Taylor coefficients.
fn best_component(
    residuals: &[ImagePlane],
    inverse: &DMatrix<f64>,
) -> Result<((usize, usize), DVector<f64>)> {
    let n = residuals.len();
    let (nx, ny) = residuals[0].shape();
    let mut best_position = (0, 0);
    let mut best_score = f64::NEG_INFINITY;
    let mut rhs = DVector::<f64>::zeros(n);
    for y in 0..ny {
        for x in 0..nx {
            for (t, residual) in residuals.iter().enumerate() {
                rhs[t] = residual[(x, y)] as f64;
            }
            let score = (inverse * &rhs).dot(&rhs);
            if score > best_score {
                best_score = score;
                best_position = (x, y);
            }
        }
    }
    if !best_score.is_finite() {
        return Err(SynthesisError::NumericalError {
            context: "multi-term peak search",
        });
    }
    let rhs = DVector::from_fn(n, |t, _| residuals[t][best_position] as f64);
    Ok((best_position, inverse * rhs))
}
