//! Clean-beam fitting and image restoration.

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthesisError};
use crate::hogbom::{psf_centre, subtract_psf};
use crate::image::{ImagePlane, ImageStore};

const FWHM_PER_SIGMA: f32 = 2.354_82;

/// Axis-aligned elliptical Gaussian fitted to the PSF main lobe.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CleanBeam {
    /// Full width at half maximum along x. \[pixels\]
    pub fwhm_x: f32,
    /// Full width at half maximum along y. \[pixels\]
    pub fwhm_y: f32,
}

impl CleanBeam {
    /// Measures the half-power widths of the main lobe through the PSF peak.
    pub fn fit(psf: &ImagePlane) -> Result<CleanBeam> {
        let centre = psf_centre(psf);
        let peak = psf[centre];
        if !(peak.is_finite() && peak > 0.0) {
            return Err(SynthesisError::NumericalError {
                context: "clean beam fit",
            });
        }
        let row: Vec<f32> = (0..psf.nrows()).map(|x| psf[(x, centre.1)] / peak).collect();
        let column: Vec<f32> = (0..psf.ncols()).map(|y| psf[(centre.0, y)] / peak).collect();
        let beam = CleanBeam {
            fwhm_x: 2.0 * half_width(&row, centre.0),
            fwhm_y: 2.0 * half_width(&column, centre.1),
        };
        if !(beam.fwhm_x > 0.0 && beam.fwhm_y > 0.0) {
            return Err(SynthesisError::NumericalError {
                context: "clean beam fit",
            });
        }
        Ok(beam)
    }

    /// Peak-normalised beam image with odd dimensions, centred.
    pub fn kernel(&self) -> ImagePlane {
        let sigma_x = self.fwhm_x / FWHM_PER_SIGMA;
        let sigma_y = self.fwhm_y / FWHM_PER_SIGMA;
        let half_x = (4.0 * sigma_x).ceil() as usize;
        let half_y = (4.0 * sigma_y).ceil() as usize;
        ImagePlane::from_fn(2 * half_x + 1, 2 * half_y + 1, |x, y| {
            let dx = x as f32 - half_x as f32;
            let dy = y as f32 - half_y as f32;
            (-0.5 * (dx * dx / (sigma_x * sigma_x) + dy * dy / (sigma_y * sigma_y))).exp()
        })
    }
}

/// Average distance from `centre` at which a unit-peak profile drops to one
/// half, interpolated linearly between samples.
fn half_width(profile: &[f32], centre: usize) -> f32 {
    let crossing = |step: isize| -> f32 {
        let mut previous = 1.0_f32;
        let mut distance = 0_usize;
        loop {
            let index = centre as isize + step * (distance as isize + 1);
            if index < 0 || index as usize >= profile.len() {
                // Main lobe runs off the image; use what we have.
                return distance as f32;
            }
            let value = profile[index as usize];
            if value <= 0.5 {
                return distance as f32 + (previous - 0.5) / (previous - value);
            }
            previous = value;
            distance += 1;
        }
    };
    0.5 * (crossing(-1) + crossing(1))
}

/// Adds `model` convolved with `kernel` to `image`.
fn add_convolved(image: &mut ImagePlane, model: &ImagePlane, kernel: &ImagePlane) {
    let centre = (kernel.nrows() / 2, kernel.ncols() / 2);
    for y in 0..model.ncols() {
        for x in 0..model.nrows() {
            let flux = model[(x, y)];
            if flux != 0.0 {
                subtract_psf(image, kernel, centre, (x, y), -flux);
            }
        }
    }
}

/// Writes `model ⊛ beam + residual` into the image planes of every Taylor term.
pub fn restore_images(store: &mut dyn ImageStore) -> Result<()> {
    let name = store.name().to_string();
    let images = store.images()?;
    let beam = CleanBeam::fit(images.psf(0))?;
    info!(
        "Restoring {name} with a {:.2} x {:.2} pixel clean beam",
        beam.fwhm_x, beam.fwhm_y
    );
    let kernel = beam.kernel();
    let (residuals, _, models, restored) = images.restoration_planes();
    for ((image, model), residual) in restored.iter_mut().zip(models).zip(residuals) {
        *image = residual.clone();
        add_convolved(image, model, &kernel);
    }
    Ok(())
}
