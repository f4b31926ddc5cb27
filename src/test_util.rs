//! Fixtures shared by unit tests.

use crate::image::{ImagePlane, ImageSet, ImageStoreKind};

/// Circular Gaussian PSF with unit peak at `(nx / 2, ny / 2)`.
pub(crate) fn gaussian_psf(shape: (usize, usize), sigma: f32) -> ImagePlane {
    let (cx, cy) = (shape.0 / 2, shape.1 / 2);
    ImagePlane::from_fn(shape.0, shape.1, |x, y| {
        let dx = x as f32 - cx as f32;
        let dy = y as f32 - cy as f32;
        (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
    })
}

/// Single-term image set holding a Gaussian PSF and the dirty image of a
/// point source of `flux` at `at`.
pub(crate) fn point_source_images(shape: (usize, usize), flux: f32, at: (usize, usize)) -> ImageSet {
    let mut images = ImageSet::new(ImageStoreKind::SingleTerm, shape);
    let psf = gaussian_psf(shape, 1.5);
    let centre = (shape.0 / 2, shape.1 / 2);
    crate::hogbom::subtract_psf(images.residual_mut(0), &psf, centre, at, -flux);
    *images.psf_mut(0) = psf;
    images
}
