//! Gridding and degridding between visibilities and image planes.
//!
//! A [`Mapper`] pairs the forward (degrid) and inverse (grid) transforms for
//! one image. [`DftMapper`] evaluates the direct Fourier sums over the image
//! pixels instead of going through a convolutional gridder and an FFT. It is
//! exact and slow, which suits small images and tests.
//!
//! Rows are weighted per Taylor term with `tau^t`, `tau = (nu - nu0) / nu0`.
//! For `n` terms a PSF pass fills `2n - 1` spectral PSFs and a residual pass
//! fills `n` residual planes. All planes are normalised by the term-0 weight
//! sum so that the term-0 PSF peaks at one.

use std::f64::consts::PI;

use log::{debug, warn};
use nalgebra::{Complex, DMatrix};
use rayon::prelude::*;

use crate::error::{Result, SynthesisError};
use crate::image::{ImageStore, ImageStoreKind};
use crate::visibility::VisBuffer;

/// The transform pair of one image.
pub trait Mapper: Send {
    fn id(&self) -> usize;

    fn image_name(&self) -> &str;

    /// Prepares to accumulate either the PSF (`dopsf`) or the residual.
    fn initialize_grid(&mut self, dopsf: bool) -> Result<()>;

    /// Accumulates one buffer. The residual pass grids `data - model`.
    fn grid(&mut self, buffer: &VisBuffer, dopsf: bool) -> Result<()>;

    /// Normalises the accumulated sums and writes them to the image store.
    fn finalize_grid(&mut self, dopsf: bool) -> Result<()>;

    /// Loads the current model for prediction.
    fn initialize_degrid(&mut self) -> Result<()>;

    /// Adds the predicted model visibilities to the buffer's model column.
    fn degrid(&mut self, buffer: &mut VisBuffer) -> Result<()>;

    fn finalize_degrid(&mut self) -> Result<()>;

    /// Frees the image locks taken during the cycle.
    fn release_locks(&mut self) -> Result<()>;

    /// Peak absolute Taylor-0 residual after the last residual pass.
    fn peak_residual(&self) -> f32;
}

/// Direct-Fourier-transform mapper.
pub struct DftMapper {
    id: usize,
    store: Box<dyn ImageStore>,
    cell_rad: f64,
    reference_freq_hz: f64,
    accumulator: Option<Accumulator>,
    components: Vec<Component>,
    peak_residual: f32,
}

/// Weighted sums of one grid pass, one plane per output term.
#[derive(Debug)]
struct Accumulator {
    planes: Vec<DMatrix<f64>>,
    weight_sums: Vec<f64>,
}

/// Nonzero model pixel with its Taylor coefficients.
#[derive(Clone, Debug)]
struct Component {
    l: f64,
    m: f64,
    flux: Vec<f64>,
}

/// One weighted visibility prepared for the image-plane sum.
#[derive(Clone, Copy, Debug)]
struct UvSample {
    u: f64,
    v: f64,
    value: Complex<f64>,
}

impl DftMapper {
    /// `cell_rad` is the pixel size in radians; the phase centre sits on pixel
    /// `(nx / 2, ny / 2)`.
    pub fn new(
        id: usize,
        store: Box<dyn ImageStore>,
        cell_rad: f64,
        reference_freq_hz: f64,
    ) -> Result<Self> {
        if !(cell_rad.is_finite() && cell_rad > 0.0) {
            return Err(SynthesisError::InvalidParameter {
                name: "cell",
                value: cell_rad,
                reason: "must be positive",
            });
        }
        if !(reference_freq_hz.is_finite() && reference_freq_hz > 0.0) {
            return Err(SynthesisError::InvalidParameter {
                name: "reffreq",
                value: reference_freq_hz,
                reason: "must be positive",
            });
        }
        Ok(Self {
            id,
            store,
            cell_rad,
            reference_freq_hz,
            accumulator: None,
            components: Vec::new(),
            peak_residual: 0.0,
        })
    }

    pub fn n_taylor_terms(&self) -> usize {
        self.store.n_taylor_terms()
    }

    fn taylor_weight(&self, frequency_hz: f64, term: usize) -> f64 {
        ((frequency_hz - self.reference_freq_hz) / self.reference_freq_hz).powi(term as i32)
    }

    fn output_terms(&self, dopsf: bool) -> usize {
        let kind: ImageStoreKind = self.store.kind();
        if dopsf {
            kind.n_psf_terms()
        } else {
            kind.n_taylor_terms()
        }
    }
}

/// Direction cosine of a pixel; the image centre is at `len / 2`.
fn pixel_offset(index: usize, len: usize, cell_rad: f64) -> f64 {
    (index as f64 - (len / 2) as f64) * cell_rad
}

impl Mapper for DftMapper {
    fn id(&self) -> usize {
        self.id
    }

    fn image_name(&self) -> &str {
        self.store.name()
    }

    fn initialize_grid(&mut self, dopsf: bool) -> Result<()> {
        let (nx, ny) = self.store.images()?.shape();
        let terms = self.output_terms(dopsf);
        self.accumulator = Some(Accumulator {
            planes: vec![DMatrix::zeros(nx, ny); terms],
            weight_sums: vec![0.0; terms],
        });
        Ok(())
    }

    fn grid(&mut self, buffer: &VisBuffer, dopsf: bool) -> Result<()> {
        let cell_rad = self.cell_rad;
        let terms = self.output_terms(dopsf);
        let taylor: Vec<Vec<f64>> = buffer
            .frequency_hz()
            .iter()
            .map(|&frequency| {
                (0..terms)
                    .map(|term| self.taylor_weight(frequency, term))
                    .collect()
            })
            .collect();
        let accumulator = self.accumulator.as_mut().ok_or_else(|| {
            SynthesisError::invalid_state("grid visibilities", "not initialised for gridding")
        })?;
        if accumulator.planes.len() != terms {
            return Err(SynthesisError::dimension_mismatch(
                "gridded planes",
                accumulator.planes.len(),
                terms,
            ));
        }

        for (term, plane) in accumulator.planes.iter_mut().enumerate() {
            let mut samples = Vec::with_capacity(buffer.n_rows());
            for (row, weights) in taylor.iter().enumerate() {
                let weight = buffer.weight()[row] as f64 * weights[term];
                if weight == 0.0 {
                    continue;
                }
                let value = if dopsf {
                    Complex::new(1.0, 0.0)
                } else {
                    let residual = buffer.residual(row);
                    Complex::new(residual.re as f64, residual.im as f64)
                };
                let (u, v) = buffer.uv_wavelengths(row);
                accumulator.weight_sums[term] += weight;
                samples.push(UvSample {
                    u,
                    v,
                    value: value * weight,
                });
            }
            add_direct_transform(plane, &samples, cell_rad);
        }
        Ok(())
    }

    fn finalize_grid(&mut self, dopsf: bool) -> Result<()> {
        let accumulator = self.accumulator.take().ok_or_else(|| {
            SynthesisError::invalid_state("finalise gridding", "not initialised for gridding")
        })?;
        let norm = accumulator.weight_sums[0];
        let name = self.store.name().to_string();
        let images = self.store.images()?;

        if norm <= 0.0 {
            warn!("[{name}] sum of weights is zero; leaving planes empty");
        }
        for (term, plane) in accumulator.planes.iter().enumerate() {
            let normalised = if norm > 0.0 {
                plane.map(|value| (value / norm) as f32)
            } else {
                plane.map(|_| 0.0_f32)
            };
            if dopsf {
                *images.psf_mut(term) = normalised;
                images.weight_mut(term).fill(accumulator.weight_sums[term] as f32);
            } else {
                *images.residual_mut(term) = normalised;
            }
        }
        if !dopsf {
            self.peak_residual = images.peak_residual();
        }
        debug!(
            "[{name}] gridded {} {} plane(s), sum of weights {norm:e}",
            accumulator.planes.len(),
            if dopsf { "PSF" } else { "residual" }
        );
        Ok(())
    }

    fn initialize_degrid(&mut self) -> Result<()> {
        let cell_rad = self.cell_rad;
        let images = self.store.images()?;
        let (nx, ny) = images.shape();
        let terms = images.kind().n_taylor_terms();
        let mut components = Vec::new();
        for y in 0..ny {
            for x in 0..nx {
                let flux: Vec<f64> = (0..terms)
                    .map(|term| images.model(term)[(x, y)] as f64)
                    .collect();
                if flux.iter().any(|value| *value != 0.0) {
                    components.push(Component {
                        l: pixel_offset(x, nx, cell_rad),
                        m: pixel_offset(y, ny, cell_rad),
                        flux,
                    });
                }
            }
        }
        debug!(
            "[{}] predicting {} model component(s)",
            self.store.name(),
            components.len()
        );
        self.components = components;
        Ok(())
    }

    fn degrid(&mut self, buffer: &mut VisBuffer) -> Result<()> {
        if self.components.is_empty() {
            return Ok(());
        }
        let rows: Vec<(f64, f64, f64)> = (0..buffer.n_rows())
            .map(|row| {
                let (u, v) = buffer.uv_wavelengths(row);
                let frequency = buffer.frequency_hz()[row];
                (u, v, (frequency - self.reference_freq_hz) / self.reference_freq_hz)
            })
            .collect();
        let components = &self.components;
        buffer
            .model_mut()
            .par_iter_mut()
            .zip(rows.par_iter())
            .for_each(|(model, &(u, v, tau))| {
                let mut sum = Complex::new(0.0_f64, 0.0);
                for component in components {
                    let flux: f64 = component
                        .flux
                        .iter()
                        .enumerate()
                        .map(|(term, coefficient)| coefficient * tau.powi(term as i32))
                        .sum();
                    let (sin, cos) = (-2.0 * PI * (u * component.l + v * component.m)).sin_cos();
                    sum += Complex::new(flux * cos, flux * sin);
                }
                *model += Complex::new(sum.re as f32, sum.im as f32);
            });
        Ok(())
    }

    fn finalize_degrid(&mut self) -> Result<()> {
        self.components.clear();
        Ok(())
    }

    fn release_locks(&mut self) -> Result<()> {
        self.store.release_locks()
    }

    fn peak_residual(&self) -> f32 {
        self.peak_residual
    }
}

impl std::fmt::Debug for DftMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DftMapper")
            .field("id", &self.id)
            .field("image", &self.store.name())
            .field("cell_rad", &self.cell_rad)
            .field("reference_freq_hz", &self.reference_freq_hz)
            .finish()
    }
}

/// Adds `Re(sum_k value_k exp(+2 pi i (u_k l + v_k m)))` to every pixel.
fn add_direct_transform(plane: &mut DMatrix<f64>, samples: &[UvSample], cell_rad: f64) {
    if samples.is_empty() {
        return;
    }
    let (nx, ny) = plane.shape();
    // Column-major storage: one chunk per y.
    plane
        .as_mut_slice()
        .par_chunks_mut(nx)
        .enumerate()
        .for_each(|(y, column)| {
            let m = pixel_offset(y, ny, cell_rad);
            for (x, pixel) in column.iter_mut().enumerate() {
                let l = pixel_offset(x, nx, cell_rad);
                let mut sum = 0.0;
                for sample in samples {
                    let (sin, cos) = (2.0 * PI * (sample.u * l + sample.v * m)).sin_cos();
                    sum += sample.value.re * cos - sample.value.im * sin;
                }
                *pixel += sum;
            }
        });
}
