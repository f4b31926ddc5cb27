//! Major-cycle orchestration over the defined images.
//!
//! The orchestrator owns the visibility source and one [`Mapper`] per image.
//! A major cycle is a single forward pass over the data: for every buffer the
//! model column is cleared, every mapper adds its model prediction, and then
//! every mapper grids the residual (or, for a PSF pass, unit weights). Mappers
//! are always visited in the order they were defined.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::algorithm::AlgorithmKind;
use crate::error::{Result, SynthesisError};
use crate::image::{ImageStoreKind, ImageStoreProvider};
use crate::mapper::{DftMapper, Mapper};
use crate::record::Record;
use crate::visibility::VisibilitySource;

/// Geometry and spectral setup of one output image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageDefinition {
    pub name: String,
    pub nx: usize,
    pub ny: usize,
    /// Pixel size. \[rad\]
    pub cell_rad: f64,
    /// Decides the image layout together with `n_taylor_terms`.
    pub algorithm: AlgorithmKind,
    pub n_taylor_terms: usize,
    pub reference_freq_hz: f64,
}

impl ImageDefinition {
    /// Single-term Hogbom image of `shape` pixels of `cell_rad` radians.
    pub fn new(
        name: impl Into<String>,
        shape: (usize, usize),
        cell_rad: f64,
        reference_freq_hz: f64,
    ) -> Self {
        Self {
            name: name.into(),
            nx: shape.0,
            ny: shape.1,
            cell_rad,
            algorithm: AlgorithmKind::Hogbom,
            n_taylor_terms: 1,
            reference_freq_hz,
        }
    }

    /// Switches to a multi-term layout for MS-MFS.
    pub fn with_taylor_terms(mut self, n_taylor_terms: usize) -> Self {
        self.algorithm = AlgorithmKind::Msmfs;
        self.n_taylor_terms = n_taylor_terms;
        self
    }

    /// Reads `imagename`, `imsize` (or `nx`/`ny`), `cell`, `reffreq`,
    /// `deconvolver` and `ntaylorterms`.
    pub fn from_record(record: &Record) -> Result<Self> {
        let name = record
            .get_str("imagename")?
            .filter(|name| !name.is_empty())
            .ok_or_else(|| SynthesisError::missing_field("imagename"))?;
        let (nx, ny) = match record.get_count("imsize")? {
            Some(size) => (size, size),
            None => (
                record
                    .get_count("nx")?
                    .ok_or_else(|| SynthesisError::missing_field("imsize"))?,
                record
                    .get_count("ny")?
                    .ok_or_else(|| SynthesisError::missing_field("imsize"))?,
            ),
        };
        let cell_rad = record
            .get_float("cell")?
            .ok_or_else(|| SynthesisError::missing_field("cell"))?;
        let reference_freq_hz = record
            .get_float("reffreq")?
            .ok_or_else(|| SynthesisError::missing_field("reffreq"))?;
        let algorithm = match record.get_str("deconvolver")? {
            Some(name) => name.parse()?,
            None => AlgorithmKind::Hogbom,
        };
        Ok(Self {
            name: name.to_string(),
            nx,
            ny,
            cell_rad,
            algorithm,
            n_taylor_terms: record.get_count("ntaylorterms")?.unwrap_or(1),
            reference_freq_hz,
        })
    }

    pub fn image_store_kind(&self) -> ImageStoreKind {
        self.algorithm.image_store_kind(self.n_taylor_terms)
    }
}

/// What one major cycle touched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MajorCycleSummary {
    pub rows_visited: usize,
    pub buffers_visited: usize,
    /// Largest peak residual over all images; zero for a PSF pass.
    pub peak_residual: f32,
}

/// Runs major cycles over a set of images.
pub struct ImagingOrchestrator {
    source: Box<dyn VisibilitySource>,
    mappers: Vec<Box<dyn Mapper>>,
}

impl ImagingOrchestrator {
    /// Selects the data every major cycle iterates over.
    pub fn new(source: Box<dyn VisibilitySource>) -> Self {
        Self {
            source,
            mappers: Vec::new(),
        }
    }

    /// Creates the images and replaces the mapper collection with one
    /// [`DftMapper`] per definition. Ids follow the definition order.
    pub fn define_images(
        &mut self,
        provider: &dyn ImageStoreProvider,
        definitions: &[ImageDefinition],
    ) -> Result<()> {
        let mut mappers: Vec<Box<dyn Mapper>> = Vec::with_capacity(definitions.len());
        for (id, definition) in definitions.iter().enumerate() {
            if definition.n_taylor_terms == 0 {
                return Err(SynthesisError::InvalidParameter {
                    name: "ntaylorterms",
                    value: 0.0,
                    reason: "must be at least 1",
                });
            }
            let store = provider.create(
                &definition.name,
                definition.image_store_kind(),
                (definition.nx, definition.ny),
            )?;
            info!(
                "Define image [{}] : {}x{} pixels of {:e} rad, {} Taylor term(s)",
                definition.name,
                definition.nx,
                definition.ny,
                definition.cell_rad,
                definition.n_taylor_terms
            );
            mappers.push(Box::new(DftMapper::new(
                id,
                store,
                definition.cell_rad,
                definition.reference_freq_hz,
            )?));
        }
        self.mappers = mappers;
        Ok(())
    }

    /// Installs a custom mapper collection, visited in the given order.
    pub fn set_mappers(&mut self, mappers: Vec<Box<dyn Mapper>>) {
        self.mappers = mappers;
    }

    /// Drops every mapper; the next cycle fails until images are defined again.
    pub fn reset_mappers(&mut self) {
        self.mappers.clear();
    }

    pub fn n_mappers(&self) -> usize {
        self.mappers.len()
    }

    pub fn source(&mut self) -> &mut dyn VisibilitySource {
        self.source.as_mut()
    }

    /// One pass over the data: predict and grid the residual, or grid the
    /// PSF when `dopsf` is set.
    pub fn run_major_cycle(&mut self, dopsf: bool) -> Result<MajorCycleSummary> {
        if self.mappers.is_empty() {
            return Err(SynthesisError::NoImageDefined);
        }
        info!("{}", if dopsf { "Make PSF" } else { "Run Major Cycle" });
        let outcome = major_cycle_pass(self.source.as_mut(), &mut self.mappers, dopsf);
        let released = self.release_locks();
        let summary = match outcome {
            Ok(summary) => summary,
            Err(err) => {
                if let Err(release_err) = released {
                    warn!("could not release image locks after failed major cycle: {release_err}");
                }
                return Err(err);
            }
        };
        released?;
        debug!(
            "Major cycle visited {} rows in {} buffers, peak residual {:e}",
            summary.rows_visited, summary.buffers_visited, summary.peak_residual
        );
        Ok(summary)
    }

    /// Residual major cycle: predicts the model and grids the residual.
    pub fn execute_major_cycle(&mut self) -> Result<MajorCycleSummary> {
        self.run_major_cycle(false)
    }

    /// PSF pass: grids unit visibilities into the PSF and weight planes.
    pub fn make_psf(&mut self) -> Result<MajorCycleSummary> {
        self.run_major_cycle(true)
    }

    /// Fills the model column of every buffer from the current models
    /// without gridding anything.
    pub fn predict_model(&mut self) -> Result<MajorCycleSummary> {
        if self.mappers.is_empty() {
            return Err(SynthesisError::NoImageDefined);
        }
        info!("Predict model");
        let outcome = predict_pass(self.source.as_mut(), &mut self.mappers);
        let released = self.release_locks();
        let summary = outcome?;
        released?;
        Ok(summary)
    }

    /// Releases every mapper's locks, reporting the first failure.
    fn release_locks(&mut self) -> Result<()> {
        let mut first_error = None;
        for mapper in &mut self.mappers {
            if let Err(err) = mapper.release_locks() {
                warn!("[{}] failed to release image locks: {err}", mapper.image_name());
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ImagingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let images: Vec<&str> = self.mappers.iter().map(|m| m.image_name()).collect();
        f.debug_struct("ImagingOrchestrator")
            .field("images", &images)
            .finish()
    }
}

fn major_cycle_pass(
    source: &mut dyn VisibilitySource,
    mappers: &mut [Box<dyn Mapper>],
    dopsf: bool,
) -> Result<MajorCycleSummary> {
    source.origin()?;
    for mapper in mappers.iter_mut() {
        if !dopsf {
            mapper.initialize_degrid()?;
        }
        mapper.initialize_grid(dopsf)?;
    }

    let mut summary = MajorCycleSummary::default();
    while let Some(buffer) = source.next_buffer()? {
        if !dopsf {
            buffer.clear_model();
            for mapper in mappers.iter_mut() {
                mapper.degrid(buffer)?;
            }
        }
        for mapper in mappers.iter_mut() {
            mapper.grid(buffer, dopsf)?;
        }
        summary.rows_visited += buffer.n_rows();
        summary.buffers_visited += 1;
    }

    for mapper in mappers.iter_mut() {
        if !dopsf {
            mapper.finalize_degrid()?;
        }
        mapper.finalize_grid(dopsf)?;
        if !dopsf {
            summary.peak_residual = summary.peak_residual.max(mapper.peak_residual());
        }
    }
    Ok(summary)
}

fn predict_pass(
    source: &mut dyn VisibilitySource,
    mappers: &mut [Box<dyn Mapper>],
) -> Result<MajorCycleSummary> {
    source.origin()?;
    for mapper in mappers.iter_mut() {
        mapper.initialize_degrid()?;
    }
    let mut summary = MajorCycleSummary::default();
    while let Some(buffer) = source.next_buffer()? {
        buffer.clear_model();
        for mapper in mappers.iter_mut() {
            mapper.degrid(buffer)?;
        }
        summary.rows_visited += buffer.n_rows();
        summary.buffers_visited += 1;
    }
    for mapper in mappers.iter_mut() {
        mapper.finalize_degrid()?;
    }
    Ok(summary)
}
