//! Image planes, image stores and the in-memory image backend.
//!
//! An image store bundles the residual, PSF, model, weight and restored
//! image planes of one deconvolution target. Stores live behind the
//! [`ImageStore`] trait so that the imaging loop does not care whether the
//! pixels sit on disk, in memory or elsewhere. Accessing the planes acquires
//! a lock on the image; [`ImageStore::release_locks`] writes the planes back
//! and frees the lock so that another handle (a gridder, another process)
//! can take it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthesisError};

/// One two-dimensional pixel plane, indexed `(x, y)`.
pub type ImagePlane = DMatrix<f32>;

/// Layout of the planes held by a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageStoreKind {
    SingleTerm,
    MultiTerm { n_taylor_terms: usize },
}

impl ImageStoreKind {
    /// Number of residual, model and image planes.
    pub fn n_taylor_terms(&self) -> usize {
        match self {
            ImageStoreKind::SingleTerm => 1,
            ImageStoreKind::MultiTerm { n_taylor_terms } => *n_taylor_terms,
        }
    }

    /// Number of PSF and weight planes (2n - 1 for n Taylor terms).
    pub fn n_psf_terms(&self) -> usize {
        2 * self.n_taylor_terms() - 1
    }
}

/// The planes of one deconvolution target.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageSet {
    kind: ImageStoreKind,
    residual: Vec<ImagePlane>,
    psf: Vec<ImagePlane>,
    model: Vec<ImagePlane>,
    weight: Vec<ImagePlane>,
    image: Vec<ImagePlane>,
}

impl ImageSet {
    /// Allocates zeroed planes of `shape = (nx, ny)`.
    pub fn new(kind: ImageStoreKind, shape: (usize, usize)) -> Self {
        let planes = |n: usize| vec![ImagePlane::zeros(shape.0, shape.1); n];
        Self {
            kind,
            residual: planes(kind.n_taylor_terms()),
            psf: planes(kind.n_psf_terms()),
            model: planes(kind.n_taylor_terms()),
            weight: planes(kind.n_psf_terms()),
            image: planes(kind.n_taylor_terms()),
        }
    }

    /// Single-term or multi-term layout of this set.
    pub fn kind(&self) -> ImageStoreKind {
        self.kind
    }

    /// `(nx, ny)` of every plane.
    pub fn shape(&self) -> (usize, usize) {
        self.residual[0].shape()
    }

    /// Residual plane of a Taylor term.
    pub fn residual(&self, term: usize) -> &ImagePlane {
        &self.residual[term]
    }

    /// PSF plane; a multi-term set has `2n - 1` of them.
    pub fn psf(&self, term: usize) -> &ImagePlane {
        &self.psf[term]
    }

    /// Model (clean component) plane of a Taylor term.
    pub fn model(&self, term: usize) -> &ImagePlane {
        &self.model[term]
    }

    /// Sum-of-weights plane, one per PSF term.
    pub fn weight(&self, term: usize) -> &ImagePlane {
        &self.weight[term]
    }

    /// Restored plane of a Taylor term.
    pub fn image(&self, term: usize) -> &ImagePlane {
        &self.image[term]
    }

    pub fn residual_mut(&mut self, term: usize) -> &mut ImagePlane {
        &mut self.residual[term]
    }

    pub fn psf_mut(&mut self, term: usize) -> &mut ImagePlane {
        &mut self.psf[term]
    }

    pub fn model_mut(&mut self, term: usize) -> &mut ImagePlane {
        &mut self.model[term]
    }

    pub fn weight_mut(&mut self, term: usize) -> &mut ImagePlane {
        &mut self.weight[term]
    }

    pub fn image_mut(&mut self, term: usize) -> &mut ImagePlane {
        &mut self.image[term]
    }

    /// Split borrow used by the deconvolution kernels: residuals and models
    /// mutable, PSFs shared.
    pub fn deconvolution_planes(
        &mut self,
    ) -> (&mut [ImagePlane], &[ImagePlane], &mut [ImagePlane]) {
        (
            self.residual.as_mut_slice(),
            self.psf.as_slice(),
            self.model.as_mut_slice(),
        )
    }

    /// Split borrow used when restoring: residuals, PSFs and models shared,
    /// restored images mutable.
    pub fn restoration_planes(
        &mut self,
    ) -> (&[ImagePlane], &[ImagePlane], &[ImagePlane], &mut [ImagePlane]) {
        (
            self.residual.as_slice(),
            self.psf.as_slice(),
            self.model.as_slice(),
            self.image.as_mut_slice(),
        )
    }

    /// Largest absolute value of the Taylor-0 residual.
    pub fn peak_residual(&self) -> f32 {
        self.residual[0].amax()
    }

    /// Integrated flux of the Taylor-0 model.
    pub fn model_flux(&self) -> f32 {
        self.model[0].sum()
    }
}

/// Handle on the images of one deconvolution target.
pub trait ImageStore: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> ImageStoreKind;

    fn n_taylor_terms(&self) -> usize {
        self.kind().n_taylor_terms()
    }

    /// Gives access to the planes, acquiring the image lock if needed.
    fn images(&mut self) -> Result<&mut ImageSet>;

    /// Adds the named model image to the current model.
    fn add_start_model(&mut self, model_name: &str) -> Result<()>;

    /// Writes back and frees the image lock. Calling it without holding the
    /// lock is a no-op.
    fn release_locks(&mut self) -> Result<()>;

    fn is_locked(&self) -> bool;
}

/// Creates and opens image stores by name.
pub trait ImageStoreProvider: Send {
    /// Creates (or overwrites) zeroed images and returns a handle on them.
    fn create(
        &self,
        name: &str,
        kind: ImageStoreKind,
        shape: (usize, usize),
    ) -> Result<Box<dyn ImageStore>>;

    /// Opens existing images, which must have the requested layout.
    fn open(&self, name: &str, kind: ImageStoreKind) -> Result<Box<dyn ImageStore>>;
}

#[derive(Debug)]
struct DiskEntry {
    images: ImageSet,
    locked: bool,
}

#[derive(Debug, Default)]
struct DiskContents {
    images: HashMap<String, DiskEntry>,
    start_models: HashMap<String, Vec<ImagePlane>>,
}

/// Shared in-memory image catalogue standing in for images on disk.
///
/// Clones share the same catalogue, so a gridder and a deconvolver holding
/// separate handles see each other's writes once locks are released.
#[derive(Clone, Debug, Default)]
pub struct MemoryImageDisk {
    contents: Arc<Mutex<DiskContents>>,
}

impl MemoryImageDisk {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, DiskContents>> {
        self.contents
            .lock()
            .map_err(|_| SynthesisError::ImageStoreUnavailable {
                name: "<catalogue>".to_string(),
                reason: "catalogue mutex poisoned".to_string(),
            })
    }

    /// Registers a model image that can later be used as a starting model.
    pub fn insert_start_model(&self, name: &str, planes: Vec<ImagePlane>) -> Result<()> {
        self.lock()?.start_models.insert(name.to_string(), planes);
        Ok(())
    }

    /// Copy of the planes currently stored for `name`.
    pub fn snapshot(&self, name: &str) -> Result<ImageSet> {
        let contents = self.lock()?;
        contents
            .images
            .get(name)
            .map(|entry| entry.images.clone())
            .ok_or_else(|| SynthesisError::ImageNotFound {
                name: name.to_string(),
            })
    }

    /// Whether some handle currently holds the lock on `name`.
    pub fn is_locked(&self, name: &str) -> Result<bool> {
        let contents = self.lock()?;
        Ok(contents
            .images
            .get(name)
            .map(|entry| entry.locked)
            .unwrap_or(false))
    }

    fn handle(&self, name: &str, kind: ImageStoreKind) -> Box<dyn ImageStore> {
        Box::new(MemoryImageStore {
            name: name.to_string(),
            kind,
            disk: self.clone(),
            checked_out: None,
        })
    }
}

impl ImageStoreProvider for MemoryImageDisk {
    fn create(
        &self,
        name: &str,
        kind: ImageStoreKind,
        shape: (usize, usize),
    ) -> Result<Box<dyn ImageStore>> {
        if shape.0 == 0 || shape.1 == 0 {
            return Err(SynthesisError::dimension_mismatch(
                "image shape",
                1,
                shape.0.min(shape.1),
            ));
        }
        let mut contents = self.lock()?;
        if contents.images.get(name).is_some_and(|entry| entry.locked) {
            return Err(SynthesisError::ImageLocked {
                name: name.to_string(),
            });
        }
        debug!(
            "Creating image {name} ({}x{}, {} Taylor terms)",
            shape.0,
            shape.1,
            kind.n_taylor_terms()
        );
        contents.images.insert(
            name.to_string(),
            DiskEntry {
                images: ImageSet::new(kind, shape),
                locked: false,
            },
        );
        drop(contents);
        Ok(self.handle(name, kind))
    }

    fn open(&self, name: &str, kind: ImageStoreKind) -> Result<Box<dyn ImageStore>> {
        let contents = self.lock()?;
        let entry = contents
            .images
            .get(name)
            .ok_or_else(|| SynthesisError::ImageNotFound {
                name: name.to_string(),
            })?;
        if entry.images.kind() != kind {
            return Err(SynthesisError::ImageStoreUnavailable {
                name: name.to_string(),
                reason: format!(
                    "stored with {} Taylor terms but {} were requested",
                    entry.images.kind().n_taylor_terms(),
                    kind.n_taylor_terms()
                ),
            });
        }
        drop(contents);
        Ok(self.handle(name, kind))
    }
}

/// Handle on one image set of a [`MemoryImageDisk`].
#[derive(Debug)]
pub struct MemoryImageStore {
    name: String,
    kind: ImageStoreKind,
    disk: MemoryImageDisk,
    /// Planes copied out while the lock is held.
    checked_out: Option<ImageSet>,
}

impl ImageStore for MemoryImageStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ImageStoreKind {
        self.kind
    }

    fn images(&mut self) -> Result<&mut ImageSet> {
        if self.checked_out.is_none() {
            let mut contents = self.disk.lock()?;
            let entry =
                contents
                    .images
                    .get_mut(&self.name)
                    .ok_or_else(|| SynthesisError::ImageNotFound {
                        name: self.name.clone(),
                    })?;
            if entry.locked {
                return Err(SynthesisError::ImageLocked {
                    name: self.name.clone(),
                });
            }
            entry.locked = true;
            trace!("Acquired lock on {}", self.name);
            self.checked_out = Some(entry.images.clone());
        }
        self.checked_out
            .as_mut()
            .ok_or_else(|| SynthesisError::ImageStoreUnavailable {
                name: self.name.clone(),
                reason: "planes were not loaded".to_string(),
            })
    }

    fn add_start_model(&mut self, model_name: &str) -> Result<()> {
        let planes = {
            let contents = self.disk.lock()?;
            contents.start_models.get(model_name).cloned().ok_or_else(|| {
                SynthesisError::ImageNotFound {
                    name: model_name.to_string(),
                }
            })?
        };
        let images = self.images()?;
        if planes.len() > images.kind().n_taylor_terms() {
            return Err(SynthesisError::dimension_mismatch(
                "starting model terms",
                images.kind().n_taylor_terms(),
                planes.len(),
            ));
        }
        let shape = images.shape();
        for (term, plane) in planes.iter().enumerate() {
            if plane.shape() != shape {
                return Err(SynthesisError::dimension_mismatch(
                    "starting model shape",
                    shape.0 * shape.1,
                    plane.len(),
                ));
            }
            *images.model_mut(term) += plane;
        }
        Ok(())
    }

    fn release_locks(&mut self) -> Result<()> {
        let Some(images) = self.checked_out.take() else {
            return Ok(());
        };
        let mut contents = self.disk.lock()?;
        let entry =
            contents
                .images
                .get_mut(&self.name)
                .ok_or_else(|| SynthesisError::ImageNotFound {
                    name: self.name.clone(),
                })?;
        entry.images = images;
        entry.locked = false;
        trace!("Released lock on {}", self.name);
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.checked_out.is_some()
    }
}
