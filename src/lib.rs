//! Major/minor cycle iteration control for radio-interferometric synthesis imaging.
//!
//! Imaging alternates between two kinds of work. A *major cycle* passes over
//! the visibility data once, predicting the current sky model and gridding
//! the residual into image planes. A *minor cycle* deconvolves those planes
//! with a CLEAN-style kernel until the residual drops below a threshold
//! derived from the PSF sidelobe level. This crate provides
//!
//! - the iteration controller that derives cycle thresholds and decides when
//!   to stop (`controller` module),
//! - minor-cycle dispatch per deconvolution target with Hogbom and
//!   multi-term (MS-MFS) kernels (`deconvolver`, `hogbom`, `msmfs` modules),
//! - major-cycle orchestration over one or more images (`imager`, `mapper`
//!   modules), and
//! - a driver that ties them together (`run` module).
//!
//! Pixel storage and visibility access sit behind traits
//! ([`ImageStore`](image::ImageStore), [`VisibilitySource`]) with in-memory
//! implementations, including a simulator for point-source skies.
//!
//! # Quick start
//!
//! ```no_run
//! use synthcycle::image::MemoryImageDisk;
//! use synthcycle::imager::{ImageDefinition, ImagingOrchestrator};
//! use synthcycle::visibility::{MemoryVisibilities, PointSource, SimulationConfig};
//! use synthcycle::{DeconvolutionDispatcher, ImagingRun, IterationController, IterationOptions, Record};
//!
//! let sky = SimulationConfig::default().with_source(PointSource {
//!     flux: 1.0,
//!     l: 0.0,
//!     m: 0.0,
//!     spectral_index: 0.0,
//! });
//! let visibilities = MemoryVisibilities::simulate(&sky).expect("valid simulation");
//!
//! let disk = MemoryImageDisk::new();
//! let mut imager = ImagingOrchestrator::new(Box::new(visibilities));
//! imager
//!     .define_images(&disk, &[ImageDefinition::new("field", (32, 32), 0.002, 1.4e9)])
//!     .expect("image defined");
//!
//! let mut deconvolver = DeconvolutionDispatcher::new(Box::new(disk.clone()));
//! deconvolver
//!     .setup_deconvolution(&Record::new().with("imagename", "field").with("algo", "hogbom"))
//!     .expect("valid deconvolution settings");
//!
//! let options = IterationOptions::default()
//!     .with_niter(500)
//!     .with_threshold(0.01);
//! let controller = IterationController::new(options).expect("valid options");
//!
//! let mut run = ImagingRun::new(imager, controller);
//! run.add_deconvolver(deconvolver);
//! let summary = run.run().expect("imaging run");
//! println!(
//!     "{} iterations, {} major cycles, converged: {}",
//!     summary.niter_done, summary.nmajor_done, summary.converged
//! );
//! ```

pub mod algorithm;
pub mod controller;
pub mod deconvolver;
pub mod error;
pub mod hogbom;
pub mod image;
pub mod imager;
pub mod mapper;
pub mod msmfs;
pub mod options;
pub mod record;
pub mod restore;
pub mod run;
pub mod state;
pub mod visibility;

#[cfg(test)]
pub(crate) mod test_util;

pub use algorithm::{AlgorithmKind, DeconvolutionAlgorithm};
pub use controller::{CycleRecord, IterationController, IterationReport, MinorCycleControls};
pub use deconvolver::{DeconvolutionConfig, DeconvolutionDispatcher};
pub use error::{Result, SynthesisError};
pub use imager::ImagingOrchestrator;
pub use options::IterationOptions;
pub use record::Record;
pub use run::{ImagingRun, RunSummary};
pub use state::{CycleMeasurement, IterationState};
pub use visibility::VisibilitySource;
