//! Minor-cycle dispatch for one deconvolution target.
//!
//! A [`DeconvolutionDispatcher`] owns the image store of one target and the
//! kernel chosen for it. It walks through a small lifecycle:
//!
//! ```text
//! Unconfigured --setup--> Configured --init--> Ready <--execute--> Ready --restore--> Restored
//! ```
//!
//! Every call that touches the images releases the image locks before it
//! returns, whether it succeeded or not, so that a gridder or another process
//! can take them between bursts.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::algorithm::{create_algorithm, AlgorithmKind, DeconvolutionAlgorithm};
use crate::controller::{CycleRecord, IterationController, MinorCycleControls};
use crate::error::{Result, SynthesisError};
use crate::image::{ImageStore, ImageStoreKind, ImageStoreProvider};
use crate::record::Record;
use crate::state::CycleMeasurement;

/// Sidelobe level assumed when the PSF shows no sidelobe structure at all.
const DEGENERATE_SIDELOBE_FLOOR: f32 = 0.01;

/// Settings of one deconvolution target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeconvolutionConfig {
    /// Name of the image store this target cleans.
    pub image_name: String,
    /// Tag recorded in the minor-cycle summary for this target.
    pub id: usize,
    /// Kernel used for every minor cycle; fixed once configured.
    pub algorithm: AlgorithmKind,
    /// Model image added to the model once, before the first minor cycle.
    pub start_model: Option<String>,
    /// Number of Taylor terms; only multi-term kernels use more than one.
    pub n_taylor_terms: usize,
}

impl DeconvolutionConfig {
    /// Settings with id 0, no start model and a single Taylor term.
    pub fn new(image_name: impl Into<String>, algorithm: AlgorithmKind) -> Self {
        Self {
            image_name: image_name.into(),
            id: 0,
            algorithm,
            start_model: None,
            n_taylor_terms: 1,
        }
    }

    /// Sets the summary tag.
    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    /// Names the model image applied before the first minor cycle.
    pub fn with_start_model(mut self, start_model: impl Into<String>) -> Self {
        self.start_model = Some(start_model.into());
        self
    }

    /// Sets the number of Taylor terms.
    pub fn with_n_taylor_terms(mut self, n_taylor_terms: usize) -> Self {
        self.n_taylor_terms = n_taylor_terms;
        self
    }

    /// Reads `imagename`, `id`, `algo` (or `deconvolver`), `startmodel` and
    /// `ntaylorterms`.
    pub fn from_record(record: &Record) -> Result<Self> {
        let image_name = record
            .get_str("imagename")?
            .filter(|name| !name.is_empty())
            .ok_or_else(|| SynthesisError::missing_field("imagename"))?;
        let algo = match record.get_str("algo")? {
            Some(algo) => algo,
            None => record
                .get_str("deconvolver")?
                .ok_or_else(|| SynthesisError::missing_field("algo"))?,
        };
        let algorithm: AlgorithmKind = algo.parse()?;
        let n_taylor_terms = record.get_count("ntaylorterms")?.unwrap_or(1);
        if n_taylor_terms == 0 {
            return Err(SynthesisError::InvalidParameter {
                name: "ntaylorterms",
                value: 0.0,
                reason: "must be at least 1",
            });
        }
        Ok(Self {
            image_name: image_name.to_string(),
            id: record.get_count("id")?.unwrap_or(0),
            algorithm,
            start_model: record
                .get_str("startmodel")?
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            n_taylor_terms,
        })
    }

    /// Writes the settings back under the keys `from_record` reads.
    pub fn to_record(&self) -> Record {
        let mut record = Record::new()
            .with("imagename", self.image_name.as_str())
            .with("id", self.id)
            .with("algo", self.algorithm.name())
            .with("ntaylorterms", self.n_taylor_terms);
        if let Some(start_model) = &self.start_model {
            record.insert("startmodel", start_model.as_str());
        }
        record
    }

    /// Layout of the image store this target needs.
    pub fn image_store_kind(&self) -> ImageStoreKind {
        self.algorithm.image_store_kind(self.n_taylor_terms)
    }
}

/// Lifecycle of a [`DeconvolutionDispatcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeconvolverState {
    Unconfigured,
    Configured,
    Ready,
    Restored,
}

impl DeconvolverState {
    pub fn name(&self) -> &'static str {
        match self {
            DeconvolverState::Unconfigured => "unconfigured",
            DeconvolverState::Configured => "configured",
            DeconvolverState::Ready => "ready",
            DeconvolverState::Restored => "restored",
        }
    }
}

/// Runs minor cycles on one deconvolution target.
pub struct DeconvolutionDispatcher {
    provider: Box<dyn ImageStoreProvider>,
    state: DeconvolverState,
    config: Option<DeconvolutionConfig>,
    algorithm: Option<Box<dyn DeconvolutionAlgorithm>>,
    store: Option<Box<dyn ImageStore>>,
    added_model: bool,
    psf_sidelobe: Option<f32>,
}

impl DeconvolutionDispatcher {
    /// Unconfigured dispatcher that opens its image store from `provider`.
    pub fn new(provider: Box<dyn ImageStoreProvider>) -> Self {
        Self {
            provider,
            state: DeconvolverState::Unconfigured,
            config: None,
            algorithm: None,
            store: None,
            added_model: false,
            psf_sidelobe: None,
        }
    }

    pub fn state(&self) -> DeconvolverState {
        self.state
    }

    pub fn config(&self) -> Option<&DeconvolutionConfig> {
        self.config.as_ref()
    }

    /// Sidelobe level measured at the first `init_minor_cycle`.
    pub fn psf_sidelobe(&self) -> Option<f32> {
        self.psf_sidelobe
    }

    /// The target's image store, once opened by `init_minor_cycle`.
    pub fn image_store(&mut self) -> Option<&mut (dyn ImageStore + 'static)> {
        self.store.as_deref_mut()
    }

    /// Configures the target from a key/value record.
    pub fn setup_deconvolution(&mut self, record: &Record) -> Result<()> {
        self.require(&[DeconvolverState::Unconfigured], "set up deconvolution")?;
        let config = DeconvolutionConfig::from_record(record)?;
        self.configure(config)
    }

    /// Configures the target. The algorithm cannot be changed afterwards.
    pub fn configure(&mut self, config: DeconvolutionConfig) -> Result<()> {
        self.require(&[DeconvolverState::Unconfigured], "set up deconvolution")?;
        let algorithm = create_algorithm(config.algorithm, config.n_taylor_terms)?;
        info!(
            "Set deconvolution options for [{}]: {} with {} Taylor term(s)",
            config.image_name,
            algorithm.algorithm_name(),
            algorithm.n_taylor_terms()
        );
        self.algorithm = Some(algorithm);
        self.config = Some(config);
        self.state = DeconvolverState::Configured;
        Ok(())
    }

    /// Opens the images, applies the starting model once and measures the
    /// peak residual, model flux and PSF sidelobe level.
    pub fn init_minor_cycle(&mut self) -> Result<CycleMeasurement> {
        self.require(
            &[DeconvolverState::Configured, DeconvolverState::Ready],
            "initialise a minor cycle",
        )?;
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| SynthesisError::invalid_state("initialise a minor cycle", "unconfigured"))?;
        if self.store.is_none() {
            self.store = Some(
                self.provider
                    .open(&config.image_name, config.image_store_kind())?,
            );
        }
        let store = self
            .store
            .as_deref_mut()
            .ok_or_else(|| SynthesisError::ImageStoreUnavailable {
                name: config.image_name.clone(),
                reason: "image store was not opened".to_string(),
            })?;

        let measured = measure(
            store,
            config.start_model.as_deref(),
            &mut self.added_model,
            &mut self.psf_sidelobe,
        );
        let released = store.release_locks();
        let measurement = measured?;
        released?;

        info!(
            "[{}] Peak residual (max, min) in region: {:e}, model flux {:e}, PSF sidelobe level {:.4}",
            config.image_name,
            measurement.peak_residual,
            measurement.model_flux,
            measurement.psf_sidelobe
        );
        self.state = DeconvolverState::Ready;
        Ok(measurement)
    }

    /// Runs one burst of minor-cycle iterations with the given controls.
    pub fn execute_minor_cycle(
        &mut self,
        controller: &mut IterationController,
        controls: &MinorCycleControls,
    ) -> Result<CycleRecord> {
        self.require(&[DeconvolverState::Ready], "execute a minor cycle")?;
        let (config, algorithm, store) = self.parts("execute a minor cycle")?;

        info!(
            "[{}] Run minor cycle iterations with {}",
            config.image_name,
            algorithm.algorithm_name()
        );
        let (outcome, cycle_threshold) = {
            let mut burst = controller.begin_minor_cycle(controls);
            let cycle_threshold = burst.cycle_threshold();
            (algorithm.deconvolve(&mut burst, store, config.id), cycle_threshold)
        };
        let released = store.release_locks();
        let report = match outcome {
            Ok(report) => report,
            Err(err) => {
                if let Err(release_err) = released {
                    warn!(
                        "[{}] could not release image locks after failed minor cycle: {release_err}",
                        config.image_name
                    );
                }
                return Err(err);
            }
        };
        released?;

        debug!(
            "[{}] {} iterations, peak residual {:e}, model flux {:e}",
            config.image_name, report.iterations, report.peak_residual, report.model_flux
        );
        Ok(CycleRecord {
            peak_residual: report.peak_residual,
            model_flux: report.model_flux,
            cycle_threshold,
            iterations: report.iterations,
            niter_done: controller.completed_niter(),
        })
    }

    /// Record-in, record-out variant of [`execute_minor_cycle`](Self::execute_minor_cycle).
    pub fn execute_minor_cycle_record(
        &mut self,
        controller: &mut IterationController,
        controls: &Record,
    ) -> Result<Record> {
        let controls = MinorCycleControls::from_record(controls)?;
        Ok(self.execute_minor_cycle(controller, &controls)?.to_record())
    }

    /// Writes the restored images. Terminal for this target.
    pub fn restore(&mut self) -> Result<()> {
        self.require(&[DeconvolverState::Ready], "restore")?;
        let (config, algorithm, store) = self.parts("restore")?;
        info!("[{}] Restoring model image", config.image_name);
        let restored = algorithm.restore(store);
        let released = store.release_locks();
        restored?;
        released?;
        self.state = DeconvolverState::Restored;
        Ok(())
    }

    fn require(&self, allowed: &[DeconvolverState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SynthesisError::invalid_state(operation, self.state.name()))
        }
    }

    fn parts(
        &mut self,
        operation: &'static str,
    ) -> Result<(
        &DeconvolutionConfig,
        &mut (dyn DeconvolutionAlgorithm + 'static),
        &mut (dyn ImageStore + 'static),
    )> {
        match (
            self.config.as_ref(),
            self.algorithm.as_deref_mut(),
            self.store.as_deref_mut(),
        ) {
            (Some(config), Some(algorithm), Some(store)) => Ok((config, algorithm, store)),
            _ => Err(SynthesisError::invalid_state(operation, self.state.name())),
        }
    }
}

impl std::fmt::Debug for DeconvolutionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeconvolutionDispatcher")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("added_model", &self.added_model)
            .field("psf_sidelobe", &self.psf_sidelobe)
            .finish()
    }
}

fn measure(
    store: &mut dyn ImageStore,
    start_model: Option<&str>,
    added_model: &mut bool,
    psf_sidelobe: &mut Option<f32>,
) -> Result<CycleMeasurement> {
    if let Some(start_model) = start_model {
        if !*added_model {
            info!("[{}] Adding starting model {start_model}", store.name());
            store.add_start_model(start_model)?;
            *added_model = true;
        }
    }
    let name = store.name().to_string();
    let images = store.images()?;
    let sidelobe = match *psf_sidelobe {
        Some(sidelobe) => sidelobe,
        None => {
            let mut sidelobe = images.psf(0).min().abs();
            if sidelobe == 1.0 {
                warn!(
                    "[{name}] PSF has no sidelobe structure; using a sidelobe level of {DEGENERATE_SIDELOBE_FLOOR}"
                );
                sidelobe = DEGENERATE_SIDELOBE_FLOOR;
            }
            *psf_sidelobe = Some(sidelobe);
            sidelobe
        }
    };
    Ok(CycleMeasurement {
        peak_residual: images.peak_residual(),
        model_flux: images.model_flux(),
        psf_sidelobe: sidelobe,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::image::{ImagePlane, MemoryImageDisk};
    use crate::options::IterationOptions;
    use crate::test_util::point_source_images;

    fn disk_with_source(name: &str, flux: f32) -> MemoryImageDisk {
        let disk = MemoryImageDisk::new();
        let mut store = disk
            .create(name, ImageStoreKind::SingleTerm, (15, 15))
            .unwrap();
        *store.images().unwrap() = point_source_images((15, 15), flux, (7, 7));
        store.release_locks().unwrap();
        disk
    }

    fn hogbom_record(name: &str) -> Record {
        Record::new().with("imagename", name).with("algo", "hogbom")
    }

    #[test]
    fn empty_setup_names_the_missing_field() {
        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(MemoryImageDisk::new()));
        let err = dispatcher.setup_deconvolution(&Record::new()).unwrap_err();
        assert!(matches!(
            err,
            SynthesisError::MissingField { field: "imagename" }
        ));
        assert_eq!(err.to_string(), "imagename not specified");
        assert_eq!(dispatcher.state(), DeconvolverState::Unconfigured);
        assert!(matches!(
            dispatcher.init_minor_cycle(),
            Err(SynthesisError::InvalidState { .. })
        ));
    }

    #[test]
    fn unknown_algorithm_is_fatal_to_setup() {
        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(MemoryImageDisk::new()));
        let record = Record::new().with("imagename", "x").with("algo", "test");
        let err = dispatcher.setup_deconvolution(&record).unwrap_err();
        assert_eq!(err.to_string(), "unknown algorithm: test");
        assert_eq!(dispatcher.state(), DeconvolverState::Unconfigured);
    }

    #[test]
    fn config_reads_aliases_and_defaults() {
        let record = Record::new()
            .with("imagename", "field0")
            .with("deconvolver", "msmfs")
            .with("ntaylorterms", 2)
            .with("startmodel", "");
        let config = DeconvolutionConfig::from_record(&record).unwrap();
        assert_eq!(config.algorithm, AlgorithmKind::Msmfs);
        assert_eq!(config.n_taylor_terms, 2);
        assert_eq!(config.id, 0);
        assert_eq!(config.start_model, None);
        assert_eq!(
            config.image_store_kind(),
            ImageStoreKind::MultiTerm { n_taylor_terms: 2 }
        );

        let back = DeconvolutionConfig::from_record(&config.to_record()).unwrap();
        assert_eq!(back, config);

        let missing_algo = Record::new().with("imagename", "field0");
        assert!(matches!(
            DeconvolutionConfig::from_record(&missing_algo),
            Err(SynthesisError::MissingField { field: "algo" })
        ));
    }

    #[test]
    fn algorithm_cannot_be_swapped_after_setup() {
        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(MemoryImageDisk::new()));
        dispatcher.setup_deconvolution(&hogbom_record("a")).unwrap();
        assert_eq!(dispatcher.state(), DeconvolverState::Configured);
        let again = Record::new().with("imagename", "a").with("algo", "msmfs");
        assert!(matches!(
            dispatcher.setup_deconvolution(&again),
            Err(SynthesisError::InvalidState { .. })
        ));
        assert_eq!(dispatcher.config().unwrap().algorithm, AlgorithmKind::Hogbom);
    }

    #[test]
    fn degenerate_psf_sidelobe_is_floored() {
        let disk = MemoryImageDisk::new();
        let mut store = disk
            .create("flat", ImageStoreKind::SingleTerm, (5, 5))
            .unwrap();
        store.images().unwrap().psf_mut(0).fill(1.0);
        store.release_locks().unwrap();

        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(disk));
        dispatcher.setup_deconvolution(&hogbom_record("flat")).unwrap();
        let measurement = dispatcher.init_minor_cycle().unwrap();
        assert_eq!(measurement.psf_sidelobe, 0.01);
        assert_eq!(dispatcher.psf_sidelobe(), Some(0.01));
    }

    #[test]
    fn sidelobe_is_the_magnitude_of_the_psf_minimum() {
        let disk = disk_with_source("target", 1.0);
        let mut store = disk.open("target", ImageStoreKind::SingleTerm).unwrap();
        store.images().unwrap().psf_mut(0)[(2, 3)] = -0.2;
        store.release_locks().unwrap();

        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(disk));
        dispatcher.setup_deconvolution(&hogbom_record("target")).unwrap();
        let measurement = dispatcher.init_minor_cycle().unwrap();
        assert_relative_eq!(measurement.psf_sidelobe, 0.2);
        assert_relative_eq!(measurement.peak_residual, 1.0);
        assert_eq!(measurement.model_flux, 0.0);
        assert_eq!(dispatcher.state(), DeconvolverState::Ready);
    }

    #[test]
    fn starting_model_is_applied_once() {
        let disk = disk_with_source("target", 1.0);
        let mut start = ImagePlane::zeros(15, 15);
        start[(3, 3)] = 2.5;
        disk.insert_start_model("start", vec![start]).unwrap();

        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(disk.clone()));
        dispatcher
            .setup_deconvolution(&hogbom_record("target").with("startmodel", "start"))
            .unwrap();
        let first = dispatcher.init_minor_cycle().unwrap();
        let second = dispatcher.init_minor_cycle().unwrap();
        assert_eq!(first.model_flux, 2.5);
        assert_eq!(second.model_flux, 2.5);
        assert_eq!(disk.snapshot("target").unwrap().model(0)[(3, 3)], 2.5);
        assert!(!disk.is_locked("target").unwrap());
    }

    #[test]
    fn minor_cycle_updates_model_and_releases_locks() {
        let disk = disk_with_source("target", 1.0);
        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(disk.clone()));
        dispatcher.setup_deconvolution(&hogbom_record("target")).unwrap();
        let mut controller = IterationController::new(
            IterationOptions::default()
                .with_niter(100)
                .with_max_cycle_niter(10),
        )
        .unwrap();
        let measurement = dispatcher.init_minor_cycle().unwrap();
        controller.calculate_cycle_threshold(&measurement);

        let controls = controller.minor_cycle_controls();
        let record = dispatcher
            .execute_minor_cycle(&mut controller, &controls)
            .unwrap();
        assert_eq!(record.iterations, 10);
        assert_eq!(record.niter_done, 10);
        assert!(!disk.is_locked("target").unwrap());
        let on_disk = disk.snapshot("target").unwrap();
        assert_relative_eq!(on_disk.model_flux(), record.model_flux);
        assert_relative_eq!(on_disk.peak_residual(), record.peak_residual);
    }

    #[test]
    fn record_interface_round_trips_controls() {
        let disk = disk_with_source("target", 1.0);
        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(disk));
        dispatcher.setup_deconvolution(&hogbom_record("target")).unwrap();
        dispatcher.init_minor_cycle().unwrap();
        let mut controller =
            IterationController::new(IterationOptions::default().with_niter(3)).unwrap();
        let controls = Record::new().with("cyclethreshold", 0.0).with("loopgain", 0.5);
        let out = dispatcher
            .execute_minor_cycle_record(&mut controller, &controls)
            .unwrap();
        assert_eq!(out.get_count("iterdone").unwrap(), Some(3));
        assert_relative_eq!(out.get_float("peakresidual").unwrap().unwrap(), 0.125);
    }

    #[test]
    fn record_controls_cannot_clean_below_the_global_threshold() {
        let disk = disk_with_source("target", 1.0);
        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(disk));
        dispatcher.setup_deconvolution(&hogbom_record("target")).unwrap();
        dispatcher.init_minor_cycle().unwrap();
        let mut controller = IterationController::new(
            IterationOptions::default()
                .with_niter(1000)
                .with_threshold(0.5),
        )
        .unwrap();
        let controls = Record::new().with("cyclethreshold", 0.0);
        let out = dispatcher
            .execute_minor_cycle_record(&mut controller, &controls)
            .unwrap();

        assert!(out.get_float("peakresidual").unwrap().unwrap() >= 0.45);
        assert!(out.get_count("iterdone").unwrap().unwrap() < 10);
        assert_relative_eq!(out.get_float("cyclethreshold").unwrap().unwrap(), 0.5);
        let row = controller.state().summary_minor[0];
        assert_relative_eq!(row.cycle_threshold, 0.5);
    }

    #[test]
    fn failing_minor_cycle_still_releases_locks() {
        let disk = MemoryImageDisk::new();
        let mut store = disk
            .create("broken", ImageStoreKind::SingleTerm, (5, 5))
            .unwrap();
        store.images().unwrap().residual_mut(0)[(1, 1)] = 1.0;
        store.release_locks().unwrap();

        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(disk.clone()));
        dispatcher.setup_deconvolution(&hogbom_record("broken")).unwrap();
        dispatcher.init_minor_cycle().unwrap();
        let mut controller =
            IterationController::new(IterationOptions::default().with_niter(10)).unwrap();
        let controls = controller.minor_cycle_controls();
        let result = dispatcher.execute_minor_cycle(&mut controller, &controls);
        assert!(matches!(result, Err(SynthesisError::NumericalError { .. })));
        assert!(!disk.is_locked("broken").unwrap());
    }

    #[test]
    fn restore_is_terminal() {
        let disk = disk_with_source("target", 1.0);
        let mut dispatcher = DeconvolutionDispatcher::new(Box::new(disk.clone()));
        assert!(dispatcher.restore().is_err());
        dispatcher.setup_deconvolution(&hogbom_record("target")).unwrap();
        dispatcher.init_minor_cycle().unwrap();
        dispatcher.restore().unwrap();
        assert_eq!(dispatcher.state(), DeconvolverState::Restored);
        assert!(!disk.is_locked("target").unwrap());
        assert_relative_eq!(disk.snapshot("target").unwrap().image(0)[(7, 7)], 1.0);

        let mut controller = IterationController::new(IterationOptions::default()).unwrap();
        let controls = controller.minor_cycle_controls();
        assert!(matches!(
            dispatcher.execute_minor_cycle(&mut controller, &controls),
            Err(SynthesisError::InvalidState { .. })
        ));
    }
}
