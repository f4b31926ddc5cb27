//! Deconvolution algorithm selection and the kernel interface.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::controller::MinorCycleBurst;
use crate::error::{Result, SynthesisError};
use crate::hogbom::Hogbom;
use crate::image::{ImageStore, ImageStoreKind};
use crate::msmfs::MultiTermClean;

/// The closed set of supported minor-cycle algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmKind {
    /// Point-source CLEAN on a single image plane.
    Hogbom,
    /// Multi-term (Taylor polynomial) multi-frequency CLEAN.
    Msmfs,
}

impl AlgorithmKind {
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmKind::Hogbom => "hogbom",
            AlgorithmKind::Msmfs => "msmfs",
        }
    }

    /// Layout of the image store this algorithm works on.
    pub fn image_store_kind(&self, n_taylor_terms: usize) -> ImageStoreKind {
        match self {
            AlgorithmKind::Hogbom => ImageStoreKind::SingleTerm,
            AlgorithmKind::Msmfs => ImageStoreKind::MultiTerm { n_taylor_terms },
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AlgorithmKind {
    type Err = SynthesisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hogbom" => Ok(AlgorithmKind::Hogbom),
            "msmfs" => Ok(AlgorithmKind::Msmfs),
            _ => Err(SynthesisError::UnknownAlgorithm {
                name: s.to_string(),
            }),
        }
    }
}

/// What a kernel reports at the end of one minor cycle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinorCycleReport {
    pub iterations: usize,
    pub peak_residual: f32,
    pub model_flux: f32,
}

/// A minor-cycle deconvolution kernel.
pub trait DeconvolutionAlgorithm: Send {
    fn algorithm_name(&self) -> &'static str;

    fn n_taylor_terms(&self) -> usize;

    /// Runs iterations against the store until `burst` says to stop.
    ///
    /// Implementations must poll [`MinorCycleBurst::check_minor_stop`]
    /// before every iteration, count each one with
    /// [`MinorCycleBurst::increment_minor_cycle_count`] and record one
    /// summary row with `id` at the end.
    fn deconvolve(
        &mut self,
        burst: &mut MinorCycleBurst<'_>,
        store: &mut dyn ImageStore,
        id: usize,
    ) -> Result<MinorCycleReport>;

    /// Produces the restored images from model, residual and PSF.
    fn restore(&mut self, store: &mut dyn ImageStore) -> Result<()>;
}

/// Builds the kernel for `kind`.
pub fn create_algorithm(
    kind: AlgorithmKind,
    n_taylor_terms: usize,
) -> Result<Box<dyn DeconvolutionAlgorithm>> {
    match kind {
        AlgorithmKind::Hogbom => Ok(Box::new(Hogbom::new())),
        AlgorithmKind::Msmfs => {
            if n_taylor_terms == 0 {
                return Err(SynthesisError::InvalidParameter {
                    name: "ntaylorterms",
                    value: 0.0,
                    reason: "must be at least 1",
                });
            }
            Ok(Box::new(MultiTermClean::new(n_taylor_terms)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names_case_insensitively() {
        assert_eq!("hogbom".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::Hogbom);
        assert_eq!("MSMFS".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::Msmfs);
        assert_eq!(AlgorithmKind::Msmfs.to_string(), "msmfs");
    }

    #[test]
    fn rejects_unknown_names() {
        for name in ["test", "clark", ""] {
            let err = name.parse::<AlgorithmKind>().unwrap_err();
            assert!(matches!(err, SynthesisError::UnknownAlgorithm { .. }));
        }
    }

    #[test]
    fn store_layout_follows_algorithm() {
        assert_eq!(
            AlgorithmKind::Hogbom.image_store_kind(3),
            ImageStoreKind::SingleTerm
        );
        assert_eq!(
            AlgorithmKind::Msmfs.image_store_kind(2),
            ImageStoreKind::MultiTerm { n_taylor_terms: 2 }
        );
    }

    #[test]
    fn factory_builds_matching_kernels() {
        let hogbom = create_algorithm(AlgorithmKind::Hogbom, 1).unwrap();
        assert_eq!(hogbom.algorithm_name(), "hogbom");
        assert_eq!(hogbom.n_taylor_terms(), 1);

        let msmfs = create_algorithm(AlgorithmKind::Msmfs, 2).unwrap();
        assert_eq!(msmfs.algorithm_name(), "msmfs");
        assert_eq!(msmfs.n_taylor_terms(), 2);

        assert!(create_algorithm(AlgorithmKind::Msmfs, 0).is_err());
    }
}
