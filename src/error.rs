use thiserror::Error;

/// Unified error type for `synthcycle` operations.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// Raised when a required configuration field is absent.
    #[error("{field} not specified")]
    MissingField {
        /// Name of the record key that was expected.
        field: &'static str,
    },

    /// Raised when a deconvolution algorithm name is not recognised.
    #[error("unknown algorithm: {name}")]
    UnknownAlgorithm { name: String },

    /// Raised when a record field holds a value of an incompatible type.
    #[error("field `{field}` must be of type {expected}")]
    FieldType {
        field: String,
        expected: &'static str,
    },

    /// Raised when a numeric parameter is outside of its allowed range.
    #[error("invalid value {value} for `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// Raised when an operation is called from the wrong lifecycle state.
    #[error("cannot {operation} while the deconvolver is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Raised when an image (or a starting model) does not exist in the store.
    #[error("image `{name}` does not exist")]
    ImageNotFound { name: String },

    /// Raised when another handle currently holds the lock on an image.
    #[error("image `{name}` is locked by another process")]
    ImageLocked { name: String },

    /// Raised when an image exists but cannot be used as requested.
    #[error("image `{name}` is unavailable: {reason}")]
    ImageStoreUnavailable { name: String, reason: String },

    /// Raised when the visibility data cannot be opened or iterated.
    #[error("visibility data unavailable: {reason}")]
    VisibilityUnavailable { reason: String },

    /// Raised when a major cycle is requested before any image was defined.
    #[error("an image must be defined before running a major cycle")]
    NoImageDefined,

    /// Raised when provided arrays or image planes have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when linear algebra operations encounter a singular system.
    #[error("matrix in {context} is singular")]
    SingularMatrix { context: &'static str },

    /// Raised when numerical routines produce NaN or infinities.
    #[error("encountered NaN during {context}")]
    NumericalError { context: &'static str },

    /// Errors raised by externally supplied kernels, passed through untouched.
    #[error(transparent)]
    External(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl SynthesisError {
    /// Helper for configuration records lacking a required key.
    pub fn missing_field(field: &'static str) -> Self {
        Self::MissingField { field }
    }

    /// Helper to format a [`DimensionMismatch`](SynthesisError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for lifecycle violations in the deconvolver state machine.
    pub fn invalid_state(operation: &'static str, state: &'static str) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularMatrix { context }
    }

    pub(crate) fn field_type(field: &str, expected: &'static str) -> Self {
        Self::FieldType {
            field: field.to_string(),
            expected,
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, SynthesisError>;
