use std::fmt;

/// Contract violations surfaced by the scoring core.
///
/// Numerically degenerate inputs with a defined fallback (zero-norm cosine,
/// zero-variance rows, fully masked attention rows) are handled in place and
/// never produce one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// A signal kind or numeric feature name with no embedding mapping.
    UnknownFeatureKind(String),
    /// Tensor dimensions disagree with each other or with the configuration.
    ShapeMismatch {
        op: &'static str,
        expected: String,
        found: String,
    },
    InvalidTemperature(f64),
    InvalidK { k: usize, max: usize },
    InvalidConfig(String),
    InvalidTimestamp(String),
    /// Snapshot was trained with a numeric transform table the code no longer applies.
    TransformMismatch { feature: String, expected: String, found: String },
    /// A numeric input outside its documented domain (e.g. strength not in [0, 1]).
    InvalidValue { field: String, value: f64 },
    EmptySequence,
    Serde(String),
}

impl CoreError {
    pub(crate) fn shape(op: &'static str, expected: impl fmt::Display, found: impl fmt::Display) -> Self {
        CoreError::ShapeMismatch {
            op,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::UnknownFeatureKind(kind) => write!(f, "unknown feature kind: {kind:?}"),
            CoreError::ShapeMismatch { op, expected, found } => {
                write!(f, "shape mismatch in {op}: expected {expected}, found {found}")
            }
            CoreError::InvalidTemperature(t) => write!(f, "invalid temperature {t}: must be > 0"),
            CoreError::InvalidK { k, max } => write!(f, "invalid k {k}: must be in 1..={max}"),
            CoreError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            CoreError::InvalidTimestamp(ts) => write!(f, "invalid timestamp: {ts:?}"),
            CoreError::TransformMismatch { feature, expected, found } => write!(
                f,
                "transform mismatch for {feature}: code applies {expected}, snapshot has {found}"
            ),
            CoreError::InvalidValue { field, value } => write!(f, "invalid value for {field}: {value}"),
            CoreError::EmptySequence => write!(f, "empty signal sequence"),
            CoreError::Serde(msg) => write!(f, "serialization error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serde(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
