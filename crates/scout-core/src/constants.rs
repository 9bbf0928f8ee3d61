/// Default layer-norm epsilon guarding `1 / sqrt(σ² + ε)`.
pub const NORM_EPSILON: f64 = 1e-5;

/// Numerical epsilon for near-zero comparisons (vector norms, scales).
pub const EPSILON: f64 = 1e-12;

/// Base of the sinusoidal positional-encoding frequency ladder.
pub const PE_BASE: f64 = 10_000.0;

/// Default signal half-life in hours (7 days).
pub const DEFAULT_HALF_LIFE_HOURS: f64 = 168.0;

/// Seconds per hour, for timestamp → age conversion.
pub const SECS_PER_HOUR: f64 = 3600.0;

/// Largest magnitude fed to `exp` in the sigmoid head before clamping.
pub const SIGMOID_CLAMP: f64 = 50.0;

/// Intent label thresholds on the 0-100 percentage score.
pub const HIGH_INTENT_THRESHOLD: f64 = 70.0;
pub const MEDIUM_INTENT_THRESHOLD: f64 = 30.0;

/// Surge-ratio denominator guard for profile momentum bucketing.
pub const SURGE_EPSILON: f64 = 1e-8;

/// Default tolerated accuracy drop (fraction) between float and quantized models.
pub const DEFAULT_ACCURACY_TOLERANCE: f64 = 0.01;
