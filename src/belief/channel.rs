use serde::{Deserialize, Serialize};

/// Smallest shape parameter a Beta channel may hold.
pub const MIN_SHAPE: f64 = 1e-6;
/// Smallest observation variance accepted by a Gaussian update.
pub const MIN_NOISE: f64 = 1e-12;

/// Beta-distributed estimate of a probability.
///
/// Successes add to `alpha`, failures to `beta`. Both stay strictly
/// positive: counts are non-negative and invalid observations are dropped.
///
/// # Examples
///
/// ```
/// use ccp_risk_engine::belief::channel::BetaChannel;
///
/// let mut risk = BetaChannel::new(1.0, 9.0);
/// assert!((risk.mean() - 0.1).abs() < 1e-12);
/// risk.observe(1.0, 0.0);
/// assert!((risk.mean() - 2.0 / 11.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaChannel {
    alpha: f64,
    beta: f64,
}

impl BetaChannel {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            alpha: sanitize_shape(alpha),
            beta: sanitize_shape(beta),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn variance(&self) -> f64 {
        let n = self.alpha + self.beta;
        self.alpha * self.beta / (n * n * (n + 1.0))
    }

    /// Conjugate update with fractional pseudo-counts.
    /// Returns `false` (and leaves the channel untouched) when either
    /// count is negative or not finite.
    pub fn observe(&mut self, successes: f64, failures: f64) -> bool {
        let valid = |x: f64| x.is_finite() && x >= 0.0;
        if !valid(successes) || !valid(failures) {
            return false;
        }
        self.alpha += successes;
        self.beta += failures;
        true
    }

    /// Record a signal in `[0, 1]` worth `weight` observations.
    pub fn observe_signal(&mut self, signal: f64, weight: f64) -> bool {
        if !signal.is_finite() {
            return false;
        }
        let s = signal.clamp(0.0, 1.0);
        self.observe(s * weight, (1.0 - s) * weight)
    }

    /// Exponential forgetting toward `prior`: `x <- lambda x + (1 - lambda) x0`.
    pub fn decay_toward(&mut self, prior: &BetaChannel, lambda: f64) {
        if !(lambda.is_finite() && lambda > 0.0 && lambda <= 1.0) {
            return;
        }
        self.alpha = sanitize_shape(lambda * self.alpha + (1.0 - lambda) * prior.alpha);
        self.beta = sanitize_shape(lambda * self.beta + (1.0 - lambda) * prior.beta);
    }

    pub fn is_valid(&self) -> bool {
        self.alpha.is_finite() && self.beta.is_finite() && self.alpha > 0.0 && self.beta > 0.0
    }
}

fn sanitize_shape(x: f64) -> f64 {
    if x.is_finite() {
        x.max(MIN_SHAPE)
    } else {
        MIN_SHAPE
    }
}

/// Mean/variance estimate of a real-valued quantity, updated as a
/// one-dimensional Kalman filter with a random-walk state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianChannel {
    mean: f64,
    variance: f64,
}

impl GaussianChannel {
    pub fn new(mean: f64, variance: f64) -> Self {
        Self {
            mean: if mean.is_finite() { mean } else { 0.0 },
            variance: if variance.is_finite() { variance.max(0.0) } else { 0.0 },
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Time update: the state drifts, so uncertainty grows.
    pub fn predict(&mut self, process_noise: f64) {
        if process_noise.is_finite() && process_noise > 0.0 {
            self.variance += process_noise;
        }
    }

    /// Measurement update with observation variance `noise`.
    /// Returns `false` for a non-finite value.
    pub fn observe(&mut self, value: f64, noise: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let r = if noise.is_finite() { noise.max(MIN_NOISE) } else { MIN_NOISE };
        let gain = self.variance / (self.variance + r);
        self.mean += gain * (value - self.mean);
        // (1 - K) P = P r / (P + r), non-negative for P >= 0.
        self.variance = (self.variance * r / (self.variance + r)).max(0.0);
        true
    }

    /// Three-point Gauss-Hermite rule: `(value, weight)` pairs whose
    /// weighted sum integrates polynomials up to degree 5 exactly.
    /// Points are clamped at `floor`.
    pub fn sigma_points(&self, floor: f64) -> [(f64, f64); 3] {
        let spread = (3.0 * self.variance).sqrt();
        [
            ((self.mean - spread).max(floor), 1.0 / 6.0),
            (self.mean.max(floor), 2.0 / 3.0),
            ((self.mean + spread).max(floor), 1.0 / 6.0),
        ]
    }

    pub fn is_valid(&self) -> bool {
        self.mean.is_finite() && self.variance.is_finite() && self.variance >= 0.0
    }
}
