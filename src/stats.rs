//! Small statistics helpers shared by the calibrator and Maverick
//!
//! Acceptance is modelled as a Beta posterior over fractional successes,
//! starting from the uninformative prior Beta(1, 1).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use statrs::distribution::{Beta, ContinuousCDF};

/// Beta posterior over an acceptance rate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AcceptancePosterior {
    /// successes + 1
    pub alpha: f64,
    /// failures + 1
    pub beta: f64,
}

impl Default for AcceptancePosterior {
    fn default() -> Self {
        Self { alpha: 1.0, beta: 1.0 }
    }
}

impl AcceptancePosterior {
    /// Update with partial success (fractional credit)
    pub fn update_partial(&mut self, credit: f64) {
        let credit = credit.clamp(0.0, 1.0);
        self.alpha += credit;
        self.beta += 1.0 - credit;
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// 95% credible interval
    pub fn credible_interval_95(&self) -> (f64, f64) {
        match Beta::new(self.alpha, self.beta) {
            Ok(dist) => (dist.inverse_cdf(0.025), dist.inverse_cdf(0.975)),
            Err(_) => (0.0, 1.0),
        }
    }
}

/// Deterministic membership in a treatment slice
///
/// Hashes `salt:decision_id` and maps the first 8 bytes to [0, 1); the
/// decision is in the slice when that value falls below `ratio`.
pub fn in_slice(salt: &str, decision_id: &str, ratio: f64) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(decision_id.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let unit = u64::from_be_bytes(head) as f64 / (u64::MAX as f64 + 1.0);
    unit < ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posterior_interval_narrows_with_data() {
        let mut small = AcceptancePosterior::default();
        let mut large = AcceptancePosterior::default();
        for _ in 0..5 {
            small.update_partial(1.0);
        }
        for _ in 0..500 {
            large.update_partial(1.0);
        }
        let (lo_s, hi_s) = small.credible_interval_95();
        let (lo_l, hi_l) = large.credible_interval_95();
        assert!(hi_l - lo_l < hi_s - lo_s);
        assert!(large.mean() > 0.99);
    }

    #[test]
    fn test_partial_credit_splits_mass() {
        let mut p = AcceptancePosterior::default();
        p.update_partial(0.5);
        assert_eq!(p.alpha, 1.5);
        assert_eq!(p.beta, 1.5);
    }

    #[test]
    fn test_slice_is_deterministic_and_proportional() {
        assert_eq!(in_slice("h1", "d1", 0.5), in_slice("h1", "d1", 0.5));
        assert!(!in_slice("h1", "d1", 0.0));
        assert!(in_slice("h1", "d1", 1.0));

        let hits = (0..2000)
            .filter(|i| in_slice("h1", &format!("decision-{}", i), 0.2))
            .count();
        assert!((300..500).contains(&hits), "hits = {}", hits);
    }
}
