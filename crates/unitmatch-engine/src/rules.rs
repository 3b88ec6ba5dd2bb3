//! Scoring rules. A [`RulesConfig`] is built once (defaults or a YAML rules
//! file), validated, and never mutated afterwards; every run snapshots it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ALGORITHM_VERSION: &str = "unitmatch-rules-v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading rules file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rules file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid rules: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub address: f64,
    pub distance: f64,
    pub area: f64,
    pub price: f64,
    pub attribute: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            address: 0.30,
            distance: 0.20,
            area: 0.25,
            price: 0.15,
            attribute: 0.10,
        }
    }
}

impl Weights {
    fn all(&self) -> [f64; 5] {
        [self.address, self.distance, self.area, self.price, self.attribute]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub auto_match: f64,
    pub review_required: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_match: 93.0,
            review_required: 80.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaRules {
    /// Relative difference treated as identical for exclusive-vs-exclusive.
    pub exclusive_tolerance: f64,
    /// Multiple of the tolerance over which the score decays to `decay_floor`.
    pub decay_factor: f64,
    pub decay_floor: f64,
    pub residual_cap: f64,
    pub gross_ratio_min: f64,
    pub gross_ratio_max: f64,
    pub gross_score: f64,
    pub overlap_min_ratio: f64,
    pub overlap_floor: f64,
    pub no_overlap_score: f64,
    pub missing_score: f64,
}

impl Default for AreaRules {
    fn default() -> Self {
        Self {
            exclusive_tolerance: 0.06,
            decay_factor: 1.8,
            decay_floor: 60.0,
            residual_cap: 20.0,
            gross_ratio_min: 1.05,
            gross_ratio_max: 1.35,
            gross_score: 92.0,
            overlap_min_ratio: 0.10,
            overlap_floor: 75.0,
            no_overlap_score: 35.0,
            missing_score: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceRules {
    pub rent_tolerance: f64,
    pub deposit_tolerance: f64,
    pub mismatch_floor: f64,
    pub both_missing_score: f64,
    pub one_missing_score: f64,
    pub rent_weight_with_deposit: f64,
    pub rent_weight_without_deposit: f64,
    pub without_deposit_bonus: f64,
}

impl Default for PriceRules {
    fn default() -> Self {
        Self {
            rent_tolerance: 0.08,
            deposit_tolerance: 0.12,
            mismatch_floor: 30.0,
            both_missing_score: 15.0,
            one_missing_score: 30.0,
            rent_weight_with_deposit: 0.7,
            rent_weight_without_deposit: 0.8,
            without_deposit_bonus: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceRules {
    pub exact_m: f64,
    pub near_m: f64,
    pub far_m: f64,
    /// Distance at which the score reaches 0.
    pub zero_m: f64,
    pub near_floor: f64,
    pub far_floor: f64,
    pub missing_score: f64,
}

impl Default for DistanceRules {
    fn default() -> Self {
        Self {
            exact_m: 20.0,
            near_m: 80.0,
            far_m: 500.0,
            zero_m: 2_000.0,
            near_floor: 90.0,
            far_floor: 45.0,
            missing_score: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockingRules {
    pub price_bucket_width: f64,
    pub area_bucket_width: f64,
    /// Members of one wildcard bucket that are paired before it is flagged
    /// as oversized and truncated.
    pub wildcard_cap: usize,
    /// Batches this small compare every pair and skip blocking.
    pub exhaustive_max_listings: usize,
}

impl Default for BlockingRules {
    fn default() -> Self {
        Self {
            price_bucket_width: 10.0,
            area_bucket_width: 2.0,
            wildcard_cap: 400,
            exhaustive_max_listings: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RulesConfig {
    pub weights: Weights,
    pub threshold: Thresholds,
    pub area: AreaRules,
    pub price: PriceRules,
    pub distance: DistanceRules,
    pub blocking: BlockingRules,
}

/// Rules as persisted on a matcher run and echoed in the output payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesSnapshot {
    pub algorithm_version: String,
    pub weights: Weights,
    pub threshold: Thresholds,
    pub area: AreaRules,
    pub price: PriceRules,
    pub distance: DistanceRules,
    pub blocking: BlockingRules,
}

impl RulesConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let rules: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text)?
        };
        rules.validate()?;
        Ok(rules)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Like [`RulesConfig::load`] but a missing file means built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = self.weights.all();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(
                "weights must be finite and non-negative".into(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::Invalid("weights must not all be zero".into()));
        }
        let t = &self.threshold;
        if !(0.0..=100.0).contains(&t.auto_match) || !(0.0..=100.0).contains(&t.review_required) {
            return Err(ConfigError::Invalid("thresholds must lie in 0..=100".into()));
        }
        if t.review_required > t.auto_match {
            return Err(ConfigError::Invalid(format!(
                "review threshold {} exceeds auto-match threshold {}",
                t.review_required, t.auto_match
            )));
        }
        for (name, tol) in [
            ("area.exclusive_tolerance", self.area.exclusive_tolerance),
            ("price.rent_tolerance", self.price.rent_tolerance),
            ("price.deposit_tolerance", self.price.deposit_tolerance),
        ] {
            if !(tol > 0.0 && tol < 1.0) {
                return Err(ConfigError::Invalid(format!("{name} must lie in (0, 1)")));
            }
        }
        if self.area.decay_factor <= 1.0 {
            return Err(ConfigError::Invalid("area.decay_factor must exceed 1".into()));
        }
        let d = &self.distance;
        if !(d.exact_m < d.near_m && d.near_m < d.far_m && d.far_m < d.zero_m) {
            return Err(ConfigError::Invalid(
                "distance bands must increase: exact < near < far < zero".into(),
            ));
        }
        let b = &self.blocking;
        if b.price_bucket_width <= 0.0 || b.area_bucket_width <= 0.0 {
            return Err(ConfigError::Invalid("bucket widths must be positive".into()));
        }
        if b.wildcard_cap < 2 {
            return Err(ConfigError::Invalid("blocking.wildcard_cap must be at least 2".into()));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> RulesSnapshot {
        RulesSnapshot {
            algorithm_version: ALGORITHM_VERSION.to_string(),
            weights: self.weights.clone(),
            threshold: self.threshold.clone(),
            area: self.area.clone(),
            price: self.price.clone(),
            distance: self.distance.clone(),
            blocking: self.blocking.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_overrides_keep_other_defaults() {
        let rules = RulesConfig::from_yaml_str(
            "threshold:\n  auto_match: 95\nweights:\n  address: 0.4\n",
        )
        .unwrap();
        assert_eq!(rules.threshold.auto_match, 95.0);
        assert_eq!(rules.threshold.review_required, 80.0);
        assert_eq!(rules.weights.address, 0.4);
        assert_eq!(rules.weights.distance, 0.20);
        assert_eq!(rules.area, AreaRules::default());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let err = RulesConfig::from_yaml_str("threshold:\n  auto_match: 70\n  review_required: 80\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn negative_weight_is_rejected() {
        let err = RulesConfig::from_yaml_str("weights:\n  price: -0.1\n").unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn missing_rules_file_falls_back_to_defaults() {
        let rules = RulesConfig::load_or_default(Path::new("/nonexistent/matcher.yaml")).unwrap();
        assert_eq!(rules, RulesConfig::default());
    }

    #[test]
    fn snapshot_carries_algorithm_version_and_all_sections() {
        let value = serde_json::to_value(RulesConfig::default().snapshot()).unwrap();
        assert_eq!(value["algorithm_version"], ALGORITHM_VERSION);
        for key in ["weights", "threshold", "area", "price", "distance", "blocking"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["threshold"]["auto_match"], 93.0);
    }
}
