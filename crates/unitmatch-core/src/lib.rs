//! Core domain model for the rental unit matcher.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod collapse;
pub mod normalize;

pub use collapse::{collapse_duplicates, content_fingerprint, IdentityKey};
pub use normalize::{parse_input_document, InputDocument};

pub const CRATE_NAME: &str = "unitmatch-core";

/// Persisted primary key of a listing row.
pub type ListingId = i64;

/// Which measurement a single area figure claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AreaKind {
    Exclusive,
    Gross,
    #[default]
    Unknown,
}

impl AreaKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exclusive" | "exclusive_area" | "net" | "전용" => Self::Exclusive,
            "gross" | "supply" | "contract" | "공급" => Self::Gross,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseType {
    Monthly,
    Jeonse,
    Sale,
    Other(String),
}

impl LeaseType {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let lease = match trimmed.to_lowercase().as_str() {
            "monthly" | "monthly_rent" | "rent" | "월세" => Self::Monthly,
            "jeonse" | "전세" => Self::Jeonse,
            "sale" | "매매" => Self::Sale,
            other => Self::Other(other.to_string()),
        };
        Some(lease)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Monthly => "monthly",
            Self::Jeonse => "jeonse",
            Self::Sale => "sale",
            Self::Other(raw) => raw.as_str(),
        }
    }
}

/// Strict internal listing record produced by [`normalize`]. Every data field
/// is optional; only `id` is guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Listing {
    pub id: ListingId,
    pub platform_code: Option<String>,
    pub external_id: Option<String>,
    pub source_ref: Option<String>,
    pub address_code: Option<String>,
    pub address_text: Option<String>,
    pub lease_type: Option<LeaseType>,
    pub rent_amount: Option<f64>,
    pub deposit_amount: Option<f64>,
    pub area_exclusive_m2: Option<f64>,
    pub area_exclusive_min_m2: Option<f64>,
    pub area_exclusive_max_m2: Option<f64>,
    pub area_gross_m2: Option<f64>,
    pub area_gross_min_m2: Option<f64>,
    pub area_gross_max_m2: Option<f64>,
    pub area_m2: Option<f64>,
    pub area_claimed: AreaKind,
    pub room_count: Option<i32>,
    pub floor: Option<i32>,
    pub total_floor: Option<i32>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
    pub image_count: Option<i32>,
}

impl Listing {
    pub fn with_id(id: ListingId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.lat?, self.lng?))
    }

    /// `(platform_code, external_id)` when both are present.
    pub fn platform_identity(&self) -> Option<(&str, &str)> {
        Some((self.platform_code.as_deref()?, self.external_id.as_deref()?))
    }

    pub fn exclusive_area(&self) -> Option<f64> {
        representative_point(
            self.area_exclusive_m2,
            self.area_exclusive_min_m2,
            self.area_exclusive_max_m2,
        )
    }

    pub fn gross_area(&self) -> Option<f64> {
        representative_point(
            self.area_gross_m2,
            self.area_gross_min_m2,
            self.area_gross_max_m2,
        )
    }

    /// Exclusive area when known, else gross. The unqualified point is not
    /// used here because its kind is only a claim.
    pub fn preferred_area(&self) -> Option<f64> {
        self.exclusive_area().or_else(|| self.gross_area())
    }
}

fn representative_point(point: Option<f64>, min: Option<f64>, max: Option<f64>) -> Option<f64> {
    match (point, min, max) {
        (Some(p), _, _) => Some(p),
        (None, Some(lo), Some(hi)) => Some((lo + hi) / 2.0),
        (None, lo, hi) => lo.or(hi),
    }
}

/// Outcome of classifying one scored pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    AutoMatch,
    ReviewRequired,
    Distinct,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoMatch => "AUTO_MATCH",
            Self::ReviewRequired => "REVIEW_REQUIRED",
            Self::Distinct => "DISTINCT",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown match status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for MatchStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "AUTO_MATCH" => Ok(Self::AutoMatch),
            "REVIEW_REQUIRED" => Ok(Self::ReviewRequired),
            "DISTINCT" => Ok(Self::Distinct),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Fatal problems with the input document. Data-quality gaps inside a
/// listing are never reported here.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("reading input {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("input is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("input document must be a JSON object")]
    NotAnObject,
    #[error("input document is missing run_id")]
    MissingRunId,
    #[error("input document is missing the listings array")]
    MissingListings,
    #[error("listing #{index} is not a JSON object")]
    ListingNotObject { index: usize },
    #[error("listing #{index} has no usable id")]
    MissingListingId { index: usize },
    #[error("listing id {id} appears more than once")]
    DuplicateListingId { id: ListingId },
}
