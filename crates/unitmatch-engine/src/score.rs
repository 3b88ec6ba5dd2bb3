//! Pairwise scoring.
//!
//! Five sub-scorers each map a pair of listings onto 0..=100. All of them are
//! total and symmetric: missing data lowers the score to a fixed floor and is
//! recorded as a [`DataNote`], never raised as an error.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use unitmatch_core::{AreaKind, Listing, ListingId, MatchStatus};

use crate::rules::{AreaRules, DistanceRules, PriceRules, RulesConfig, Thresholds};

const EARTH_RADIUS_M: f64 = 6_371_008.8;
const ADDRESS_CODE_PREFIX: usize = 8;
const ADDRESS_TEXT_PREFIX: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataNote {
    MissingAddress,
    MissingCoordinates,
    MissingArea,
    MissingRent,
}

/// Audit trail for one pair, serialized as the pair's `reason_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairReason {
    pub forced_match: bool,
    pub address_score: f64,
    pub distance_score: f64,
    pub area_score: f64,
    pub price_score: f64,
    pub attribute_score: f64,
    pub weighted_score: f64,
    pub distance_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<DataNote>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPair {
    pub source_listing_id: ListingId,
    pub target_listing_id: ListingId,
    pub score: i32,
    pub status: MatchStatus,
    pub distance_score: f64,
    pub address_score: f64,
    pub area_score: f64,
    pub price_score: f64,
    pub attribute_score: f64,
    #[serde(rename = "reason_json")]
    pub reason: PairReason,
}

/// Scores pairs against one immutable rules value. Cheap to share across
/// scoring threads.
#[derive(Debug, Clone, Copy)]
pub struct PairScorer<'a> {
    rules: &'a RulesConfig,
}

impl<'a> PairScorer<'a> {
    pub fn new(rules: &'a RulesConfig) -> Self {
        Self { rules }
    }

    pub fn score(&self, a: &Listing, b: &Listing) -> ScoredPair {
        let address = address_score(a, b);
        let distance_m = distance_meters(a, b);
        let distance = distance_score(distance_m, &self.rules.distance);
        let area = area_score(a, b, &self.rules.area);
        let price = price_score(a, b, &self.rules.price);
        let attribute = attribute_score(a, b);

        let w = &self.rules.weights;
        let weighted = w.address * address
            + w.distance * distance
            + w.area * area
            + w.price * price
            + w.attribute * attribute;
        let score = weighted.clamp(0.0, 100.0).round() as i32;
        let forced = is_forced_match(a, b);
        let status = classify(score, forced, &self.rules.threshold);

        let mut notes = Vec::new();
        if a.address_code.is_none() && a.address_text.is_none()
            || b.address_code.is_none() && b.address_text.is_none()
        {
            notes.push(DataNote::MissingAddress);
        }
        if distance_m.is_none() {
            notes.push(DataNote::MissingCoordinates);
        }
        if area_range(a).is_none() || area_range(b).is_none() {
            notes.push(DataNote::MissingArea);
        }
        if a.rent_amount.is_none() || b.rent_amount.is_none() {
            notes.push(DataNote::MissingRent);
        }

        let (source, target) = if a.id <= b.id { (a.id, b.id) } else { (b.id, a.id) };
        ScoredPair {
            source_listing_id: source,
            target_listing_id: target,
            score,
            status,
            distance_score: distance,
            address_score: address,
            area_score: area,
            price_score: price,
            attribute_score: attribute,
            reason: PairReason {
                forced_match: forced,
                address_score: address,
                distance_score: distance,
                area_score: area,
                price_score: price,
                attribute_score: attribute,
                weighted_score: weighted,
                distance_m,
                notes,
            },
        }
    }
}

/// Same platform and the same platform-side id on both sides.
pub fn is_forced_match(a: &Listing, b: &Listing) -> bool {
    match (a.platform_identity(), b.platform_identity()) {
        (Some((pa, ea)), Some((pb, eb))) => pa == pb && ea == eb,
        _ => false,
    }
}

pub fn classify(score: i32, forced: bool, threshold: &Thresholds) -> MatchStatus {
    let score = f64::from(score);
    if forced || score >= threshold.auto_match {
        MatchStatus::AutoMatch
    } else if score >= threshold.review_required {
        MatchStatus::ReviewRequired
    } else {
        MatchStatus::Distinct
    }
}

// ---------------------------------------------------------------- address

pub fn address_score(a: &Listing, b: &Listing) -> f64 {
    let code_a = a.address_code.as_deref().map(str::trim).filter(|c| !c.is_empty());
    let code_b = b.address_code.as_deref().map(str::trim).filter(|c| !c.is_empty());
    if let (Some(ca), Some(cb)) = (code_a, code_b) {
        if ca == cb {
            return 100.0;
        }
        if shared_prefix(ca, cb, ADDRESS_CODE_PREFIX) {
            return 70.0;
        }
    }

    match (
        a.address_text.as_deref().map(normalize_address),
        b.address_text.as_deref().map(normalize_address),
    ) {
        (Some(ta), Some(tb)) if !ta.is_empty() && !tb.is_empty() => text_similarity(&ta, &tb),
        _ => 0.0,
    }
}

fn normalize_address(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn shared_prefix(a: &str, b: &str, len: usize) -> bool {
    let pa: Vec<char> = a.chars().take(len).collect();
    let pb: Vec<char> = b.chars().take(len).collect();
    pa.len() == len && pa == pb
}

fn text_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 100.0;
    }
    if a.contains(b) || b.contains(a) {
        return 72.0;
    }
    if shared_prefix(a, b, ADDRESS_TEXT_PREFIX) {
        return 40.0;
    }
    let ta: HashSet<&str> = a.split(' ').collect();
    let tb: HashSet<&str> = b.split(' ').collect();
    let union = ta.union(&tb).count();
    let overlap = if union == 0 {
        0.0
    } else {
        ta.intersection(&tb).count() as f64 / union as f64
    };
    8.0 + 52.0 * overlap
}

// ---------------------------------------------------------------- distance

pub fn haversine_m((lat1, lng1): (f64, f64), (lat2, lng2): (f64, f64)) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lng2 - lng1).to_radians();
    let h = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

pub fn distance_meters(a: &Listing, b: &Listing) -> Option<f64> {
    Some(haversine_m(a.coordinates()?, b.coordinates()?))
}

/// Piecewise-linear falloff: flat at 100 up to `exact_m`, then three linear
/// segments down to 0 at `zero_m`.
pub fn distance_score(distance_m: Option<f64>, rules: &DistanceRules) -> f64 {
    let Some(d) = distance_m else {
        return rules.missing_score;
    };
    if d <= rules.exact_m {
        100.0
    } else if d <= rules.near_m {
        lerp(100.0, rules.near_floor, (d - rules.exact_m) / (rules.near_m - rules.exact_m))
    } else if d <= rules.far_m {
        lerp(rules.near_floor, rules.far_floor, (d - rules.near_m) / (rules.far_m - rules.near_m))
    } else {
        lerp(rules.far_floor, 0.0, (d - rules.far_m) / (rules.zero_m - rules.far_m)).max(0.0)
    }
}

fn lerp(from: f64, to: f64, t: f64) -> f64 {
    from + (to - from) * t.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------- area

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaRange {
    pub min: f64,
    pub max: f64,
    pub point: f64,
    pub kind: AreaKind,
}

fn range_from(point: Option<f64>, min: Option<f64>, max: Option<f64>, kind: AreaKind) -> Option<AreaRange> {
    let positive = |v: Option<f64>| v.filter(|x| *x > 0.0);
    let (point, min, max) = (positive(point), positive(min), positive(max));
    let lo = min.or(point).or(max)?;
    let hi = max.or(point).or(min)?;
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    Some(AreaRange {
        min: lo,
        max: hi,
        point: point.unwrap_or((lo + hi) / 2.0),
        kind,
    })
}

/// Exclusive figures win over gross ones, which win over the unqualified
/// point (typed by its claimed kind).
pub fn area_range(listing: &Listing) -> Option<AreaRange> {
    range_from(
        listing.area_exclusive_m2,
        listing.area_exclusive_min_m2,
        listing.area_exclusive_max_m2,
        AreaKind::Exclusive,
    )
    .or_else(|| {
        range_from(
            listing.area_gross_m2,
            listing.area_gross_min_m2,
            listing.area_gross_max_m2,
            AreaKind::Gross,
        )
    })
    .or_else(|| range_from(listing.area_m2, None, None, listing.area_claimed))
}

fn relative_diff(a: f64, b: f64) -> f64 {
    let max = a.abs().max(b.abs());
    if max == 0.0 {
        0.0
    } else {
        (a - b).abs() / max
    }
}

pub fn area_score(a: &Listing, b: &Listing, rules: &AreaRules) -> f64 {
    let (Some(ra), Some(rb)) = (area_range(a), area_range(b)) else {
        return rules.missing_score;
    };

    match (ra.kind, rb.kind) {
        (AreaKind::Exclusive, AreaKind::Exclusive) => {
            let rel = relative_diff(ra.point, rb.point);
            let tol = rules.exclusive_tolerance;
            if rel <= tol {
                100.0
            } else if rel <= tol * rules.decay_factor {
                lerp(100.0, rules.decay_floor, (rel - tol) / (tol * (rules.decay_factor - 1.0)))
            } else {
                (rules.residual_cap * (1.0 - rel)).clamp(0.0, rules.residual_cap)
            }
        }
        (AreaKind::Exclusive, AreaKind::Gross) | (AreaKind::Gross, AreaKind::Exclusive)
            if common_area_ratio(ra.point, rb.point, rules) =>
        {
            rules.gross_score
        }
        _ => overlap_score(ra, rb, rules),
    }
}

/// Gross area usually exceeds exclusive area by a building's common-area
/// share; a ratio inside that band is treated as the same unit.
fn common_area_ratio(x: f64, y: f64, rules: &AreaRules) -> bool {
    let ratio = x.max(y) / x.min(y);
    (rules.gross_ratio_min..=rules.gross_ratio_max).contains(&ratio)
}

fn overlap_score(a: AreaRange, b: AreaRange, rules: &AreaRules) -> f64 {
    let widen = |r: AreaRange| {
        if r.max - r.min <= f64::EPSILON {
            let pad = r.point * rules.exclusive_tolerance / 2.0;
            (r.min - pad, r.max + pad)
        } else {
            (r.min, r.max)
        }
    };
    let (a_lo, a_hi) = widen(a);
    let (b_lo, b_hi) = widen(b);
    let overlap = (a_hi.min(b_hi) - a_lo.max(b_lo)).max(0.0);
    let union = a_hi.max(b_hi) - a_lo.min(b_lo);
    let ratio = if union <= 0.0 { 1.0 } else { overlap / union };

    if ratio >= rules.overlap_min_ratio {
        lerp(
            rules.overlap_floor,
            100.0,
            (ratio - rules.overlap_min_ratio) / (1.0 - rules.overlap_min_ratio),
        )
    } else {
        rules.no_overlap_score
    }
}

// ---------------------------------------------------------------- price

fn tolerance_score(a: f64, b: f64, tolerance: f64, floor: f64) -> f64 {
    let rel = relative_diff(a, b);
    100.0 - (100.0 - floor) * (rel / tolerance).min(1.0)
}

pub fn price_score(a: &Listing, b: &Listing, rules: &PriceRules) -> f64 {
    let (rent_a, rent_b) = match (a.rent_amount, b.rent_amount) {
        (None, None) => return rules.both_missing_score,
        (Some(x), Some(y)) => (x, y),
        _ => return rules.one_missing_score,
    };
    let rent = tolerance_score(rent_a, rent_b, rules.rent_tolerance, rules.mismatch_floor);

    match (a.deposit_amount, b.deposit_amount) {
        (Some(da), Some(db)) => {
            let deposit = tolerance_score(da, db, rules.deposit_tolerance, rules.mismatch_floor);
            deposit + rules.rent_weight_with_deposit * (rent - deposit)
        }
        _ => rules.rent_weight_without_deposit * rent + rules.without_deposit_bonus,
    }
}

// ---------------------------------------------------------------- attributes

pub fn attribute_score(a: &Listing, b: &Listing) -> f64 {
    let rooms = match (a.room_count, b.room_count) {
        (Some(x), Some(y)) => match x.abs_diff(y) {
            0 => 40.0,
            1 => 25.0,
            2 => 12.0,
            _ => 10.0,
        },
        _ => 10.0,
    };

    let floor = match (a.floor, b.floor) {
        (Some(x), Some(y)) => {
            let diff = x.abs_diff(y);
            let tallest = a.total_floor.into_iter().chain(b.total_floor).max().unwrap_or(0);
            if diff == 0 {
                30.0
            } else if diff <= 1 {
                20.0
            } else if tallest > 0 && f64::from(diff) / f64::from(tallest) < 0.03 {
                12.0
            } else {
                10.0
            }
        }
        _ => 10.0,
    };

    let lease = match (&a.lease_type, &b.lease_type) {
        (Some(x), Some(y)) if x == y => 30.0,
        _ => 0.0,
    };

    f64::min(rooms + floor + lease, 100.0)
}
