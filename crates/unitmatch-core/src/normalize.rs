//! Tolerant coercion from scraper-shaped JSON into [`Listing`].
//!
//! Fields are accepted in snake_case or camelCase. Unparseable, empty or
//! non-finite values become `None`; only document shape and listing ids can
//! fail.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AreaKind, InputError, LeaseType, Listing, ListingId};

/// Batch handed to the engine: one collection run's listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDocument {
    pub run_id: String,
    pub listings: Vec<Listing>,
}

pub fn parse_input_document(bytes: &[u8]) -> Result<InputDocument, InputError> {
    let value: Value = serde_json::from_slice(bytes)?;
    input_document_from_value(&value)
}

pub fn input_document_from_value(value: &Value) -> Result<InputDocument, InputError> {
    let obj = value.as_object().ok_or(InputError::NotAnObject)?;
    let run_id = lookup(obj, &["run_id"])
        .and_then(coerce_text)
        .ok_or(InputError::MissingRunId)?;
    let raw_listings = lookup(obj, &["listings"])
        .and_then(Value::as_array)
        .ok_or(InputError::MissingListings)?;

    let mut seen = HashSet::with_capacity(raw_listings.len());
    let mut listings = Vec::with_capacity(raw_listings.len());
    for (index, raw) in raw_listings.iter().enumerate() {
        let raw = raw
            .as_object()
            .ok_or(InputError::ListingNotObject { index })?;
        let listing = normalize_listing(index, raw)?;
        if !seen.insert(listing.id) {
            return Err(InputError::DuplicateListingId { id: listing.id });
        }
        listings.push(listing);
    }

    Ok(InputDocument { run_id, listings })
}

pub fn normalize_listing(index: usize, raw: &Map<String, Value>) -> Result<Listing, InputError> {
    let id = lookup(raw, &["id", "listing_id"])
        .and_then(coerce_id)
        .ok_or(InputError::MissingListingId { index })?;

    let number = |names: &[&str]| lookup(raw, names).and_then(coerce_number);
    let text = |names: &[&str]| lookup(raw, names).and_then(coerce_text);
    let int = |names: &[&str]| lookup(raw, names).and_then(coerce_int);

    let (lat, lng) = valid_coordinates(
        number(&["lat", "latitude"]),
        number(&["lng", "lon", "longitude"]),
    );

    Ok(Listing {
        id,
        platform_code: text(&["platform_code", "platform"]),
        external_id: text(&["external_id"]),
        source_ref: text(&["source_ref"]),
        address_code: text(&["address_code"]),
        address_text: text(&["address_text", "address"]),
        lease_type: text(&["lease_type"]).and_then(|v| LeaseType::parse(&v)),
        rent_amount: number(&["rent_amount", "rent"]),
        deposit_amount: number(&["deposit_amount", "deposit"]),
        area_exclusive_m2: number(&["area_exclusive_m2", "area_exclusive"]),
        area_exclusive_min_m2: number(&["area_exclusive_min_m2", "area_exclusive_min"]),
        area_exclusive_max_m2: number(&["area_exclusive_max_m2", "area_exclusive_max"]),
        area_gross_m2: number(&["area_gross_m2", "area_gross"]),
        area_gross_min_m2: number(&["area_gross_min_m2", "area_gross_min"]),
        area_gross_max_m2: number(&["area_gross_max_m2", "area_gross_max"]),
        area_m2: number(&["area_m2", "area"]),
        area_claimed: text(&["area_claimed", "area_claimed_kind", "area_kind"])
            .map(|v| AreaKind::parse(&v))
            .unwrap_or_default(),
        room_count: int(&["room_count", "rooms"]),
        floor: lookup(raw, &["floor"]).and_then(coerce_floor),
        total_floor: int(&["total_floor", "total_floors"]),
        lat,
        lng,
        created_at: lookup(raw, &["created_at"]).and_then(coerce_timestamp),
        image_count: int(&["image_count"]),
    })
}

/// First non-null value under any of `names` or their camelCase forms.
fn lookup<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .flat_map(|name| [name.to_string(), snake_to_camel(name)])
        .filter_map(|key| obj.get(&key))
        .find(|v| !v.is_null())
}

fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

pub fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses numbers out of noisy scraper encodings such as `"1,000만원"` or
/// `" 52.3 m2"`.
pub fn coerce_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_numeric_prefix(s),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn parse_numeric_prefix(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | '_') && !c.is_whitespace())
        .collect();
    let mut end = 0;
    let mut seen_dot = false;
    let mut seen_digit = false;
    for (i, c) in cleaned.char_indices() {
        match c {
            '+' | '-' if i == 0 => {}
            '.' if !seen_dot => seen_dot = true,
            d if d.is_ascii_digit() => seen_digit = true,
            _ => break,
        }
        end = i + c.len_utf8();
    }
    if !seen_digit {
        return None;
    }
    cleaned[..end].trim_end_matches('.').parse().ok()
}

pub fn coerce_int(value: &Value) -> Option<i32> {
    let n = coerce_number(value)?.trunc();
    (n >= i32::MIN as f64 && n <= i32::MAX as f64).then_some(n as i32)
}

/// Floors may be written `B1`/`b2` for basements.
fn coerce_floor(value: &Value) -> Option<i32> {
    if let Value::String(s) = value {
        let trimmed = s.trim();
        if let Some(rest) = trimmed.strip_prefix(['B', 'b']) {
            return parse_numeric_prefix(rest)
                .map(|n| -(n.trunc().abs() as i32))
                .filter(|n| *n != 0);
        }
    }
    coerce_int(value)
}

fn coerce_id(value: &Value) -> Option<ListingId> {
    let id = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<ListingId>().ok(),
        _ => None,
    }?;
    (id > 0).then_some(id)
}

fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn valid_coordinates(lat: Option<f64>, lng: Option<f64>) -> (Option<f64>, Option<f64>) {
    let lat = lat.filter(|v| (-90.0..=90.0).contains(v));
    let lng = lng.filter(|v| (-180.0..=180.0).contains(v));
    match (lat, lng) {
        (Some(a), Some(b)) if a == 0.0 && b == 0.0 => (None, None),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snake_and_camel_case_produce_the_same_listing() {
        let snake = json!({
            "run_id": "run-1",
            "listings": [{
                "id": 7, "platform_code": "zigbang", "external_id": "z-7",
                "address_code": "1168010100", "rent_amount": 50, "deposit_amount": "1,000",
                "area_exclusive_m2": 33.1, "room_count": 2, "floor": "3", "total_floor": 12,
                "lat": 37.5, "lng": 127.0, "lease_type": "월세"
            }]
        });
        let camel = json!({
            "runId": "run-1",
            "listings": [{
                "listingId": "7", "platformCode": "zigbang", "externalId": "z-7",
                "addressCode": "1168010100", "rentAmount": "50", "depositAmount": 1000,
                "areaExclusiveM2": "33.1", "roomCount": 2.0, "floor": 3, "totalFloor": "12",
                "lat": 37.5, "lng": 127.0, "leaseType": "monthly"
            }]
        });

        let a = input_document_from_value(&snake).unwrap();
        let b = input_document_from_value(&camel).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.listings[0].deposit_amount, Some(1000.0));
        assert_eq!(a.listings[0].lease_type, Some(LeaseType::Monthly));
    }

    #[test]
    fn noisy_numbers_degrade_to_absent_instead_of_failing() {
        assert_eq!(coerce_number(&json!("1,000만원")), Some(1000.0));
        assert_eq!(coerce_number(&json!(" 52.3 m2")), Some(52.3));
        assert_eq!(coerce_number(&json!("-")), None);
        assert_eq!(coerce_number(&json!("")), None);
        assert_eq!(coerce_number(&json!("협의")), None);
        assert_eq!(coerce_number(&json!(true)), None);
        assert_eq!(coerce_number(&json!(null)), None);
        assert_eq!(coerce_floor(&json!("B1")), Some(-1));
        assert_eq!(coerce_floor(&json!("12층")), Some(12));
    }

    #[test]
    fn missing_or_duplicate_ids_are_input_errors() {
        let missing = json!({"run_id": "r", "listings": [{"rent": 10}]});
        assert!(matches!(
            input_document_from_value(&missing),
            Err(InputError::MissingListingId { index: 0 })
        ));

        let dup = json!({"run_id": "r", "listings": [{"id": 1}, {"id": "1"}]});
        assert!(matches!(
            input_document_from_value(&dup),
            Err(InputError::DuplicateListingId { id: 1 })
        ));

        let no_run = json!({"listings": []});
        assert!(matches!(
            input_document_from_value(&no_run),
            Err(InputError::MissingRunId)
        ));

        assert!(matches!(
            parse_input_document(b"{not json"),
            Err(InputError::Json(_))
        ));
    }

    #[test]
    fn out_of_range_and_null_island_coordinates_are_dropped() {
        let doc = json!({"run_id": "r", "listings": [
            {"id": 1, "lat": 0, "lng": 0},
            {"id": 2, "lat": 95.0, "lng": 127.0},
            {"id": 3, "latitude": "37.51", "longitude": "127.02"}
        ]});
        let parsed = input_document_from_value(&doc).unwrap();
        assert_eq!(parsed.listings[0].coordinates(), None);
        assert_eq!(parsed.listings[1].coordinates(), None);
        assert_eq!(parsed.listings[2].coordinates(), Some((37.51, 127.02)));
    }
}
