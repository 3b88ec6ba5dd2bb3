//! View-time duplicate collapse.
//!
//! Some producers re-emit the same listing across crawl runs without a stable
//! external id. Listings are grouped by a fallback identity chain and a single
//! representative per identity is kept.

use std::cmp::Ordering;
use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::Listing;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentityKey {
    SourceRef(String),
    External { platform: String, external_id: String },
    Fingerprint(String),
}

pub fn identity_key(listing: &Listing) -> IdentityKey {
    if let Some(source_ref) = &listing.source_ref {
        return IdentityKey::SourceRef(source_ref.clone());
    }
    if let Some(external_id) = &listing.external_id {
        return IdentityKey::External {
            platform: listing.platform_code.clone().unwrap_or_default(),
            external_id: external_id.clone(),
        };
    }
    IdentityKey::Fingerprint(content_fingerprint(listing))
}

/// SHA-256 over (platform, address, rent, deposit, room_count, floor).
pub fn content_fingerprint(listing: &Listing) -> String {
    fn num(v: Option<f64>) -> String {
        v.map(|n| n.to_string()).unwrap_or_default()
    }
    fn int(v: Option<i32>) -> String {
        v.map(|n| n.to_string()).unwrap_or_default()
    }

    let address = listing
        .address_text
        .as_deref()
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .or_else(|| listing.address_code.clone())
        .unwrap_or_default();
    let material = [
        listing.platform_code.clone().unwrap_or_default(),
        address,
        num(listing.rent_amount),
        num(listing.deposit_amount),
        int(listing.room_count),
        int(listing.floor),
    ]
    .join("|");

    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

/// Larger area wins, then newest `created_at`, then larger id. Absent values
/// sort lowest.
fn representative_order(a: &Listing, b: &Listing) -> Ordering {
    let by_area = match (a.preferred_area(), b.preferred_area()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    };
    by_area
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Keeps exactly one listing per identity key. Which row survives depends
/// only on the rows themselves; output follows the order in which each
/// identity was first seen.
pub fn collapse_duplicates(listings: Vec<Listing>) -> Vec<Listing> {
    let mut order: Vec<IdentityKey> = Vec::new();
    let mut best: HashMap<IdentityKey, Listing> = HashMap::new();

    for listing in listings {
        let key = identity_key(&listing);
        match best.get_mut(&key) {
            Some(current) => {
                if representative_order(&listing, current) == Ordering::Greater {
                    *current = listing;
                }
            }
            None => {
                order.push(key.clone());
                best.insert(key, listing);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| best.remove(&key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn row(id: i64, source_ref: Option<&str>, area: Option<f64>, day: u32) -> Listing {
        Listing {
            source_ref: source_ref.map(str::to_string),
            area_exclusive_m2: area,
            created_at: Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).single(),
            ..Listing::with_id(id)
        }
    }

    #[test]
    fn one_survivor_per_identity_with_largest_area() {
        let rows = vec![
            row(1, Some("https://p/1"), Some(30.0), 1),
            row(2, Some("https://p/1"), Some(33.0), 1),
            row(3, Some("https://p/1"), None, 5),
            row(4, Some("https://p/2"), Some(20.0), 1),
        ];
        let kept = collapse_duplicates(rows);
        let ids: Vec<_> = kept.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn ties_on_area_go_to_newest_row_regardless_of_input_order() {
        let forward = vec![
            row(1, Some("x"), Some(30.0), 1),
            row(2, Some("x"), Some(30.0), 9),
            row(3, Some("x"), Some(30.0), 4),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        assert_eq!(collapse_duplicates(forward)[0].id, 2);
        assert_eq!(collapse_duplicates(backward)[0].id, 2);
    }

    #[test]
    fn fingerprint_identifies_rows_without_stable_ids() {
        let base = Listing {
            platform_code: Some("dabang".into()),
            address_text: Some("Seoul  Gangnam-gu Yeoksam-dong".into()),
            rent_amount: Some(55.0),
            deposit_amount: Some(500.0),
            room_count: Some(1),
            floor: Some(4),
            ..Listing::with_id(10)
        };
        let mut reemitted = base.clone();
        reemitted.id = 11;
        reemitted.address_text = Some("seoul gangnam-gu yeoksam-dong".into());
        reemitted.area_gross_m2 = Some(40.0);

        let mut other_floor = base.clone();
        other_floor.id = 12;
        other_floor.floor = Some(5);

        assert_eq!(identity_key(&base), identity_key(&reemitted));
        assert_ne!(identity_key(&base), identity_key(&other_floor));

        let kept = collapse_duplicates(vec![base, reemitted, other_floor]);
        let ids: Vec<_> = kept.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![11, 12]);
    }

    #[test]
    fn external_id_is_scoped_by_platform() {
        let a = Listing {
            platform_code: Some("zigbang".into()),
            external_id: Some("100".into()),
            ..Listing::with_id(1)
        };
        let b = Listing {
            platform_code: Some("dabang".into()),
            external_id: Some("100".into()),
            ..Listing::with_id(2)
        };
        assert_eq!(collapse_duplicates(vec![a, b]).len(), 2);
    }

    #[test]
    fn output_follows_first_seen_identity_order() {
        let rows = vec![
            row(5, Some("b"), Some(20.0), 1),
            row(1, Some("a"), Some(20.0), 1),
            row(6, Some("b"), Some(25.0), 1),
        ];
        let mut reordered = rows.clone();
        reordered.swap(0, 1);

        let ids = |kept: Vec<Listing>| kept.iter().map(|l| l.id).collect::<Vec<_>>();
        assert_eq!(ids(collapse_duplicates(rows)), vec![6, 1]);
        assert_eq!(ids(collapse_duplicates(reordered)), vec![1, 6]);
    }
}
