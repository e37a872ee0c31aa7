//! The authoritative drivable filter: which OSM ways count as streets a
//! private motor vehicle can cover.

use std::collections::BTreeMap;

pub const EXCLUDED_HIGHWAY_TYPES: &[&str] = &[
    "footway",
    "path",
    "steps",
    "pedestrian",
    "bridleway",
    "cycleway",
    "corridor",
    "platform",
    "raceway",
    "proposed",
    "construction",
    "track",
    "service",
    "alley",
    "driveway",
    "parking_aisle",
];

pub const EXCLUDED_ACCESS_TYPES: &[&str] = &[
    "private",
    "no",
    "customers",
    "delivery",
    "agricultural",
    "forestry",
    "destination",
    "permit",
];

pub const EXCLUDED_SERVICE_TYPES: &[&str] = &["parking_aisle", "driveway"];

/// OSM tag values can be semicolon-joined lists; any excluded member
/// disqualifies the way.
fn values(tags: &BTreeMap<String, String>, key: &str) -> Vec<String> {
    tags.get(key)
        .map(|v| v.split(';').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

fn any_excluded(tags: &BTreeMap<String, String>, key: &str, excluded: &[&str]) -> bool {
    values(tags, key).iter().any(|v| excluded.contains(&v.as_str()))
}

fn is(tags: &BTreeMap<String, String>, key: &str, value: &str) -> bool {
    values(tags, key).iter().any(|v| v == value)
}

pub fn is_drivable(tags: &BTreeMap<String, String>) -> bool {
    if values(tags, "highway").is_empty() {
        return false;
    }
    if any_excluded(tags, "highway", EXCLUDED_HIGHWAY_TYPES) {
        return false;
    }
    if any_excluded(tags, "access", EXCLUDED_ACCESS_TYPES) {
        return false;
    }
    if any_excluded(tags, "service", EXCLUDED_SERVICE_TYPES) {
        return false;
    }
    if is(tags, "area", "yes") {
        return false;
    }
    if is(tags, "motor_vehicle", "no") || is(tags, "motorcar", "no") {
        return false;
    }
    !is(tags, "vehicle", "no")
}

/// Whether the way is one-way for driving.
pub fn is_oneway(tags: &BTreeMap<String, String>) -> bool {
    matches!(
        tags.get("oneway").map(String::as_str),
        Some("yes") | Some("true") | Some("1") | Some("-1")
    )
}
