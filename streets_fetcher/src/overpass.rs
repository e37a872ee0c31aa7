//! Overpass QL query construction and response parsing.

use std::collections::BTreeMap;

use geo::MultiPolygon;
use serde::Deserialize;

use street_coverage::RawWay;

use crate::filter;

/// Build the Overpass QL query for all highway-tagged ways inside the
/// boundary. Overpass `poly:` filters take `"lat lon lat lon ..."`; areas
/// with multiple rings query each ring and union the result.
pub fn build_query(boundary: &MultiPolygon<f64>, timeout_s: u64) -> String {
    let mut clauses = String::new();
    for polygon in &boundary.0 {
        let ring: Vec<String> = polygon
            .exterior()
            .coords()
            .map(|c| format!("{} {}", c.y, c.x))
            .collect();
        clauses.push_str(&format!("way[\"highway\"](poly:\"{}\");", ring.join(" ")));
    }
    format!("[out:json][timeout:{timeout_s}];({clauses});out geom;")
}

/// Bounding-box fallback when the caller has no polygon. Input order is
/// `[min_lon, min_lat, max_lon, max_lat]`.
pub fn build_bbox_query(bbox: [f64; 4], timeout_s: u64) -> String {
    let [min_lon, min_lat, max_lon, max_lat] = bbox;
    format!(
        "[out:json][timeout:{timeout_s}];way[\"highway\"]({min_lat},{min_lon},{max_lat},{max_lon});out geom;"
    )
}

#[derive(Debug, Deserialize)]
pub struct OverpassResponse {
    pub elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
pub struct OverpassElement {
    #[serde(rename = "type")]
    pub element_type: String,
    pub id: i64,
    #[serde(default)]
    pub geometry: Vec<OverpassPoint>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct OverpassPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Reduce an Overpass response to the drivable way set.
pub fn parse_ways(response: OverpassResponse) -> Vec<RawWay> {
    let mut out = Vec::new();
    for element in response.elements {
        if element.element_type != "way" || element.geometry.len() < 2 {
            continue;
        }
        if !filter::is_drivable(&element.tags) {
            continue;
        }
        out.push(RawWay {
            way_id: element.id,
            points: element.geometry.iter().map(|p| [p.lon, p.lat]).collect(),
            highway: element
                .tags
                .get("highway")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            street_name: element.tags.get("name").cloned().unwrap_or_default(),
            oneway: filter::is_oneway(&element.tags),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    #[test]
    fn query_includes_every_ring() {
        let boundary = MultiPolygon(vec![polygon![
            (x: -96.9, y: 32.7),
            (x: -96.7, y: 32.7),
            (x: -96.7, y: 32.9),
            (x: -96.9, y: 32.9),
        ]]);
        let q = build_query(&boundary, 300);
        assert!(q.starts_with("[out:json][timeout:300];"));
        assert!(q.contains("poly:\"32.7 -96.9"));
        assert!(q.ends_with("out geom;"));
    }

    #[test]
    fn bbox_query_orders_coordinates() {
        let q = build_bbox_query([-96.9, 32.7, -96.7, 32.9], 300);
        assert!(q.contains("(32.7,-96.9,32.9,-96.7)"));
    }

    #[test]
    fn parse_keeps_drivable_ways_only() {
        let raw = r#"{
            "elements": [
                {
                    "type": "way",
                    "id": 100,
                    "geometry": [
                        {"lat": 32.7, "lon": -96.8},
                        {"lat": 32.701, "lon": -96.8}
                    ],
                    "tags": {"highway": "residential", "name": "Elm St", "oneway": "yes"}
                },
                {
                    "type": "way",
                    "id": 101,
                    "geometry": [
                        {"lat": 32.7, "lon": -96.81},
                        {"lat": 32.701, "lon": -96.81}
                    ],
                    "tags": {"highway": "footway"}
                },
                {
                    "type": "node",
                    "id": 102
                }
            ]
        }"#;
        let response: OverpassResponse = serde_json::from_str(raw).unwrap();
        let ways = parse_ways(response);
        assert_eq!(ways.len(), 1);
        assert_eq!(ways[0].way_id, 100);
        assert_eq!(ways[0].street_name, "Elm St");
        assert!(ways[0].oneway);
        assert_eq!(ways[0].points[0], [-96.8, 32.7]);
    }
}
