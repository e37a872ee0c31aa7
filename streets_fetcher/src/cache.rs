//! On-disk cache of fetched way sets, keyed by area name and a stable hash
//! of the boundary geometry. A boundary edit invalidates the key naturally.

use std::path::{Path, PathBuf};

use geo::MultiPolygon;
use street_coverage::RawWay;

use crate::FetchError;

/// FNV-1a over the canonical coordinate stream. Stable across processes,
/// which `DefaultHasher` does not guarantee.
pub fn boundary_hash(boundary: &MultiPolygon<f64>) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut feed = |v: f64| {
        for b in v.to_bits().to_le_bytes() {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    };
    for polygon in &boundary.0 {
        for c in polygon.exterior().coords() {
            feed(c.x);
            feed(c.y);
        }
        for interior in polygon.interiors() {
            for c in interior.coords() {
                feed(c.x);
                feed(c.y);
            }
        }
    }
    hash
}

pub fn cache_path(dir: &Path, display_name: &str, boundary: &MultiPolygon<f64>) -> PathBuf {
    let slug: String = display_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    dir.join(format!("{slug}-{:016x}.json", boundary_hash(boundary)))
}

pub fn load(path: &Path) -> Option<Vec<RawWay>> {
    let file = std::fs::File::open(path).ok()?;
    serde_json::from_reader(std::io::BufReader::new(file)).ok()
}

pub fn save(path: &Path, ways: &[RawWay]) -> Result<(), FetchError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let file = std::fs::File::create(&tmp)?;
        serde_json::to_writer(std::io::BufWriter::new(file), ways)
            .map_err(|e| FetchError::BadResponse(format!("cache encode failed: {e}")))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
