//! Out-of-band storage for large derived artifacts, chiefly the area-wide
//! streets GeoJSON. Artifacts move as byte streams with a sidecar metadata
//! document; the area document only ever holds the opaque handle.

use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::write_json_atomic;
use crate::{CoverageArea, CoverageError, Segment};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactId(pub String);

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: ArtifactId,
    pub area_display_name: String,
    pub content_type: String,
    pub generated_at: DateTime<Utc>,
    pub bytes: u64,
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CoverageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Store an artifact from a reader, copying in bounded chunks so peak
    /// memory stays independent of artifact size.
    pub fn put_stream(
        &self,
        id_hint: &str,
        area_display_name: &str,
        content_type: &str,
        reader: &mut dyn Read,
    ) -> Result<ArtifactId, CoverageError> {
        let id = self.fresh_id(id_hint);
        let path = self.data_path(&id);
        let bytes = {
            let file = fs::File::create(&path)?;
            let mut writer = BufWriter::new(file);
            let copied = std::io::copy(reader, &mut writer)?;
            writer.flush()?;
            copied
        };
        self.write_meta(&id, area_display_name, content_type, bytes)?;
        Ok(id)
    }

    /// Open a writer for incremental generation. `finish_write` must be
    /// called afterwards to publish the metadata.
    pub fn create(&self, id_hint: &str) -> Result<(ArtifactId, BufWriter<fs::File>), CoverageError> {
        let id = self.fresh_id(id_hint);
        let file = fs::File::create(self.data_path(&id))?;
        Ok((id, BufWriter::new(file)))
    }

    pub fn finish_write(
        &self,
        id: &ArtifactId,
        area_display_name: &str,
        content_type: &str,
    ) -> Result<(), CoverageError> {
        let bytes = fs::metadata(self.data_path(id))?.len();
        self.write_meta(id, area_display_name, content_type, bytes)
    }

    pub fn get_stream(&self, id: &ArtifactId) -> Result<fs::File, CoverageError> {
        fs::File::open(self.data_path(id)).map_err(CoverageError::Io)
    }

    pub fn meta(&self, id: &ArtifactId) -> Result<ArtifactMeta, CoverageError> {
        crate::store::read_json(&self.meta_path(id))
    }

    /// Idempotent: deleting a missing artifact is not an error.
    pub fn delete(&self, id: &ArtifactId) -> Result<(), CoverageError> {
        for path in [self.data_path(id), self.meta_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn find_by_tag(&self, area_display_name: &str) -> Result<Vec<ArtifactMeta>, CoverageError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let meta: ArtifactMeta = crate::store::read_json(&path)?;
            if meta.area_display_name == area_display_name {
                out.push(meta);
            }
        }
        Ok(out)
    }

    fn fresh_id(&self, hint: &str) -> ArtifactId {
        let slug: String = hint
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        let mut id = ArtifactId(slug.clone());
        let mut n = 1;
        while self.data_path(&id).exists() {
            id = ArtifactId(format!("{slug}.{n}"));
            n += 1;
        }
        id
    }

    fn data_path(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(format!("{}.bin", id.0))
    }

    fn meta_path(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(format!("{}.meta", id.0))
    }

    fn write_meta(
        &self,
        id: &ArtifactId,
        area_display_name: &str,
        content_type: &str,
        bytes: u64,
    ) -> Result<(), CoverageError> {
        write_json_atomic(
            &self.meta_path(id),
            &ArtifactMeta {
                id: id.clone(),
                area_display_name: area_display_name.to_string(),
                content_type: content_type.to_string(),
                generated_at: Utc::now(),
                bytes,
            },
        )
    }
}

/// Write the area-wide streets FeatureCollection feature by feature so the
/// whole collection is never held in memory, and register it under the
/// area's display name.
pub fn write_streets_geojson<'a>(
    store: &ArtifactStore,
    area: &CoverageArea,
    segments: impl Iterator<Item = &'a Segment>,
) -> Result<ArtifactId, CoverageError> {
    let (id, mut writer) = store.create(&format!("{}_streets.geojson", area.id))?;
    writer.write_all(br#"{"type":"FeatureCollection","features":["#)?;
    let mut first = true;
    for seg in segments {
        if !first {
            writer.write_all(b",")?;
        }
        first = false;
        let feature = segment_feature(seg);
        serde_json::to_writer(&mut writer, &feature)?;
    }
    writer.write_all(b"]}")?;
    writer.flush()?;
    drop(writer);
    store.finish_write(&id, &area.display_name, "application/geo+json")?;
    Ok(id)
}

fn segment_feature(seg: &Segment) -> geojson::Feature {
    let mut properties = serde_json::Map::new();
    properties.insert("segment_id".to_string(), seg.segment_id.0.clone().into());
    properties.insert(
        "location".to_string(),
        seg.area_display_name.clone().into(),
    );
    properties.insert("highway".to_string(), seg.highway_tag.clone().into());
    properties.insert("street_name".to_string(), seg.street_name.clone().into());
    properties.insert("segment_length".to_string(), seg.segment_length_m.into());
    properties.insert("oneway".to_string(), seg.oneway.into());
    properties.insert("driven".to_string(), seg.state.driven.into());
    properties.insert("undriveable".to_string(), seg.state.undriveable.into());
    properties.insert(
        "manual_override".to_string(),
        seg.state.manual_override.into(),
    );
    geojson::Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::from(&seg.geometry))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CoverageParams, SegmentId, SegmentState};
    use geo::{polygon, LineString, MultiPolygon};

    fn temp_store(name: &str) -> ArtifactStore {
        let dir = std::env::temp_dir().join(format!("artifacts_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        ArtifactStore::open(dir).unwrap()
    }

    #[test]
    fn put_get_delete_round_trip() {
        let store = temp_store("round");
        let mut payload = std::io::Cursor::new(b"hello streets".to_vec());
        let id = store
            .put_stream("t1_streets.geojson", "T1", "application/geo+json", &mut payload)
            .unwrap();

        let mut read_back = String::new();
        store
            .get_stream(&id)
            .unwrap()
            .read_to_string(&mut read_back)
            .unwrap();
        assert_eq!(read_back, "hello streets");

        let meta = store.meta(&id).unwrap();
        assert_eq!(meta.bytes, 13);
        assert_eq!(meta.area_display_name, "T1");

        store.delete(&id).unwrap();
        // Idempotent.
        store.delete(&id).unwrap();
        assert!(store.get_stream(&id).is_err());
    }

    #[test]
    fn find_by_tag_filters_area() {
        let store = temp_store("tag");
        for (hint, area) in [("a.geojson", "T1"), ("b.geojson", "T2")] {
            let mut payload = std::io::Cursor::new(b"{}".to_vec());
            store
                .put_stream(hint, area, "application/geo+json", &mut payload)
                .unwrap();
        }
        let hits = store.find_by_tag("T1").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].area_display_name, "T1");
    }

    #[test]
    fn collisions_get_fresh_ids() {
        let store = temp_store("fresh");
        let mut a = std::io::Cursor::new(b"a".to_vec());
        let mut b = std::io::Cursor::new(b"b".to_vec());
        let id_a = store.put_stream("same", "T1", "text/plain", &mut a).unwrap();
        let id_b = store.put_stream("same", "T1", "text/plain", &mut b).unwrap();
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn streets_geojson_is_valid_feature_collection() {
        let store = temp_store("geojson");
        let boundary = MultiPolygon(vec![polygon![
            (x: -0.01, y: -0.01),
            (x: 0.01, y: -0.01),
            (x: 0.01, y: 0.01),
            (x: -0.01, y: 0.01),
        ]]);
        let area = CoverageArea::new("T1", boundary, CoverageParams::default());
        let seg = Segment {
            segment_id: SegmentId("t1-1-0".to_string()),
            area_display_name: "T1".to_string(),
            geometry: LineString::from(vec![(0.0, 0.0), (0.0, 0.0005)]),
            highway_tag: "residential".to_string(),
            street_name: "Main St".to_string(),
            segment_length_m: 45.0,
            oneway: false,
            state: SegmentState::default(),
        };

        let id = write_streets_geojson(&store, &area, [&seg].into_iter()).unwrap();
        let mut text = String::new();
        store
            .get_stream(&id)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        let parsed: geojson::GeoJson = text.parse().unwrap();
        match parsed {
            geojson::GeoJson::FeatureCollection(fc) => {
                assert_eq!(fc.features.len(), 1);
                let props = fc.features[0].properties.as_ref().unwrap();
                assert_eq!(props["segment_id"], "t1-1-0");
                assert_eq!(props["driven"], false);
            }
            other => panic!("expected feature collection, got {other:?}"),
        }
    }
}
