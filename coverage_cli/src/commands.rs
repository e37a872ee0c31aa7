use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::Deserialize;

use coverage_tasks::{boundary_from_geojson, TaskError, TaskResult, TaskRunner};
use street_coverage::store::SegmentFilter;
use street_coverage::trips::{Trip, TripGeometry};
use street_coverage::{CoverageError, CoverageParams, SegmentId, SegmentMark};
use streets_fetcher::{FetcherConfig, StreetFetcher, DEFAULT_OVERPASS_URL};
use trip_matcher::{MatchClient, MatcherConfig};

use crate::Commands;

pub async fn run(data_dir: PathBuf, command: Commands) -> TaskResult<()> {
    let mut runner = open_runner(&data_dir)?;

    match command {
        Commands::Preprocess {
            name,
            boundary,
            segment_length_m,
            match_buffer_m,
            min_match_length_m,
        } => {
            let boundary = load_boundary(&boundary)?;
            let params =
                CoverageParams::from_meters(segment_length_m, match_buffer_m, min_match_length_m);
            let task_id = runner.preprocess_area(&name, boundary, params).await?;
            println!("{task_id}");
        }
        Commands::FullCalc { name } => {
            let task_id = runner.full_calc(&name).await?;
            println!("{task_id}");
        }
        Commands::IncrementalCalc { name } => {
            let task_id = runner.incremental_calc(&name).await?;
            println!("{task_id}");
        }
        Commands::ImportTrips { file } => {
            let count = import_trips(&mut runner, &file)?;
            println!("imported {count} trips");
        }
        Commands::MatchTrips => {
            let task_id = runner.match_trips().await?;
            println!("{task_id}");
        }
        Commands::GenerateRoute { name, start } => {
            let start = start.as_deref().map(parse_lon_lat).transpose()?;
            match runner.generate_route(&name, start).await {
                Ok(task_id) => println!("{task_id}"),
                // Nothing left to drive is early success, not a failure.
                Err(TaskError::Coverage(CoverageError::NoUndrivenSegments(_))) => {
                    println!("all streets already driven");
                }
                Err(e) => return Err(e),
            }
        }
        Commands::GetRoute { name } => {
            let area = runner.network.area_by_name(&name)?;
            match &area.optimal_route {
                Some(route) => {
                    let text = serde_json::to_string_pretty(route)
                        .map_err(CoverageError::Serde)?;
                    println!("{text}");
                }
                None => println!("no route generated for {name}"),
            }
        }
        Commands::ExportGpx { name, output } => {
            let bytes = runner.export_route_gpx(&name)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &bytes).map_err(CoverageError::Io)?;
                    info!("wrote {} bytes to {}", bytes.len(), path.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout()
                        .write_all(&bytes)
                        .map_err(CoverageError::Io)?;
                }
            }
        }
        Commands::MarkSegment { segment_id, state } => {
            let mark: SegmentMark = state.parse()?;
            runner.mark_segment(&SegmentId(segment_id), mark)?;
            println!("ok");
        }
        Commands::QueryStreets { name, bbox, filter } => {
            let bbox = bbox.as_deref().map(parse_bbox).transpose()?;
            let filter = parse_filter(&filter)?;
            let segments = runner.query_streets(&name, bbox, filter)?;
            for seg in segments {
                println!(
                    "{}\t{}\t{:.1}m\tdriven={}\tundriveable={}",
                    seg.segment_id,
                    if seg.street_name.is_empty() {
                        seg.highway_tag.as_str()
                    } else {
                        seg.street_name.as_str()
                    },
                    seg.segment_length_m,
                    seg.state.driven,
                    seg.state.undriveable,
                );
            }
        }
        Commands::Cancel { name } => {
            runner.cancel(&name)?;
            println!("ok");
        }
        Commands::Delete { name } => {
            runner.delete(&name)?;
            println!("ok");
        }
        Commands::Status { task_id } => {
            match runner.progress.get(&task_id) {
                Some(rec) => println!(
                    "{:?}\t{:?}\t{}%\t{}",
                    rec.status, rec.stage, rec.progress_pct, rec.message
                ),
                None => println!("unknown task {task_id}"),
            }
        }
    }
    Ok(())
}

fn open_runner(data_dir: &Path) -> TaskResult<TaskRunner> {
    let fetcher = StreetFetcher::new(FetcherConfig {
        overpass_url: std::env::var("OVERPASS_URL")
            .unwrap_or_else(|_| DEFAULT_OVERPASS_URL.to_string()),
        cache_dir: Some(data_dir.join("street_cache")),
        ..FetcherConfig::default()
    });
    // Matching is optional: commands that don't touch the provider work
    // without a token.
    let matcher = std::env::var("MAPBOX_ACCESS_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
        .map(|access_token| {
            MatchClient::new(MatcherConfig {
                access_token,
                ..MatcherConfig::default()
            })
        });
    TaskRunner::open(data_dir, fetcher, matcher)
}

fn load_boundary(path: &Path) -> TaskResult<geo::MultiPolygon<f64>> {
    let text = std::fs::read_to_string(path).map_err(CoverageError::Io)?;
    let doc: geojson::GeoJson = text
        .parse()
        .map_err(|e| CoverageError::Validation(format!("bad boundary geojson: {e}")))?;
    Ok(boundary_from_geojson(&doc)?)
}

/// Trip documents as exported by the telematics side: already validated
/// except for geometry, which is normalized here.
#[derive(Deserialize)]
struct TripImport {
    transaction_id: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    gps: geojson::Geometry,
}

fn import_trips(runner: &mut TaskRunner, file: &Path) -> TaskResult<usize> {
    let text = std::fs::read_to_string(file).map_err(CoverageError::Io)?;
    let imports: Vec<TripImport> = serde_json::from_str(&text)
        .map_err(|e| CoverageError::Validation(format!("bad trips file: {e}")))?;
    let mut count = 0usize;
    for import in imports {
        let gps = TripGeometry::from_geojson(&import.gps)?;
        runner.trips.insert(Trip {
            transaction_id: import.transaction_id,
            start_time: import.start_time,
            end_time: import.end_time,
            gps,
            matched_gps: None,
            match_status: None,
            matched_at: None,
        })?;
        count += 1;
    }
    Ok(count)
}

fn parse_lon_lat(text: &str) -> Result<[f64; 2], TaskError> {
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() != 2 {
        return Err(CoverageError::Validation(format!("expected lon,lat, got {text:?}")).into());
    }
    let lon = parts[0]
        .trim()
        .parse()
        .map_err(|_| CoverageError::Validation(format!("bad longitude {:?}", parts[0])))?;
    let lat = parts[1]
        .trim()
        .parse()
        .map_err(|_| CoverageError::Validation(format!("bad latitude {:?}", parts[1])))?;
    Ok([lon, lat])
}

fn parse_bbox(text: &str) -> Result<[f64; 4], TaskError> {
    let parts: Vec<f64> = text
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| CoverageError::Validation(format!("bad bbox {text:?}")))?;
    if parts.len() != 4 {
        return Err(CoverageError::Validation(format!("expected 4 bbox values, got {text:?}")).into());
    }
    Ok([parts[0], parts[1], parts[2], parts[3]])
}

fn parse_filter(text: &str) -> Result<SegmentFilter, TaskError> {
    match text {
        "all" => Ok(SegmentFilter::All),
        "driven" => Ok(SegmentFilter::Driven),
        "undriven" => Ok(SegmentFilter::Undriven),
        "driveable" => Ok(SegmentFilter::Driveable),
        "undriveable" => Ok(SegmentFilter::Undriveable),
        other => Err(CoverageError::Validation(format!("unknown filter {other:?}")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lon_lat_parsing() {
        assert_eq!(parse_lon_lat("-96.8, 32.7").unwrap(), [-96.8, 32.7]);
        assert!(parse_lon_lat("only-one").is_err());
    }

    #[test]
    fn bbox_parsing() {
        assert_eq!(
            parse_bbox("-96.9,32.7,-96.7,32.9").unwrap(),
            [-96.9, 32.7, -96.7, 32.9]
        );
        assert!(parse_bbox("1,2,3").is_err());
    }

    #[test]
    fn filter_parsing() {
        assert!(matches!(parse_filter("undriven"), Ok(SegmentFilter::Undriven)));
        assert!(parse_filter("bogus").is_err());
    }
}
