mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Street coverage engine")]
struct Cli {
    /// Root directory for the document stores, caches and artifacts.
    #[arg(long, default_value = "./data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, segment and calculate coverage for a new or updated area
    Preprocess {
        /// Unique display name for the area
        #[arg(long)]
        name: String,
        /// GeoJSON file with the boundary polygon
        #[arg(long)]
        boundary: PathBuf,
        /// Target segment length in meters
        #[arg(long, default_value_t = 45.72)]
        segment_length_m: f64,
        /// Match buffer in meters
        #[arg(long, default_value_t = 7.62)]
        match_buffer_m: f64,
        /// Minimum matched overlap in meters
        #[arg(long, default_value_t = 4.57)]
        min_match_length_m: f64,
    },
    /// Rebuild coverage from scratch over all matched trips
    FullCalc {
        #[arg(long)]
        name: String,
    },
    /// Attribute only trips matched since the last pass
    IncrementalCalc {
        #[arg(long)]
        name: String,
    },
    /// Load trip documents from a JSON file into the trip store
    ImportTrips {
        #[arg(long)]
        file: PathBuf,
    },
    /// Map-match every trip that hasn't been matched yet
    MatchTrips,
    /// Solve the optimal completion route for an area
    GenerateRoute {
        #[arg(long)]
        name: String,
        /// Optional starting point as lon,lat
        #[arg(long)]
        start: Option<String>,
    },
    /// Print the stored optimal route as JSON
    GetRoute {
        #[arg(long)]
        name: String,
    },
    /// Export the stored optimal route as GPX
    ExportGpx {
        #[arg(long)]
        name: String,
        /// Output file; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Apply a manual override to a street segment
    MarkSegment {
        #[arg(long)]
        segment_id: String,
        /// One of driven, undriven, driveable, undriveable
        #[arg(long)]
        state: String,
    },
    /// List street segments for an area
    QueryStreets {
        #[arg(long)]
        name: String,
        /// Viewport as min_lon,min_lat,max_lon,max_lat
        #[arg(long)]
        bbox: Option<String>,
        /// Filter: all, driven, undriven, driveable, undriveable
        #[arg(long, default_value = "all")]
        filter: String,
    },
    /// Request cancellation of running tasks for an area
    Cancel {
        #[arg(long)]
        name: String,
    },
    /// Delete an area and everything derived from it
    Delete {
        #[arg(long)]
        name: String,
    },
    /// Show progress for a task
    Status {
        #[arg(long)]
        task_id: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    match commands::run(cli.data_dir, cli.command).await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}
