use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::Level;

use proximity_engine::dataset::DatasetSource;
use proximity_engine::geo::{format_distance, DistanceUnit, RadiusBands};
use proximity_engine::report::ReportBuilder;
use proximity_engine::source::{resolve_center, DeviceFilter, RemoteSource, Session};
use proximity_engine::defaults::DEFAULT_CENTER;
use proximity_engine::{api, metrics, Coordinate, EngineConfig, EntityDirectory, ProximityEngine, QuerySpec, TimeWindow};

#[derive(Parser)]
struct Cli {
    /// Log at debug level
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Find who passed near an address during a time window
    Run {
        #[arg(long)]
        dataset: PathBuf,
        /// Address or "lat, lon"; the default center when omitted
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
        /// Filter radius in meters
        #[arg(long)]
        radius: Option<f64>,
        /// Entity ids to query; every device in the dataset when omitted
        #[arg(long = "entity")]
        entities: Vec<String>,
        #[arg(long)]
        imperial: bool,
        /// Print the CSV export after the summary
        #[arg(long)]
        csv: bool,
    },
    /// List devices, optionally filtered by name
    Devices {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Run the HTTP gateway
    Api {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        imperial: bool,
    },
}

fn unit(imperial: bool) -> DistanceUnit {
    if imperial {
        DistanceUnit::Imperial
    } else {
        DistanceUnit::Metric
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();
    tracing::info!("Proximity engine {}", proximity_engine::VERSION);

    match cli.cmd {
        Cmd::Run { dataset, address, from, to, radius, entities, imperial, csv } => {
            run(dataset, address, TimeWindow::new(from, to), radius, entities, unit(imperial), csv).await?
        }
        Cmd::Devices { dataset, name } => devices(dataset, name).await?,
        Cmd::Api { dataset, imperial } => api::run(&dataset, unit(imperial)).await?,
    }
    Ok(())
}

async fn run(
    dataset: PathBuf,
    address: Option<String>,
    window: TimeWindow,
    radius: Option<f64>,
    entities: Vec<String>,
    unit: DistanceUnit,
    csv: bool,
) -> anyhow::Result<()> {
    let source: Arc<dyn RemoteSource> = Arc::new(DatasetSource::from_path(&dataset).await?);
    let session = Session::anonymous();
    let config = EngineConfig::from_env();

    let (center, address) = match address {
        Some(address) => (resolve_center(source.as_ref(), &session, &address).await?, address),
        None => {
            let (latitude, longitude) = DEFAULT_CENTER;
            (Coordinate::new(latitude, longitude), format!("{latitude}, {longitude}"))
        }
    };
    let devices = source.fetch_devices(&DeviceFilter::all(), &session).await?;
    let entity_ids = if entities.is_empty() {
        devices.iter().map(|d| d.id.clone()).collect()
    } else {
        entities
    };

    let mut spec = QuerySpec::new(center, window, entity_ids).with_limits(config.record_cap, config.chunk_size);
    if let Some(radius) = radius {
        spec = spec.with_radius(radius);
    }
    let bands = RadiusBands::from_radius(spec.radius_m);
    let labels: Vec<String> = bands.radii().into_iter().map(|r| format_distance(r, unit)).collect();
    tracing::info!(
        "Searching {} around ({:.6}, {:.6}), bands {}",
        format_distance(bands.outer(), unit),
        center.latitude,
        center.longitude,
        labels.join(", ")
    );

    let report = Arc::new(ReportBuilder::new(unit).with_record_cap(config.record_cap));
    let engine = ProximityEngine::new(source, session, report.clone(), config);
    let handle = engine.start_run(spec, EntityDirectory::new(devices)).await?;

    let captions = report.clone();
    let progress = engine.on_progress(&handle, move |hit| println!("{}", captions.hit_caption(&hit)));

    let outcome = tokio::select! {
        summary = engine.await_completion(&handle) => summary,
        _ = tokio::signal::ctrl_c() => {
            engine.cancel(&handle);
            engine.await_completion(&handle).await
        }
    };
    let summary = outcome.context("Proximity run did not complete")?;
    // Progress closes when the run ends; drain it before printing the summary.
    if let Err(e) = progress.await {
        tracing::warn!(run_id = %handle.id(), error = %e, "Progress listener ended abnormally");
    }

    println!("{}", report.summary_message(&summary, &address));
    if csv {
        print!("{}", report.csv());
    }
    tracing::debug!("Metrics: {:?}", metrics::get_metrics_collector().snapshot());
    Ok(())
}

async fn devices(dataset: PathBuf, name: Option<String>) -> anyhow::Result<()> {
    let source = DatasetSource::from_path(&dataset).await?;
    let filter = name.map(DeviceFilter::named).unwrap_or_else(DeviceFilter::all);
    for device in source.fetch_devices(&filter, &Session::anonymous()).await? {
        println!("{}\t{}", device.id, device.name);
    }
    Ok(())
}
