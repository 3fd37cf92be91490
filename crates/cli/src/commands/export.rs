use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Args;
use geoflip_core::auth::AuthAction;
use geoflip_core::export::{
    download_file_name, pipeline_job_name, validate_output_format, JobState,
};
use geoflip_events::TrackerEvent;
use geoflip_transform::api::{ApiError, GeoJsonExport};
use geoflip_transform::request::{
    DistanceUnit, PipelineConfig, TransformRequest, Transformation,
};
use geoflip_transform::tracker::{ExportTracker, JobAction, TrackerError};
use tokio::sync::broadcast::{self, error::RecvError};

use super::{print_event, App};

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Input file (.zip shapefile, .gpkg, .dxf or .geojson)
    pub file: PathBuf,
    /// Output format: shp, gpkg, dxf, csv or geojson
    #[arg(long)]
    pub to: String,
    /// Input format; inferred from the file extension when omitted
    #[arg(long)]
    pub from: Option<String>,
    /// Target EPSG code
    #[arg(long, default_value_t = 4326)]
    pub epsg: u32,
    /// Source EPSG code, used for DXF inputs only
    #[arg(long)]
    pub input_epsg: Option<u32>,
    /// Export name; defaults to a timestamped pipeline name
    #[arg(long)]
    pub name: Option<String>,
    /// Buffer features by this distance
    #[arg(long)]
    pub buffer: Option<f64>,
    /// Units of the buffer distance: meters, kilometers, feet or miles
    #[arg(long, default_value = "meters")]
    pub units: String,
    /// Dissolve all features into one
    #[arg(long)]
    pub union: bool,
    /// Wait for the job and download the result
    #[arg(long)]
    pub wait: bool,
    /// Where `--wait` saves the result
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// GeoJSON input file
    pub file: PathBuf,
    /// Output format: shp, gpkg, dxf, csv or geojson
    #[arg(long)]
    pub to: String,
    /// Target EPSG code
    #[arg(long, default_value_t = 4326)]
    pub epsg: u32,
    /// Name of the saved file; defaults to the input file stem
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,
}

pub async fn submit(app: &mut App, args: SubmitArgs) -> anyhow::Result<()> {
    require_session(app)?;

    let input_format = match args.from {
        Some(format) => format,
        None => infer_input_format(&args.file)?.to_string(),
    };

    let mut config = PipelineConfig::new(&input_format, &args.to, args.epsg, args.input_epsg)?;
    if let Some(distance) = args.buffer {
        config = config.with_step(Transformation::Buffer {
            distance,
            units: parse_units(&args.units)?,
        });
    }
    if args.union {
        config = config.with_step(Transformation::Union);
    }

    let file = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let file_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".into());
    let name = args
        .name
        .unwrap_or_else(|| pipeline_job_name(&input_format, chrono::Utc::now()));
    let request = TransformRequest::versioned(input_format, file_name, file, config);

    let tracker = app.tracker();
    let mut rx = app.events.subscribe();

    let task_id = match tracker.submit(&name, &request).await {
        Ok(id) => id,
        Err(e) => {
            drain(&mut rx);
            if matches!(e, TrackerError::Api(ApiError::Unauthorized)) {
                app.session.dispatch(AuthAction::Logout)?;
            }
            return Err(e.into());
        }
    };
    println!("Queued {name} as {task_id}");

    if !args.wait {
        tracker.shutdown().await;
        return Ok(());
    }

    let last = follow(&mut rx, &task_id).await;
    tracker.shutdown().await;

    match last {
        Some(TrackerEvent::JobSucceeded { .. }) => {
            let path = tracker.download(&task_id, &args.out_dir).await?;
            println!("Saved {}", path.display());
            Ok(())
        }
        Some(TrackerEvent::JobFailed { message, .. }) => bail!("{name}: {message}"),
        _ => {
            println!("{task_id} is still tracked; run `geoflip watch` to keep checking");
            Ok(())
        }
    }
}

pub async fn convert(app: &App, args: ConvertArgs) -> anyhow::Result<()> {
    validate_output_format(&args.to)?;

    let raw = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let input_geojson: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("{} is not valid GeoJSON", args.file.display()))?;

    let export = GeoJsonExport {
        input_geojson,
        output_format: args.to.clone(),
        output_crs: format!("EPSG:{}", args.epsg),
    };
    let bytes = match app.session.api().export_geojson(&export).await {
        Ok(bytes) => bytes,
        Err(e) => bail!("{}", e.user_message()),
    };

    let name = args.name.unwrap_or_else(|| {
        args.file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "export".into())
    });
    let path = args.out_dir.join(download_file_name(&name, &args.to));
    tokio::fs::create_dir_all(&args.out_dir).await?;
    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Saved {}", path.display());
    Ok(())
}

pub fn list(app: &App) -> anyhow::Result<()> {
    let jobs = app.ledger.pending_jobs()?;
    if jobs.is_empty() {
        println!("No tracked exports");
        return Ok(());
    }

    for (job, record) in jobs {
        let hint = match record.state {
            JobState::Processing => "geoflip watch",
            JobState::Success => "geoflip download",
            JobState::Failure => "geoflip remove",
        };
        println!(
            "{}  {}  {}  {}  ({hint})",
            job.task_id, job.name, job.output_format, record.state
        );
    }
    Ok(())
}

pub async fn watch(app: &App) -> anyhow::Result<()> {
    let tracker = app.tracker();
    let mut rx = app.events.subscribe();

    let restored = tracker.restore().await?;
    if restored.is_empty() {
        println!("No tracked exports");
        return Ok(());
    }

    while has_running(&tracker).await {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed tracker events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    drain(&mut rx);
    tracker.shutdown().await;

    let ready = tracker
        .jobs()
        .await
        .iter()
        .filter(|v| v.action() == JobAction::Download)
        .count();
    if ready > 0 {
        println!("{ready} export(s) ready; run `geoflip download <task id>`");
    }
    Ok(())
}

pub async fn download(app: &App, task_id: &str, out_dir: &Path) -> anyhow::Result<()> {
    let tracker = app.tracker();
    let mut rx = app.events.subscribe();

    let result = tracker.download(task_id, out_dir).await;
    drain(&mut rx);
    let path = result?;
    println!("Saved {}", path.display());
    Ok(())
}

pub async fn remove(app: &App, task_id: &str) -> anyhow::Result<()> {
    app.tracker().remove(task_id).await?;
    println!("Removed {task_id}");
    Ok(())
}

// ---- helpers ----

fn require_session(app: &App) -> anyhow::Result<()> {
    if !app.session.is_authenticated() {
        bail!("Not signed in; run `geoflip login` first");
    }
    Ok(())
}

async fn has_running(tracker: &ExportTracker) -> bool {
    tracker
        .jobs()
        .await
        .iter()
        .any(|v| v.action() == JobAction::Wait)
}

/// Print events for `task_id` until its polling ends or the user interrupts.
async fn follow(rx: &mut broadcast::Receiver<TrackerEvent>, task_id: &str) -> Option<TrackerEvent> {
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => return None,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => {
                print_event(&event);
                if event.task_id() == Some(task_id) && event.ends_polling() {
                    return Some(event);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Missed tracker events");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Print whatever is already queued on the bus.
fn drain(rx: &mut broadcast::Receiver<TrackerEvent>) {
    while let Ok(event) = rx.try_recv() {
        print_event(&event);
    }
}

/// Map a file extension to the input format of the upload endpoint.
fn infer_input_format(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    Ok(match ext.as_str() {
        "zip" | "shp" => "shp",
        "gpkg" => "gpkg",
        "dxf" => "dxf",
        "geojson" | "json" => "geojson",
        _ => bail!(
            "Cannot infer the input format of {}; pass --from",
            path.display()
        ),
    })
}

fn parse_units(units: &str) -> anyhow::Result<DistanceUnit> {
    serde_json::from_value(serde_json::Value::String(units.to_ascii_lowercase()))
        .with_context(|| format!("Unknown distance unit '{units}'"))
}
