//! `geoflip` -- command-line client for Geoflip export jobs.
//!
//! Submits transformations, tracks the resulting export jobs across runs in a
//! local state file, and downloads finished outputs.
//!
//! # Environment variables
//!
//! See [`config::ClientConfig::from_env`]. A `.env` file in the working
//! directory is loaded first. Log output is controlled with `RUST_LOG`
//! (default `geoflip=info`).

mod commands;
mod config;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::App;
use crate::config::ClientConfig;

#[derive(Parser, Debug)]
#[command(name = "geoflip")]
#[command(about = "Convert and track geospatial exports with Geoflip", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "GEOFLIP_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Show how many transformations remain this month
    Usage,
    /// Upload a file and queue an export job
    Submit(commands::export::SubmitArgs),
    /// Convert a GeoJSON file synchronously without creating a job
    Convert(commands::export::ConvertArgs),
    /// List tracked export jobs
    List,
    /// Poll pending jobs and print their progress until none is running
    Watch,
    /// Save a finished export and stop tracking it
    Download {
        task_id: String,
        /// Directory the file is written to
        #[arg(long, default_value = ".")]
        out_dir: std::path::PathBuf,
    },
    /// Stop tracking an export job
    Remove { task_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "geoflip=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env()?;

    tracing::debug!(
        api_url = %config.api_url,
        state_path = %config.state_path.display(),
        "Loaded configuration",
    );

    let mut app = App::open(config)?;

    match cli.command {
        Command::Login { email, password } => {
            commands::account::login(&mut app, email, password).await
        }
        Command::Logout => commands::account::logout(&mut app).await,
        Command::Usage => commands::account::usage(&mut app).await,
        Command::Submit(args) => commands::export::submit(&mut app, args).await,
        Command::Convert(args) => commands::export::convert(&app, args).await,
        Command::List => commands::export::list(&app),
        Command::Watch => commands::export::watch(&app).await,
        Command::Download { task_id, out_dir } => {
            commands::export::download(&app, &task_id, &out_dir).await
        }
        Command::Remove { task_id } => commands::export::remove(&app, &task_id).await,
    }
}
