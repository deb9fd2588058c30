//! Tether CLI - drive an isolated inference worker from the terminal.

mod call;
mod colors;
mod connect;
mod download;
mod generate;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::connect::WorkerOptions;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Drive an isolated inference worker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the tether-worker binary (defaults to TETHER_WORKER_PATH, then discovery)
    #[arg(long, global = true)]
    worker: Option<PathBuf>,

    /// Timeout for every call, in seconds
    #[arg(long, global = true)]
    request_timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue one call and print its JSON result
    Call {
        /// Call type, e.g. getLocalModels
        call_type: String,

        /// JSON payload
        #[arg(long)]
        data: Option<String>,
    },

    /// Stream a generated response to stdout
    Generate {
        /// Prompt to send
        prompt: String,

        /// Model to load first
        #[arg(short, long, default_value = "echo")]
        model: String,
    },

    /// Download a model, showing progress
    Download {
        /// Model id
        model: String,
    },

    /// Show the worker's model status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format tether-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(tether_err) = err.downcast_ref::<tether_core::Error>() {
            anyhow::anyhow!("{}", tether_err.with_hint())
        } else {
            err
        }
    };

    let options = WorkerOptions {
        worker: cli.worker,
        request_timeout: cli.request_timeout,
    };

    match cli.command {
        Commands::Call { call_type, data } => {
            call::execute(&options, &call_type, data.as_deref())
                .await
                .map_err(format_error)?;
        }

        Commands::Generate { prompt, model } => {
            generate::execute(&options, &model, &prompt)
                .await
                .map_err(format_error)?;
        }

        Commands::Download { model } => {
            download::execute(&options, &model).await.map_err(format_error)?;
        }

        Commands::Status => {
            status::execute(&options).await.map_err(format_error)?;
        }
    }

    Ok(())
}
