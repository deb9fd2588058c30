//! tether-worker - isolated inference worker.
//!
//! Speaks the tether protocol over stdin/stdout. Started by the host's
//! `ProcessLauncher`; not meant to be run by hand.

use std::time::Duration;

use clap::Parser;

use tether_worker::{EchoEngine, WorkerRuntime, serve_stdio};

#[derive(Parser)]
#[command(name = "tether-worker")]
#[command(about = "Isolated inference worker for tether hosts")]
#[command(version)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Pause between streamed chunks, in milliseconds
    #[arg(long, default_value = "0")]
    step_delay_ms: u64,

    /// Seconds to wait for the host to answer a reverse call
    #[arg(long, default_value = "60")]
    host_timeout: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the channel, so logs must go to stderr
    let filter = if args.verbose {
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

    let engine = EchoEngine::new().with_step_delay(Duration::from_millis(args.step_delay_ms));
    let runtime =
        WorkerRuntime::new(engine).with_host_timeout(Duration::from_secs(args.host_timeout));

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = rt.block_on(serve_stdio(runtime));
    // Don't wait on the stdin reader; the host may keep the pipe open.
    rt.shutdown_background();
    result
}
