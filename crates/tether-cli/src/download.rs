//! Download command implementation for tether CLI.

use std::io::Write;

use serde_json::json;

use tether_core::{Operation, Progress};

use crate::colors;
use crate::connect::{WorkerOptions, connect};

/// Download a model, rendering progress on stderr.
pub async fn execute(options: &WorkerOptions, model: &str) -> anyhow::Result<()> {
    let proxy = connect(options).await?;

    println!("{}Downloading{} {}", colors::BOLD, colors::RESET, model);
    let result = proxy
        .call_with_progress(
            Operation::DownloadModel,
            Some(json!({ "modelId": model })),
            render_progress,
        )
        .await;
    proxy.shutdown().await;

    let value = result?;
    eprintln!();
    println!("{}Done{} {}", colors::GREEN, colors::RESET, value);
    Ok(())
}

fn render_progress(update: Progress) {
    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "\r{}", progress_line(&update));
    let _ = stderr.flush();
}

fn progress_line(update: &Progress) -> String {
    let percent = update.progress.clamp(0.0, 100.0);
    let filled = (percent / 5.0).round() as usize;
    let bar = format!("{}{}", "#".repeat(filled), " ".repeat(20 - filled));
    match &update.speed {
        Some(speed) => format!("[{}] {:5.1}% {}{}{}", bar, percent, colors::CYAN, speed, colors::RESET),
        None => format!("[{}] {:5.1}%", bar, percent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_line() {
        let line = progress_line(&Progress {
            progress: 50.0,
            speed: None,
        });
        assert_eq!(line, "[##########          ]  50.0%");

        // Out-of-range reports are clamped.
        let line = progress_line(&Progress {
            progress: 140.0,
            speed: None,
        });
        assert!(line.starts_with("[####################]"));
    }
}
