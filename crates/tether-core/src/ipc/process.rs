//! Worker process management.
//!
//! Provides `ProcessLauncher`, which spawns the `tether-worker` binary and
//! connects to it over length-prefixed JSON frames on stdin/stdout.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

use super::protocol::{Message, read_frame, write_frame};
use super::transport::{Channel, ChannelEvent, Launcher, Transport};

/// Environment variable overriding the worker binary location.
pub const WORKER_PATH_ENV: &str = "TETHER_WORKER_PATH";

const WORKER_NAME: &str = if cfg!(windows) {
    "tether-worker.exe"
} else {
    "tether-worker"
};

/// Launcher that runs each worker generation as a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    /// Explicit worker binary; discovered when `None`.
    worker_path: Option<PathBuf>,
    /// Extra arguments passed to the worker.
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific worker binary instead of discovering one.
    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    /// Append an argument for the worker process.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Find the tether-worker binary path.
    ///
    /// Looks in the following order:
    /// 1. The explicitly configured path
    /// 2. `TETHER_WORKER_PATH` environment variable
    /// 3. Same directory as the current executable
    /// 4. System PATH
    /// 5. `target/{debug,release}` during development
    pub fn find_worker_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.worker_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(Error::ChannelUnavailable(format!(
                "worker binary not found at {}",
                path.display()
            )));
        }

        if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let worker_path = exe_dir.join(WORKER_NAME);
                if worker_path.exists() {
                    return Ok(worker_path);
                }
            }
        }

        if let Ok(path) = which::which(WORKER_NAME) {
            return Ok(path);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in ["debug", "release"] {
                let path = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(WORKER_NAME);
                if path.exists() {
                    return Ok(path.canonicalize().unwrap_or(path));
                }
            }
        }

        Err(Error::ChannelUnavailable(format!(
            "could not find {} binary. Set {} or ensure it's in PATH.",
            WORKER_NAME, WORKER_PATH_ENV
        )))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self) -> Result<Channel> {
        let worker_path = self.find_worker_binary()?;

        let mut child = Command::new(&worker_path)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Worker logs go to stderr; stdout is the channel
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ChannelUnavailable(format!(
                    "failed to spawn worker process '{}': {}",
                    worker_path.display(),
                    e
                ))
            })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ChannelUnavailable("failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ChannelUnavailable("failed to get worker stdout".to_string()))?;

        tracing::debug!(pid, path = %worker_path.display(), "spawned worker process");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        // Writer: frames queued messages onto the worker's stdin.
        let writer_events = events_tx.clone();
        tokio::spawn(async move {
            let mut stdin = BufWriter::new(stdin);
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut stdin, &message).await {
                    let _ = writer_events.send(ChannelEvent::Error(format!(
                        "failed to write to worker: {}",
                        e
                    )));
                    break;
                }
            }
        });

        // Reader: decodes frames from the worker's stdout.
        let reader_events = events_tx.clone();
        tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout);
            loop {
                match read_frame(&mut stdout).await {
                    Ok(Some(message)) => {
                        if reader_events.send(ChannelEvent::Message(message)).is_err() {
                            break;
                        }
                    }
                    // EOF: the exit watcher reports the status.
                    Ok(None) => break,
                    Err(e) => {
                        let _ = reader_events.send(ChannelEvent::Error(format!(
                            "failed to read from worker: {}",
                            e
                        )));
                        break;
                    }
                }
            }
        });

        // Exit watcher: reports unexpected exits, kills on request.
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    tracing::debug!(pid, ?code, "worker process exited");
                    let _ = events_tx.send(ChannelEvent::Closed { code });
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("failed to kill worker: {}", e);
                    }
                }
            }
        });

        Ok(Channel {
            transport: Box::new(ProcessTransport {
                outbound: Some(outbound_tx),
                kill: Some(kill_tx),
            }),
            events: events_rx,
        })
    }
}

/// Outbound half of a process channel.
struct ProcessTransport {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    kill: Option<oneshot::Sender<()>>,
}

impl Transport for ProcessTransport {
    fn send(&mut self, message: Message) -> Result<()> {
        let tx = self
            .outbound
            .as_ref()
            .ok_or_else(|| Error::ChannelUnavailable("worker has been killed".to_string()))?;
        tx.send(message)
            .map_err(|_| Error::ChannelUnavailable("worker stdin is closed".to_string()))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the sender closes stdin so the writer task ends.
        self.outbound = None;
        let kill = self
            .kill
            .take()
            .ok_or_else(|| Error::ChannelUnavailable("worker has been killed".to_string()))?;

        if kill.send(()).is_err() {
            tracing::debug!("worker exited before close");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_missing_path_is_reported() {
        let launcher = ProcessLauncher::new().with_worker_path("/nonexistent/tether-worker");
        let err = launcher.find_worker_binary().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tether-worker"));
    }

    #[test]
    fn test_args_are_collected() {
        let launcher = ProcessLauncher::new().arg("--engine").arg("echo");
        assert_eq!(launcher.args, vec!["--engine", "echo"]);
    }

    #[test]
    #[ignore = "Requires tether-worker binary"]
    fn test_finds_built_worker() {
        let path = ProcessLauncher::new().find_worker_binary().unwrap();
        assert!(path.ends_with(WORKER_NAME));
    }
}
