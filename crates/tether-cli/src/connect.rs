//! Starting a worker for a CLI command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tether_core::{
    ProcessLauncher, ProxyConfig, RestartPolicy, ReverseCallBridge, StaticToolRegistry,
    TimeoutConfig, WorkerProxy,
};

/// Worker options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Explicit worker binary.
    pub worker: Option<PathBuf>,
    /// Override for every call timeout, in seconds.
    pub request_timeout: Option<u64>,
}

impl WorkerOptions {
    fn config(&self) -> ProxyConfig {
        let mut config = ProxyConfig {
            // A one-shot command has nothing to resume after a crash.
            restart: RestartPolicy::disabled(),
            ..Default::default()
        };
        if let Some(secs) = self.request_timeout {
            let timeout = Duration::from_secs(secs);
            config.timeouts = TimeoutConfig {
                standard: timeout,
                long_running: timeout,
                generation: timeout,
            };
        }
        config
    }
}

/// Spawn the worker process and wait until it is ready.
pub async fn connect(options: &WorkerOptions) -> tether_core::Result<WorkerProxy> {
    let mut launcher = ProcessLauncher::new();
    if let Some(path) = &options.worker {
        launcher = launcher.with_worker_path(path);
    }
    // Fail before spawning anything if there is no worker to run.
    let path = launcher.find_worker_binary()?;
    tracing::debug!(path = %path.display(), "using worker binary");

    // No tools are exposed, but reverse calls still get a reply.
    let bridge = ReverseCallBridge::with_tool_registry(Arc::new(StaticToolRegistry::default()));

    let proxy = WorkerProxy::builder(launcher)
        .config(options.config())
        .bridge(bridge)
        .spawn();
    proxy.wait_for_initialization().await?;
    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timeout_applies_to_every_category() {
        let options = WorkerOptions {
            worker: None,
            request_timeout: Some(5),
        };
        let config = options.config();
        assert_eq!(config.timeouts.standard, Duration::from_secs(5));
        assert_eq!(config.timeouts.long_running, Duration::from_secs(5));
        assert_eq!(config.timeouts.generation, Duration::from_secs(5));
        assert_eq!(config.restart.max_attempts, 0);
    }

    #[test]
    fn test_default_timeouts_are_kept() {
        let config = WorkerOptions::default().config();
        assert_eq!(config.timeouts, TimeoutConfig::default());
    }
}
