//! Status command implementation for tether CLI.

use serde::Deserialize;

use tether_core::Operation;

use crate::colors;
use crate::connect::{WorkerOptions, connect};

/// Reply to `getModelStatus`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelStatus {
    #[serde(default)]
    loaded: bool,
    #[serde(default)]
    model_id: Option<String>,
}

/// Print the worker's model status.
pub async fn execute(options: &WorkerOptions) -> anyhow::Result<()> {
    let proxy = connect(options).await?;
    let result = proxy
        .call_as::<ModelStatus>(Operation::GetModelStatus, None)
        .await;
    let state = proxy.state();
    proxy.shutdown().await;
    let status = result?;

    println!("{}Worker:{} {}", colors::BOLD, colors::RESET, state);
    if status.loaded {
        let model = status.model_id.as_deref().unwrap_or("unknown");
        println!("{}Model:{}  {}{}{}", colors::BOLD, colors::RESET, colors::GREEN, model, colors::RESET);
    } else {
        println!("{}Model:{}  {}none loaded{}", colors::BOLD, colors::RESET, colors::YELLOW, colors::RESET);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_reply_decodes() {
        let status: ModelStatus =
            serde_json::from_value(json!({"loaded": true, "modelId": "echo"})).unwrap();
        assert!(status.loaded);
        assert_eq!(status.model_id.as_deref(), Some("echo"));

        let status: ModelStatus = serde_json::from_value(json!({"loaded": false, "modelId": null})).unwrap();
        assert!(!status.loaded);
        assert!(status.model_id.is_none());
    }
}
