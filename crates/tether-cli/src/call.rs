//! Call command implementation for tether CLI.
//!
//! Issues one forward call and prints the JSON result.

use anyhow::Context;
use serde_json::Value;

use tether_core::Operation;

use crate::colors;
use crate::connect::{WorkerOptions, connect};

/// Execute a single call.
pub async fn execute(options: &WorkerOptions, call_type: &str, data: Option<&str>) -> anyhow::Result<()> {
    // Validate everything before a worker is spawned.
    let op: Operation = call_type.parse()?;
    let payload = parse_payload(data)?;

    if op == Operation::Init {
        anyhow::bail!("init is sent automatically when the worker starts");
    }
    if op.is_streaming() {
        anyhow::bail!("{} streams its result; use `tether generate` instead", op);
    }

    let proxy = connect(options).await?;
    let result = proxy.call(op, payload).await;
    proxy.shutdown().await;

    let value = result?;
    println!("{}{}{}", colors::DIM, op, colors::RESET);
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn parse_payload(data: Option<&str>) -> anyhow::Result<Option<Value>> {
    data.map(|raw| serde_json::from_str(raw).context("--data is not valid JSON"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_parsing() {
        assert_eq!(parse_payload(None).unwrap(), None);
        assert_eq!(
            parse_payload(Some(r#"{"modelId": "echo"}"#)).unwrap(),
            Some(json!({"modelId": "echo"}))
        );
        assert!(parse_payload(Some("{modelId")).is_err());
    }
}
