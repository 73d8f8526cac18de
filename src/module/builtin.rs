//! Default module served by the CLI when no other module is configured.

use std::time::Duration;

use futures::stream;
use serde_json::{json, Value};

use super::{InvocationError, Output, ServedModule};

/// Build the default module.
pub fn default_module(name: &str) -> ServedModule {
    ServedModule::new(name)
        .blocking("echo", |call| {
            Ok(json!({ "args": call.args, "kwargs": call.kwargs }))
        })
        .blocking("ping", |_| Ok(json!("pong")))
        .blocking("time", |_| {
            let now = chrono::Utc::now();
            Ok(json!(now.timestamp_millis() as f64 / 1000.0))
        })
        .blocking("add", |call| {
            let a: f64 = call.get(0, "a")?;
            let b: f64 = call.get(1, "b")?;
            Ok(json!(a + b))
        })
        .blocking("fail", |call| -> Result<Value, InvocationError> {
            let message: Option<String> = call.opt(0, "message")?;
            Err(InvocationError::Failed(
                message.unwrap_or_else(|| "requested failure".to_string()),
            ))
        })
        .handler("count", |call| async move {
            let n: u64 = call.get(0, "n")?;
            let delay_ms: u64 = call.opt(1, "delay_ms")?.unwrap_or(0);
            Ok::<_, InvocationError>(count(n, Duration::from_millis(delay_ms)))
        })
}

/// Sequence 0..n, one item per `delay`.
fn count(n: u64, delay: Duration) -> Output {
    Output::stream(stream::unfold(0u64, move |i| async move {
        if i >= n {
            return None;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Some((Value::from(i), i + 1))
    }))
}
