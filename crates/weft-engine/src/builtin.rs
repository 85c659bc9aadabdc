//! Built-in deterministic handlers.

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use weft_core::error::{Result, WeftError};
use weft_core::traits::StepHandler;
use weft_core::types::ValueMap;

/// `passthrough`: the resolved inputs, as an object.
pub struct Passthrough;

impl StepHandler for Passthrough {
    fn id(&self) -> &str {
        "passthrough"
    }

    fn description(&self) -> &str {
        "Return the resolved inputs as an object"
    }

    fn run(&self, inputs: ValueMap, _cancel: CancellationToken) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Ok(Value::Object(inputs)) })
    }
}

/// `select`: the `value` input.
pub struct Select;

impl StepHandler for Select {
    fn id(&self) -> &str {
        "select"
    }

    fn description(&self) -> &str {
        "Return the `value` input"
    }

    fn run(&self, inputs: ValueMap, _cancel: CancellationToken) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            inputs
                .get("value")
                .cloned()
                .ok_or_else(|| WeftError::InvalidInput("select needs a 'value' input".into()))
        })
    }
}

/// `fail`: always fails with the `message` input.
pub struct Fail;

impl StepHandler for Fail {
    fn id(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Fail with the `message` input"
    }

    fn run(&self, inputs: ValueMap, _cancel: CancellationToken) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let message = inputs
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("step failed")
                .to_string();
            Err(WeftError::StepExecution {
                step: "fail".into(),
                message,
            })
        })
    }
}

/// `sleep`: waits `ms` milliseconds, then returns `ms`.
pub struct Sleep;

impl StepHandler for Sleep {
    fn id(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Wait `ms` milliseconds"
    }

    fn run(&self, inputs: ValueMap, cancel: CancellationToken) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let ms = inputs
                .get("ms")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| WeftError::InvalidInput("sleep needs an integer 'ms' input".into()))?;
            tokio::select! {
                _ = cancel.cancelled() => Err(WeftError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Value::from(ms)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_passthrough_and_select() {
        let out = Passthrough
            .run(inputs(&[("a", json!(1))]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1}));

        let out = Select
            .run(inputs(&[("value", json!([1, 2]))]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!([1, 2]));
        assert!(Select.run(ValueMap::new(), CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_uses_message() {
        let err = Fail
            .run(inputs(&[("message", json!("boom"))]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_cancellable() {
        let out = Sleep
            .run(inputs(&[("ms", json!(50))]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!(50));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Sleep
            .run(inputs(&[("ms", json!(60_000))]), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Cancelled));
    }
}
