use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_core::config::BackendConfig;
use weft_core::error::BackendError;
use weft_core::traits::Backend;
use weft_core::types::{InvocationRequest, InvocationResult, ValueMap};

/// Backend reached over HTTP: the invocation is POSTed as JSON and the
/// response's `output` becomes the step output.
pub struct HttpBackend {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: u64,
    http: Client,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig, endpoint: String) -> Self {
        Self {
            name: config.name.clone(),
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
            http: Client::new(),
        }
    }
}

#[derive(Serialize)]
struct InvokeBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    run_id: &'a str,
    step: &'a str,
    tier: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    capability: Option<&'a str>,
    inputs: &'a ValueMap,
}

#[derive(Deserialize, Debug)]
struct InvokeResponse {
    output: serde_json::Value,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

/// Map a non-success HTTP status to the backend failure kind.
fn classify_status(status: StatusCode, body: String) -> BackendError {
    match status.as_u16() {
        429 => BackendError::RateLimited(body),
        401 | 403 => BackendError::Auth(body),
        code @ 500..=599 => BackendError::Server {
            status: code,
            message: body,
        },
        code => BackendError::Request(format!("HTTP {}: {}", code, body)),
    }
}

impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn invoke(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<InvocationResult, BackendError>> {
        Box::pin(async move {
            let body = InvokeBody {
                model: self.model.as_deref(),
                run_id: &request.run_id.0,
                step: &request.step,
                tier: &request.tier,
                capability: request.capability.as_deref(),
                inputs: &request.inputs,
            };

            let mut req = self.http.post(&self.endpoint).json(&body);
            if let Some(ref api_key) = self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            debug!(backend = %self.name, step = %request.step, "Sending backend request");

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                r = req.send() => r.map_err(|e| {
                    if e.is_timeout() {
                        BackendError::Timeout(self.timeout_secs * 1000)
                    } else {
                        BackendError::Request(e.to_string())
                    }
                })?,
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, body));
            }

            let parsed: InvokeResponse = response
                .json()
                .await
                .map_err(|e| BackendError::Request(format!("invalid response body: {}", e)))?;

            Ok(InvocationResult {
                output: parsed.output,
                backend: self.name.clone(),
                tokens_used: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
            })
        })
    }
}
