//! HTTP job dispatch: turns one [`crate::jq::JqJob`] into a POST against a
//! pool's `processing_uri` and classifies the result.
//!
//! The client setup mirrors `fetcher::client`'s `Lazy<Client>` with a
//! `ClientBuilder` (connect timeout, request timeout, redirect policy), and
//! the dispatch algorithm itself is a retranslation of
//! `original_source/src/gearman-client.cpp::processJob`: curl's multipart
//! fields become `reqwest::multipart::Form` parts, curl's
//! `curl_progress_func` abort-on-`g_force_shutdown`/wall-clock check becomes
//! a `tokio::select!` race against a deadline and a shutdown watch, and the
//! strict two-field JSON envelope check is preserved verbatim.

use crate::error::DispatchError;
use once_cell::sync::Lazy;
use reqwest::{multipart, Client};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

/// Shared client, built once per process the way `fetcher::client::CLIENT`
/// is. `original_source` sets `CURLOPT_TCP_NODELAY`/`SO_REUSEADDR`/keepalive
/// via a socket-options callback; `reqwest`'s pool does the equivalent via
/// `tcp_nodelay` and `tcp_keepalive`.
static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .tcp_nodelay(true)
        .tcp_keepalive(Duration::from_secs(120))
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("yardmaster/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build HTTP client")
});

/// The two fields `original_source` requires in a processing response
/// (`gearman_ret`, `response_string`), with strict types — anything else is
/// `DispatchError::Envelope`, which the caller reports as `WORK_FAIL`
/// without crashing the slot.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub gearman_ret: u64,
    pub response_string: String,
}

/// Dispatches jobs for one pool to one `processing_uri`. Holds no
/// per-job state; every call is independent, matching
/// `GearmanClient::processJob`'s description as a pure function of its
/// arguments plus the shared client.
pub struct JobDispatcher {
    processing_uri: String,
    max_job_running_time: Duration,
}

impl JobDispatcher {
    pub fn new(processing_uri: impl Into<String>, max_job_running_time: Duration) -> Self {
        Self {
            processing_uri: processing_uri.into(),
            max_job_running_time,
        }
    }

    /// POST one job's fields as multipart form data and decode the JSON
    /// envelope. `shutdown` stands in for curl's `g_force_shutdown` check
    /// inside the progress callback: if it fires before the response lands,
    /// the request is dropped and [`DispatchError::ShutdownAbort`] is
    /// returned instead of waiting out the full deadline.
    #[instrument(skip(self, shutdown, workload), fields(function_name, handle))]
    pub async fn dispatch(
        &self,
        function_name: &str,
        handle: &str,
        unique: &str,
        workload: bytes::Bytes,
        shutdown: &CancellationToken,
    ) -> Result<JobResult, DispatchError> {
        let form = multipart::Form::new()
            .text("function_name", function_name.to_string())
            .text("job_handle", handle.to_string())
            .text("unique", unique.to_string())
            .part(
                "workload",
                multipart::Part::bytes(workload.to_vec()).mime_str("application/octet-stream")
                    .map_err(|e| DispatchError::Form(e.to_string()))?,
            );

        let request = CLIENT
            .post(&self.processing_uri)
            .header("Expect", "")
            .multipart(form)
            .send();

        let response = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(DispatchError::ShutdownAbort),
            result = tokio::time::timeout(self.max_job_running_time, request) => {
                match result {
                    Err(_elapsed) => return Err(DispatchError::Timeout),
                    Ok(inner) => inner?,
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::HttpStatus(status));
        }

        let body: Value = response.json().await?;
        decode_envelope(&body)
    }
}

/// Requires exactly a numeric `gearman_ret` and a string `response_string`,
/// matching the strict type checks in `processJob`'s JSON handling — a
/// missing field, a stringly-typed `gearman_ret`, or extra structure where
/// a scalar is expected are all `Envelope` errors, never silently coerced.
fn decode_envelope(body: &Value) -> Result<JobResult, DispatchError> {
    let gearman_ret = body
        .get("gearman_ret")
        .and_then(Value::as_u64)
        .ok_or_else(|| DispatchError::Envelope("missing or non-numeric gearman_ret".into()))?;

    let response_string = body
        .get("response_string")
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::Envelope("missing or non-string response_string".into()))?
        .to_string();

    Ok(JobResult {
        gearman_ret,
        response_string,
    })
}

impl JobResult {
    /// `gearman_ret == 0` is success, anything else is a worker-reported
    /// failure, the same mapping `processJob` uses to decide between
    /// `WORK_COMPLETE` and `WORK_FAIL`.
    pub fn is_success(&self) -> bool {
        self.gearman_ret == 0
    }
}

#[allow(dead_code)]
fn log_unexpected_status(status: reqwest::StatusCode) {
    warn!(%status, "processing URI returned a non-success status");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_envelope_accepts_well_formed_success() {
        let body = json!({"gearman_ret": 0, "response_string": "ok"});
        let result = decode_envelope(&body).unwrap();
        assert!(result.is_success());
        assert_eq!(result.response_string, "ok");
    }

    #[test]
    fn decode_envelope_accepts_nonzero_as_failure() {
        let body = json!({"gearman_ret": 1, "response_string": "boom"});
        let result = decode_envelope(&body).unwrap();
        assert!(!result.is_success());
    }

    #[test]
    fn decode_envelope_rejects_missing_gearman_ret() {
        let body = json!({"response_string": "ok"});
        assert!(matches!(
            decode_envelope(&body),
            Err(DispatchError::Envelope(_))
        ));
    }

    #[test]
    fn decode_envelope_rejects_stringly_typed_gearman_ret() {
        let body = json!({"gearman_ret": "0", "response_string": "ok"});
        assert!(matches!(
            decode_envelope(&body),
            Err(DispatchError::Envelope(_))
        ));
    }

    #[test]
    fn decode_envelope_rejects_non_string_response_string() {
        let body = json!({"gearman_ret": 0, "response_string": 5});
        assert!(matches!(
            decode_envelope(&body),
            Err(DispatchError::Envelope(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_honors_shutdown_before_response() {
        let dispatcher = JobDispatcher::new("http://127.0.0.1:1/never", Duration::from_secs(30));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = dispatcher
            .dispatch("Sum", "h1", "u1", bytes::Bytes::new(), &shutdown)
            .await;
        assert!(matches!(result, Err(DispatchError::ShutdownAbort)));
    }
}
