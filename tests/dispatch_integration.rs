use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use yardmaster::dispatch::JobDispatcher;
use yardmaster::error::DispatchError;

#[tokio::test]
async fn dispatch_success_decodes_the_envelope() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/process"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "gearman_ret": 0,
            "response_string": "42",
        })))
        .mount(&mock_server)
        .await;

    let dispatcher = JobDispatcher::new(
        format!("{}/process", mock_server.uri()),
        Duration::from_secs(5),
    );
    let shutdown = tokio_util::sync::CancellationToken::new();

    let result = dispatcher
        .dispatch("Sum", "h1", "u1", bytes::Bytes::from_static(b"1,2,3"), &shutdown)
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.response_string, "42");
}

#[tokio::test]
async fn dispatch_surfaces_non_success_http_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/process"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let dispatcher = JobDispatcher::new(
        format!("{}/process", mock_server.uri()),
        Duration::from_secs(5),
    );
    let shutdown = tokio_util::sync::CancellationToken::new();

    let result = dispatcher
        .dispatch("Sum", "h1", "u1", bytes::Bytes::new(), &shutdown)
        .await;

    match result {
        Err(DispatchError::HttpStatus(status)) => assert_eq!(status.as_u16(), 503),
        other => panic!("expected HttpStatus(503), got {other:?}"),
    }
}

#[tokio::test]
async fn dispatch_reports_worker_failure_without_http_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/process"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "gearman_ret": 1,
            "response_string": "worker raised an exception",
        })))
        .mount(&mock_server)
        .await;

    let dispatcher = JobDispatcher::new(
        format!("{}/process", mock_server.uri()),
        Duration::from_secs(5),
    );
    let shutdown = tokio_util::sync::CancellationToken::new();

    let result = dispatcher
        .dispatch("Sum", "h1", "u1", bytes::Bytes::new(), &shutdown)
        .await
        .unwrap();

    assert!(!result.is_success());
}

#[tokio::test]
async fn dispatch_times_out_past_max_job_running_time() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&mock_server)
        .await;

    let dispatcher = JobDispatcher::new(
        format!("{}/slow", mock_server.uri()),
        Duration::from_millis(50),
    );
    let shutdown = tokio_util::sync::CancellationToken::new();

    let result = dispatcher
        .dispatch("Sum", "h1", "u1", bytes::Bytes::new(), &shutdown)
        .await;

    assert!(matches!(result, Err(DispatchError::Timeout)));
}

#[tokio::test]
async fn dispatch_rejects_malformed_envelope() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/process"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "unexpected": "shape",
        })))
        .mount(&mock_server)
        .await;

    let dispatcher = JobDispatcher::new(
        format!("{}/process", mock_server.uri()),
        Duration::from_secs(5),
    );
    let shutdown = tokio_util::sync::CancellationToken::new();

    let result = dispatcher
        .dispatch("Sum", "h1", "u1", bytes::Bytes::new(), &shutdown)
        .await;

    assert!(matches!(result, Err(DispatchError::Envelope(_))));
}
