use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::http::Request;
use httpmock::Method::POST;
use httpmock::MockServer;
use llm_relay::{Config, Listener, LogConfig, Model, Provider, RetryConfig, RetryTransport};

fn openai_model(id: &str, provider: &str, attempts: u32) -> Model {
    Model {
        provider: provider.to_string(),
        model: format!("{id}-upstream"),
        model_type: "openai".to_string(),
        attempts,
        ..Model::default()
    }
}

fn provider_for(url: &str) -> Provider {
    Provider {
        url: url.to_string(),
        ..Provider::default()
    }
}

/// Builds a validated single-listener config and its transport.
fn build_transport(
    providers: Vec<(&str, Provider)>,
    models: Vec<(&str, Model)>,
    retry: RetryConfig,
    log: LogConfig,
) -> RetryTransport {
    let mut config = Config {
        retry,
        log,
        ..Config::default()
    };
    for (name, provider) in providers {
        config.providers.insert(name.to_string(), provider);
    }
    let chain: Vec<String> = models.iter().map(|(id, _)| id.to_string()).collect();
    for (id, model) in models {
        config.models.insert(id.to_string(), model);
    }
    config.listeners.push(Listener {
        name: "test".to_string(),
        port: 4000,
        models: chain,
        ..Listener::default()
    });
    config.apply_defaults();
    config.validate().expect("valid config");
    RetryTransport::new(&config.listeners[0], &config).expect("transport")
}

fn fast_retry(max_cycles: u32) -> RetryConfig {
    RetryConfig {
        max_cycles,
        default_timeout_ms: 1_000,
        default_interval_ms: 1,
        exponential_backoff: false,
    }
}

fn post_request(path: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn first_success_short_circuits() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(200).body("ok");
    });

    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", openai_model("m1", "mock", 2))],
        fast_retry(1),
        LogConfig::default(),
    );

    let response = transport
        .round_trip(post_request("/path", r#"{"test":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, "ok".as_bytes());
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn retryable_status_exhausts_model_attempts() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(429).body("rate limited");
    });

    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", openai_model("m1", "mock", 2))],
        fast_retry(1),
        LogConfig::default(),
    );

    let response = transport
        .round_trip(post_request("/path", r#"{"test":1}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    assert_eq!(mock.hits(), 2);
}

#[tokio::test]
async fn retry_spans_multiple_cycles() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(429);
    });

    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", openai_model("m1", "mock", 2))],
        fast_retry(2),
        LogConfig::default(),
    );

    let response = transport.round_trip(post_request("/path", "{}")).await.unwrap();
    assert_eq!(response.status(), 429);
    assert_eq!(mock.hits(), 4);
}

#[tokio::test]
async fn server_error_falls_back_to_next_model() {
    let failing = MockServer::start();
    let failing_mock = failing.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(500);
    });
    let healthy = MockServer::start();
    let healthy_mock = healthy.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(200).body("fallback ok");
    });

    let transport = build_transport(
        vec![
            ("primary", provider_for(&failing.base_url())),
            ("secondary", provider_for(&healthy.base_url())),
        ],
        vec![
            ("m1", openai_model("m1", "primary", 1)),
            ("m2", openai_model("m2", "secondary", 1)),
        ],
        fast_retry(1),
        LogConfig::default(),
    );

    let response = transport.round_trip(post_request("/path", "{}")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, "fallback ok".as_bytes());
    assert_eq!(failing_mock.hits(), 1);
    assert_eq!(healthy_mock.hits(), 1);
}

#[tokio::test]
async fn client_error_is_terminal() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(400).body("bad request error");
    });

    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", openai_model("m1", "mock", 3))],
        fast_retry(2),
        LogConfig::default(),
    );

    let response = transport.round_trip(post_request("/path", "{}")).await.unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn client_error_body_is_replayed_when_captured() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(400).body("bad request error");
    });

    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", openai_model("m1", "mock", 1))],
        fast_retry(1),
        LogConfig {
            level: "info".to_string(),
            include_error_body: true,
        },
    );

    let response = transport.round_trip(post_request("/path", "{}")).await.unwrap();
    assert_eq!(response.status(), 400);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, "bad request error".as_bytes());
}

#[tokio::test]
async fn model_override_rewrites_request_body() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .json_body_partial(r#"{"model":"m1-upstream"}"#);
        then.status(200).body("ok");
    });

    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", openai_model("m1", "mock", 1))],
        fast_retry(1),
        LogConfig::default(),
    );

    let response = transport
        .round_trip(post_request("/v1/chat/completions", r#"{"model":"client-pick","temperature":0.2}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn empty_body_becomes_model_object() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/path")
            .json_body_partial(r#"{"model":"m1-upstream"}"#);
        then.status(200).body("ok");
    });

    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", openai_model("m1", "mock", 1))],
        fast_retry(1),
        LogConfig::default(),
    );

    let request = Request::builder()
        .method("POST")
        .uri("/path")
        .body(Body::empty())
        .unwrap();
    let response = transport.round_trip(request).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn non_json_body_is_a_per_attempt_failure() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(200);
    });

    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", openai_model("m1", "mock", 2))],
        fast_retry(1),
        LogConfig::default(),
    );

    let err = transport
        .round_trip(post_request("/path", "not json"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to set model field"), "got {err}");
    assert_eq!(mock.hits(), 0);
}

#[tokio::test]
async fn exhausted_retryable_returns_last_response() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(500);
    });

    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", openai_model("m1", "mock", 2))],
        fast_retry(1),
        LogConfig::default(),
    );

    let response = transport.round_trip(post_request("/path", "{}")).await.unwrap();
    assert_eq!(response.status(), 500);
}

#[tokio::test]
async fn connection_failure_surfaces_last_error() {
    // Nothing listens on port 9 (discard) on loopback.
    let transport = build_transport(
        vec![("mock", provider_for("http://127.0.0.1:9"))],
        vec![("m1", openai_model("m1", "mock", 1))],
        fast_retry(1),
        LogConfig::default(),
    );

    let err = transport.round_trip(post_request("/path", "{}")).await.unwrap_err();
    assert!(err.to_string().contains("upstream request failed"), "got {err}");
}

#[tokio::test]
async fn non_streaming_attempt_times_out() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(200).delay(Duration::from_millis(300)).body("slow");
    });

    let mut model = openai_model("m1", "mock", 1);
    model.timeout_ms = 50;
    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", model)],
        fast_retry(1),
        LogConfig::default(),
    );

    let start = Instant::now();
    let result = transport.round_trip(post_request("/path", "{}")).await;
    assert!(result.is_err(), "expected timeout error");
    assert!(
        start.elapsed() < Duration::from_millis(250),
        "timeout did not fire before the upstream delay"
    );
}

#[tokio::test]
async fn streaming_request_is_not_subject_to_model_timeout() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(200).delay(Duration::from_millis(300)).body("slow stream");
    });

    let mut model = openai_model("m1", "mock", 1);
    model.timeout_ms = 50;
    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", model)],
        fast_retry(1),
        LogConfig::default(),
    );

    let request = Request::builder()
        .method("POST")
        .uri("/path")
        .header("accept", "text/event-stream")
        .body(Body::from("{}"))
        .unwrap();
    let response = transport.round_trip(request).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, "slow stream".as_bytes());
}

#[tokio::test]
async fn exponential_backoff_grows_with_global_attempts() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/path");
        then.status(429);
    });

    let transport = build_transport(
        vec![("mock", provider_for(&upstream.base_url()))],
        vec![("m1", openai_model("m1", "mock", 3))],
        RetryConfig {
            max_cycles: 1,
            default_timeout_ms: 1_000,
            default_interval_ms: 10,
            exponential_backoff: true,
        },
        LogConfig::default(),
    );

    let start = Instant::now();
    let response = transport.round_trip(post_request("/path", "{}")).await.unwrap();
    assert_eq!(response.status(), 429);
    assert_eq!(mock.hits(), 3);
    // Waits after attempts 1 and 2: 10ms * 1 + 10ms * 2.
    assert!(
        start.elapsed() >= Duration::from_millis(28),
        "waits were shorter than linear backoff requires"
    );
}

#[tokio::test]
async fn url_rewrite_joins_base_path_and_preserves_query() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .query_param("limit", "5");
        then.status(200).body("ok");
    });

    let mut provider = provider_for(&format!("{}/v1/", upstream.base_url()));
    provider.strip_version_prefix = false;
    let transport = build_transport(
        vec![("mock", provider)],
        vec![("m1", openai_model("m1", "mock", 1))],
        fast_retry(1),
        LogConfig::default(),
    );

    let response = transport
        .round_trip(post_request("/chat/completions?limit=5", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn url_rewrite_strips_version_prefix() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).body("ok");
    });

    let mut provider = provider_for(&format!("{}/v1", upstream.base_url()));
    provider.strip_version_prefix = true;
    let transport = build_transport(
        vec![("mock", provider)],
        vec![("m1", openai_model("m1", "mock", 1))],
        fast_retry(1),
        LogConfig::default(),
    );

    // The inbound /v1 prefix is stripped, then the provider base path
    // re-adds it, so double /v1/v1 never reaches the upstream.
    let response = transport
        .round_trip(post_request("/v1/chat/completions", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn bearer_auth_header_reaches_upstream() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/path")
            .header("authorization", "Bearer sk-test");
        then.status(200);
    });

    let mut provider = provider_for(&upstream.base_url());
    provider.api_key = "sk-test".to_string();
    let transport = build_transport(
        vec![("mock", provider)],
        vec![("m1", openai_model("m1", "mock", 1))],
        fast_retry(1),
        LogConfig::default(),
    );

    let response = transport.round_trip(post_request("/path", "{}")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn anthropic_dialect_sets_version_header() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/path")
            .header("x-api-key", "claude-key")
            .header("anthropic-version", "2023-06-01");
        then.status(200);
    });

    let mut provider = provider_for(&upstream.base_url());
    provider.api_key = "claude-key".to_string();
    let mut model = openai_model("m1", "mock", 1);
    model.model_type = "anthropic".to_string();
    let transport = build_transport(
        vec![("mock", provider)],
        vec![("m1", model)],
        fast_retry(1),
        LogConfig::default(),
    );

    let response = transport.round_trip(post_request("/path", "{}")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn bedrock_dialect_signs_request() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/model/invoke")
            .header_exists("authorization")
            .header_exists("x-amz-date")
            .header_exists("x-amz-content-sha256")
            .header("x-amz-security-token", "session-token");
        then.status(200);
    });

    let mut provider = provider_for(&upstream.base_url());
    provider.aws_region = "us-east-1".to_string();
    provider.aws_access_key_id = "mock-key".to_string();
    provider.aws_secret_access_key = "mock-secret".to_string();
    provider.aws_session_token = "session-token".to_string();
    let mut model = openai_model("m1", "mock", 1);
    model.model_type = "bedrock".to_string();
    let transport = build_transport(
        vec![("mock", provider)],
        vec![("m1", model)],
        fast_retry(1),
        LogConfig::default(),
    );

    let response = transport.round_trip(post_request("/model/invoke", "{}")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(mock.hits(), 1);
}
