use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, request::Parts, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use regex::Regex;
use reqwest::Url;

use crate::auth::apply_dialect_auth;
use crate::config::{Config, Dialect, Listener, LogConfig, Model, Provider, RetryConfig};
use crate::request::{
    collect_up_to, drain_body, format_body_for_log, is_streaming_request, read_error_body, set_model,
};
use crate::{RelayError, Result};

/// Hard cap on buffered inbound request bodies.
pub const MAX_REQUEST_BODY_BYTES: usize = 100 * 1024 * 1024;

fn version_prefix_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^/v\d+").expect("version prefix regex is valid"))
}

/// The retry/fallback core. One instance per listener; every inbound
/// request makes exactly one [`RetryTransport::round_trip`] call, which
/// walks the listener's model chain until a terminal response or error.
pub struct RetryTransport {
    models: Vec<Model>,
    providers: HashMap<String, Provider>,
    retry: RetryConfig,
    log: LogConfig,
    read_timeout: Duration,
    client: reqwest::Client,
}

impl RetryTransport {
    pub fn new(listener: &Listener, config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| RelayError::ConfigInvalid {
                entity: format!("listener {:?}", listener.name),
                reason: format!("failed to build http client: {err}"),
            })?;

        Ok(Self {
            models: listener.resolved_models.clone(),
            providers: config.providers.clone(),
            retry: config.retry.clone(),
            log: config.log.clone(),
            read_timeout: listener.read_timeout(),
            client,
        })
    }

    /// Forwards one request through the model chain.
    ///
    /// Attempts run strictly in order over (cycle, model, attempt). The
    /// first non-retryable result wins; retryable statuses (429 and 5xx)
    /// and transport errors advance the loop. Client disconnects drop this
    /// future, which aborts any in-flight upstream call or wait.
    pub async fn round_trip(&self, request: Request) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let buffered = collect_up_to(body.into_data_stream(), MAX_REQUEST_BODY_BYTES);
        let (body, over_limit) = tokio::time::timeout(self.read_timeout, buffered)
            .await
            .map_err(|_| RelayError::BodyRead("timed out reading request body".to_string()))?
            .map_err(|err| RelayError::BodyRead(err.to_string()))?;
        if over_limit {
            return Err(RelayError::BodyTooLarge(MAX_REQUEST_BODY_BYTES));
        }

        let streaming = is_streaming_request(&parts, &body);
        let debug_enabled = tracing::enabled!(tracing::Level::DEBUG);
        let max_cycles = self.retry.max_cycles.max(1);
        let num_models = self.models.len();

        let mut last_err: Option<RelayError> = None;
        let mut last_resp: Option<BufferedResponse> = None;
        let mut total_attempts: u32 = 0;

        for cycle in 0..max_cycles {
            for (model_idx, model) in self.models.iter().enumerate() {
                let provider = self.providers.get(&model.provider);
                let interval = model.effective_interval(provider, self.retry.default_interval_ms);
                let attempts = model.attempts.max(1);

                for attempt in 0..attempts {
                    total_attempts += 1;
                    tracing::debug!(
                        provider = %model.provider,
                        model = %model.model,
                        cycle = cycle + 1,
                        attempt = attempt + 1,
                        total_attempts,
                        "trying model"
                    );

                    let upstream = match self.try_model(&parts, &body, model, streaming, debug_enabled).await {
                        Ok(upstream) => upstream,
                        Err(err) => {
                            tracing::debug!(provider = %model.provider, error = %err, "model request failed");
                            last_err = Some(err);
                            if should_wait(cycle, model_idx, attempt, num_models, attempts, max_cycles) {
                                self.wait(interval, total_attempts).await;
                            }
                            continue;
                        }
                    };

                    let status = upstream.status();
                    tracing::info!(
                        provider = %model.provider,
                        model = %model.model,
                        status = status.as_u16(),
                        streaming,
                        "response"
                    );

                    if is_retryable(status) {
                        last_resp = Some(self.handle_retryable_response(upstream, model).await);
                        if should_wait(cycle, model_idx, attempt, num_models, attempts, max_cycles) {
                            self.wait(interval, total_attempts).await;
                        }
                        continue;
                    }

                    if status.as_u16() >= 400 {
                        return Ok(self.handle_client_error_response(upstream, model).await);
                    }

                    return Ok(stream_response(upstream));
                }
            }
        }

        if let Some(resp) = last_resp {
            return Ok(resp.into_response());
        }
        if let Some(err) = last_err {
            return Err(err);
        }
        Err(RelayError::AttemptsExhausted)
    }

    /// One upstream attempt: rewrite the body and URL, apply auth, dispatch.
    async fn try_model(
        &self,
        parts: &Parts,
        body: &Bytes,
        model: &Model,
        streaming: bool,
        debug_enabled: bool,
    ) -> Result<reqwest::Response> {
        let provider = self
            .providers
            .get(&model.provider)
            .ok_or_else(|| RelayError::ProviderMissing(model.provider.clone()))?;
        let base = provider
            .parsed_url
            .as_ref()
            .ok_or_else(|| RelayError::ProviderMissing(model.provider.clone()))?;

        let new_body = set_model(body, &model.model)?;
        if debug_enabled {
            tracing::debug!(body = %format_body_for_log(&new_body), "request body");
        }

        let url = build_target_url(base, parts.uri.path(), parts.uri.query(), provider.strip_version_prefix);
        if debug_enabled {
            tracing::debug!(url = %url, "request url");
        }

        let mut headers = parts.headers.clone();
        sanitize_proxy_headers(&mut headers);
        let dialect = model.dialect.unwrap_or(Dialect::Openai);
        apply_dialect_auth(&mut headers, &parts.method, &url, &new_body, dialect, provider);

        let mut outgoing = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(new_body);
        if !streaming {
            // Streaming upstreams hold the connection open while emitting
            // events; a deadline would cut the stream mid-response.
            outgoing = outgoing.timeout(model.effective_timeout(self.retry.default_timeout_ms));
        }

        outgoing.send().await.map_err(RelayError::from)
    }

    /// Waits between attempts, growing linearly with the global attempt
    /// count when exponential backoff is on.
    async fn wait(&self, interval: Duration, total_attempts: u32) {
        let duration = if self.retry.exponential_backoff {
            interval.saturating_mul(total_attempts)
        } else {
            interval
        };
        tracing::debug!(
            duration_ms = duration.as_millis() as u64,
            exponential = self.retry.exponential_backoff,
            "waiting before retry"
        );
        tokio::time::sleep(duration).await;
    }

    /// Logs and drains a retryable response, keeping only its status and
    /// headers for a potential final reply.
    async fn handle_retryable_response(&self, upstream: reqwest::Response, model: &Model) -> BufferedResponse {
        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_framing_headers(&mut headers);

        if self.log.include_error_body {
            let body = match read_error_body(upstream).await {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read error body");
                    Bytes::new()
                }
            };
            tracing::info!(
                provider = %model.provider,
                status = status.as_u16(),
                error = %String::from_utf8_lossy(&body),
                "retryable status"
            );
        } else {
            drain_body(upstream).await;
            tracing::info!(provider = %model.provider, status = status.as_u16(), "retryable status");
        }

        BufferedResponse {
            status,
            headers,
            body: Bytes::new(),
        }
    }

    /// Terminal 4xx handling. With `include_error_body` the first 4 KiB
    /// are captured for the log and replayed to the caller; otherwise the
    /// body passes through untouched.
    async fn handle_client_error_response(&self, upstream: reqwest::Response, model: &Model) -> Response {
        let status = upstream.status();

        if self.log.include_error_body {
            let mut headers = upstream.headers().clone();
            strip_framing_headers(&mut headers);
            let body = match read_error_body(upstream).await {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read error body");
                    Bytes::new()
                }
            };
            tracing::info!(
                provider = %model.provider,
                model = %model.model,
                status = status.as_u16(),
                error = %String::from_utf8_lossy(&body),
                "error status"
            );
            BufferedResponse { status, headers, body }.into_response()
        } else {
            tracing::info!(
                provider = %model.provider,
                model = %model.model,
                status = status.as_u16(),
                "error status"
            );
            stream_response(upstream)
        }
    }
}

/// A response remembered past the attempt that produced it. Framing
/// headers were stripped when it was buffered.
struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl BufferedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Streams an upstream response back without buffering, preserving SSE
/// event timing.
fn stream_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

pub(crate) fn is_retryable(status: StatusCode) -> bool {
    status.as_u16() >= 500 || status == StatusCode::TOO_MANY_REQUESTS
}

/// No wait after the last attempt of the last model in the last cycle.
fn should_wait(
    cycle: u32,
    model_idx: usize,
    attempt: u32,
    num_models: usize,
    model_attempts: u32,
    max_cycles: u32,
) -> bool {
    !(cycle + 1 == max_cycles && model_idx + 1 == num_models && attempt + 1 == model_attempts)
}

/// Builds the upstream URL: scheme and host from the provider base, path
/// joined without double slashes, query preserved. The `/vN` prefix is
/// dropped first when the provider asks for it.
fn build_target_url(base: &Url, request_path: &str, query: Option<&str>, strip_version_prefix: bool) -> Url {
    let request_path = if strip_version_prefix {
        version_prefix_regex().replace(request_path, "").into_owned()
    } else {
        request_path.to_string()
    };

    let base_path = base.path().trim_end_matches('/').to_string();
    let mut url = base.clone();
    url.set_path(&format!("{base_path}{request_path}"));
    url.set_query(query);
    url
}

/// Drops headers that must not be forwarded: connection management is
/// per-hop, and host/length are derived from the rewritten request.
fn sanitize_proxy_headers(headers: &mut HeaderMap) {
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove(header::TE);
    headers.remove(header::UPGRADE);
    headers.remove("keep-alive");
}

/// Removes message-framing headers from a response whose body has been
/// replaced or drained.
fn strip_framing_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::TRANSFER_ENCODING);
}
