use std::io::Read;

use axum::http::{header, request::Parts};
use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::Value;

use crate::{RelayError, Result};

/// At most this many bytes of an upstream error body are captured for
/// logging and replay.
const ERROR_BODY_CAPTURE_BYTES: usize = 4 * 1024;

/// Bound on the compressed input consumed while decompressing a
/// gzip-encoded error body.
const ERROR_BODY_GZIP_SOURCE_BYTES: usize = 64 * 1024;

const BODY_LOG_MAX_BYTES: usize = 2048;

/// Overrides the top-level `model` field of a JSON request body.
///
/// An empty body becomes `{"model": <name>}`. All other fields and their
/// order are preserved. Non-JSON bodies (and JSON bodies whose root is not
/// an object) are rejected.
pub fn set_model(body: &[u8], model: &str) -> Result<Bytes> {
    let mut value = if body.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(body).map_err(|err| RelayError::ModelOverride(err.to_string()))?
    };
    let Value::Object(object) = &mut value else {
        return Err(RelayError::ModelOverride("request body is not a JSON object".to_string()));
    };
    object.insert("model".to_string(), Value::String(model.to_string()));
    let encoded = serde_json::to_vec(&value).map_err(|err| RelayError::ModelOverride(err.to_string()))?;
    Ok(Bytes::from(encoded))
}

#[derive(Default, Deserialize)]
struct StreamProbe {
    #[serde(default)]
    stream: bool,
}

/// A request is streaming when its path hints at a streaming endpoint,
/// its `Accept` header asks for SSE, or its JSON body sets `stream: true`.
/// An absent or unparsable body never classifies as streaming by itself.
pub fn is_streaming_request(parts: &Parts, body: &[u8]) -> bool {
    let path = parts.uri.path();
    if path.contains("-stream") || path.contains("/stream") {
        return true;
    }

    let accept = parts
        .headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if accept.contains("text/event-stream") {
        return true;
    }

    serde_json::from_slice::<StreamProbe>(body)
        .map(|probe| probe.stream)
        .unwrap_or(false)
}

/// Captures up to 4 KiB of an upstream error body, decompressing
/// gzip-encoded bodies first. The rest of the body is discarded.
pub async fn read_error_body(response: reqwest::Response) -> std::io::Result<Bytes> {
    let gzip = response
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == "gzip");

    if gzip {
        let (raw, truncated) = collect_up_to(response.bytes_stream(), ERROR_BODY_GZIP_SOURCE_BYTES)
            .await
            .map_err(std::io::Error::other)?;
        if truncated {
            return Err(std::io::Error::other(format!(
                "gzip error body is bigger than the {ERROR_BODY_GZIP_SOURCE_BYTES} byte decode bound"
            )));
        }
        let mut decoded = Vec::new();
        GzDecoder::new(raw.as_ref())
            .take(ERROR_BODY_CAPTURE_BYTES as u64)
            .read_to_end(&mut decoded)?;
        Ok(Bytes::from(decoded))
    } else {
        let (body, _) = collect_up_to(response.bytes_stream(), ERROR_BODY_CAPTURE_BYTES)
            .await
            .map_err(std::io::Error::other)?;
        Ok(body)
    }
}

/// Consumes and discards the remainder of a response body so the
/// connection can return to the pool.
pub async fn drain_body(response: reqwest::Response) {
    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        if next.is_err() {
            break;
        }
    }
}

/// Gathers a byte stream into memory, never holding more than `limit`
/// bytes. The flag reports whether the stream had more data past the
/// limit; when it does, reading stops there and the excess is never
/// pulled off the wire. Callers decide whether a truncated collect is
/// an error (request buffering) or fine (error-body capture).
pub(crate) async fn collect_up_to<S, E>(
    mut stream: S,
    limit: usize,
) -> std::result::Result<(Bytes, bool), E>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
{
    let mut collected = BytesMut::new();
    while let Some(chunk) = stream.try_next().await? {
        let space = limit - collected.len();
        if chunk.len() > space {
            collected.extend_from_slice(&chunk[..space]);
            return Ok((collected.freeze(), true));
        }
        collected.extend_from_slice(&chunk);
    }
    Ok((collected.freeze(), false))
}

/// Renders a request body for debug logs: `(empty)` for empty bodies,
/// pretty-printed JSON where possible, raw bytes otherwise. Output longer
/// than 2048 bytes is truncated with a marker.
pub fn format_body_for_log(body: &[u8]) -> String {
    if body.is_empty() {
        return "(empty)".to_string();
    }

    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Ok(formatted) = serde_json::to_string_pretty(&value) {
            return truncate_for_log(formatted.as_bytes());
        }
    }

    truncate_for_log(body)
}

fn truncate_for_log(body: &[u8]) -> String {
    if body.len() > BODY_LOG_MAX_BYTES {
        format!("{}\n... (truncated)", String::from_utf8_lossy(&body[..BODY_LOG_MAX_BYTES]))
    } else {
        String::from_utf8_lossy(body).to_string()
    }
}
