use axum::http::{header, HeaderMap, HeaderValue, Method};
use reqwest::Url;

use crate::config::{Dialect, Provider};
use crate::sigv4::{SigV4Signer, SigV4Timestamp};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Injects the authentication headers for one attempt.
///
/// The api_key sentinel `-` deletes the dialect's credential header, an
/// empty key leaves whatever the client sent intact, and any other value
/// replaces it. Bedrock requests are SigV4-signed instead when the
/// provider carries static credentials.
pub fn apply_dialect_auth(
    headers: &mut HeaderMap,
    method: &Method,
    url: &Url,
    body: &[u8],
    dialect: Dialect,
    provider: &Provider,
) {
    match dialect {
        Dialect::Openai => match provider.api_key.as_str() {
            "-" => {
                headers.remove(header::AUTHORIZATION);
            }
            "" => {}
            key => set_header(headers, header::AUTHORIZATION, &format!("Bearer {key}")),
        },
        Dialect::Anthropic => {
            match provider.api_key.as_str() {
                "-" => {
                    headers.remove("x-api-key");
                }
                "" => {}
                key => set_header(headers, "x-api-key", key),
            }
            headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        }
        Dialect::Bedrock => sign_bedrock_request(headers, method, url, body, provider),
    }
}

fn set_header(headers: &mut HeaderMap, name: impl axum::http::header::IntoHeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(err) => tracing::warn!(error = %err, "skipping invalid auth header value"),
    }
}

/// Signs a Bedrock attempt with SigV4 when the provider has a static
/// access key; otherwise the request goes out unsigned and any ambient
/// AWS auth is left to the upstream. A signing failure is logged and the
/// attempt proceeds unsigned.
fn sign_bedrock_request(
    headers: &mut HeaderMap,
    method: &Method,
    url: &Url,
    body: &[u8],
    provider: &Provider,
) {
    if provider.aws_access_key_id.is_empty() {
        return;
    }

    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    let region = if provider.aws_region.is_empty() {
        "us-east-1"
    } else {
        provider.aws_region.as_str()
    };
    let session_token = if provider.aws_session_token.is_empty() {
        None
    } else {
        Some(provider.aws_session_token.clone())
    };

    let result = sign_with(headers, method, url, body, provider, region, session_token);
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to sign bedrock request");
    }
}

fn sign_with(
    headers: &mut HeaderMap,
    method: &Method,
    url: &Url,
    body: &[u8],
    provider: &Provider,
    region: &str,
    session_token: Option<String>,
) -> crate::Result<()> {
    let signer = SigV4Signer::new(
        provider.aws_access_key_id.clone(),
        provider.aws_secret_access_key.clone(),
        session_token,
        region,
        "bedrock",
    )?;
    let timestamp = SigV4Timestamp::now()?;
    let signed = signer.sign(method.as_str(), url, headers, body, timestamp)?;
    signed.apply(headers)
}
