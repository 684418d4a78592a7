//! AWS Signature Version 4 request signing.
//!
//! The canonical-request layout, the string-to-sign, and the
//! date/region/service key-derivation chain are all fixed by the AWS
//! SigV4 specification ("Signature Version 4 signing process" in the
//! AWS General Reference); this module implements that procedure over
//! the crate's `HeaderMap`-based outbound requests.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use axum::http::{HeaderMap, HeaderValue};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

use crate::{RelayError, Result};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// A signing instant in the `YYYYMMDD'T'HHMMSS'Z'` form SigV4 expects.
#[derive(Debug, Clone)]
pub struct SigV4Timestamp {
    amz_date: String,
}

impl SigV4Timestamp {
    pub fn now() -> Result<Self> {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(datetime: OffsetDateTime) -> Result<Self> {
        const AMZ_FORMAT: &[FormatItem<'_>] =
            format_description!("[year][month][day]T[hour][minute][second]Z");
        let amz_date = datetime
            .format(AMZ_FORMAT)
            .map_err(|err| RelayError::Signing(format!("failed to format signing time: {err}")))?;
        Ok(Self { amz_date })
    }

    #[cfg(test)]
    pub fn from_amz_date(amz_date: &str) -> Result<Self> {
        let amz_date = amz_date.trim();
        if amz_date.len() < 8 || !amz_date.is_ascii() {
            return Err(RelayError::Signing("malformed amz date".to_string()));
        }
        Ok(Self {
            amz_date: amz_date.to_string(),
        })
    }

    pub fn amz_date(&self) -> &str {
        &self.amz_date
    }

    /// The `YYYYMMDD` prefix used in the credential scope.
    fn date_stamp(&self) -> &str {
        &self.amz_date[..8]
    }
}

/// Signs requests with a static credential set. One instance is built
/// per signed attempt.
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
    service: String,
}

/// The headers produced by signing, applied onto the outbound request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub security_token: Option<String>,
}

impl SignedHeaders {
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        headers.insert("authorization", header_value(&self.authorization)?);
        headers.insert("x-amz-date", header_value(&self.amz_date)?);
        headers.insert("x-amz-content-sha256", header_value(&self.content_sha256)?);
        if let Some(token) = self.security_token.as_deref() {
            headers.insert("x-amz-security-token", header_value(token)?);
        }
        Ok(())
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| RelayError::Signing(format!("invalid signed header value: {err}")))
}

impl SigV4Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self> {
        let signer = Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token,
            region: region.into(),
            service: service.into(),
        };
        for (field, value) in [
            ("access_key", &signer.access_key),
            ("secret_key", &signer.secret_key),
            ("region", &signer.region),
            ("service", &signer.service),
        ] {
            if value.trim().is_empty() {
                return Err(RelayError::Signing(format!("sigv4 {field} is required")));
            }
        }
        Ok(signer)
    }

    /// Produces the SigV4 headers for one request. `payload` must be the
    /// exact bytes that will be sent; headers already on the request are
    /// folded into the signature.
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        headers: &HeaderMap,
        payload: &[u8],
        timestamp: SigV4Timestamp,
    ) -> Result<SignedHeaders> {
        let host = host_with_port(url)?;
        let payload_hash = hex_digest(payload);

        let signable = self.signable_headers(headers, &host, &timestamp, &payload_hash);
        let signed_names = signable.keys().map(String::as_str).collect::<Vec<_>>().join(";");
        let header_block: String = signable
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();

        let canonical_request = [
            method.to_string(),
            encode_path(url),
            encode_query(url),
            header_block,
            signed_names.clone(),
            payload_hash.clone(),
        ]
        .join("\n");

        let scope = self.credential_scope(timestamp.date_stamp());
        let string_to_sign = format!(
            "{ALGORITHM}\n{}\n{scope}\n{}",
            timestamp.amz_date(),
            hex_digest(canonical_request.as_bytes())
        );
        let signature = self.signature(timestamp.date_stamp(), &string_to_sign)?;

        Ok(SignedHeaders {
            authorization: format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_names}, Signature={signature}",
                self.access_key
            ),
            amz_date: timestamp.amz_date,
            content_sha256: payload_hash,
            security_token: self.session_token.clone(),
        })
    }

    /// The headers that take part in the signature: every UTF-8 request
    /// header (lowercased, whitespace collapsed, duplicates joined with
    /// commas) plus the synthetic host/date/content-hash entries. Non-UTF-8
    /// values are left out; AWS ignores unsigned headers.
    fn signable_headers(
        &self,
        headers: &HeaderMap,
        host: &str,
        timestamp: &SigV4Timestamp,
        payload_hash: &str,
    ) -> BTreeMap<String, String> {
        let mut signable = headers
            .iter()
            .filter_map(|(name, value)| {
                let value = collapse_whitespace(value.to_str().ok()?);
                Some((name.as_str().to_ascii_lowercase(), value))
            })
            .fold(BTreeMap::<String, String>::new(), |mut map, (name, value)| {
                map.entry(name)
                    .and_modify(|joined| {
                        if !joined.is_empty() {
                            joined.push(',');
                        }
                        joined.push_str(&value);
                    })
                    .or_insert(value);
                map
            });

        signable.entry("host".to_string()).or_insert_with(|| host.to_string());
        signable.insert("x-amz-date".to_string(), timestamp.amz_date().to_string());
        signable
            .entry("x-amz-content-sha256".to_string())
            .or_insert_with(|| payload_hash.to_string());
        if let Some(token) = self.session_token.as_deref() {
            signable.insert("x-amz-security-token".to_string(), collapse_whitespace(token));
        }
        signable
    }

    fn credential_scope(&self, date_stamp: &str) -> String {
        format!("{date_stamp}/{}/{}/aws4_request", self.region, self.service)
    }

    /// Derives the signing key by folding HMAC-SHA256 over the
    /// date/region/service/terminator chain, then signs the string-to-sign.
    fn signature(&self, date_stamp: &str, string_to_sign: &str) -> Result<String> {
        let seed = format!("AWS4{}", self.secret_key).into_bytes();
        let signing_key = [date_stamp, self.region.as_str(), self.service.as_str(), "aws4_request"]
            .into_iter()
            .try_fold(seed, |key, input| hmac(&key, input.as_bytes()))?;
        Ok(hex(&hmac(&signing_key, string_to_sign.as_bytes())?))
    }
}

fn host_with_port(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::Signing("sigv4 url has no host".to_string()))?;
    Ok(url
        .port()
        .map_or_else(|| host.to_string(), |port| format!("{host}:{port}")))
}

fn encode_path(url: &Url) -> String {
    match url.path() {
        "" => "/".to_string(),
        path => uri_encode(path, false),
    }
}

/// Query pairs are encoded, then sorted by encoded name and value.
fn encode_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| (uri_encode(&name, true), uri_encode(&value, true)))
        .collect();
    pairs.sort_unstable();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .reduce(|mut query, pair| {
            query.push('&');
            query.push_str(&pair);
            query
        })
        .unwrap_or_default()
}

/// RFC 3986 unreserved characters pass through; everything else becomes
/// `%XX` with uppercase hex, per the SigV4 canonicalization rules.
/// Slashes stay literal in paths but are encoded inside query strings.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => {
                let _ = write!(encoded, "%{byte:02X}");
            }
        }
    }
    encoded
}

/// SigV4 header canonicalization: interior whitespace runs shrink to one
/// space and the ends are trimmed.
fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hmac(key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| RelayError::Signing(format!("bad hmac key: {err}")))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex_digest(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}
