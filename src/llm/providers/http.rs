//! HTTP plumbing shared by the vendor adapters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;

use crate::error::{ConfigError, ProviderError};
use crate::llm::provider::ProviderRoute;

/// Longest error body excerpt kept in error messages.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// A vendor response before it is decoded.
#[derive(Debug)]
pub struct RawResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Body text.
    pub body: String,
}

/// Builds the shared HTTP client.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] if TLS initialisation fails.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("quarry/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ConfigError::InvalidValue {
            key: "http_client".to_string(),
            message: e.to_string(),
        })
}

/// Sends a request and reads the body, mapping transport failures.
///
/// # Errors
///
/// Returns [`ProviderError::Transport`] when no complete response arrived.
pub async fn send(request: RequestBuilder, route: ProviderRoute) -> Result<RawResponse, ProviderError> {
    let response = request.send().await.map_err(|e| ProviderError::Transport {
        route,
        message: e.to_string(),
    })?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.map_err(|e| ProviderError::Transport {
        route,
        message: e.to_string(),
    })?;
    Ok(RawResponse {
        status,
        headers,
        body,
    })
}

/// Decodes a successful JSON body.
///
/// # Errors
///
/// Returns [`ProviderError::Decode`] on malformed JSON.
pub fn decode<T: serde::de::DeserializeOwned>(
    raw: &RawResponse,
    route: ProviderRoute,
) -> Result<T, ProviderError> {
    serde_json::from_str(&raw.body).map_err(|e| ProviderError::Decode {
        route,
        message: format!("{e}; body: {}", excerpt(&raw.body)),
    })
}

/// Classifies a non-success response that is not a rate limit.
#[must_use]
pub fn status_error(raw: &RawResponse, route: ProviderRoute) -> ProviderError {
    let message = error_message(&raw.body);
    let status = raw.status.as_u16();
    if raw.status.is_server_error() || status == 529 {
        ProviderError::Server {
            route,
            status,
            message,
        }
    } else {
        ProviderError::Api {
            route,
            status: Some(status),
            message,
        }
    }
}

/// Pulls `error.message` (or `message`) out of a JSON error body.
#[must_use]
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.pointer("/error/message")
                .or_else(|| json.get("message"))
                .or_else(|| json.get("Message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| excerpt(body))
}

fn excerpt(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Reads `retry-after` as whole or fractional seconds.
#[must_use]
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Time until an RFC 3339 instant, zero if it already passed.
#[must_use]
pub fn until_rfc3339(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let at = DateTime::parse_from_rfc3339(value.trim()).ok()?;
    Some(
        at.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

/// Parses Go-style durations such as `1m30.5s`, `250ms` or `2h`.
#[must_use]
pub fn parse_go_duration(value: &str) -> Option<Duration> {
    let mut rest = value.trim();
    if rest.is_empty() {
        return None;
    }
    let mut total = 0.0_f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let number: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            "us" | "µs" => 0.000_001,
            "ns" => 0.000_000_001,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += number * scale;
    }
    total.is_finite().then(|| Duration::from_secs_f64(total))
}

/// Largest of the durations found in `names`, parsed by `parse`.
pub fn max_header_duration(
    headers: &HeaderMap,
    names: &[&str],
    parse: impl Fn(&str) -> Option<Duration>,
) -> Option<Duration> {
    names
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .filter_map(parse)
        .max()
}
