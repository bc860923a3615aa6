//! Shared HTTP transport for REST-backed adapters.
//!
//! Wraps a `reqwest::Client` and turns transport failures, non-success
//! statuses and undecodable bodies into [`ServiceError`]s of the caller's
//! domain, keeping the original failure as the cause.

use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::error::{ErrorDomain, ErrorKind, ServiceError, ServiceResult};

/// Cause attached when a backing service answers with a non-success status.
#[derive(Error, Debug, Clone)]
#[error("HTTP {status}: {body}")]
pub struct HttpStatusError {
    /// Response status code
    pub status: u16,
    /// Response body, as text
    pub body: String,
}

#[derive(Debug, Clone)]
pub(crate) struct HttpTransport {
    client: reqwest::Client,
    domain: ErrorDomain,
    provider: &'static str,
}

impl HttpTransport {
    pub(crate) fn new(
        domain: ErrorDomain,
        provider: &'static str,
        timeout: Duration,
    ) -> ServiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ServiceError::invalid_config(domain, format!("{}: cannot build HTTP client", provider))
                    .with_cause(e)
            })?;
        Ok(Self {
            client,
            domain,
            provider,
        })
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send the request and require a success status.
    pub(crate) async fn send(
        &self,
        request: RequestBuilder,
        kind: ErrorKind,
        context: &str,
    ) -> ServiceResult<Response> {
        let response = request.send().await.map_err(|e| {
            ServiceError::new(self.domain, kind, context.to_string()).with_cause(e)
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::warn!(
            provider = self.provider,
            status = status.as_u16(),
            "{}",
            context
        );
        Err(ServiceError::new(self.domain, kind, context.to_string()).with_cause(
            HttpStatusError {
                status: status.as_u16(),
                body,
            },
        ))
    }

    /// Send the request and decode a JSON body. An empty body decodes as
    /// JSON `null`.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        kind: ErrorKind,
        context: &str,
    ) -> ServiceResult<T> {
        let response = self.send(request, kind, context).await?;
        let text = response.text().await.map_err(|e| {
            ServiceError::new(self.domain, kind, context.to_string()).with_cause(e)
        })?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| {
            ServiceError::new(
                self.domain,
                kind,
                format!("{}: unexpected response body", context),
            )
            .with_cause(e)
        })
    }

    /// Send the request and discard the body.
    pub(crate) async fn send_empty(
        &self,
        request: RequestBuilder,
        kind: ErrorKind,
        context: &str,
    ) -> ServiceResult<()> {
        self.send(request, kind, context).await.map(|_| ())
    }
}

/// Strip a trailing slash so paths can be appended with `format!`.
pub(crate) fn base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Accept `value` as a single URL path segment. Dot segments are rejected
/// since URL normalization would resolve them against the parent path.
pub(crate) fn path_segment(value: &str, domain: ErrorDomain) -> ServiceResult<&str> {
    if matches!(value, "" | "." | "..") || value.contains(['/', '?', '#']) {
        return Err(ServiceError::invalid_config(
            domain,
            format!("invalid path segment: {:?}", value),
        ));
    }
    Ok(value)
}
