// packages/uplink/src/upload/transport.rs
//! HTTP transport seam
//!
//! The dispatcher only speaks [`IngestTransport`]; [`HyperTransport`] is the
//! default client. It speaks both `https://` (rustls, webpki roots) and plain
//! `http://`, since presigned storage URLs and local test servers differ.
//! Hosts that need a platform networking stack plug in their own
//! implementation.

use crate::utils::errors::{PipelineError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::trace;

/// Outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// JSON POST
    pub fn post_json(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, url)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Response status and fully-read body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one request and returns the complete response
pub trait IngestTransport: Send + Sync {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

/// hyper client with a per-request deadline
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HyperTransport {
    pub fn new(timeout: Duration) -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client, timeout }
    }

    async fn exchange(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let req = builder
            .body(Full::new(request.body))
            .map_err(|e| PipelineError::NetworkFailed(format!("Request build error: {}", e)))?;

        let response = self.client.request(req).await.map_err(|e| {
            PipelineError::NetworkFailed(format!(
                "{} {} failed: {}",
                request.method,
                request.url,
                error_chain(&e)
            ))
        })?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PipelineError::NetworkFailed(format!("Response body error: {}", e)))?
            .to_bytes();

        trace!("{} {} -> {}", request.method, request.url, status);

        Ok(HttpResponse { status, body })
    }
}

/// `error: cause: cause`, since the client error alone only names its kind
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl IngestTransport for HyperTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let target = format!("{} {}", request.method, request.url);
            tokio::time::timeout(self.timeout, self.exchange(request))
                .await
                .map_err(|_| PipelineError::Timeout(format!("{} after {:?}", target, self.timeout)))?
        })
    }
}
