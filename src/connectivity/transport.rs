//! HTTP exchange used by the SOAP codec
//!
//! The codec only needs "POST this body, give me status and body back".
//! Keeping that behind a trait lets tests script router behaviour without
//! a network.

use super::types::NatError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONNECTION;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use reqwest::Url;
use tracing::debug;

/// Status and body of one HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One independent HTTP POST per call; no pipelining is assumed
#[async_trait]
pub trait SoapTransport: Send + Sync {
    /// POST `body` to `url` with the given headers.
    ///
    /// Non-2xx statuses are NOT errors here: routers attach SOAP faults to
    /// 500 responses, so the reply is returned for the codec to inspect.
    async fn post(
        &self,
        url: &Url,
        headers: &[(&'static str, String)],
        body: String,
    ) -> Result<HttpReply, NatError>;
}

/// Plain HTTP/1.1 transport over hyper's client, without connection reuse
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HyperTransport {
    pub fn new() -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build_http();

        Self { client }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SoapTransport for HyperTransport {
    async fn post(
        &self,
        url: &Url,
        headers: &[(&'static str, String)],
        body: String,
    ) -> Result<HttpReply, NatError> {
        let mut builder = Request::builder().method(Method::POST).uri(url.as_str());
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }

        let req = builder
            .header(CONNECTION, "close")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| NatError::InvalidArgument(format!("Failed to build request: {}", e)))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| NatError::Unreachable(format!("POST {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        debug!("POST {} answered with HTTP {}", url, status);

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| NatError::Unreachable(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        Ok(HttpReply {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
