//! Default reqwest-backed transport
//!
//! Connection pooling, TLS, decompression and redirect following are all
//! handled by the wrapped `reqwest::Client`.

use super::{HttpRequest, HttpResponse, ResponseBody, ResponseHead, Transport, TransportError};
use crate::error::{AppError, Cause, ErrorKind};
use crate::DEFAULT_USER_AGENT;
use async_trait::async_trait;
use futures::TryStreamExt;
use std::io;
use std::time::Duration;
use tokio_util::io::StreamReader;

/// Connect timeout for the default client
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP transport built on `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with a connect timeout and the default User-Agent
    pub fn new() -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| {
                AppError::wrap(
                    ErrorKind::Internal,
                    "failed to create HTTP client",
                    Cause::foreign(err),
                )
            })?;
        Ok(Self { client })
    }

    /// Use an already configured client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    fn name(&self) -> &'static str {
        "reqwest"
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let request_head = request.head();

        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;

        let head = ResponseHead {
            status: response.status(),
            headers: response.headers().clone(),
            url: Some(response.url().clone()),
        };

        let stream = response.bytes_stream().map_err(io::Error::other);
        let body = ResponseBody::from_reader(StreamReader::new(stream));

        let mut http_response = HttpResponse::new(head, body);
        http_response.request = Some(request_head);
        Ok(http_response)
    }
}
