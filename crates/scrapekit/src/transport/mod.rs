//! Transport seam
//!
//! Design: the engine never talks to the network directly. A [`Transport`]
//! sends one fully built [`HttpRequest`] and hands back one
//! [`HttpResponse`]; connection pooling, TLS, proxies and redirects are
//! its business. [`ReqwestTransport`] is the default implementation.

mod default;

pub use default::ReqwestTransport;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use url::Url;

/// Error type transports report failures with
pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Trait for the HTTP transport collaborator
///
/// Implement this trait to plug in a different HTTP stack or a scripted
/// transport for tests. Exactly one call is made per fetch; retries are
/// left to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier for logging/debugging
    fn name(&self) -> &'static str;

    /// Send the request and return the response with an unread body
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).execute(request).await
    }
}

/// Wire-level request handed to a [`Transport`]
///
/// The body is an in-memory buffer, so the request can be cloned and
/// replayed.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// Method, URL and headers, without the body
    pub fn head(&self) -> RequestHead {
        RequestHead {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// Request line and headers of the request a response answers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

/// Status line and headers of a response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Final URL after redirects, when the transport reports one
    pub url: Option<Url>,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            url: None,
        }
    }

    /// Content-Type header value, if present and valid text
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Content-Length header value, if present and numeric
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
    }
}

type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Unread response body
pub struct ResponseBody(BoxReader);

impl ResponseBody {
    /// A body that is immediately at end of stream
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::from_reader(io::Cursor::new(bytes.into()))
    }

    pub fn from_reader(reader: impl AsyncRead + Send + 'static) -> Self {
        Self(Box::pin(reader))
    }
}

impl AsyncRead for ResponseBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.0.as_mut().poll_read(cx, buf)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseBody { .. }")
    }
}

/// Response returned by a [`Transport`]
///
/// Dropping the response closes the body.
#[derive(Debug)]
pub struct HttpResponse {
    pub head: ResponseHead,
    pub trailers: Option<HeaderMap>,
    /// The request this response answers
    pub request: Option<RequestHead>,
    pub body: ResponseBody,
}

impl HttpResponse {
    pub fn new(head: ResponseHead, body: ResponseBody) -> Self {
        Self {
            head,
            trailers: None,
            request: None,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// Copy safe to hand to an observer: empty body, cloned headers and
    /// trailers, no link back to the request
    pub fn snapshot(&self) -> HttpResponse {
        HttpResponse {
            head: self.head.clone(),
            trailers: self.trailers.clone(),
            request: None,
            body: ResponseBody::empty(),
        }
    }
}
