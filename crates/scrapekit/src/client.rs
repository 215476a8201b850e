//! Scraper client
//!
//! Design: one [`Scraper`] is built once and shared. Each call runs the
//! stages strictly in order on the caller's task: prepare body, send,
//! validate, read with a size ceiling, decode. The configuration is never
//! mutated after [`ScraperBuilder::build`], so concurrent calls need no
//! locking.

use crate::body::{prepare_body, PreparedBody, RequestPayload};
use crate::error::{AppError, Cause, ErrorKind, FetchError, Result};
use crate::html::Document;
use crate::io::read_bounded;
use crate::json;
use crate::scope::FetchScope;
use crate::transport::{HttpRequest, HttpResponse, ReqwestTransport, ResponseHead, Transport};
use crate::validate::{
    is_html_content_type, validate_response, AcceptPolicy, ResponseCheck, ResponseObserver,
};
use crate::DEFAULT_USER_AGENT;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, warn};
use url::Url;

/// Default ceiling for request and response bodies (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// One request as described by the caller
pub struct FetchRequest {
    method: Method,
    url: String,
    payload: RequestPayload,
    headers: HeaderMap,
    check: Option<ResponseCheck>,
}

impl FetchRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            payload: RequestPayload::Absent,
            headers: HeaderMap::new(),
            check: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Set the request body
    pub fn body(mut self, payload: impl Into<RequestPayload>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set one header, replacing earlier values
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Copy every header of `headers` into the request
    ///
    /// The caller's map is cloned, never modified.
    pub fn headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.append(name.clone(), value.clone());
        }
        self
    }

    /// Run `check` on the response head once the status is accepted
    pub fn check<F>(mut self, check: F) -> Self
    where
        F: Fn(&ResponseHead) -> std::result::Result<(), Cause> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("payload", &self.payload)
            .field("headers", &self.headers)
            .field("check", &self.check.is_some())
            .finish()
    }
}

/// Everything needed to send one request, fixed before sending
struct RequestParameters {
    method: Method,
    url: String,
    body: Option<PreparedBody>,
    headers: HeaderMap,
    accept: &'static str,
    check: Option<ResponseCheck>,
}

/// A response read into memory
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub head: ResponseHead,
    /// Effective URL, or the requested URL when the transport reports none
    pub url: Url,
    /// At most the configured response limit
    pub body: Bytes,
    /// True when the body was cut at the limit
    pub truncated: bool,
}

impl FetchResult {
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn content_type(&self) -> Option<&str> {
        self.head.content_type()
    }
}

struct Config {
    transport: Arc<dyn Transport>,
    max_request_body_size: usize,
    max_response_body_size: usize,
    on_response: Option<ResponseObserver>,
    user_agent: HeaderValue,
}

/// Builder for configuring a [`Scraper`]
#[derive(Default)]
pub struct ScraperBuilder {
    transport: Option<Arc<dyn Transport>>,
    max_request_body_size: Option<usize>,
    max_response_body_size: Option<usize>,
    on_response: Option<ResponseObserver>,
    user_agent: Option<String>,
}

impl ScraperBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom transport instead of [`ReqwestTransport`]
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Maximum request body size in bytes; zero keeps the default
    pub fn max_request_body_size(mut self, size: usize) -> Self {
        if size == 0 {
            debug!("Ignoring zero max_request_body_size");
        } else {
            self.max_request_body_size = Some(size);
        }
        self
    }

    /// Maximum response body size in bytes; zero keeps the default
    pub fn max_response_body_size(mut self, size: usize) -> Self {
        if size == 0 {
            debug!("Ignoring zero max_response_body_size");
        } else {
            self.max_response_body_size = Some(size);
        }
        self
    }

    /// Receive a detached snapshot of every response before validation
    pub fn on_response<F>(mut self, observer: F) -> Self
    where
        F: Fn(HttpResponse) + Send + Sync + 'static,
    {
        self.on_response = Some(Arc::new(observer));
        self
    }

    /// Set the User-Agent sent when a request has none
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Build the scraper
    pub fn build(self) -> Result<Scraper> {
        let user_agent = self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
        let user_agent = HeaderValue::from_str(user_agent).map_err(|err| {
            AppError::wrap(
                ErrorKind::InvalidInput,
                format!("invalid User-Agent {user_agent:?}"),
                Cause::foreign(err),
            )
        })?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        Ok(Scraper {
            config: Arc::new(Config {
                transport,
                max_request_body_size: self.max_request_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
                max_response_body_size: self
                    .max_response_body_size
                    .unwrap_or(DEFAULT_MAX_BODY_SIZE),
                on_response: self.on_response,
                user_agent,
            }),
        })
    }
}

/// Configured fetch-validate-decode engine
///
/// Cheap to clone; clones share the configuration.
#[derive(Clone)]
pub struct Scraper {
    config: Arc<Config>,
}

impl fmt::Debug for Scraper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scraper")
            .field("transport", &self.config.transport.name())
            .field("max_request_body_size", &self.config.max_request_body_size)
            .field("max_response_body_size", &self.config.max_response_body_size)
            .field("on_response", &self.config.on_response.is_some())
            .finish()
    }
}

impl Scraper {
    /// Create a scraper with the default transport and limits
    pub fn new() -> Result<Self> {
        ScraperBuilder::new().build()
    }

    pub fn builder() -> ScraperBuilder {
        ScraperBuilder::new()
    }

    pub fn max_request_body_size(&self) -> usize {
        self.config.max_request_body_size
    }

    pub fn max_response_body_size(&self) -> usize {
        self.config.max_response_body_size
    }

    /// Send `request` and read the validated response into memory
    pub async fn fetch(
        &self,
        scope: &FetchScope,
        request: FetchRequest,
        policy: AcceptPolicy,
    ) -> Result<FetchResult> {
        let FetchRequest {
            method,
            url,
            payload,
            headers,
            check,
        } = request;

        let body = prepare_body(scope, payload, self.config.max_request_body_size).await?;
        let params = RequestParameters {
            method,
            url,
            body,
            headers,
            accept: policy.accept(),
            check,
        };

        let (response, requested) = self.invoke(scope, &params).await?;
        let response = validate_response(
            scope,
            response,
            policy,
            params.check.as_ref(),
            self.config.on_response.as_ref(),
        )
        .await?;
        self.read_body(scope, response, requested).await
    }

    /// Fetch and parse an HTML page
    pub async fn fetch_html(&self, scope: &FetchScope, request: FetchRequest) -> Result<Document> {
        let result = self.fetch(scope, request, AcceptPolicy::Html).await?;
        if result.truncated {
            return Err(self.truncated_error("HTML", &result.url));
        }
        let FetchResult { head, url, body, .. } = result;
        Ok(Document::decode(&body, head.content_type(), url))
    }

    /// GET a page and parse it
    pub async fn fetch_html_document(
        &self,
        scope: &FetchScope,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<Document> {
        self.fetch_html(scope, FetchRequest::get(url).headers(headers))
            .await
    }

    /// Parse HTML from a local stream, without any network activity
    ///
    /// `url_hint` becomes the document's base URL.
    pub async fn parse_html<R>(
        &self,
        scope: &FetchScope,
        reader: R,
        url_hint: &str,
        content_type: Option<&str>,
    ) -> Result<Document>
    where
        R: AsyncRead + Unpin,
    {
        let base_url = Url::parse(url_hint).map_err(|err| {
            AppError::wrap(
                ErrorKind::InvalidInput,
                format!("invalid base URL {url_hint:?}"),
                Cause::foreign(err),
            )
        })?;

        let (body, truncated) =
            read_bounded(scope, reader, self.config.max_response_body_size, None)
                .await
                .map_err(|err| {
                    FetchError::from_io(
                        err,
                        ErrorKind::Internal,
                        format!("failed to read HTML input for {base_url}"),
                    )
                })?;
        if truncated {
            return Err(self.truncated_error("HTML", &base_url));
        }

        if let Some(ct) = content_type.filter(|ct| !is_html_content_type(ct)) {
            warn!(url = %base_url, content_type = ct, "Input is not HTML, parsing anyway");
        }
        Ok(Document::decode(&body, content_type, base_url))
    }

    /// Fetch JSON and decode it into `target`
    ///
    /// A 204 response leaves `target` untouched.
    pub async fn fetch_json_into<T>(
        &self,
        scope: &FetchScope,
        request: FetchRequest,
        target: &mut T,
    ) -> Result<()>
    where
        T: DeserializeOwned,
    {
        let result = self.fetch(scope, request, AcceptPolicy::Json).await?;
        if result.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        *target = self.decode_result(scope, &result)?;
        Ok(())
    }

    /// Fetch JSON and decode it
    ///
    /// A 204 response decodes as `null`, so `Option<T>` yields `None`.
    pub async fn fetch_json<T>(&self, scope: &FetchScope, request: FetchRequest) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let result = self.fetch(scope, request, AcceptPolicy::Json).await?;
        if result.status() == StatusCode::NO_CONTENT {
            return serde_json::from_value(serde_json::Value::Null).map_err(|err| {
                AppError::wrap(
                    ErrorKind::ParsingFailed,
                    format!("no content from {} to decode", result.url),
                    Cause::foreign(err),
                )
                .into()
            });
        }
        self.decode_result(scope, &result)
    }

    /// Decode an in-memory JSON body, without any network activity
    pub fn decode_json_bytes<T>(
        &self,
        scope: &FetchScope,
        body: &[u8],
        content_type: Option<&str>,
        url: &str,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let limit = self.config.max_response_body_size;
        json::check_response(content_type, body.len() > limit, limit, url)?;
        json::decode(scope, body, content_type, url)
    }

    fn decode_result<T: DeserializeOwned>(&self, scope: &FetchScope, result: &FetchResult) -> Result<T> {
        let url = result.url.as_str();
        json::check_response(
            result.content_type(),
            result.truncated,
            self.config.max_response_body_size,
            url,
        )?;
        json::decode(scope, &result.body, result.content_type(), url)
    }

    /// Send exactly one request through the transport
    async fn invoke(
        &self,
        scope: &FetchScope,
        params: &RequestParameters,
    ) -> Result<(HttpResponse, Url)> {
        let request = self.build_request(params)?;
        let requested = request.url.clone();
        let method = request.method.clone();

        scope.check()?;
        debug!(
            %method,
            url = %requested,
            transport = self.config.transport.name(),
            "Sending request"
        );

        let outcome = tokio::select! {
            result = self.config.transport.execute(request) => result,
            cancelled = scope.done() => Err(cancelled.into()),
        };

        match outcome {
            Ok(response) => Ok((response, requested)),
            Err(err) => match scope.error() {
                Some(cancelled) => Err(AppError::wrap(
                    ErrorKind::Unavailable,
                    format!("request aborted: {method} {requested}"),
                    cancelled,
                )
                .into()),
                None => Err(AppError::wrap(
                    ErrorKind::Unavailable,
                    format!("network error: {method} {requested}"),
                    Cause::Foreign(err),
                )
                .into()),
            },
        }
    }

    fn build_request(&self, params: &RequestParameters) -> Result<HttpRequest> {
        let url = Url::parse(&params.url).map_err(|err| {
            AppError::wrap(
                ErrorKind::ExecutionFailed,
                format!("invalid request URL {:?}", params.url),
                Cause::foreign(err),
            )
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::new(
                ErrorKind::ExecutionFailed,
                format!("unsupported URL scheme {:?} in {url}", url.scheme()),
            )
            .into());
        }

        let mut headers = params.headers.clone();
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static(params.accept));
        }
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, self.config.user_agent.clone());
        }
        if let Some(content_type) = params.body.as_ref().and_then(|b| b.content_type) {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
        }

        Ok(HttpRequest {
            method: params.method.clone(),
            url,
            headers,
            body: params.body.as_ref().map(|b| b.bytes.clone()),
        })
    }

    async fn read_body(
        &self,
        scope: &FetchScope,
        response: HttpResponse,
        requested: Url,
    ) -> Result<FetchResult> {
        let HttpResponse { head, body, .. } = response;
        let url = head.url.clone().unwrap_or(requested);

        if head.status == StatusCode::NO_CONTENT {
            return Ok(FetchResult {
                head,
                url,
                body: Bytes::new(),
                truncated: false,
            });
        }

        let max = self.config.max_response_body_size;
        let (body, truncated) = read_bounded(scope, body, max, head.content_length())
            .await
            .map_err(|err| {
                FetchError::from_io(
                    err,
                    ErrorKind::Unavailable,
                    format!("failed to read response body from {url}"),
                )
            })?;
        if truncated {
            warn!(url = %url, limit = max, "Response body truncated");
        }

        Ok(FetchResult {
            head,
            url,
            body,
            truncated,
        })
    }

    fn truncated_error(&self, what: &str, url: &Url) -> FetchError {
        AppError::new(
            ErrorKind::InvalidInput,
            format!(
                "{what} from {url} exceeds the limit of {} bytes",
                self.config.max_response_body_size
            ),
        )
        .into()
    }
}
