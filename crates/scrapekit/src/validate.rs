//! Response validation
//!
//! Decides whether a response is worth reading. Failed responses are
//! turned into classified errors carrying a short, charset-normalized
//! preview of the body, and the status-to-kind table here is what callers
//! base their retry decisions on.

use crate::charset;
use crate::error::{AppError, Cause, ErrorKind, FetchError, Result};
use crate::io::{drain, read_prefix};
use crate::scope::FetchScope;
use crate::transport::{HttpResponse, ResponseHead};
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Bytes of a failed response captured for the error message
pub const PREVIEW_LEN: usize = 1024;

/// Bytes drained after the preview so the connection can be reused
pub const DRAIN_LEN: usize = 3 * 1024;

/// Caller-supplied check run after the status passes
///
/// Returning a [`Cause::App`] keeps that error's kind; any other cause
/// is classified as [`ErrorKind::ExecutionFailed`].
pub type ResponseCheck = Arc<dyn Fn(&ResponseHead) -> std::result::Result<(), Cause> + Send + Sync>;

/// Callback receiving a detached snapshot of every response
pub type ResponseObserver = Arc<dyn Fn(HttpResponse) + Send + Sync>;

/// Which statuses a flow accepts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcceptPolicy {
    /// 200 and 204, with a lenient content-type check
    Html,
    /// 200, 201, 202 and 204
    #[default]
    Json,
}

impl AcceptPolicy {
    pub fn allows(&self, status: StatusCode) -> bool {
        match self {
            AcceptPolicy::Html => matches!(status.as_u16(), 200 | 204),
            AcceptPolicy::Json => matches!(status.as_u16(), 200 | 201 | 202 | 204),
        }
    }

    /// Default Accept header for the flow
    pub fn accept(&self) -> &'static str {
        match self {
            AcceptPolicy::Html => {
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"
            }
            AcceptPolicy::Json => "application/json",
        }
    }
}

/// Map a rejected HTTP status to an error kind
///
/// 5xx, 408 and 429 are transient; every other 4xx is permanent; anything
/// else defaults to transient.
pub fn status_kind(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        408 | 429 => ErrorKind::Unavailable,
        400..=499 => ErrorKind::ExecutionFailed,
        500..=599 => ErrorKind::Unavailable,
        _ => ErrorKind::Unavailable,
    }
}

/// Media type of a Content-Type value, lowercased and without parameters
pub(crate) fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub(crate) fn is_html_content_type(content_type: &str) -> bool {
    matches!(
        media_type(content_type).as_str(),
        "text/html" | "application/xhtml+xml"
    )
}

pub(crate) fn is_json_content_type(content_type: &str) -> bool {
    let media = media_type(content_type);
    media == "application/json" || media == "text/json" || media.ends_with("+json")
}

/// Validate `response`, returning it for reading if it passes
///
/// On failure the body is previewed, partially drained and dropped.
pub async fn validate_response(
    scope: &FetchScope,
    mut response: HttpResponse,
    policy: AcceptPolicy,
    check: Option<&ResponseCheck>,
    observer: Option<&ResponseObserver>,
) -> Result<HttpResponse> {
    if let Some(observer) = observer {
        observer(response.snapshot());
    }

    let status = response.status();
    let url = response_url(&response);

    if status == StatusCode::NO_CONTENT {
        return Ok(response);
    }

    if !policy.allows(status) {
        let preview = body_preview(scope, &mut response).await;
        if let Err(err) = drain(scope, &mut response.body, DRAIN_LEN).await {
            tracing::debug!(url = %url, error = %err, "Failed to drain rejected response body");
        }

        let kind = status_kind(status);
        let err = AppError::new(
            kind,
            format!("unexpected HTTP status {status} from {url}: {preview}"),
        );
        log_rejection(&err, status, &url);
        return Err(err.into());
    }

    if policy == AcceptPolicy::Html {
        match response.head.content_type() {
            Some(ct) if !is_html_content_type(ct) => {
                warn!(url = %url, content_type = ct, "Response is not HTML, parsing anyway");
            }
            None => {
                warn!(url = %url, "Response has no content type, parsing as HTML");
            }
            _ => {}
        }
    }

    if let Some(check) = check {
        if let Err(cause) = check(&response.head) {
            let preview = body_preview(scope, &mut response).await;
            let kind = cause.kind().unwrap_or(ErrorKind::ExecutionFailed);
            let err = AppError::wrap(
                kind,
                format!("response from {url} rejected by check: {cause} (body: {preview})"),
                cause,
            );
            return Err(FetchError::App(err));
        }
    }

    Ok(response)
}

/// Charset-normalized preview of the first [`PREVIEW_LEN`] body bytes.
///
/// Never fails: a read error becomes part of the preview text.
async fn body_preview(scope: &FetchScope, response: &mut HttpResponse) -> String {
    match read_prefix(scope, &mut response.body, PREVIEW_LEN).await {
        Ok(bytes) => {
            let detected = charset::detect(&bytes, response.head.content_type());
            let text = charset::decode(&bytes, detected);
            let text = text.trim_end_matches('\u{FFFD}').trim();
            if text.is_empty() {
                "<empty body>".to_string()
            } else {
                text.to_string()
            }
        }
        Err(err) => format!("<body unavailable: {err}>"),
    }
}

fn response_url(response: &HttpResponse) -> String {
    response
        .head
        .url
        .as_ref()
        .or(response.request.as_ref().map(|r| &r.url))
        .map(|u| u.to_string())
        .unwrap_or_else(|| "<unknown url>".to_string())
}

fn log_rejection(err: &AppError, status: StatusCode, url: &str) {
    let kind = err.kind();
    let level = kind.log_level();
    if level == tracing::Level::ERROR {
        error!(%status, %kind, url, "HTTP status rejected");
    } else if level == tracing::Level::WARN {
        warn!(%status, %kind, url, "HTTP status rejected");
    } else {
        info!(%status, %kind, url, "HTTP status rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ResponseBody;
    use reqwest::header::{HeaderValue, CONTENT_TYPE};
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    fn response(status: u16, content_type: Option<&'static str>, body: Vec<u8>) -> HttpResponse {
        let mut head = ResponseHead::new(StatusCode::from_u16(status).unwrap());
        if let Some(ct) = content_type {
            head.headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
        }
        head.url = Some(url::Url::parse("https://example.com/page").unwrap());
        HttpResponse::new(head, ResponseBody::from_bytes(body))
    }

    #[test]
    fn test_status_kind_table() {
        let cases = [
            (400, ErrorKind::ExecutionFailed),
            (401, ErrorKind::ExecutionFailed),
            (403, ErrorKind::ExecutionFailed),
            (404, ErrorKind::ExecutionFailed),
            (408, ErrorKind::Unavailable),
            (422, ErrorKind::ExecutionFailed),
            (429, ErrorKind::Unavailable),
            (500, ErrorKind::Unavailable),
            (502, ErrorKind::Unavailable),
            (503, ErrorKind::Unavailable),
            (301, ErrorKind::Unavailable),
            (206, ErrorKind::Unavailable),
        ];
        for (code, kind) in cases {
            assert_eq!(status_kind(StatusCode::from_u16(code).unwrap()), kind, "{code}");
        }
    }

    #[test]
    fn test_accept_policies() {
        for code in [200, 201, 202, 204] {
            assert!(AcceptPolicy::Json.allows(StatusCode::from_u16(code).unwrap()));
        }
        assert!(!AcceptPolicy::Json.allows(StatusCode::from_u16(203).unwrap()));
        assert!(AcceptPolicy::Html.allows(StatusCode::OK));
        assert!(AcceptPolicy::Html.allows(StatusCode::NO_CONTENT));
        assert!(!AcceptPolicy::Html.allows(StatusCode::CREATED));
    }

    #[test]
    fn test_content_type_helpers() {
        assert_eq!(media_type("Text/HTML; charset=UTF-8"), "text/html");
        assert!(is_html_content_type("text/html; charset=euc-kr"));
        assert!(is_html_content_type("application/xhtml+xml"));
        assert!(!is_html_content_type("image/png"));
        assert!(is_json_content_type("application/json; charset=utf-8"));
        assert!(is_json_content_type("application/problem+json"));
        assert!(!is_json_content_type("text/plain"));
    }

    #[tokio::test]
    async fn test_accepted_status_passes() {
        let scope = FetchScope::new();
        let resp = response(200, Some("text/html"), b"<html></html>".to_vec());
        let mut resp = validate_response(&scope, resp, AcceptPolicy::Html, None, None)
            .await
            .unwrap();
        let mut body = Vec::new();
        resp.body.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"<html></html>");
    }

    #[tokio::test]
    async fn test_non_html_content_type_is_lenient() {
        let scope = FetchScope::new();
        let resp = response(200, Some("image/png"), b"<html></html>".to_vec());
        assert!(validate_response(&scope, resp, AcceptPolicy::Html, None, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_no_content_short_circuits() {
        let scope = FetchScope::new();
        let check: ResponseCheck =
            Arc::new(|_| Err(AppError::new(ErrorKind::Conflict, "never called").into()));
        let resp = response(204, None, Vec::new());
        assert!(validate_response(&scope, resp, AcceptPolicy::Json, Some(&check), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_rejected_status_has_preview() {
        let scope = FetchScope::new();
        let resp = response(404, Some("text/plain"), b"no such page".to_vec());
        let err = validate_response(&scope, resp, AcceptPolicy::Json, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ExecutionFailed));
        let message = err.to_string();
        assert!(message.contains("404"));
        assert!(message.contains("https://example.com/page"));
        assert!(message.contains("no such page"));
    }

    #[tokio::test]
    async fn test_rejected_status_preview_is_bounded_and_decoded() {
        let scope = FetchScope::new();
        let (encoded, _, _) = encoding_rs::EUC_KR.encode("서버 오류");
        let mut body = encoded.into_owned();
        body.extend(std::iter::repeat(b'x').take(10_000));
        let resp = response(503, Some("text/plain; charset=euc-kr"), body);

        let err = validate_response(&scope, resp, AcceptPolicy::Html, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Unavailable));
        let message = err.to_string();
        assert!(message.contains("서버 오류"));
        assert!(message.matches('x').count() < PREVIEW_LEN);
    }

    #[tokio::test]
    async fn test_check_failure_keeps_kind() {
        let scope = FetchScope::new();
        let check: ResponseCheck = Arc::new(|head| {
            if head.headers.contains_key("x-session") {
                Ok(())
            } else {
                Err(AppError::new(ErrorKind::Unauthorized, "session expired").into())
            }
        });
        let resp = response(200, Some("text/html"), b"login page".to_vec());
        let err = validate_response(&scope, resp, AcceptPolicy::Html, Some(&check), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Unauthorized));
        assert!(err.to_string().contains("login page"));
    }

    #[tokio::test]
    async fn test_check_failure_with_foreign_cause() {
        let scope = FetchScope::new();
        let check: ResponseCheck =
            Arc::new(|_| Err(Cause::foreign("missing marker header")));
        let resp = response(200, Some("application/json"), b"{}".to_vec());
        let err = validate_response(&scope, resp, AcceptPolicy::Json, Some(&check), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ExecutionFailed));
        assert!(err.to_string().contains("missing marker header"));
    }

    #[tokio::test]
    async fn test_observer_gets_detached_snapshot() {
        let scope = FetchScope::new();
        let seen: Arc<Mutex<Vec<u16>>> = Arc::default();
        let sink = seen.clone();
        let observer: ResponseObserver = Arc::new(move |mut snapshot: HttpResponse| {
            snapshot.head.headers.clear();
            sink.lock().unwrap().push(snapshot.status().as_u16());
        });

        let resp = response(500, Some("text/plain"), b"boom".to_vec());
        let err = validate_response(&scope, resp, AcceptPolicy::Json, None, Some(&observer))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(*seen.lock().unwrap(), vec![500]);
    }
}
