//! Request body preparation
//!
//! Turns a [`RequestPayload`] into a size-checked, replayable [`Bytes`]
//! buffer before anything touches the network. A prepared body can be
//! cloned cheaply, so a caller retrying a request sends the same bytes.

use crate::error::{AppError, Cause, ErrorKind, FetchError, Result};
use crate::io::CancellableReader;
use crate::scope::FetchScope;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Content type sent with [`RequestPayload::Json`] bodies
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A stream usable as a request body
///
/// Implementations that already hold their data in memory can say so
/// through [`replayable`](Self::replayable), which lets the preparer skip
/// the copy.
pub trait BodySource: AsyncRead + Send + Unpin {
    /// Remaining length, if known without reading
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Remaining contents, if the source is memory-backed and can be
    /// replayed without consuming it
    fn replayable(&self) -> Option<Bytes> {
        None
    }
}

impl BodySource for Cursor<Bytes> {
    fn size_hint(&self) -> Option<u64> {
        Some((self.get_ref().len() as u64).saturating_sub(self.position()))
    }

    fn replayable(&self) -> Option<Bytes> {
        let start = usize::try_from(self.position())
            .unwrap_or(usize::MAX)
            .min(self.get_ref().len());
        Some(self.get_ref().slice(start..))
    }
}

impl BodySource for Cursor<Vec<u8>> {
    fn size_hint(&self) -> Option<u64> {
        Some((self.get_ref().len() as u64).saturating_sub(self.position()))
    }
}

/// Opaque stream with no length or replay capability
struct OpaqueSource<R>(R);

impl<R: AsyncRead + Send + Unpin> AsyncRead for OpaqueSource<R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl<R: AsyncRead + Send + Unpin> BodySource for OpaqueSource<R> {}

/// Value that can be serialized as a JSON request body
pub trait JsonBody: Send + Sync {
    fn to_json(&self) -> serde_json::Result<Vec<u8>>;
}

impl<T: Serialize + Send + Sync> JsonBody for T {
    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Caller-supplied request payload
#[derive(Default)]
pub enum RequestPayload {
    /// No body
    #[default]
    Absent,
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Bytes),
    /// A stream, drained into memory before sending
    Stream(Box<dyn BodySource>),
    /// A value serialized as JSON
    Json(Box<dyn JsonBody>),
}

impl RequestPayload {
    pub fn text(text: impl Into<String>) -> Self {
        RequestPayload::Text(text.into())
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        RequestPayload::Bytes(bytes.into())
    }

    /// Use a [`BodySource`] as the body
    pub fn stream(source: impl BodySource + 'static) -> Self {
        RequestPayload::Stream(Box::new(source))
    }

    /// Use any async reader as the body
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        RequestPayload::Stream(Box::new(OpaqueSource(reader)))
    }

    /// Serialize `value` as the JSON body
    pub fn json(value: impl Serialize + Send + Sync + 'static) -> Self {
        RequestPayload::Json(Box::new(value))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, RequestPayload::Absent)
    }
}

impl fmt::Debug for RequestPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPayload::Absent => f.write_str("Absent"),
            RequestPayload::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            RequestPayload::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            RequestPayload::Stream(source) => {
                f.debug_tuple("Stream").field(&source.size_hint()).finish()
            }
            RequestPayload::Json(_) => f.write_str("Json"),
        }
    }
}

impl From<String> for RequestPayload {
    fn from(text: String) -> Self {
        RequestPayload::Text(text)
    }
}

impl From<&str> for RequestPayload {
    fn from(text: &str) -> Self {
        RequestPayload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for RequestPayload {
    fn from(bytes: Vec<u8>) -> Self {
        RequestPayload::Bytes(Bytes::from(bytes))
    }
}

impl From<Bytes> for RequestPayload {
    fn from(bytes: Bytes) -> Self {
        RequestPayload::Bytes(bytes)
    }
}

impl<T: Into<RequestPayload>> From<Option<T>> for RequestPayload {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// A body ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBody {
    pub bytes: Bytes,
    /// Content type implied by the payload, used when the caller set none
    pub content_type: Option<&'static str>,
}

/// Prepare `payload` for transmission, enforcing `max` bytes
pub async fn prepare_body(
    scope: &FetchScope,
    payload: RequestPayload,
    max: usize,
) -> Result<Option<PreparedBody>> {
    let (bytes, content_type) = match payload {
        RequestPayload::Absent => return Ok(None),
        RequestPayload::Text(text) => {
            ensure_within(text.len() as u64, max)?;
            (Bytes::from(text), None)
        }
        RequestPayload::Bytes(bytes) => {
            ensure_within(bytes.len() as u64, max)?;
            (bytes, None)
        }
        RequestPayload::Stream(source) => (drain_source(scope, source, max).await?, None),
        RequestPayload::Json(value) => {
            let encoded = value.to_json().map_err(|err| {
                AppError::wrap(
                    ErrorKind::Internal,
                    "failed to serialize request body as JSON",
                    Cause::foreign(err),
                )
            })?;
            ensure_within(encoded.len() as u64, max)?;
            (Bytes::from(encoded), Some(JSON_CONTENT_TYPE))
        }
    };

    Ok(Some(PreparedBody {
        bytes,
        content_type,
    }))
}

async fn drain_source(scope: &FetchScope, source: Box<dyn BodySource>, max: usize) -> Result<Bytes> {
    if let Some(len) = source.size_hint() {
        ensure_within(len, max)?;
    }
    if let Some(bytes) = source.replayable() {
        return Ok(bytes);
    }

    let mut buf = Vec::new();
    CancellableReader::new(source, scope.clone())
        .take((max as u64).saturating_add(1))
        .read_to_end(&mut buf)
        .await
        .map_err(|err| {
            FetchError::from_io(err, ErrorKind::ExecutionFailed, "failed to read request body")
        })?;

    ensure_within(buf.len() as u64, max)?;
    Ok(Bytes::from(buf))
}

fn ensure_within(len: u64, max: usize) -> Result<(), AppError> {
    if len > max as u64 {
        return Err(AppError::new(
            ErrorKind::InvalidInput,
            format!("request body of {len} bytes exceeds the limit of {max} bytes"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScopeError;
    use serde::ser::{Serialize, Serializer};
    use std::io;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refusing to serialize"))
        }
    }

    fn kind_of(err: FetchError) -> ErrorKind {
        err.kind().expect("classified error")
    }

    #[tokio::test]
    async fn test_absent_payload() {
        let scope = FetchScope::new();
        assert!(prepare_body(&scope, RequestPayload::Absent, 10).await.unwrap().is_none());

        let none: Option<String> = None;
        let payload = RequestPayload::from(none);
        assert!(payload.is_absent());
        assert!(prepare_body(&scope, payload, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_text_at_and_over_limit() {
        let scope = FetchScope::new();
        let body = prepare_body(&scope, "0123456789".into(), 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&body.bytes[..], b"0123456789");
        assert_eq!(body.content_type, None);

        let err = prepare_body(&scope, "0123456789A".into(), 10).await.unwrap_err();
        assert!(err.to_string().contains("limit of 10 bytes"));
        assert_eq!(kind_of(err), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_bytes_over_limit() {
        let scope = FetchScope::new();
        let err = prepare_body(&scope, vec![0u8; 11].into(), 10).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_replayable_stream_is_not_copied() {
        let scope = FetchScope::new();
        let data = Bytes::from_static(b"memory backed");
        let body = prepare_body(&scope, RequestPayload::stream(Cursor::new(data.clone())), 64)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body.bytes, data);
        assert_eq!(body.bytes.as_ptr(), data.as_ptr());
    }

    #[tokio::test]
    async fn test_stream_length_checked_before_reading() {
        let scope = FetchScope::new();
        let err = prepare_body(&scope, RequestPayload::stream(Cursor::new(vec![1u8; 11])), 10)
            .await
            .unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_opaque_stream_drained() {
        let scope = FetchScope::new();
        let reader = tokio_test::io::Builder::new()
            .read(b"chunk one, ")
            .read(b"chunk two")
            .build();
        let body = prepare_body(&scope, RequestPayload::reader(reader), 64)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&body.bytes[..], b"chunk one, chunk two");
    }

    #[tokio::test]
    async fn test_opaque_stream_over_limit() {
        let scope = FetchScope::new();
        let reader = Cursor::new(vec![7u8; 100]);
        let payload = RequestPayload::reader(reader);
        let err = prepare_body(&scope, payload, 10).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_opaque_stream_with_unbounded_limit() {
        let scope = FetchScope::new();
        let payload = RequestPayload::reader(Cursor::new(b"abc".to_vec()));
        let body = prepare_body(&scope, payload, usize::MAX).await.unwrap().unwrap();
        assert_eq!(&body.bytes[..], b"abc");
    }

    #[tokio::test]
    async fn test_stream_read_failure_is_execution_failed() {
        let scope = FetchScope::new();
        let reader = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
            .build();
        let err = prepare_body(&scope, RequestPayload::reader(reader), 64)
            .await
            .unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::ExecutionFailed);
    }

    #[tokio::test]
    async fn test_stream_cancellation_is_not_wrapped() {
        let scope = FetchScope::new();
        let (reader, mut writer) = tokio::io::duplex(16);
        let trigger = scope.clone();
        tokio::spawn(async move {
            writer.write_all(b"abc").await.unwrap();
            trigger.cancel();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = writer.write_all(b"def").await;
        });

        let err = prepare_body(&scope, RequestPayload::reader(reader), 64)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Scope(ScopeError::Cancelled)));
    }

    #[tokio::test]
    async fn test_json_payload() {
        let scope = FetchScope::new();
        let value = serde_json::json!({"name": "한글", "value": 1});
        let body = prepare_body(&scope, RequestPayload::json(value.clone()), 1024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body.content_type, Some(JSON_CONTENT_TYPE));
        let decoded: serde_json::Value = serde_json::from_slice(&body.bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[tokio::test]
    async fn test_json_serialization_failure_is_internal() {
        let scope = FetchScope::new();
        let err = prepare_body(&scope, RequestPayload::json(Unserializable), 1024)
            .await
            .unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_json_over_limit() {
        let scope = FetchScope::new();
        let err = prepare_body(&scope, RequestPayload::json(vec!["x"; 100]), 16)
            .await
            .unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::InvalidInput);
    }
}
