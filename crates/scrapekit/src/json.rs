//! JSON decoding
//!
//! Bodies are normalized to UTF-8 and streamed into serde in strict mode:
//! only whitespace may follow the first value. Syntax errors carry a
//! snippet of the source around the failing position. serde reports that
//! position in the normalized stream, so the body is transcoded again and
//! the snippet is cut from that text on character boundaries, instead of
//! slicing multi-byte source bytes blindly.

use crate::charset::{self, TranscodingReader};
use crate::error::{AppError, Cause, ErrorKind, FetchError, Result, ScopeError};
use crate::io::CancellableReader;
use crate::scope::FetchScope;
use crate::validate::{is_html_content_type, is_json_content_type};
use encoding_rs::{Encoding, UTF_8};
use serde::de::DeserializeOwned;
use std::io::{self, BufReader, Cursor, Read};
use tracing::{debug, warn};

/// Characters kept on each side of the failing position
const SNIPPET_RADIUS: usize = 40;

/// Reject responses that can't be JSON before decoding starts
///
/// An HTML content type almost always means a login page, an error page or
/// a wrong endpoint, so it is a hard failure. Other unexpected types only
/// warn. A truncated body has no valid partial form.
pub(crate) fn check_response(
    content_type: Option<&str>,
    truncated: bool,
    limit: usize,
    url: &str,
) -> Result<()> {
    match content_type {
        Some(ct) if is_html_content_type(ct) => {
            return Err(AppError::new(
                ErrorKind::InvalidInput,
                format!("expected JSON from {url} but got HTML ({ct})"),
            )
            .into());
        }
        Some(ct) if !is_json_content_type(ct) => {
            warn!(url, content_type = ct, "Response is not JSON, decoding anyway");
        }
        None => debug!(url, "Response has no content type, decoding as JSON"),
        _ => {}
    }

    if truncated {
        return Err(AppError::new(
            ErrorKind::InvalidInput,
            format!("JSON response from {url} exceeds the limit of {limit} bytes"),
        )
        .into());
    }
    Ok(())
}

/// Decode one JSON value from an in-memory body
///
/// The scope is checked before every read, so a cancellation during decode
/// or during the trailing-data check comes back as the bare
/// [`ScopeError`].
pub fn decode<T: DeserializeOwned>(
    scope: &FetchScope,
    body: &[u8],
    content_type: Option<&str>,
    url: &str,
) -> Result<T> {
    let encoding = match charset::detect(body, content_type) {
        Some(detected) => detected.encoding,
        None => {
            warn!(url, "Could not detect JSON encoding, decoding as UTF-8");
            UTF_8
        }
    };

    let source = CancellableReader::new(Cursor::new(body), scope.clone());
    decode_from(source, body, encoding, url)
}

/// Decode from `source`, which yields `body`; `body` is only used to build
/// error snippets
fn decode_from<T: DeserializeOwned, R: Read>(
    source: R,
    body: &[u8],
    encoding: &'static Encoding,
    url: &str,
) -> Result<T> {
    let mut reader = CountingReader::new(BufReader::new(TranscodingReader::new(source, encoding)));
    let mut de = serde_json::Deserializer::from_reader(&mut reader);

    let decoded = T::deserialize(&mut de);
    let trailing = match &decoded {
        Ok(_) => de.end().err(),
        Err(_) => None,
    };
    drop(de);

    let position = SourcePosition {
        body,
        encoding,
        offset: reader.count,
    };

    match decoded {
        Ok(value) => match trailing {
            None => Ok(value),
            Some(err) => Err(trailing_failure(err, &position, url)),
        },
        Err(err) => Err(decode_failure(err, &position, url)),
    }
}

fn decode_failure(err: serde_json::Error, position: &SourcePosition<'_>, url: &str) -> FetchError {
    if err.is_io() {
        return io_failure(err, url);
    }
    let snippet = position.snippet();
    AppError::wrap(
        ErrorKind::ParsingFailed,
        format!(
            "failed to decode JSON from {url}: {err} (offset {}, near `{snippet}`)",
            position.offset
        ),
        Cause::foreign(err),
    )
    .into()
}

fn trailing_failure(err: serde_json::Error, position: &SourcePosition<'_>, url: &str) -> FetchError {
    if err.is_io() {
        return io_failure(err, url);
    }
    let snippet = position.snippet();
    AppError::wrap(
        ErrorKind::ParsingFailed,
        format!(
            "unexpected trailing data after JSON value from {url} (offset {}, near `{snippet}`)",
            position.offset
        ),
        Cause::foreign(err),
    )
    .into()
}

/// The body is in memory, so the only expected read failure is the scope.
fn io_failure(err: serde_json::Error, url: &str) -> FetchError {
    let err = io::Error::from(err);
    match ScopeError::from_io(&err) {
        Some(scope) => FetchError::Scope(scope),
        None => AppError::wrap(
            ErrorKind::Internal,
            format!("failed to read JSON body from {url}"),
            Cause::foreign(err),
        )
        .into(),
    }
}

/// Where a decode stopped, in the normalized stream
struct SourcePosition<'a> {
    body: &'a [u8],
    encoding: &'static Encoding,
    offset: u64,
}

impl SourcePosition<'_> {
    /// Text around the failure
    ///
    /// The body is transcoded the same way the decoder saw it, so `offset`
    /// indexes that text exactly whatever the source encoding was.
    fn snippet(&self) -> String {
        let (text, _) = self.encoding.decode_with_bom_removal(self.body);
        let mut at = usize::try_from(self.offset)
            .unwrap_or(usize::MAX)
            .min(text.len());
        while !text.is_char_boundary(at) {
            at -= 1;
        }

        let before: Vec<char> = text[..at].chars().rev().take(SNIPPET_RADIUS).collect();
        let window: String = before
            .into_iter()
            .rev()
            .chain(text[at..].chars().take(SNIPPET_RADIUS))
            .collect();
        window.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Counts the bytes handed to the JSON parser
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
