//! Character-encoding normalization
//!
//! Detection looks at a small sample only, in this order: byte-order mark,
//! the Content-Type `charset` parameter, then a `<meta>` or XML declaration
//! inside the sample. A sample that is already valid UTF-8 is taken as
//! UTF-8. Everything decoded here comes out as UTF-8.

use encoding_rs::{CoderResult, Decoder, Encoding, UTF_16BE, UTF_16LE, UTF_8};
use std::borrow::Cow;
use std::io::{self, Read};

/// Bytes inspected when detecting the encoding
pub const SNIFF_LEN: usize = 1024;

/// Buffer size of [`TranscodingReader`]
const BUF_LEN: usize = 8 * 1024;

/// Where a detected encoding came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharsetSource {
    Bom,
    ContentType,
    /// `<meta charset>`, `<meta http-equiv>` or `<?xml encoding?>`
    Document,
    /// No declaration, but the sample is valid UTF-8
    Utf8Sample,
}

/// Result of encoding detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detected {
    pub encoding: &'static Encoding,
    pub source: CharsetSource,
}

impl Detected {
    fn new(encoding: &'static Encoding, source: CharsetSource) -> Self {
        Self { encoding, source }
    }
}

/// Detect the encoding of a body from its first bytes and Content-Type
///
/// Only the first [`SNIFF_LEN`] bytes of `sample` are looked at. Returns
/// `None` when nothing usable was found.
pub fn detect(sample: &[u8], content_type: Option<&str>) -> Option<Detected> {
    let sample = &sample[..sample.len().min(SNIFF_LEN)];

    if let Some((encoding, _)) = Encoding::for_bom(sample) {
        return Some(Detected::new(encoding, CharsetSource::Bom));
    }

    if let Some(encoding) = content_type
        .and_then(content_type_charset)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
    {
        return Some(Detected::new(encoding, CharsetSource::ContentType));
    }

    if let Some(encoding) = sniff_document_charset(sample) {
        return Some(Detected::new(encoding, CharsetSource::Document));
    }

    if is_utf8_prefix(sample) {
        return Some(Detected::new(UTF_8, CharsetSource::Utf8Sample));
    }

    None
}

/// Decode a complete body to text.
///
/// Without a detected encoding the bytes are taken as UTF-8, with invalid
/// sequences replaced.
pub fn decode(body: &[u8], detected: Option<Detected>) -> Cow<'_, str> {
    match detected {
        Some(detected) => detected.encoding.decode_with_bom_removal(body).0,
        None => String::from_utf8_lossy(body),
    }
}

/// `charset` parameter of a Content-Type value
pub(crate) fn content_type_charset(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        (!value.is_empty()).then_some(value)
    })
}

fn sniff_document_charset(sample: &[u8]) -> Option<&'static Encoding> {
    let lower: Vec<u8> = sample.iter().map(u8::to_ascii_lowercase).collect();
    let hay = String::from_utf8_lossy(&lower);
    let trimmed = hay.trim_start();

    let label = if trimmed.starts_with("<?xml") {
        let decl_end = trimmed.find("?>").unwrap_or(trimmed.len());
        attribute_value(&trimmed[..decl_end], "encoding=")
    } else {
        None
    };

    let label = label.or_else(|| {
        hay.match_indices("<meta")
            .find_map(|(idx, _)| {
                let tag = &hay[idx..];
                let tag = &tag[..tag.find('>').unwrap_or(tag.len())];
                attribute_value(tag, "charset=")
            })
    })?;

    let encoding = Encoding::for_label(label.as_bytes())?;
    // A document that could declare UTF-16 in ASCII is not UTF-16.
    if encoding == UTF_16LE || encoding == UTF_16BE {
        return Some(UTF_8);
    }
    Some(encoding)
}

fn attribute_value<'a>(hay: &'a str, key: &str) -> Option<&'a str> {
    let idx = hay.find(key)?;
    let after = hay[idx + key.len()..].trim_start();
    let after = after.trim_start_matches(['"', '\'']);
    let value: &str = after
        .split(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | ';' | '>' | '/' | '?'))
        .next()
        .unwrap_or("");
    (!value.is_empty()).then_some(value)
}

/// Valid UTF-8, allowing a multi-byte sequence cut off by the sample end
fn is_utf8_prefix(sample: &[u8]) -> bool {
    match std::str::from_utf8(sample) {
        Ok(_) => true,
        Err(err) => err.error_len().is_none(),
    }
}

/// Synchronous reader that transcodes its input to UTF-8
///
/// Produces the same text as `encoding.decode_with_bom_removal` on the
/// whole input, without holding more than one buffer of it.
pub struct TranscodingReader<R> {
    inner: R,
    decoder: Decoder,
    input: Box<[u8]>,
    in_start: usize,
    in_end: usize,
    output: Box<[u8]>,
    out_start: usize,
    out_end: usize,
    eof: bool,
    finished: bool,
}

impl<R: Read> TranscodingReader<R> {
    /// Wrap `inner`, removing a byte-order mark matching `encoding`
    pub fn new(inner: R, encoding: &'static Encoding) -> Self {
        Self {
            inner,
            decoder: encoding.new_decoder_with_bom_removal(),
            input: vec![0; BUF_LEN].into_boxed_slice(),
            in_start: 0,
            in_end: 0,
            output: vec![0; BUF_LEN].into_boxed_slice(),
            out_start: 0,
            out_end: 0,
            eof: false,
            finished: false,
        }
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.decoder.encoding()
    }

    fn fill(&mut self) -> io::Result<()> {
        if self.in_start == self.in_end && !self.eof {
            let n = self.inner.read(&mut self.input)?;
            self.in_start = 0;
            self.in_end = n;
            self.eof = n == 0;
        }

        let (result, read, written, _) = self.decoder.decode_to_utf8(
            &self.input[self.in_start..self.in_end],
            &mut self.output,
            self.eof,
        );
        self.in_start += read;
        self.out_start = 0;
        self.out_end = written;

        if self.eof && result == CoderResult::InputEmpty {
            self.finished = true;
        }
        Ok(())
    }
}

impl<R: Read> Read for TranscodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.out_start < self.out_end {
                let n = buf.len().min(self.out_end - self.out_start);
                buf[..n].copy_from_slice(&self.output[self.out_start..self.out_start + n]);
                self.out_start += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            self.fill()?;
        }
    }
}
