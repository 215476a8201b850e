//! HTML decoding
//!
//! A [`Document`] is a parsed tree plus the URL relative links resolve
//! against. The tree comes from `scraper`, which is not `Send`: finish
//! working with a document before the next `.await` in a spawned task.

use crate::charset::{self, SNIFF_LEN};
use crate::error::{AppError, ErrorKind, Result};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

/// Parsed HTML document with its base URL
#[derive(Debug, Clone)]
pub struct Document {
    html: Html,
    base_url: Url,
}

impl Document {
    /// Parse already-decoded text
    pub fn parse(text: &str, base_url: Url) -> Self {
        Self {
            html: Html::parse_document(text),
            base_url,
        }
    }

    /// Normalize `body` to UTF-8 and parse it.
    ///
    /// The encoding is detected from the first [`SNIFF_LEN`] bytes and
    /// `content_type`. When nothing usable is found the bytes are parsed as
    /// UTF-8 and a warning is logged.
    pub fn decode(body: &[u8], content_type: Option<&str>, base_url: Url) -> Self {
        let detected = charset::detect(&body[..body.len().min(SNIFF_LEN)], content_type);
        match detected {
            Some(d) => debug!(
                url = %base_url,
                encoding = d.encoding.name(),
                source = ?d.source,
                "Detected HTML encoding"
            ),
            None => warn!(
                url = %base_url,
                content_type = content_type.unwrap_or(""),
                "Could not detect HTML encoding, parsing as UTF-8"
            ),
        }
        let text = charset::decode(body, detected);
        Self::parse(&text, base_url)
    }

    /// The underlying `scraper` tree
    pub fn html(&self) -> &Html {
        &self.html
    }

    /// Effective URL of the response, or the requested URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `href` against the base URL
    pub fn resolve(&self, href: &str) -> Option<Url> {
        self.base_url.join(href.trim()).ok()
    }

    /// All elements matching a CSS selector, in document order
    ///
    /// An invalid selector is an [`ErrorKind::Internal`] error.
    pub fn select(&self, css: &str) -> Result<Vec<ElementRef<'_>>> {
        let selector = parse_selector(css)?;
        Ok(self.html.select(&selector).collect())
    }

    /// First element matching a CSS selector
    ///
    /// A page missing the element is an [`ErrorKind::ExecutionFailed`]
    /// error: the server answered, but not with the expected page.
    pub fn select_first(&self, css: &str) -> Result<ElementRef<'_>> {
        let selector = parse_selector(css)?;
        self.html.select(&selector).next().ok_or_else(|| {
            AppError::new(
                ErrorKind::ExecutionFailed,
                format!("no element matches `{css}` in {}", self.base_url),
            )
            .into()
        })
    }

    /// Trimmed text of the first `<title>`, if any
    pub fn title(&self) -> Option<String> {
        let selector = Selector::parse("title").ok()?;
        let title = self.html.select(&selector).next()?;
        let text = collapse_whitespace(&title.text().collect::<String>());
        (!text.is_empty()).then_some(text)
    }

    /// Absolute URLs of every `<a href>`, resolved against the base URL
    pub fn links(&self) -> Vec<Url> {
        let Ok(selector) = Selector::parse("a[href]") else {
            return Vec::new();
        };
        self.html
            .select(&selector)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| self.resolve(href))
            .collect()
    }
}

/// Text content of an element with whitespace runs collapsed
pub fn element_text(element: &ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|err| {
        AppError::new(
            ErrorKind::Internal,
            format!("invalid CSS selector `{css}`: {err}"),
        )
        .into()
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::EUC_KR;

    fn base() -> Url {
        Url::parse("https://example.com/news/index.html").unwrap()
    }

    const PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>  Latest
   news </title></head>
<body>
  <ul id="list">
    <li><a href="/news/1">First</a></li>
    <li><a href="2">Second</a></li>
    <li><a href="https://other.example/x">Elsewhere</a></li>
  </ul>
</body>
</html>"#;

    #[test]
    fn test_title_and_links() {
        let doc = Document::parse(PAGE, base());
        assert_eq!(doc.title().as_deref(), Some("Latest news"));

        let links: Vec<String> = doc.links().iter().map(Url::to_string).collect();
        assert_eq!(
            links,
            vec![
                "https://example.com/news/1",
                "https://example.com/news/2",
                "https://other.example/x",
            ]
        );
    }

    #[test]
    fn test_select() {
        let doc = Document::parse(PAGE, base());
        let items = doc.select("#list li").unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(element_text(&items[1]), "Second");

        let first = doc.select_first("li a").unwrap();
        assert_eq!(first.value().attr("href"), Some("/news/1"));
    }

    #[test]
    fn test_select_first_missing_is_execution_failed() {
        let doc = Document::parse(PAGE, base());
        let err = doc.select_first("table.prices").unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ExecutionFailed));
        assert!(err.to_string().contains("https://example.com/news/index.html"));
    }

    #[test]
    fn test_invalid_selector_is_internal() {
        let doc = Document::parse(PAGE, base());
        let err = doc.select("li[[").unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Internal));
    }

    #[test]
    fn test_resolve() {
        let doc = Document::parse("<p>x</p>", base());
        assert_eq!(
            doc.resolve("../img/a.png").unwrap().as_str(),
            "https://example.com/img/a.png"
        );
        assert_eq!(doc.base_url(), &base());
    }

    #[test]
    fn test_decode_non_utf8_from_header() {
        let (body, _, _) = EUC_KR.encode("<html><head><title>한글 제목</title></head></html>");
        let doc = Document::decode(&body, Some("text/html; charset=euc-kr"), base());
        assert_eq!(doc.title().as_deref(), Some("한글 제목"));
    }

    #[test]
    fn test_decode_non_utf8_from_meta() {
        let (body, _, _) = EUC_KR.encode(
            "<html><head><meta charset=\"euc-kr\"><title>뉴스</title></head></html>",
        );
        let doc = Document::decode(&body, Some("text/html"), base());
        assert_eq!(doc.title().as_deref(), Some("뉴스"));
    }

    #[test]
    fn test_decode_undetectable_is_lenient() {
        let (body, _, _) = EUC_KR.encode("<title>ok 한</title>");
        let doc = Document::decode(&body, None, base());
        assert!(doc.title().unwrap().starts_with("ok"));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let a = Document::decode(PAGE.as_bytes(), Some("text/html"), base());
        let b = Document::decode(PAGE.as_bytes(), Some("text/html"), base());
        assert_eq!(a.html().root_element().html(), b.html().root_element().html());
    }
}
