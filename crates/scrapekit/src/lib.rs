//! Scrapekit - fetch, validate and decode HTML and JSON resources
//!
//! This crate turns "give me a parsed document" or "give me a decoded
//! value" into one call, tolerating what real servers get wrong: missing
//! or lying charsets, wrong content types, oversized bodies, and a mix of
//! transient and permanent failures.
//!
//! ## Pipeline
//!
//! Every call runs the same stages in order:
//!
//! 1. [`RequestPayload`] is prepared into a size-checked, replayable body
//! 2. One [`Transport`] call sends the request ([`ReqwestTransport`] by default)
//! 3. The response status (and an optional caller check) is validated
//! 4. The body is read into memory up to the configured limit
//! 5. The body is normalized to UTF-8 and decoded as a [`Document`] or JSON
//!
//! Every failure is a [`FetchError`]. Classified failures carry an
//! [`ErrorKind`] that tells callers whether a retry can help; cancelling
//! the [`FetchScope`] comes back as the bare [`ScopeError`].
//!
//! ```no_run
//! use scrapekit::{FetchRequest, FetchScope, Scraper};
//! use std::time::Duration;
//!
//! # async fn run() -> scrapekit::Result<()> {
//! let scraper = Scraper::new()?;
//! let scope = FetchScope::new().with_timeout(Duration::from_secs(30));
//!
//! let doc = scraper
//!     .fetch_html(&scope, FetchRequest::get("https://example.com/"))
//!     .await?;
//! println!("{:?}", doc.title());
//! # Ok(())
//! # }
//! ```

mod body;
pub mod charset;
mod client;
mod error;
mod html;
pub mod io;
pub mod json;
mod scope;
pub mod transport;
mod validate;

pub use body::{prepare_body, BodySource, JsonBody, PreparedBody, RequestPayload, JSON_CONTENT_TYPE};
pub use client::{FetchRequest, FetchResult, Scraper, ScraperBuilder, DEFAULT_MAX_BODY_SIZE};
pub use error::{AppError, Cause, ErrorKind, FetchError, Result, ScopeError};
pub use html::{element_text, Document};
pub use io::{read_bounded, CancellableReader};
pub use scope::FetchScope;
pub use transport::{
    HttpRequest, HttpResponse, RequestHead, ResponseBody, ResponseHead, ReqwestTransport,
    Transport, TransportError,
};
pub use reqwest::{header, Method, StatusCode};
pub use url::Url;
pub use validate::{status_kind, validate_response, AcceptPolicy, ResponseCheck, ResponseObserver};

/// Default User-Agent string
pub const DEFAULT_USER_AGENT: &str = "Everruns Scrapekit/1.0";
