//! Scrapekit CLI - fetch a page or a JSON resource from the command line

use clap::{Args, Parser, Subcommand};
use scrapekit::header::{HeaderMap, HeaderName, HeaderValue};
use scrapekit::{element_text, Document, FetchError, FetchRequest, FetchScope, Method, Scraper};
use std::error::Error as _;
use std::io::{self, Write};
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Scrapekit - fetch, validate and decode HTML and JSON resources
#[derive(Parser, Debug)]
#[command(name = "scrapekit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch an HTML page and print its title, links or selected elements
    Html {
        /// URL to fetch
        url: String,

        /// CSS selector; prints the text of every matching element
        #[arg(long, short)]
        select: Option<String>,

        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Fetch a JSON resource and pretty-print it
    Json {
        /// URL to fetch
        url: String,

        /// HTTP method
        #[arg(long, short = 'X', default_value = "GET")]
        method: String,

        /// Request body, sent as-is
        #[arg(long, short)]
        data: Option<String>,

        #[command(flatten)]
        fetch: FetchArgs,
    },
}

#[derive(Args, Debug)]
struct FetchArgs {
    /// Extra request header as `Name: value` (repeatable)
    #[arg(long = "header", short = 'H')]
    headers: Vec<String>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Maximum response body size in bytes
    #[arg(long)]
    max_response_size: Option<usize>,

    /// Custom User-Agent
    #[arg(long)]
    user_agent: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Html { url, select, fetch } => run_html(&url, select.as_deref(), &fetch).await,
        Commands::Json {
            url,
            method,
            data,
            fetch,
        } => run_json(&url, &method, data, &fetch).await,
    };

    if let Err(err) = result {
        eprintln!("{}", format_error(&err));
        std::process::exit(exit_code(&err));
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

async fn run_html(url: &str, select: Option<&str>, args: &FetchArgs) -> Result<(), FetchError> {
    let scraper = build_scraper(args)?;
    let scope = FetchScope::new().with_timeout(Duration::from_secs(args.timeout));
    let headers = parse_headers(&args.headers)?;

    tracing::debug!(url, ?select, "Fetching HTML");
    let doc = scraper.fetch_html_document(&scope, url, &headers).await?;
    let body = match select {
        Some(css) => doc
            .select(css)?
            .iter()
            .map(element_text)
            .collect::<Vec<_>>()
            .join("\n"),
        None => doc
            .links()
            .iter()
            .map(|link| link.to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    };

    writeln_safe(&format_document(&doc, &body));
    Ok(())
}

async fn run_json(
    url: &str,
    method: &str,
    data: Option<String>,
    args: &FetchArgs,
) -> Result<(), FetchError> {
    let scraper = build_scraper(args)?;
    let scope = FetchScope::new().with_timeout(Duration::from_secs(args.timeout));
    let headers = parse_headers(&args.headers)?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|err| {
        scrapekit::AppError::wrap(
            scrapekit::ErrorKind::InvalidInput,
            format!("invalid HTTP method {method:?}"),
            scrapekit::Cause::foreign(err),
        )
    })?;

    tracing::debug!(url, %method, "Fetching JSON");
    let request = FetchRequest::new(method, url).headers(&headers).body(data);
    let value: serde_json::Value = scraper.fetch_json(&scope, request).await?;

    let json = serde_json::to_string_pretty(&value).unwrap_or_else(|e| {
        eprintln!("Error serializing response: {}", e);
        std::process::exit(1);
    });
    writeln_safe(&json);
    Ok(())
}

fn build_scraper(args: &FetchArgs) -> Result<Scraper, FetchError> {
    let mut builder = Scraper::builder();
    if let Some(size) = args.max_response_size {
        builder = builder.max_response_body_size(size);
    }
    if let Some(ref ua) = args.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    builder.build()
}

/// Parse `Name: value` pairs into a header map
fn parse_headers(raw: &[String]) -> Result<HeaderMap, FetchError> {
    let mut headers = HeaderMap::new();
    for line in raw {
        let invalid = || {
            scrapekit::AppError::new(
                scrapekit::ErrorKind::InvalidInput,
                format!("invalid header {line:?}, expected `Name: value`"),
            )
        };
        let (name, value) = line.split_once(':').ok_or_else(invalid)?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Format a parsed page with a YAML frontmatter header
fn format_document(doc: &Document, body: &str) -> String {
    let mut output = String::new();

    output.push_str("---\n");
    output.push_str(&format!("url: {}\n", doc.base_url()));
    if let Some(title) = doc.title() {
        output.push_str(&format!("title: {}\n", title));
    }
    output.push_str("---\n");
    output.push_str(body);

    output
}

/// Error message followed by its cause chain, kind and retry hint
fn format_error(err: &FetchError) -> String {
    let mut output = format!("Error: {}", err);

    let mut source = err.source();
    while let Some(cause) = source {
        output.push_str(&format!("\n  caused by: {}", cause));
        source = cause.source();
    }

    match err.kind() {
        Some(kind) => output.push_str(&format!("\n  kind: {}", kind)),
        None => output.push_str("\n  kind: cancelled"),
    }
    output.push_str(&format!("\n  retryable: {}", err.is_retryable()));
    output
}

/// 2 when retrying may help, 1 otherwise
fn exit_code(err: &FetchError) -> i32 {
    if err.is_retryable() {
        2
    } else {
        1
    }
}

/// Write to stdout, exit silently on broken pipe
fn writeln_safe(s: &str) {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if let Err(e) = writeln!(handle, "{}", s) {
        if e.kind() == io::ErrorKind::BrokenPipe {
            std::process::exit(0);
        }
        eprintln!("Error writing to stdout: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrapekit::{AppError, ErrorKind, ScopeError, Url};

    #[test]
    fn test_format_document() {
        let doc = Document::parse(
            "<html><head><title>Hello</title></head></html>",
            Url::parse("https://example.com/page").unwrap(),
        );

        let output = format_document(&doc, "first\nsecond");

        assert!(output.starts_with("---\n"));
        assert!(output.contains("url: https://example.com/page\n"));
        assert!(output.contains("title: Hello\n"));
        assert!(output.ends_with("---\nfirst\nsecond"));
    }

    #[test]
    fn test_format_document_without_title() {
        let doc = Document::parse("<p>x</p>", Url::parse("https://example.com/").unwrap());
        let output = format_document(&doc, "");
        assert!(!output.contains("title:"));
    }

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(&[
            "Accept: text/html".to_string(),
            "X-Token:  abc ".to_string(),
        ])
        .unwrap();
        assert_eq!(headers["accept"], "text/html");
        assert_eq!(headers["x-token"], "abc");

        let err = parse_headers(&["no separator".to_string()]).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidInput));
    }

    #[test]
    fn test_format_error_chain() {
        let inner = AppError::new(ErrorKind::System, "connection reset");
        let err = FetchError::from(AppError::wrap(ErrorKind::Unavailable, "network error", inner));

        let output = format_error(&err);
        assert!(output.starts_with("Error: network error"));
        assert!(output.contains("caused by: connection reset"));
        assert!(output.contains("kind: unavailable"));
        assert!(output.contains("retryable: true"));
    }

    #[test]
    fn test_exit_codes() {
        let retryable = FetchError::from(AppError::new(ErrorKind::Unavailable, "HTTP 503"));
        let permanent = FetchError::from(AppError::new(ErrorKind::ExecutionFailed, "HTTP 404"));
        let cancelled = FetchError::from(ScopeError::DeadlineExceeded);

        assert_eq!(exit_code(&retryable), 2);
        assert_eq!(exit_code(&permanent), 1);
        assert_eq!(exit_code(&cancelled), 1);
        assert!(format_error(&cancelled).contains("kind: cancelled"));
    }
}
