//! Error types for scrapekit
//!
//! Every failure that leaves the engine is a [`FetchError`]. Cancellation of
//! the [`FetchScope`](crate::FetchScope) is passed through as a bare
//! [`ScopeError`] so callers can match it directly; everything else is an
//! [`AppError`] carrying exactly one [`ErrorKind`].

use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::panic::Location;
use thiserror::Error;

/// Maximum number of backtrace frames kept on an [`AppError`]
const MAX_FRAMES: usize = 5;

/// Result type used across the crate
pub type Result<T, E = FetchError> = std::result::Result<T, E>;

/// Closed set of error kinds used for retry and log-level decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unclassified failure
    Unknown,
    /// Programmer or logic error
    Internal,
    /// Infrastructure-level I/O failure
    System,
    /// Authentication required
    Unauthorized,
    /// Authenticated but not allowed
    Forbidden,
    /// Bad caller input or a size limit violation
    InvalidInput,
    /// Conflicting state
    Conflict,
    /// Resource does not exist
    NotFound,
    /// Permanent remote-side failure
    ExecutionFailed,
    /// Decode-time structural failure
    ParsingFailed,
    /// Operation ran out of time
    Timeout,
    /// Transient failure, worth retrying
    Unavailable,
}

impl ErrorKind {
    /// Stable name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::Internal => "internal",
            ErrorKind::System => "system",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::ParsingFailed => "parsing_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
        }
    }

    /// Returns true if a failure of this kind may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Unavailable)
    }

    /// Level at which failures of this kind should be logged
    pub fn log_level(&self) -> tracing::Level {
        match self {
            ErrorKind::Unknown | ErrorKind::Internal | ErrorKind::System => tracing::Level::ERROR,
            ErrorKind::ExecutionFailed
            | ErrorKind::ParsingFailed
            | ErrorKind::Timeout
            | ErrorKind::Unavailable => tracing::Level::WARN,
            _ => tracing::Level::INFO,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancellation reported by a fetch scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// The scope was cancelled explicitly
    #[error("fetch scope cancelled")]
    Cancelled,

    /// The scope's deadline passed
    #[error("fetch scope deadline exceeded")]
    DeadlineExceeded,
}

impl ScopeError {
    /// Carry this error through an `io::Error`.
    ///
    /// `Interrupted` is avoided on purpose: std read loops retry it.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            ScopeError::Cancelled => io::Error::other(self),
            ScopeError::DeadlineExceeded => io::Error::new(io::ErrorKind::TimedOut, self),
        }
    }

    /// Recover a scope error produced by [`into_io`](Self::into_io)
    pub(crate) fn from_io(err: &io::Error) -> Option<ScopeError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<ScopeError>())
            .copied()
    }
}

/// The wrapped cause of an [`AppError`]
#[derive(Debug)]
pub enum Cause {
    /// Another classified error
    App(Box<AppError>),
    /// Scope cancellation observed while the failure happened
    Scope(ScopeError),
    /// Any other error (transport, I/O, serde)
    Foreign(Box<dyn StdError + Send + Sync + 'static>),
}

impl Cause {
    /// Wrap an arbitrary error as a foreign cause
    pub fn foreign(err: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        Cause::Foreign(err.into())
    }

    /// Kind carried by this cause, if it is classified
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Cause::App(err) => Some(err.kind()),
            _ => None,
        }
    }

    fn as_error(&self) -> &(dyn StdError + 'static) {
        match self {
            Cause::App(err) => &**err,
            Cause::Scope(err) => err,
            Cause::Foreign(err) => &**err,
        }
    }
}

impl From<AppError> for Cause {
    fn from(err: AppError) -> Self {
        Cause::App(Box::new(err))
    }
}

impl From<ScopeError> for Cause {
    fn from(err: ScopeError) -> Self {
        Cause::Scope(err)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_error(), f)
    }
}

/// A classified error with an optional cause chain
///
/// The kind never changes after construction. Causes are owned, so a
/// chain can never loop back on itself.
#[derive(Debug)]
pub struct AppError {
    kind: ErrorKind,
    message: String,
    cause: Option<Cause>,
    location: &'static Location<'static>,
    frames: Vec<String>,
}

impl AppError {
    /// Create an error without a cause
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            location: Location::caller(),
            frames: capture_frames(),
        }
    }

    /// Create an error wrapping a cause
    #[track_caller]
    pub fn wrap(kind: ErrorKind, message: impl Into<String>, cause: impl Into<Cause>) -> Self {
        Self {
            cause: Some(cause.into()),
            ..Self::new(kind, message)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    /// Source location where the error was created
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Up to five backtrace frames, empty unless backtraces are enabled
    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    /// Innermost error of the chain (`self` when there is no cause)
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        let mut current = self;
        loop {
            match &current.cause {
                Some(Cause::App(inner)) => current = &**inner,
                Some(other) => return other.as_error(),
                None => return current,
            }
        }
    }

    /// Scope cancellation recorded anywhere in the chain
    pub fn scope_error(&self) -> Option<ScopeError> {
        let mut current = self;
        loop {
            match &current.cause {
                Some(Cause::App(inner)) => current = &**inner,
                Some(Cause::Scope(err)) => return Some(*err),
                _ => return None,
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(Cause::as_error)
    }
}

/// Errors returned by every public fetch operation
#[derive(Debug, Error)]
pub enum FetchError {
    /// The fetch scope was cancelled or timed out; never reclassified
    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// A classified failure
    #[error(transparent)]
    App(#[from] AppError),
}

impl FetchError {
    /// Kind of a classified failure, `None` for a bare cancellation
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            FetchError::Scope(_) => None,
            FetchError::App(err) => Some(err.kind()),
        }
    }

    /// Returns true if the failure was caused by scope cancellation,
    /// either directly or as the recorded cause of an aborted request
    pub fn is_cancellation(&self) -> bool {
        match self {
            FetchError::Scope(_) => true,
            FetchError::App(err) => err.scope_error().is_some(),
        }
    }

    /// Returns true if retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Scope(_) => false,
            FetchError::App(err) => err.kind().is_retryable(),
        }
    }

    /// Classify an I/O failure, passing scope cancellation through untouched
    #[track_caller]
    pub(crate) fn from_io(err: io::Error, kind: ErrorKind, message: impl Into<String>) -> Self {
        match ScopeError::from_io(&err) {
            Some(scope) => FetchError::Scope(scope),
            None => FetchError::App(AppError::wrap(kind, message, Cause::foreign(err))),
        }
    }
}

fn capture_frames() -> Vec<String> {
    let backtrace = Backtrace::capture();
    if backtrace.status() != BacktraceStatus::Captured {
        return Vec::new();
    }

    backtrace
        .to_string()
        .lines()
        .filter_map(|line| {
            let (index, symbol) = line.trim_start().split_once(": ")?;
            index.parse::<usize>().ok()?;
            Some(symbol.trim().to_string())
        })
        .filter(|symbol| {
            !symbol.starts_with("std::")
                && !symbol.starts_with("core::")
                && !symbol.contains("scrapekit::error::")
        })
        .take(MAX_FRAMES)
        .collect()
}
