//! Fetch scope: cancellation and deadline for one logical request

use crate::error::ScopeError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellable, optionally deadline-bearing scope threaded through a fetch
///
/// Cloning a scope shares its cancellation state. Use [`child`](Self::child)
/// for a scope that can be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct FetchScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl FetchScope {
    /// Create a scope with no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scope driven by an existing cancellation token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Limit the scope to `timeout` from now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Limit the scope to `deadline`; an earlier existing deadline wins
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a scope that is cancelled with this one but can also be
    /// cancelled independently
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel the scope and every child derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Current cancellation state, `None` while the scope is live
    pub fn error(&self) -> Option<ScopeError> {
        if self.token.is_cancelled() {
            return Some(ScopeError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ScopeError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Fail fast if the scope is already done
    pub fn check(&self) -> Result<(), ScopeError> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve once the scope is cancelled or its deadline passes
    pub async fn done(&self) -> ScopeError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => ScopeError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ScopeError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ScopeError::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_scope() {
        let scope = FetchScope::new();
        assert!(scope.error().is_none());
        assert!(scope.check().is_ok());
        assert!(scope.deadline().is_none());
    }

    #[test]
    fn test_cancelled_scope() {
        let scope = FetchScope::new();
        let shared = scope.clone();
        shared.cancel();
        assert_eq!(scope.error(), Some(ScopeError::Cancelled));
        assert_eq!(scope.check(), Err(ScopeError::Cancelled));
    }

    #[tokio::test]
    async fn test_expired_deadline() {
        let scope = FetchScope::new().with_timeout(Duration::ZERO);
        assert_eq!(scope.error(), Some(ScopeError::DeadlineExceeded));
        assert_eq!(scope.done().await, ScopeError::DeadlineExceeded);
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let now = Instant::now();
        let scope = FetchScope::new()
            .with_deadline(now + Duration::from_secs(5))
            .with_deadline(now + Duration::from_secs(60));
        assert_eq!(scope.deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = FetchScope::new();
        let child = parent.child();
        child.cancel();
        assert!(parent.error().is_none());
        assert_eq!(child.error(), Some(ScopeError::Cancelled));

        let other = parent.child();
        parent.cancel();
        assert_eq!(other.error(), Some(ScopeError::Cancelled));
    }

    #[tokio::test]
    async fn test_done_resolves_on_cancel() {
        let scope = FetchScope::new();
        let trigger = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        assert_eq!(scope.done().await, ScopeError::Cancelled);
    }
}
