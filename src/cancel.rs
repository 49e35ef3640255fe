//! Cooperative cancellation.
//!
//! The dispatcher checks the token before each level, before each key, and
//! before taking each page of pending work, which bounds cancellation latency
//! to one (key, level) unit. A cancelled cycle commits nothing, so the next
//! cycle is a safe, idempotent resumption.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Clonable cancellation flag shared between an outer scheduler and the
/// reduction worker.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    // < 0 means no countdown is armed.
    countdown: AtomicI64,
}

impl Default for TokenInner {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            countdown: AtomicI64::new(-1),
        }
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that trips itself after `checks` calls to [`is_cancelled`].
    ///
    /// Exists so cancellation protocols can be exercised deterministically at
    /// every check point; production callers use [`cancel`] instead.
    ///
    /// [`is_cancelled`]: CancellationToken::is_cancelled
    /// [`cancel`]: CancellationToken::cancel
    pub fn countdown(checks: u32) -> Self {
        let token = Self::new();
        token
            .inner
            .countdown
            .store(i64::from(checks), Ordering::SeqCst);
        token
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Poll the token. Counts down an armed [`countdown`] trigger.
    ///
    /// [`countdown`]: CancellationToken::countdown
    pub fn is_cancelled(&self) -> bool {
        if self.inner.countdown.load(Ordering::SeqCst) >= 0
            && self.inner.countdown.fetch_sub(1, Ordering::SeqCst) <= 0
        {
            self.cancel();
        }
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_sticky_and_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());

        clone.cancel();
        assert!(token.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[test]
    fn countdown_trips_after_n_checks() {
        let token = CancellationToken::countdown(3);
        assert!(!token.is_cancelled());
        assert!(!token.is_cancelled());
        assert!(!token.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[test]
    fn countdown_zero_trips_immediately() {
        let token = CancellationToken::countdown(0);
        assert!(token.is_cancelled());
    }
}
