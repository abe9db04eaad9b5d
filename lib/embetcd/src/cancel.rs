// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cancellation contexts with deadlines.
//!
//! A [`CancelContext`] wraps a [`CancellationToken`] and adds an optional
//! deadline plus the *reason* it became done ([`CancelReason`]). Contexts form
//! a tree: cancelling a parent cancels every child, and a child's deadline is
//! never later than its parent's.
//!
//! Deadlines are observed lazily by whoever awaits [`CancelContext::done`] or
//! calls [`CancelContext::err`], so contexts can be created outside of a tokio
//! runtime. [`CancelContext::child_token`] is the exception: a plain token has
//! nobody polling the deadline, so it gets a watcher task.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a cancellation source became done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelReason {
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("context canceled")]
    Cancelled,
}

/// Anything that can bound a wait.
pub trait CancelSource {
    /// Resolves once the source is done, with the reason.
    fn done(&self) -> BoxFuture<'_, CancelReason>;
}

impl CancelSource for CancellationToken {
    fn done(&self) -> BoxFuture<'_, CancelReason> {
        Box::pin(async move {
            self.cancelled().await;
            CancelReason::Cancelled
        })
    }
}

impl CancelSource for CancelContext {
    fn done(&self) -> BoxFuture<'_, CancelReason> {
        Box::pin(CancelContext::done(self))
    }
}

#[derive(Debug, Default)]
struct Reason {
    value: OnceLock<CancelReason>,
    parent: Option<Arc<Reason>>,
}

impl Reason {
    fn resolved(&self) -> Option<CancelReason> {
        self.value
            .get()
            .copied()
            .or_else(|| self.parent.as_ref().and_then(|parent| parent.resolved()))
    }
}

/// A cancellable scope with an optional deadline.
#[derive(Debug, Clone)]
pub struct CancelContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    reason: Arc<Reason>,
}

impl Default for CancelContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CancelContext {
    /// A root context that is never done unless cancelled explicitly.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            reason: Arc::new(Reason::default()),
        }
    }

    /// Root context driven by an existing token, e.g. a runtime's primary token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            reason: Arc::new(Reason::default()),
        }
    }

    /// Child context that can be cancelled on its own.
    pub fn with_cancel(&self) -> Self {
        self.child(self.deadline)
    }

    /// Child context that expires `timeout` from now, or at the parent's
    /// deadline if that comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        self.child(Some(deadline))
    }

    fn child(&self, deadline: Option<Instant>) -> Self {
        Self {
            token: self.token.child_token(),
            deadline,
            reason: Arc::new(Reason {
                value: OnceLock::new(),
                parent: Some(self.reason.clone()),
            }),
        }
    }

    /// Cancel this context and all of its children. Idempotent; the first
    /// recorded reason wins.
    pub fn cancel(&self) {
        let _ = self.reason.value.set(CancelReason::Cancelled);
        self.token.cancel();
    }

    fn expire(&self) {
        let _ = self.reason.value.set(CancelReason::DeadlineExceeded);
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token for tasks that should stop with this context, including when
    /// its deadline passes.
    ///
    /// With a deadline set this spawns a watcher task, so it must be called
    /// from within a tokio runtime. The watcher exits once the token fires.
    pub fn child_token(&self) -> CancellationToken {
        let token = self.token.child_token();
        if self.deadline.is_some() && !token.is_cancelled() {
            let ctx = self.clone();
            let watched = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.done() => {}
                    _ = watched.cancelled() => {}
                }
            });
        }
        token
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// `None` while the context is live, otherwise why it is done.
    pub fn err(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            return Some(self.cancelled_reason());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.expire();
                Some(self.cancelled_reason())
            }
            _ => None,
        }
    }

    /// Wait until the context is done.
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => self.cancelled_reason(),
                    _ = tokio::time::sleep_until(deadline) => {
                        self.expire();
                        self.cancelled_reason()
                    }
                }
            }
            None => {
                self.token.cancelled().await;
                self.cancelled_reason()
            }
        }
    }

    // a token cancelled through a raw clone has no recorded reason
    fn cancelled_reason(&self) -> CancelReason {
        self.reason.resolved().unwrap_or(CancelReason::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_explicit_cancel() {
        let ctx = CancelContext::background();
        assert_eq!(ctx.err(), None);

        ctx.cancel();
        assert_eq!(ctx.done().await, CancelReason::Cancelled);
        assert_eq!(ctx.err(), Some(CancelReason::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = CancelContext::background().with_timeout(Duration::from_millis(5));
        let start = Instant::now();

        assert_eq!(ctx.done().await, CancelReason::DeadlineExceeded);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(5) && elapsed < Duration::from_millis(6));
        assert_eq!(ctx.err(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_expiry_keeps_first_reason() {
        let ctx = CancelContext::background().with_timeout(Duration::from_millis(1));
        tokio::time::advance(Duration::from_millis(2)).await;

        assert_eq!(ctx.err(), Some(CancelReason::DeadlineExceeded));
        ctx.cancel();
        assert_eq!(ctx.err(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_parent_cancel_propagates_reason() {
        let parent = CancelContext::background();
        let child = parent.with_cancel();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        parent.cancel();
        assert_eq!(grandchild.done().await, CancelReason::Cancelled);
        assert!(child.is_done());
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_alive() {
        let parent = CancelContext::background();
        let child = parent.with_cancel();

        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_deadline_capped_by_parent() {
        let parent = CancelContext::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(5));

        assert_eq!(child.deadline(), parent.deadline());
        assert_eq!(child.done().await, CancelReason::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_token_fires_at_deadline() {
        let ctx = CancelContext::background().with_timeout(Duration::from_millis(5));
        let token = ctx.child_token();
        let start = Instant::now();

        tokio::time::timeout(Duration::from_millis(500), token.cancelled())
            .await
            .expect("token should fire at the deadline");
        assert!(start.elapsed() < Duration::from_millis(6));
        assert_eq!(ctx.err(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_child_token_follows_explicit_cancel() {
        let ctx = CancelContext::background();
        let token = ctx.child_token();
        assert!(!token.is_cancelled());

        ctx.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_token_cancel_leaves_context_alive() {
        let ctx = CancelContext::background().with_timeout(Duration::from_secs(1));
        let token = ctx.child_token();

        token.cancel();
        tokio::task::yield_now().await;
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn test_raw_token_cancel_reports_cancelled() {
        let token = CancellationToken::new();
        let ctx = CancelContext::from_token(token.clone());

        token.cancel();
        assert_eq!(ctx.err(), Some(CancelReason::Cancelled));
        assert_eq!(CancelSource::done(&token).await, CancelReason::Cancelled);
    }

    #[test]
    fn test_reason_messages() {
        assert_eq!(
            CancelReason::DeadlineExceeded.to_string(),
            "context deadline exceeded"
        );
        assert_eq!(CancelReason::Cancelled.to_string(), "context canceled");
    }
}
