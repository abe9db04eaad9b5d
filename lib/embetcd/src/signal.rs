// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-shot completion and failure signals.
//!
//! A [`CompletionSignal`] reports that a watched operation succeeded, a
//! [`FailureSignal`] reports that it failed with an error value. Both fire at
//! most once. A signal whose notifier is dropped without notifying is
//! *abandoned* and never fires, so a crashed initiator cannot be mistaken for a
//! successful one.
//!
//! Signals are futures. Poll them through a mutable reference (`&mut signal`)
//! so the initiator keeps ownership:
//!
//! ```rust,ignore
//! let (resolver, mut ready, mut failed) = signal::outcome::<anyhow::Error>();
//! tokio::spawn(async move { resolver.succeed() });
//! wait_for_completion(&mut ready, &mut failed, &ctx).await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Create an independent completion notifier/signal pair.
pub fn completion() -> (CompletionNotifier, CompletionSignal) {
    let (tx, rx) = oneshot::channel();
    (CompletionNotifier { tx }, CompletionSignal { rx: Some(rx) })
}

/// Create an independent failure notifier/signal pair.
pub fn failure<E>() -> (FailureNotifier<E>, FailureSignal<E>) {
    let (tx, rx) = oneshot::channel();
    (FailureNotifier { tx }, FailureSignal { rx: Some(rx) })
}

/// Create a completion and a failure signal driven by a single [`Resolver`].
///
/// Resolving consumes the resolver, so at most one of the two signals can
/// ever fire.
pub fn outcome<E>() -> (Resolver<E>, CompletionSignal, FailureSignal<E>) {
    let (completion, completion_signal) = completion();
    let (failure, failure_signal) = failure();
    (
        Resolver {
            completion,
            failure,
        },
        completion_signal,
        failure_signal,
    )
}

/// Sending half of a [`CompletionSignal`].
#[derive(Debug)]
pub struct CompletionNotifier {
    tx: oneshot::Sender<()>,
}

impl CompletionNotifier {
    /// Fire the signal. A no-op when the signal side is already gone.
    pub fn notify(self) {
        let _ = self.tx.send(());
    }

    /// Returns true if the signal side was dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Sending half of a [`FailureSignal`].
#[derive(Debug)]
pub struct FailureNotifier<E> {
    tx: oneshot::Sender<E>,
}

impl<E> FailureNotifier<E> {
    /// Fire the signal with `err`. The error is dropped if nobody listens.
    pub fn fail(self, err: E) {
        let _ = self.tx.send(err);
    }

    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Resolves a watched operation exactly once, as either success or failure.
#[derive(Debug)]
pub struct Resolver<E> {
    completion: CompletionNotifier,
    failure: FailureNotifier<E>,
}

impl<E> Resolver<E> {
    pub fn succeed(self) {
        self.completion.notify();
    }

    pub fn fail(self, err: E) {
        self.failure.fail(err);
    }

    /// Resolve from a `Result`, success on `Ok(())`.
    pub fn resolve(self, result: Result<(), E>) {
        match result {
            Ok(()) => self.succeed(),
            Err(err) => self.fail(err),
        }
    }

    /// Returns true once both signal sides were dropped.
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_abandoned() && self.failure.is_abandoned()
    }
}

/// One-shot "operation succeeded" notification.
#[derive(Debug)]
pub struct CompletionSignal {
    rx: Option<oneshot::Receiver<()>>,
}

impl CompletionSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Returns true while the signal may still fire.
    pub fn is_armed(&self) -> bool {
        self.rx.is_some()
    }
}

impl Future for CompletionSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Pending;
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(())) => {
                self.rx = None;
                Poll::Ready(())
            }
            // notifier dropped: the signal is abandoned and stays pending forever
            Poll::Ready(Err(_)) => {
                self.rx = None;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One-shot "operation failed" notification carrying the error.
#[derive(Debug)]
pub struct FailureSignal<E> {
    rx: Option<oneshot::Receiver<E>>,
}

impl<E> FailureSignal<E> {
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_armed(&self) -> bool {
        self.rx.is_some()
    }
}

impl<E> Future for FailureSignal<E> {
    type Output = E;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<E> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Pending;
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(err)) => {
                self.rx = None;
                Poll::Ready(err)
            }
            Poll::Ready(Err(_)) => {
                self.rx = None;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_completion_fires_once() {
        let (notifier, mut signal) = completion();
        notifier.notify();

        (&mut signal).await;
        assert!(!signal.is_armed());
        // already fired: never ready again
        assert!((&mut signal).now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_completion_never_fires() {
        let (notifier, mut signal) = completion();
        drop(notifier);

        assert!((&mut signal).now_or_never().is_none());
        assert!(!signal.is_armed());
    }

    #[tokio::test]
    async fn test_failure_carries_error() {
        let (notifier, mut signal) = failure::<String>();
        notifier.fail("disk full".to_string());

        assert_eq!((&mut signal).await, "disk full");
        assert!((&mut signal).now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_resolver_fires_exactly_one_side() {
        let (resolver, mut ready, mut failed) = outcome::<&'static str>();
        resolver.fail("boom");

        assert_eq!((&mut failed).await, "boom");
        // the completion side was dropped along with the resolver
        assert!((&mut ready).now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_resolver_resolve_ok() {
        let (resolver, mut ready, mut failed) = outcome::<&'static str>();
        resolver.resolve(Ok(()));

        (&mut ready).await;
        assert!((&mut failed).now_or_never().is_none());
    }

    #[test]
    fn test_abandoned_detection() {
        let (resolver, ready, failed) = outcome::<()>();
        assert!(!resolver.is_abandoned());
        drop(ready);
        drop(failed);
        assert!(resolver.is_abandoned());
    }

    #[test]
    fn test_never_signals() {
        let mut ready = CompletionSignal::never();
        let mut failed = FailureSignal::<()>::never();
        assert!((&mut ready).now_or_never().is_none());
        assert!((&mut failed).now_or_never().is_none());
    }
}
