// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Three-way completion wait.
//!
//! [`wait_for_completion`] suspends the caller until the first of three
//! sources is ready:
//!
//! | source                     | result                          |
//! |----------------------------|---------------------------------|
//! | completion signal fires    | `Ok(())`                        |
//! | failure signal fires `E`   | `Err(WaitError::Failed(E))`     |
//! | cancel source becomes done | `Err(WaitError::Cancelled(..))` |
//!
//! The wait itself never times out; bound it with a [`CancelContext`]
//! carrying a deadline. When several sources are ready at the same instant any
//! one of them may win, callers must not rely on an order between them.
//!
//! The wait does not own or abort the watched operation. Pass signals as
//! `&mut signal` to keep them with the initiator.
//!
//! [`CancelContext`]: crate::cancel::CancelContext

use std::future::IntoFuture;

use thiserror::Error;

use crate::cancel::{CancelReason, CancelSource};

/// Terminal state of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<E> {
    Succeeded,
    Failed(E),
    Cancelled(CancelReason),
}

impl<E> Resolution<E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Resolution::Succeeded)
    }

    pub fn into_result(self) -> Result<(), WaitError<E>> {
        match self {
            Resolution::Succeeded => Ok(()),
            Resolution::Failed(err) => Err(WaitError::Failed(err)),
            Resolution::Cancelled(reason) => Err(WaitError::Cancelled(reason)),
        }
    }
}

/// Why a wait did not end in success.
#[derive(Debug, Error)]
pub enum WaitError<E> {
    /// The watched operation reported a failure, relayed as-is
    #[error("{0}")]
    Failed(E),

    /// The cancel source became done first
    #[error(transparent)]
    Cancelled(#[from] CancelReason),
}

impl<E> WaitError<E> {
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            WaitError::Cancelled(reason) => Some(*reason),
            WaitError::Failed(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason().is_some()
    }

    /// The operation's own error, if that is what ended the wait.
    pub fn into_failure(self) -> Option<E> {
        match self {
            WaitError::Failed(err) => Some(err),
            WaitError::Cancelled(_) => None,
        }
    }
}

impl<E: Into<anyhow::Error>> WaitError<E> {
    /// Flatten into an [`anyhow::Error`] without wrapping an operation
    /// failure, so sentinel errors stay downcastable.
    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            WaitError::Failed(err) => err.into(),
            WaitError::Cancelled(reason) => anyhow::Error::new(reason),
        }
    }
}

/// Wait for the first of `completion`, `failure` or `cancel`, returning which
/// one resolved.
pub async fn resolve<C, F, E, X>(completion: C, failure: F, cancel: &X) -> Resolution<E>
where
    C: IntoFuture<Output = ()>,
    F: IntoFuture<Output = E>,
    X: CancelSource + ?Sized,
{
    let completion = completion.into_future();
    let failure = failure.into_future();

    let resolution = tokio::select! {
        () = completion => Resolution::Succeeded,
        err = failure => Resolution::Failed(err),
        reason = cancel.done() => Resolution::Cancelled(reason),
    };

    match &resolution {
        Resolution::Succeeded => tracing::trace!("wait resolved: succeeded"),
        Resolution::Failed(_) => tracing::trace!("wait resolved: failed"),
        Resolution::Cancelled(reason) => tracing::trace!(%reason, "wait resolved: cancelled"),
    }
    resolution
}

/// Block until the watched operation succeeds, fails, or `cancel` is done.
pub async fn wait_for_completion<C, F, E, X>(
    completion: C,
    failure: F,
    cancel: &X,
) -> Result<(), WaitError<E>>
where
    C: IntoFuture<Output = ()>,
    F: IntoFuture<Output = E>,
    X: CancelSource + ?Sized,
{
    resolve(completion, failure, cancel).await.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelContext;
    use crate::error::{ServerError, server_error};
    use crate::signal;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, PartialEq, Eq)]
    struct Tagged(u64);

    #[tokio::test]
    async fn test_completion_wins() {
        let (resolver, mut ready, mut failed) = signal::outcome::<Tagged>();
        let ctx = CancelContext::background();

        resolver.succeed();
        let result = wait_for_completion(&mut ready, &mut failed, &ctx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_failure_relayed_unchanged() {
        let (resolver, mut ready, mut failed) = signal::outcome::<Tagged>();
        let ctx = CancelContext::background();

        resolver.fail(Tagged(0xdead_beef));
        let err = wait_for_completion(&mut ready, &mut failed, &ctx)
            .await
            .unwrap_err();
        assert!(!err.is_cancelled());
        assert_eq!(err.into_failure(), Some(Tagged(0xdead_beef)));
    }

    #[tokio::test]
    async fn test_sentinel_survives_into_anyhow() {
        let (resolver, mut ready, mut failed) = signal::outcome::<anyhow::Error>();
        let ctx = CancelContext::background();

        resolver.fail(ServerError::ClusterNameConflict.into());
        let err = wait_for_completion(&mut ready, &mut failed, &ctx)
            .await
            .map_err(WaitError::into_anyhow)
            .unwrap_err();
        assert_eq!(server_error(&err), Some(ServerError::ClusterNameConflict));
        // not wrapped: the outermost error is the sentinel itself
        assert!(err.downcast_ref::<ServerError>().is_some());
    }

    #[tokio::test]
    async fn test_cancel_before_signals() {
        let (_resolver, mut ready, mut failed) = signal::outcome::<Tagged>();
        let ctx = CancelContext::background();

        ctx.cancel();
        let err = wait_for_completion(&mut ready, &mut failed, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.cancel_reason(), Some(CancelReason::Cancelled));
    }

    #[tokio::test]
    async fn test_bare_token_as_cancel_source() {
        let token = CancellationToken::new();
        token.cancel();

        let resolution = resolve(
            signal::CompletionSignal::never(),
            signal::FailureSignal::<()>::never(),
            &token,
        )
        .await;
        assert_eq!(resolution, Resolution::Cancelled(CancelReason::Cancelled));
    }

    #[tokio::test]
    async fn test_trait_object_cancel_source() {
        let ctx = CancelContext::background();
        ctx.cancel();
        let source: &dyn CancelSource = &ctx;

        let resolution = resolve(
            signal::CompletionSignal::never(),
            signal::FailureSignal::<()>::never(),
            source,
        )
        .await;
        assert!(!resolution.is_success());
    }

    #[tokio::test]
    async fn test_simultaneous_failure_and_cancel_never_succeeds() {
        for _ in 0..32 {
            let (resolver, mut ready, mut failed) = signal::outcome::<Tagged>();
            let ctx = CancelContext::background();

            resolver.fail(Tagged(7));
            ctx.cancel();

            match resolve(&mut ready, &mut failed, &ctx).await {
                Resolution::Failed(Tagged(7)) => {}
                Resolution::Cancelled(CancelReason::Cancelled) => {}
                other => panic!("unexpected resolution {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_abandoned_signals_fall_back_to_cancel() {
        let (resolver, mut ready, mut failed) = signal::outcome::<Tagged>();
        drop(resolver);
        let ctx = CancelContext::background();

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { wait_for_completion(&mut ready, &mut failed, &ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        ctx.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.cancel_reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn test_wait_error_display() {
        let err = WaitError::Failed("server failed to start");
        assert_eq!(err.to_string(), "server failed to start");

        let err = WaitError::<&str>::from(CancelReason::DeadlineExceeded);
        assert_eq!(err.to_string(), "context deadline exceeded");
    }
}
