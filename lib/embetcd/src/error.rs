// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sentinel errors raised by server lifecycle orchestration.
//!
//! These travel through [`crate::wait::wait_for_completion`] untouched, so callers
//! can recover them with `anyhow::Error::downcast_ref::<ServerError>()`.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServerError {
    /// The server name is already used by another member of the cluster
    #[error("server name is in conflict with an existing cluster member")]
    NameConflict,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is already stopped")]
    AlreadyStopped,

    /// The cluster name key is missing or holds a different name
    #[error(
        "cluster name either does not exist in the cluster under '/_etcd-cluster/name' or is different from this server's cluster name"
    )]
    ClusterNameConflict,
}

/// Returns the [`ServerError`] carried anywhere in the chain of `err`, if any.
pub fn server_error(err: &anyhow::Error) -> Option<ServerError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ServerError>())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_messages_match_cluster_tooling() {
        assert_eq!(
            ServerError::AlreadyRunning.to_string(),
            "server is already running"
        );
        assert_eq!(
            ServerError::AlreadyStopped.to_string(),
            "server is already stopped"
        );
        assert!(
            ServerError::ClusterNameConflict
                .to_string()
                .contains("/_etcd-cluster/name")
        );
    }

    #[test]
    fn test_server_error_found_through_context() {
        let err = Err::<(), _>(ServerError::NameConflict)
            .context("joining cluster")
            .unwrap_err();
        assert_eq!(server_error(&err), Some(ServerError::NameConflict));

        let other = anyhow::anyhow!("disk full");
        assert_eq!(server_error(&other), None);
    }
}
