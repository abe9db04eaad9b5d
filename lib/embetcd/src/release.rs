// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Teardown helpers for possibly-absent resources.
//!
//! Each helper accepts an `Option` and does nothing when the handle (or the
//! resource inside it) is gone, so they can be called unconditionally from
//! error paths and repeatedly during shutdown. None of them return errors:
//! teardown has nobody left to report a secondary failure to.

use crate::cancel::CancelContext;
use crate::client::{Client, EtcdApi, Lease};
use crate::server::{EtcdNode, Server};

/// Close the server's etcd node if there is one.
pub fn close_server<N: EtcdNode>(server: Option<&mut Server<N>>) {
    if let Some(server) = server {
        server.close();
    }
}

/// Drop the client's connection if it is still open.
pub fn close_client<C: EtcdApi>(client: Option<&mut Client<C>>) {
    if let Some(client) = client {
        client.close();
    }
}

/// Cancel `ctx` and its children.
pub fn cancel_context(ctx: Option<&CancelContext>) {
    if let Some(ctx) = ctx {
        ctx.cancel();
    }
}

/// Best-effort lease revocation, bounded by `ctx`.
///
/// Only issues the request when both the client (with an open connection)
/// and the lease are present. Failures are not returned.
pub async fn revoke_lease<C: EtcdApi>(
    ctx: &CancelContext,
    client: Option<&mut Client<C>>,
    lease: Option<&Lease>,
) {
    let (Some(client), Some(lease)) = (client, lease) else {
        return;
    };
    let Some(api) = client.api_mut() else {
        return;
    };

    tokio::select! {
        result = api.lease_revoke(lease.id) => {
            if let Err(err) = result {
                tracing::debug!(lease_id = lease.id, error = %err, "lease revoke failed during teardown");
            }
        }
        reason = ctx.done() => {
            tracing::debug!(lease_id = lease.id, %reason, "lease revoke abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockEtcd;
    use crate::config::ServerConfig;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CountingNode {
        closes: Arc<AtomicUsize>,
    }

    impl EtcdNode for CountingNode {
        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closes.load(Ordering::SeqCst) > 0
        }
    }

    #[test]
    fn test_close_server_twice() {
        let closes = Arc::new(AtomicUsize::new(0));
        let node = CountingNode {
            closes: closes.clone(),
        };
        let mut server = Server::with_node(ServerConfig::default(), node);

        close_server(Some(&mut server));
        close_server(Some(&mut server));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!server.is_running());

        close_server::<CountingNode>(None);
    }

    #[test]
    fn test_close_client_twice() {
        let mut client = MockEtcd::new().client();
        close_client(Some(&mut client));
        close_client(Some(&mut client));
        assert!(!client.is_open());

        close_client::<MockEtcd>(None);
    }

    #[test]
    fn test_cancel_context() {
        let ctx = CancelContext::background();
        cancel_context(Some(&ctx));
        cancel_context(Some(&ctx));
        assert!(ctx.is_done());

        cancel_context(None);
    }

    #[tokio::test]
    async fn test_revoke_lease_requires_both_inputs() {
        let etcd = MockEtcd::new();
        let mut client = etcd.client();
        let lease = client.grant_lease(Duration::from_secs(10)).await.unwrap();
        let ctx = CancelContext::background();

        revoke_lease(&ctx, Some(&mut client), None).await;
        revoke_lease::<MockEtcd>(&ctx, None, Some(&lease)).await;
        assert_eq!(etcd.state.lock().unwrap().revoke_calls, 0);

        revoke_lease(&ctx, Some(&mut client), Some(&lease)).await;
        assert_eq!(etcd.state.lock().unwrap().revoke_calls, 1);
        assert!(etcd.state.lock().unwrap().leases.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_lease_discards_errors() {
        let etcd = MockEtcd::new();
        let mut client = etcd.client();
        let ctx = CancelContext::background();
        let unknown = Lease { id: 42, ttl: 10 };

        // lease not found: swallowed
        revoke_lease(&ctx, Some(&mut client), Some(&unknown)).await;
        revoke_lease(&ctx, Some(&mut client), Some(&unknown)).await;
        assert_eq!(etcd.state.lock().unwrap().revoke_calls, 2);
    }

    #[tokio::test]
    async fn test_revoke_lease_skips_closed_client() {
        let etcd = MockEtcd::new();
        let mut client = etcd.client();
        let lease = client.grant_lease(Duration::from_secs(10)).await.unwrap();
        client.close();

        revoke_lease(&CancelContext::background(), Some(&mut client), Some(&lease)).await;
        assert_eq!(etcd.state.lock().unwrap().revoke_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_lease_bounded_by_context() {
        let etcd = MockEtcd::new();
        etcd.state.lock().unwrap().hang_revoke = true;
        let mut client = etcd.client();
        let lease = client.grant_lease(Duration::from_secs(10)).await.unwrap();

        let ctx = CancelContext::background().with_timeout(Duration::from_millis(20));
        let start = tokio::time::Instant::now();
        revoke_lease(&ctx, Some(&mut client), Some(&lease)).await;

        assert!(start.elapsed() < Duration::from_millis(25));
        assert_eq!(etcd.state.lock().unwrap().revoke_calls, 1);
    }
}
