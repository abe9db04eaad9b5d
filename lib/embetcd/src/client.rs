// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! etcd client handle used by the supervisor.
//!
//! [`EtcdApi`] is the narrow slice of the etcd API the supervisor needs
//! (health, cluster name key, membership, leases). It is implemented for
//! [`etcd_client::Client`]; tests plug in an in-memory implementation.
//!
//! [`Client`] owns an optional connection. Closing it drops the connection and
//! leaves a closed handle behind, so closing twice is harmless.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use etcd_client::{ConnectOptions, LeaseGrantResponse};

use crate::config::ClientConfig;
use crate::utils::urls_to_strings;

/// A granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: i64,
    /// TTL in seconds as granted by the server
    pub ttl: i64,
}

impl From<&LeaseGrantResponse> for Lease {
    fn from(resp: &LeaseGrantResponse) -> Self {
        Self {
            id: resp.id(),
            ttl: resp.ttl(),
        }
    }
}

/// A cluster member as reported by etcd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: u64,
    /// Empty for a member that was added but has not started yet
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
}

impl From<&etcd_client::Member> for MemberInfo {
    fn from(member: &etcd_client::Member) -> Self {
        Self {
            id: member.id(),
            name: member.name().to_string(),
            peer_urls: member.peer_urls().to_vec(),
            client_urls: member.client_urls().to_vec(),
        }
    }
}

/// Result of registering a member: its new ID and the membership after the add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAdded {
    pub id: u64,
    pub members: Vec<MemberInfo>,
}

#[async_trait]
pub trait EtcdApi: Send {
    /// Succeeds once the endpoint answers a status request.
    async fn status(&mut self) -> Result<()>;

    async fn get_string(&mut self, key: &str) -> Result<Option<String>>;

    async fn put_string(&mut self, key: &str, value: &str) -> Result<()>;

    async fn members(&mut self) -> Result<Vec<MemberInfo>>;

    /// Register a new member by its peer URLs.
    async fn member_add(&mut self, peer_urls: Vec<String>) -> Result<MemberAdded>;

    async fn member_remove(&mut self, member_id: u64) -> Result<()>;

    async fn lease_grant(&mut self, ttl_secs: i64) -> Result<Lease>;

    async fn lease_revoke(&mut self, lease_id: i64) -> Result<()>;
}

#[async_trait]
impl EtcdApi for etcd_client::Client {
    async fn status(&mut self) -> Result<()> {
        etcd_client::Client::status(self).await?;
        Ok(())
    }

    async fn get_string(&mut self, key: &str) -> Result<Option<String>> {
        let resp = self.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str()?.to_string())),
            None => Ok(None),
        }
    }

    async fn put_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.put(key, value, None).await?;
        Ok(())
    }

    async fn members(&mut self) -> Result<Vec<MemberInfo>> {
        let resp = self.member_list().await?;
        Ok(resp.members().iter().map(MemberInfo::from).collect())
    }

    async fn member_add(&mut self, peer_urls: Vec<String>) -> Result<MemberAdded> {
        let resp = etcd_client::Client::member_add(self, peer_urls, None).await?;
        let member = resp
            .member()
            .ok_or_else(|| anyhow!("member add response carries no member"))?;
        Ok(MemberAdded {
            id: member.id(),
            members: resp.member_list().iter().map(MemberInfo::from).collect(),
        })
    }

    async fn member_remove(&mut self, member_id: u64) -> Result<()> {
        etcd_client::Client::member_remove(self, member_id).await?;
        Ok(())
    }

    async fn lease_grant(&mut self, ttl_secs: i64) -> Result<Lease> {
        let resp = etcd_client::Client::lease_grant(self, ttl_secs, None).await?;
        Ok(Lease::from(&resp))
    }

    async fn lease_revoke(&mut self, lease_id: i64) -> Result<()> {
        etcd_client::Client::lease_revoke(self, lease_id).await?;
        Ok(())
    }
}

/// Possibly-closed etcd client handle.
pub struct Client<C = etcd_client::Client> {
    api: Option<C>,
    endpoints: Vec<String>,
}

impl<C> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoints", &self.endpoints)
            .field("open", &self.api.is_some())
            .finish()
    }
}

impl Client<etcd_client::Client> {
    /// Connect to the endpoints in `config`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let endpoints = urls_to_strings(&config.endpoints);
        let options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout())
            .with_timeout(config.request_timeout());

        let api = etcd_client::Client::connect(endpoints.clone(), Some(options))
            .await
            .with_context(|| {
                format!(
                    "Unable to connect to etcd server at {}. Check etcd server status",
                    endpoints.join(", ")
                )
            })?;

        tracing::debug!(endpoints = %endpoints.join(","), "connected etcd client");
        Ok(Self {
            api: Some(api),
            endpoints,
        })
    }
}

impl<C: EtcdApi> Client<C> {
    /// Wrap an already connected API implementation.
    pub fn from_api(api: C, endpoints: Vec<String>) -> Self {
        Self {
            api: Some(api),
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn is_open(&self) -> bool {
        self.api.is_some()
    }

    /// The underlying connection, `None` once closed.
    pub fn api_mut(&mut self) -> Option<&mut C> {
        self.api.as_mut()
    }

    pub(crate) fn open_api(&mut self) -> Result<&mut C> {
        self.api
            .as_mut()
            .ok_or_else(|| anyhow!("etcd client for {} is closed", self.endpoints.join(",")))
    }

    /// Grant a lease with the given TTL (whole seconds, at least one).
    pub async fn grant_lease(&mut self, ttl: Duration) -> Result<Lease> {
        let ttl_secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let lease = self
            .open_api()?
            .lease_grant(ttl_secs)
            .await
            .context("Failed to create new lease")?;

        tracing::info!("Created new lease ID: {} (TTL: {}s)", lease.id, lease.ttl);
        Ok(lease)
    }

    pub async fn revoke(&mut self, lease: &Lease) -> Result<()> {
        self.open_api()?
            .lease_revoke(lease.id)
            .await
            .with_context(|| format!("Failed to revoke lease {}", lease.id))
    }

    pub async fn status(&mut self) -> Result<()> {
        self.open_api()?.status().await
    }

    /// Drop the connection. Returns false if it was already closed.
    pub fn close(&mut self) -> bool {
        let was_open = self.api.take().is_some();
        if was_open {
            tracing::debug!(endpoints = %self.endpoints.join(","), "closed etcd client");
        }
        was_open
    }
}
