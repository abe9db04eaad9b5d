// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Checks run against an existing cluster before a new member joins it.

use anyhow::{Context, Result};

use crate::client::{Client, EtcdApi, MemberInfo};
use crate::error::ServerError;
use crate::utils::string_in_slice;

/// Key holding the logical cluster name.
pub const CLUSTER_NAME_KEY: &str = "/_etcd-cluster/name";

/// Fails with [`ServerError::ClusterNameConflict`] unless the cluster stores
/// exactly `cluster_name` under [`CLUSTER_NAME_KEY`].
pub async fn check_cluster_name<C: EtcdApi>(
    client: &mut Client<C>,
    cluster_name: &str,
) -> Result<()> {
    let stored = client
        .open_api()?
        .get_string(CLUSTER_NAME_KEY)
        .await
        .context("Failed to read cluster name")?;

    match stored {
        Some(stored) if stored == cluster_name => Ok(()),
        stored => {
            tracing::warn!(
                expected = cluster_name,
                found = ?stored,
                "cluster name mismatch"
            );
            Err(ServerError::ClusterNameConflict.into())
        }
    }
}

/// Fails with [`ServerError::NameConflict`] if a current member already uses `name`.
pub async fn check_name_conflict<C: EtcdApi>(client: &mut Client<C>, name: &str) -> Result<()> {
    let members = client
        .open_api()?
        .members()
        .await
        .context("Failed to list cluster members")?;

    let names: Vec<&str> = members.iter().map(|member| member.name.as_str()).collect();
    if string_in_slice(name, &names) {
        return Err(ServerError::NameConflict.into());
    }
    Ok(())
}

/// Record the cluster name on a freshly bootstrapped cluster.
pub async fn publish_cluster_name<C: EtcdApi>(
    client: &mut Client<C>,
    cluster_name: &str,
) -> Result<()> {
    client
        .open_api()?
        .put_string(CLUSTER_NAME_KEY, cluster_name)
        .await
        .context("Failed to publish cluster name")
}

/// A member registered with the cluster but not started yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub member_id: u64,
    /// `--initial-cluster` value the member must start with
    pub initial_cluster: String,
}

/// Register `name` as a new member.
///
/// Until the member starts it still counts toward quorum, so callers that
/// fail to start it must undo the registration with [`remove_member`].
pub async fn add_member<C: EtcdApi>(
    client: &mut Client<C>,
    name: &str,
    peer_urls: &[String],
) -> Result<Registration> {
    let added = client
        .open_api()?
        .member_add(peer_urls.to_vec())
        .await
        .with_context(|| format!("Failed to add member {name}"))?;

    tracing::info!(name, member_id = added.id, peers = %peer_urls.join(","), "added cluster member");
    Ok(Registration {
        member_id: added.id,
        initial_cluster: initial_cluster(&added.members, name, peer_urls),
    })
}

pub async fn remove_member<C: EtcdApi>(client: &mut Client<C>, member_id: u64) -> Result<()> {
    client
        .open_api()?
        .member_remove(member_id)
        .await
        .with_context(|| format!("Failed to remove member {member_id:x}"))?;

    tracing::info!(member_id, "removed cluster member");
    Ok(())
}

/// Build `name=peer_url,...` for every started member plus this one.
///
/// Members that were added but never started carry no name; only the one
/// matching `peer_urls` (this member) is kept, under `name`.
pub fn initial_cluster(members: &[MemberInfo], name: &str, peer_urls: &[String]) -> String {
    let mut entries = Vec::new();
    for member in members {
        let member_name = if !member.name.is_empty() {
            member.name.as_str()
        } else if member.peer_urls == peer_urls {
            name
        } else {
            continue;
        };
        for url in &member.peer_urls {
            entries.push(format!("{member_name}={url}"));
        }
    }
    entries.join(",")
}
