// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Embedded etcd server lifecycle.
//!
//! [`Server`] owns at most one running etcd node. [`EtcdProcess`] runs the
//! `etcd` binary as a child process and reports "ready" or "exited" through a
//! [`signal::outcome`] pair; [`Server::start`] turns that into a synchronous
//! result with [`wait_for_completion`], bounded by the startup timeout.
//!
//! Starting a member with seed endpoints joins the existing cluster: the
//! cluster name and member names are checked first, then the member is added
//! and started with `--initial-cluster-state existing`.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::cancel::CancelContext;
use crate::client::{Client, EtcdApi};
use crate::cluster::{self, Registration};
use crate::config::{ClientConfig, ServerConfig};
use crate::error::ServerError;
use crate::release::{close_client, close_server};
use crate::signal::{self, CompletionSignal, FailureSignal, Resolver};
use crate::utils::urls_to_strings;
use crate::wait::wait_for_completion;

const PROBE_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const PROBE_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// A running etcd node owned by a [`Server`].
pub trait EtcdNode: Send {
    /// Ask the node to stop. Must return without waiting for it.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// `--initial-cluster-state` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    New,
    Existing,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::New => "new",
            ClusterState::Existing => "existing",
        }
    }
}

/// The etcd binary running as a supervised child process.
#[derive(Debug)]
pub struct EtcdProcess {
    pid: Option<u32>,
    shutdown: CancellationToken,
}

impl EtcdProcess {
    /// Build the etcd command line for `config`.
    pub fn command(config: &ServerConfig, initial_cluster: &str, state: ClusterState) -> Command {
        let mut cmd = Command::new(&config.etcd_binary);
        cmd.arg("--name")
            .arg(&config.name)
            .arg("--data-dir")
            .arg(&config.data_dir)
            .arg("--listen-client-urls")
            .arg(urls_to_strings(&config.listen_client_urls).join(","))
            .arg("--advertise-client-urls")
            .arg(urls_to_strings(&config.advertise_client_urls).join(","))
            .arg("--listen-peer-urls")
            .arg(urls_to_strings(&config.listen_peer_urls).join(","))
            .arg("--initial-advertise-peer-urls")
            .arg(urls_to_strings(&config.advertise_peer_urls).join(","))
            .arg("--initial-cluster")
            .arg(initial_cluster)
            .arg("--initial-cluster-state")
            .arg(state.as_str())
            .arg("--initial-cluster-token")
            .arg(&config.cluster_name);
        cmd
    }

    /// Spawn `etcd` for `config`.
    ///
    /// The returned signals report whether the node became ready (answers a
    /// status request at its advertised client URLs) or exited first.
    pub fn spawn(
        config: &ServerConfig,
        initial_cluster: &str,
        state: ClusterState,
    ) -> Result<(Self, CompletionSignal, FailureSignal<anyhow::Error>)> {
        Self::spawn_command(
            Self::command(config, initial_cluster, state),
            config.local_client(),
        )
        .with_context(|| {
            format!(
                "Failed to spawn etcd binary {}",
                config.etcd_binary.display()
            )
        })
    }

    /// Spawn an arbitrary command and supervise it as an etcd node whose
    /// readiness is probed through `probe`.
    pub fn spawn_command(
        mut cmd: Command,
        probe: ClientConfig,
    ) -> Result<(Self, CompletionSignal, FailureSignal<anyhow::Error>)> {
        let child = cmd.stdin(Stdio::null()).kill_on_drop(true).spawn()?;
        let pid = child.id();
        let shutdown = CancellationToken::new();
        let (resolver, ready, failed) = signal::outcome();

        tracing::info!(?pid, "spawned etcd process");
        tokio::spawn(supervise(child, probe, resolver, shutdown.clone()));

        Ok((Self { pid, shutdown }, ready, failed))
    }
}

impl EtcdNode for EtcdProcess {
    fn close(&mut self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(pid = ?self.pid, "stopping etcd process");
            self.shutdown.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for EtcdProcess {
    fn drop(&mut self) {
        self.close();
    }
}

async fn supervise(
    mut child: Child,
    probe: ClientConfig,
    resolver: Resolver<anyhow::Error>,
    shutdown: CancellationToken,
) {
    let pid = child.id();

    tokio::select! {
        status = child.wait() => {
            let err = match status {
                Ok(status) => anyhow!("etcd exited before becoming ready: {status}"),
                Err(err) => anyhow::Error::new(err).context("Failed to wait on etcd process"),
            };
            resolver.fail(err);
            return;
        }
        _ = probe_ready(&probe, &shutdown) => {
            tracing::info!(?pid, "etcd is ready");
            resolver.succeed();
        }
        _ = shutdown.cancelled() => {
            resolver.fail(anyhow!("etcd was closed before becoming ready"));
            terminate(&mut child).await;
            return;
        }
    }

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => tracing::warn!(?pid, %status, "etcd exited"),
            Err(err) => tracing::warn!(?pid, error = %err, "lost track of etcd process"),
        },
        _ = shutdown.cancelled() => terminate(&mut child).await,
    }
}

async fn terminate(child: &mut Child) {
    let pid = child.id();
    if let Err(err) = child.start_kill() {
        tracing::debug!(?pid, error = %err, "etcd process already gone");
    }
    match child.wait().await {
        Ok(status) => tracing::info!(?pid, %status, "etcd process stopped"),
        Err(err) => tracing::warn!(?pid, error = %err, "failed to reap etcd process"),
    }
}

/// Resolves once a client can connect and get a status answer, retrying
/// with exponential backoff.
async fn probe_ready(config: &ClientConfig, shutdown: &CancellationToken) {
    let mut backoff = PROBE_INITIAL_BACKOFF;
    loop {
        match Client::connect(config).await {
            Ok(mut client) => {
                let status = client.status().await;
                close_client(Some(&mut client));
                match status {
                    Ok(()) => return,
                    Err(err) => tracing::trace!(error = %err, "etcd not ready yet"),
                }
            }
            Err(err) => tracing::trace!(error = %err, "etcd not reachable yet"),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.cancelled() => return std::future::pending().await,
        }
        backoff = std::cmp::min(backoff * 2, PROBE_MAX_BACKOFF);
    }
}

/// How a [`Server`] reaches etcd and brings up its node.
#[async_trait]
pub trait NodeLauncher: Sync {
    type Node: EtcdNode;
    type Api: EtcdApi;

    async fn connect(&self, config: &ClientConfig) -> Result<Client<Self::Api>>;

    /// Start a node. The signals report whether it became ready or failed first.
    fn launch(
        &self,
        config: &ServerConfig,
        initial_cluster: &str,
        state: ClusterState,
    ) -> Result<(Self::Node, CompletionSignal, FailureSignal<anyhow::Error>)>;
}

/// Runs the `etcd` binary and talks to it over gRPC.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl NodeLauncher for ProcessLauncher {
    type Node = EtcdProcess;
    type Api = etcd_client::Client;

    async fn connect(&self, config: &ClientConfig) -> Result<Client> {
        Client::connect(config).await
    }

    fn launch(
        &self,
        config: &ServerConfig,
        initial_cluster: &str,
        state: ClusterState,
    ) -> Result<(EtcdProcess, CompletionSignal, FailureSignal<anyhow::Error>)> {
        EtcdProcess::spawn(config, initial_cluster, state)
    }
}

/// One embedded etcd member.
#[derive(Debug)]
pub struct Server<N = EtcdProcess> {
    config: ServerConfig,
    node: Option<N>,
}

impl<N: EtcdNode> Server<N> {
    /// Adopt an already running node.
    pub fn with_node(config: ServerConfig, node: N) -> Self {
        Self {
            config,
            node: Some(node),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.node.is_some()
    }

    /// Close the node if there is one. Returns false when nothing was running.
    pub fn close(&mut self) -> bool {
        match self.node.take() {
            Some(mut node) => {
                node.close();
                true
            }
            None => false,
        }
    }

    /// Stop the node, failing with [`ServerError::AlreadyStopped`] when
    /// nothing is running.
    pub fn stop(&mut self) -> Result<()> {
        if !self.close() {
            return Err(ServerError::AlreadyStopped.into());
        }
        tracing::info!(name = %self.config.name, "etcd member stopped");
        Ok(())
    }

    /// Start the member through `launcher` and wait until it is ready.
    ///
    /// The wait is bounded by `ctx` and by the configured startup timeout,
    /// whichever ends first. On any failure the node is closed again, a member
    /// registered while joining is removed, and the error is returned as
    /// produced (sentinel errors stay downcastable).
    pub async fn start_with<L>(&mut self, ctx: &CancelContext, launcher: &L) -> Result<()>
    where
        L: NodeLauncher<Node = N>,
    {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning.into());
        }
        self.config
            .validate()
            .context("Invalid etcd server configuration")?;

        let startup = ctx.with_timeout(self.config.startup_timeout());
        let peer_urls = urls_to_strings(&self.config.advertise_peer_urls);

        let state = if self.config.is_joining() {
            let mut seeds = launcher.connect(&self.config.seed_client()).await?;
            let joined = self
                .join_and_launch(&startup, launcher, &mut seeds, &peer_urls)
                .await;
            close_client(Some(&mut seeds));
            joined?;
            ClusterState::Existing
        } else {
            let initial = peer_urls
                .iter()
                .map(|url| format!("{}={url}", self.config.name))
                .collect::<Vec<_>>()
                .join(",");
            self.launch_and_wait(&startup, launcher, &initial, ClusterState::New)
                .await?;
            if let Err(err) = self.publish_cluster_name(launcher).await {
                tracing::error!(name = %self.config.name, error = %err, "failed to publish cluster name");
                close_server(Some(self));
                return Err(err);
            }
            ClusterState::New
        };

        tracing::info!(
            name = %self.config.name,
            cluster = %self.config.cluster_name,
            state = state.as_str(),
            "etcd member started"
        );
        Ok(())
    }

    async fn join_and_launch<L>(
        &mut self,
        startup: &CancelContext,
        launcher: &L,
        seeds: &mut Client<L::Api>,
        peer_urls: &[String],
    ) -> Result<()>
    where
        L: NodeLauncher<Node = N>,
    {
        let registration = join(&self.config, seeds, peer_urls).await?;
        let launched = self
            .launch_and_wait(
                startup,
                launcher,
                &registration.initial_cluster,
                ClusterState::Existing,
            )
            .await;

        if launched.is_err() {
            // an unstarted member still counts toward quorum and blocks a retry
            // with the same peer URLs
            let cleanup = CancelContext::background().with_timeout(self.config.cleanup_timeout());
            tokio::select! {
                removed = cluster::remove_member(seeds, registration.member_id) => {
                    if let Err(err) = removed {
                        tracing::warn!(member_id = registration.member_id, error = %err, "failed to roll back member registration");
                    }
                }
                reason = cleanup.done() => {
                    tracing::warn!(member_id = registration.member_id, %reason, "member registration rollback abandoned");
                }
            }
        }
        launched
    }

    async fn launch_and_wait<L>(
        &mut self,
        startup: &CancelContext,
        launcher: &L,
        initial_cluster: &str,
        state: ClusterState,
    ) -> Result<()>
    where
        L: NodeLauncher<Node = N>,
    {
        let (node, mut ready, mut failed) = launcher.launch(&self.config, initial_cluster, state)?;
        self.node = Some(node);

        if let Err(err) = wait_for_completion(&mut ready, &mut failed, startup).await {
            tracing::error!(name = %self.config.name, error = %err, "etcd member failed to start");
            close_server(Some(self));
            return Err(err.into_anyhow());
        }
        Ok(())
    }

    async fn publish_cluster_name<L>(&self, launcher: &L) -> Result<()>
    where
        L: NodeLauncher<Node = N>,
    {
        let mut client = launcher.connect(&self.config.local_client()).await?;
        let published = cluster::publish_cluster_name(&mut client, &self.config.cluster_name).await;
        close_client(Some(&mut client));
        published
    }
}

impl Server<EtcdProcess> {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, node: None }
    }

    /// Start the `etcd` binary. See [`Server::start_with`].
    pub async fn start(&mut self, ctx: &CancelContext) -> Result<()> {
        self.start_with(ctx, &ProcessLauncher).await
    }
}

/// Validate an existing cluster and register `config` as a new member of it.
pub async fn join<C: EtcdApi>(
    config: &ServerConfig,
    client: &mut Client<C>,
    peer_urls: &[String],
) -> Result<Registration> {
    cluster::check_cluster_name(client, &config.cluster_name).await?;
    cluster::check_name_conflict(client, &config.name).await?;
    cluster::add_member(client, &config.name, peer_urls).await
}
