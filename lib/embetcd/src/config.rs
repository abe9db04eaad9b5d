// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the embedded etcd server and its clients.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/etc/embetcd/embetcd.toml`
//! 3. TOML file from the `EMBETCD_CONFIG_PATH` environment variable
//! 4. Environment variables (`EMBETCD_SERVER_*`, `EMBETCD_CLIENT_*`)
//!
//! ```toml
//! [server]
//! name = "node-1"
//! cluster_name = "metadata"
//! seeds = ["http://10.0.0.2:2379"]
//! startup_timeout_secs = 30
//!
//! [client]
//! endpoints = ["http://127.0.0.1:2379"]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::utils::duration_or_default;

/// ENV pointing at an optional TOML configuration file
const CONFIG_PATH_ENV: &str = "EMBETCD_CONFIG_PATH";

const SYSTEM_CONFIG_PATH: &str = "/etc/embetcd/embetcd.toml";

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Top-level configuration: one embedded server plus the client used to
/// talk to it (or to the cluster it joins).
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct EmbetcdConfig {
    #[validate(nested)]
    #[serde(default)]
    pub server: ServerConfig,

    #[validate(nested)]
    #[serde(default)]
    pub client: ClientConfig,
}

impl EmbetcdConfig {
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(EmbetcdConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            .merge(
                Env::prefixed("EMBETCD_SERVER_")
                    .map(|k| format!("server.{}", k.as_str().to_lowercase()).into()),
            )
            .merge(
                Env::prefixed("EMBETCD_CLIENT_")
                    .map(|k| format!("client.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider on top.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }
}

impl Provider for EmbetcdConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("EmbetcdConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

/// Settings for one embedded etcd member.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// Member name, unique within the cluster.
    #[validate(custom(function = "validate_member_name"))]
    pub name: String,

    /// Logical cluster name stored under `/_etcd-cluster/name`.
    #[validate(custom(function = "validate_member_name"))]
    pub cluster_name: String,

    pub data_dir: PathBuf,

    /// Path to the etcd executable.
    pub etcd_binary: PathBuf,

    #[validate(length(min = 1))]
    pub listen_client_urls: Vec<Url>,

    #[validate(length(min = 1))]
    pub advertise_client_urls: Vec<Url>,

    #[validate(length(min = 1))]
    pub listen_peer_urls: Vec<Url>,

    #[validate(length(min = 1))]
    pub advertise_peer_urls: Vec<Url>,

    /// Client endpoints of an existing cluster to join. Empty starts a new cluster.
    #[serde(default)]
    pub seeds: Vec<Url>,

    #[validate(range(min = 1))]
    pub startup_timeout_secs: Option<u64>,

    /// Bound on best-effort teardown calls, such as removing a member
    /// registration after a failed join.
    #[validate(range(min = 1))]
    pub cleanup_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            cluster_name: "default".to_string(),
            data_dir: PathBuf::from("default.etcd"),
            etcd_binary: PathBuf::from("etcd"),
            listen_client_urls: vec![local_url(2379)],
            advertise_client_urls: vec![local_url(2379)],
            listen_peer_urls: vec![local_url(2380)],
            advertise_peer_urls: vec![local_url(2380)],
            seeds: Vec::new(),
            startup_timeout_secs: None,
            cleanup_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn startup_timeout(&self) -> Duration {
        duration_or_default(
            self.startup_timeout_secs.map(Duration::from_secs),
            DEFAULT_STARTUP_TIMEOUT,
        )
    }

    pub fn cleanup_timeout(&self) -> Duration {
        duration_or_default(
            self.cleanup_timeout_secs.map(Duration::from_secs),
            DEFAULT_CLEANUP_TIMEOUT,
        )
    }

    /// True when this member joins an existing cluster.
    pub fn is_joining(&self) -> bool {
        !self.seeds.is_empty()
    }

    /// Client settings for talking to this member once it is up.
    pub fn local_client(&self) -> ClientConfig {
        ClientConfig {
            endpoints: self.advertise_client_urls.clone(),
            ..ClientConfig::default()
        }
    }

    /// Client settings for talking to the cluster being joined.
    pub fn seed_client(&self) -> ClientConfig {
        ClientConfig {
            endpoints: self.seeds.clone(),
            ..ClientConfig::default()
        }
    }
}

/// Settings for an etcd client connection.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ClientConfig {
    #[validate(length(min = 1))]
    pub endpoints: Vec<Url>,

    #[validate(range(min = 1))]
    pub dial_timeout_secs: Option<u64>,

    #[validate(range(min = 1))]
    pub request_timeout_secs: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![local_url(2379)],
            dial_timeout_secs: None,
            request_timeout_secs: None,
        }
    }
}

impl ClientConfig {
    pub fn dial_timeout(&self) -> Duration {
        duration_or_default(
            self.dial_timeout_secs.map(Duration::from_secs),
            DEFAULT_DIAL_TIMEOUT,
        )
    }

    pub fn request_timeout(&self) -> Duration {
        duration_or_default(
            self.request_timeout_secs.map(Duration::from_secs),
            DEFAULT_REQUEST_TIMEOUT,
        )
    }
}

fn local_url(port: u16) -> Url {
    Url::parse(&format!("http://127.0.0.1:{port}")).expect("valid loopback url")
}

/// Member and cluster names end up in `--initial-cluster`, so they must be
/// non-empty and free of the separators used there.
fn validate_member_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() || name.contains([',', '=']) || name.contains(char::is_whitespace)
    {
        let mut err = ValidationError::new("invalid_member_name");
        err.add_param("value".into(), &name);
        return Err(err);
    }
    Ok(())
}
