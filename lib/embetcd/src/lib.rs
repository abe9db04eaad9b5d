// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Embedded etcd supervision
//!
//! Utilities for a process that embeds and supervises an etcd node: turning
//! asynchronous "ready" / "failed" notifications into a synchronous result
//! ([`wait::wait_for_completion`]), cancellation contexts with deadlines
//! ([`cancel::CancelContext`]), and best-effort teardown helpers
//! ([`release`]) for servers, clients, contexts and leases.

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

pub mod cancel;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod release;
pub mod server;
pub mod signal;
pub mod utils;
pub mod wait;

pub use cancel::{CancelContext, CancelReason, CancelSource};
pub use client::{Client, EtcdApi, Lease};
pub use config::{ClientConfig, ConfigError, EmbetcdConfig, ServerConfig};
pub use error::ServerError;
pub use server::{EtcdNode, EtcdProcess, NodeLauncher, ProcessLauncher, Server};
pub use signal::{CompletionSignal, FailureSignal, Resolver};
pub use tokio_util::sync::CancellationToken;
pub use wait::{Resolution, WaitError, wait_for_completion};
