// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

pub use tokio::time::{Duration, Instant};

use url::Url;

/// Returns `value` if set, else `default`.
///
/// Generic over the duration type so signed durations such as
/// [`chrono::TimeDelta`] pass through unclamped.
pub fn duration_or_default<D>(value: Option<D>, default: D) -> D {
    value.unwrap_or(default)
}

/// Each URL as an etcd endpoint string, in order.
pub fn urls_to_strings(urls: &[Url]) -> Vec<String> {
    urls.iter().map(url_to_string).collect()
}

/// Serialize `url` the way etcd flags expect it: a bare root path is left
/// off, since etcd rejects member URLs that carry a path.
pub fn url_to_string(url: &Url) -> String {
    let serialized = url.as_str();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        serialized
            .strip_suffix('/')
            .unwrap_or(serialized)
            .to_string()
    } else {
        serialized.to_string()
    }
}

/// Exact-match membership test, stopping at the first hit.
pub fn string_in_slice<S: AsRef<str>>(needle: &str, haystack: &[S]) -> bool {
    haystack.iter().any(|candidate| candidate.as_ref() == needle)
}
