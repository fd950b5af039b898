// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runtime end-to-end tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use foliage_statefun::{Runtime, RuntimeConfig};
use foliage_substrate::EmbeddedCluster;

/// One embedded cluster shared by the runtimes of a test.
pub struct TestContext {
    pub cluster: EmbeddedCluster,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            cluster: EmbeddedCluster::new(),
        }
    }

    /// Configuration with timings suited to tests.
    pub fn config() -> RuntimeConfig {
        RuntimeConfig::new()
            .with_key_value_store_bucket_name("test_kv_store")
            .with_request_timeout_sec(5)
    }

    /// A runtime connected to `domain` with the test configuration.
    pub async fn runtime(&self, domain: &str) -> Runtime {
        self.runtime_with(domain, Self::config()).await
    }

    /// A runtime connected to `domain` with an explicit configuration.
    pub async fn runtime_with(&self, domain: &str, config: RuntimeConfig) -> Runtime {
        Runtime::new(self.cluster.connect(domain), config)
            .await
            .expect("runtime connects")
    }
}

/// Poll `check` every 10 ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
