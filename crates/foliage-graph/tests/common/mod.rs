// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for graph end-to-end tests.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::Value;

use foliage_statefun::{RequestProvider, Runtime, RuntimeConfig};
use foliage_substrate::EmbeddedCluster;

/// Start a hub runtime with every graph function type registered and the
/// CMDB schema prepared. `customize` can register extra function types
/// (e.g. trigger sinks) before the runtime starts.
pub async fn start_graph_runtime<F>(customize: F) -> Runtime
where
    F: FnOnce(&Runtime),
{
    let cluster = EmbeddedCluster::new();
    let substrate = cluster.connect("hub");
    let config = RuntimeConfig::new()
        .with_key_value_store_bucket_name("graph_test_kv_store")
        .with_request_timeout_sec(5);
    let runtime = Runtime::new(substrate, config)
        .await
        .expect("runtime connects");
    foliage_graph::register_all_function_types(&runtime);
    customize(&runtime);
    runtime.start().await.expect("runtime starts");
    runtime
}

/// Issue an in-process request to a graph function type.
pub async fn call(runtime: &Runtime, typename: &str, id: &str, payload: Value) -> Value {
    runtime
        .request(RequestProvider::Local, typename, id, payload, Value::Null)
        .await
        .expect("graph request succeeds at the transport level")
}

/// Assert a high-level (`{"payload": {...}}`) reply reported success.
pub fn assert_hl_ok(response: &Value) {
    assert_eq!(
        response["payload"]["status"], "ok",
        "unexpected HL failure: {response}"
    );
}

/// Assert a high-level reply reported failure.
pub fn assert_hl_failed(response: &Value) {
    assert_eq!(
        response["payload"]["status"], "failed",
        "expected HL failure, got: {response}"
    );
}

/// Assert a low-level (bare) reply reported success.
pub fn assert_ll_ok(response: &Value) {
    assert_eq!(response["status"], "ok", "unexpected LL failure: {response}");
}

/// Whether a key exists in the bucket.
pub async fn has_key(runtime: &Runtime, key: &str) -> bool {
    runtime
        .global_cache()
        .get(key)
        .await
        .expect("cache read")
        .is_some()
}

/// Poll for a condition with a timeout; trigger fan-out is asynchronous.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
