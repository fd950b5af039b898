// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end scenarios for the stateful-function runtime.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use common::{wait_until, TestContext};
use foliage_statefun::{
    handler, Address, ContextProcessor, FunctionTypeConfig, RequestProvider, SignalProvider,
};

/// A signal appends its payload to a KV key; state survives invocations.
#[tokio::test]
async fn single_domain_signal_appends_to_kv() {
    let ctx = TestContext::new();
    let runtime = ctx.runtime("hub").await;

    runtime.register_function_type(
        "t",
        handler(|ctx: ContextProcessor| async move {
            let cache = ctx.global_cache();
            let key = format!("t/{}", ctx.self_address.id);
            let mut list = cache.get_json(&key).await?.unwrap_or_else(|| json!([]));
            if let (Some(items), Some(v)) = (list.as_array_mut(), ctx.payload.get("v")) {
                items.push(v.clone());
            }
            cache.set_json(&key, &list).await?;
            Ok(())
        }),
        FunctionTypeConfig::new(),
    );
    runtime.start().await.unwrap();

    runtime
        .signal(SignalProvider::Stream, "t", "s1", json!({"v": 1}), Value::Null)
        .await
        .unwrap();
    let cache = runtime.global_cache();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let cache = cache.clone();
            async move { cache.get_json("t/s1").await.unwrap() == Some(json!([1])) }
        })
        .await,
        "first signal lands within the delivery window"
    );

    runtime
        .signal(SignalProvider::Stream, "t", "s1", json!({"v": 2}), Value::Null)
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let cache = cache.clone();
            async move { cache.get_json("t/s1").await.unwrap() == Some(json!([1, 2])) }
        })
        .await
    );

    runtime.shutdown().await;
}

/// An in-process request to a locally-registered type short-circuits the
/// substrate and echoes the payload.
#[tokio::test]
async fn request_short_circuit_echoes_payload() {
    let ctx = TestContext::new();
    let runtime = ctx.runtime("hub").await;

    runtime.register_function_type(
        "echo",
        handler(|mut ctx: ContextProcessor| async move {
            let payload = ctx.payload.clone();
            if let Some(reply) = ctx.reply.as_mut() {
                reply.with(payload)?;
            }
            Ok(())
        }),
        FunctionTypeConfig::new(),
    );
    runtime.start().await.unwrap();

    let started = Instant::now();
    let response = runtime
        .request(
            RequestProvider::Auto,
            "echo",
            "e",
            json!({"n": 42}),
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(response, json!({"n": 42}));
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "local short-circuit must not touch the stream plane"
    );

    runtime.shutdown().await;
}

/// A signal emitted on the hub for a leaf-qualified id reaches the leaf's
/// handler with the caller's domain preserved.
#[tokio::test]
async fn cross_domain_signal_reaches_leaf() {
    let ctx = TestContext::new();
    let hub = ctx.runtime("hub").await;
    let leaf = ctx.runtime("leaf").await;

    let (seen_tx, mut seen_rx) = mpsc::channel::<(Address, Address)>(8);
    leaf.register_function_type(
        "t",
        handler(move |ctx: ContextProcessor| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx
                    .send((ctx.self_address.clone(), ctx.caller.clone()))
                    .await;
                Ok(())
            }
        }),
        FunctionTypeConfig::new(),
    );

    hub.register_function_type(
        "emitter",
        handler(|ctx: ContextProcessor| async move {
            ctx.signal(SignalProvider::Stream, "t", "leaf#id7", json!({}), Value::Null)
                .await?;
            Ok(())
        }),
        FunctionTypeConfig::new(),
    );

    hub.start().await.unwrap();
    leaf.start().await.unwrap();

    hub.signal(SignalProvider::Stream, "emitter", "origin", json!({}), Value::Null)
        .await
        .unwrap();

    let (self_address, caller) =
        tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .expect("delivered within one second")
            .expect("channel open");
    assert_eq!(
        self_address,
        Address {
            domain: "leaf".into(),
            typename: "t".into(),
            id: "id7".into()
        }
    );
    assert_eq!(caller.domain, "hub");
    assert_eq!(caller.typename, "emitter");
    assert_eq!(caller.id, "origin");

    hub.shutdown().await;
    leaf.shutdown().await;
}

/// Signals sent to one id are observed strictly in send order.
#[tokio::test]
async fn per_id_ordering_is_fifo() {
    let ctx = TestContext::new();
    let runtime = ctx.runtime("hub").await;

    let observed: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    runtime.register_function_type(
        "seq",
        handler(move |ctx: ContextProcessor| {
            let sink = sink.clone();
            async move {
                if let Some(n) = ctx.payload.get("n").and_then(Value::as_i64) {
                    sink.lock().unwrap().push(n);
                }
                Ok(())
            }
        }),
        FunctionTypeConfig::new(),
    );
    runtime.start().await.unwrap();

    for n in 0..20 {
        runtime
            .signal(SignalProvider::Stream, "seq", "same-id", json!({"n": n}), Value::Null)
            .await
            .unwrap();
    }

    let sink = observed.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let sink = sink.clone();
            async move { sink.lock().unwrap().len() == 20 }
        })
        .await
    );
    assert_eq!(*observed.lock().unwrap(), (0..20).collect::<Vec<i64>>());

    runtime.shutdown().await;
}

/// An idle id handler is reclaimed after its lifetime; state stays in KV.
#[tokio::test]
async fn idle_id_handlers_are_garbage_collected() {
    let ctx = TestContext::new();
    let runtime = ctx.runtime("hub").await;

    runtime.register_function_type(
        "gc.target",
        handler(|_ctx: ContextProcessor| async { Ok(()) }),
        FunctionTypeConfig::new().with_id_lifetime(Duration::from_millis(100)),
    );
    runtime.start().await.unwrap();

    runtime
        .signal(SignalProvider::Stream, "gc.target", "x", json!({}), Value::Null)
        .await
        .unwrap();

    let handle = runtime.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let handle = handle.clone();
            async move { handle.live_id_handlers("gc.target") == 1 }
        })
        .await,
        "handler spun up"
    );
    let handle = runtime.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let handle = handle.clone();
            async move { handle.live_id_handlers("gc.target") == 0 }
        })
        .await,
        "handler reclaimed after idling"
    );

    runtime.shutdown().await;
}

/// Two processes registering the same single-instance type: one serves, the
/// other skips, and takes over after the holder dies.
#[tokio::test]
async fn single_instance_gating_and_takeover() {
    let ctx = TestContext::new();
    let config = TestContext::config()
        .with_kv_mutex_life_time_sec(2)
        .with_kv_mutex_is_old_polling_interval_sec(1);

    let first = ctx.runtime_with("hub", config.clone()).await;
    let second = ctx.runtime_with("hub", config).await;

    let first_hits = Arc::new(AtomicUsize::new(0));
    let second_hits = Arc::new(AtomicUsize::new(0));

    for (runtime, hits) in [(&first, &first_hits), (&second, &second_hits)] {
        let hits = hits.clone();
        runtime.register_function_type(
            "s",
            handler(move |_ctx: ContextProcessor| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            FunctionTypeConfig::new(),
        );
    }

    first.start().await.unwrap();
    second.start().await.unwrap();

    second
        .signal(SignalProvider::Stream, "s", "job", json!({}), Value::Null)
        .await
        .unwrap();
    let hits = first_hits.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let hits = hits.clone();
            async move { hits.load(Ordering::SeqCst) == 1 }
        })
        .await,
        "lock holder processes"
    );
    assert_eq!(second_hits.load(Ordering::SeqCst), 0, "the other skipped");

    // Kill the holder; its lock sentinel stops refreshing and goes stale.
    first.shutdown().await;

    second
        .signal(SignalProvider::Stream, "s", "job", json!({}), Value::Null)
        .await
        .unwrap();
    let hits = second_hits.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let hits = hits.clone();
            async move { hits.load(Ordering::SeqCst) >= 1 }
        })
        .await,
        "survivor takes over within the mutex lifetime"
    );

    second.shutdown().await;
}

/// A handler error naks the delivery and the stream redelivers it.
#[tokio::test]
async fn failed_handler_gets_redelivered() {
    let ctx = TestContext::new();
    let runtime = ctx.runtime("hub").await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    runtime.register_function_type(
        "flaky",
        handler(move |_ctx: ContextProcessor| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok(())
            }
        }),
        FunctionTypeConfig::new(),
    );
    runtime.start().await.unwrap();

    runtime
        .signal(SignalProvider::Stream, "flaky", "x", json!({}), Value::Null)
        .await
        .unwrap();
    let counter = attempts.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let counter = counter.clone();
            async move { counter.load(Ordering::SeqCst) >= 2 }
        })
        .await,
        "nak leads to redelivery"
    );

    runtime.shutdown().await;
}

/// Object context written by one invocation is visible to the next one for
/// the same id.
#[tokio::test]
async fn object_context_survives_between_invocations() {
    let ctx = TestContext::new();
    let runtime = ctx.runtime("hub").await;

    runtime.register_function_type(
        "counter",
        handler(|mut ctx: ContextProcessor| async move {
            let mut state = ctx.get_object_context().await?;
            let n = state.get("n").and_then(Value::as_i64).unwrap_or(0) + 1;
            state["n"] = json!(n);
            ctx.set_object_context(state).await;
            if let Some(reply) = ctx.reply.as_mut() {
                reply.with(json!({"n": n}))?;
            }
            Ok(())
        }),
        FunctionTypeConfig::new(),
    );
    runtime.start().await.unwrap();

    for expected in 1..=3 {
        let response = runtime
            .request(RequestProvider::Local, "counter", "c1", json!({}), Value::Null)
            .await
            .unwrap();
        assert_eq!(response, json!({"n": expected}));
    }
    // A different id has its own state.
    let response = runtime
        .request(RequestProvider::Local, "counter", "c2", json!({}), Value::Null)
        .await
        .unwrap();
    assert_eq!(response, json!({"n": 1}));

    runtime.shutdown().await;
}

/// Requests to an unregistered local type fail fast; a request through the
/// core plane without a responder fails with a substrate error.
#[tokio::test]
async fn request_error_paths() {
    let ctx = TestContext::new();
    let runtime = ctx.runtime("hub").await;
    runtime.start().await.unwrap();

    let err = runtime
        .request(RequestProvider::Local, "ghost", "x", json!({}), Value::Null)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not registered"));

    let err = runtime
        .request(RequestProvider::Core, "ghost", "x", json!({}), Value::Null)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no responder"));

    runtime.shutdown().await;
}
