// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The handler-facing context processor.
//!
//! A handler receives one [`ContextProcessor`] per invocation. It exposes
//! the invocation addresses and payload, the per-id object context (loaded
//! from the key/value bucket on first access and flushed after the handler
//! returns), the global cache, and the signal/request primitives. In
//! request mode [`ContextProcessor::reply`] carries the reply sink.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::cache::CacheStore;
use crate::error::{Result, StatefunError};
use crate::function_type::{RequestProvider, SignalProvider};
use crate::runtime::RuntimeInner;

/// A function instance address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    /// Domain the instance lives in. Empty for external callers.
    pub domain: String,
    /// Function typename.
    pub typename: String,
    /// Object id, without domain prefix.
    pub id: String,
}

/// Reply sink of a request-mode invocation. Valid exactly once.
pub struct Reply {
    sink: Option<oneshot::Sender<Value>>,
}

impl Reply {
    pub(crate) fn new(sink: oneshot::Sender<Value>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Send the reply. A second call fails with
    /// [`StatefunError::AlreadyReplied`].
    pub fn with(&mut self, value: Value) -> Result<()> {
        let sink = self.sink.take().ok_or(StatefunError::AlreadyReplied)?;
        // The requester may have timed out already; the reply is then
        // dropped, which is the documented cancellation contract.
        let _ = sink.send(value);
        Ok(())
    }
}

/// Lazily-loaded per-id state, flushed after the handler returns.
pub(crate) struct ObjectContextCell {
    key: String,
    state: Mutex<ObjectContextState>,
}

#[derive(Default)]
struct ObjectContextState {
    loaded: Option<Value>,
    dirty: bool,
}

impl ObjectContextCell {
    pub(crate) fn new(typename: &str, id: &str) -> Self {
        Self {
            key: format!("{typename}.{id}"),
            state: Mutex::new(ObjectContextState::default()),
        }
    }

    pub(crate) async fn get(&self, cache: &CacheStore) -> Result<Value> {
        let mut state = self.state.lock().await;
        if state.loaded.is_none() {
            let stored = cache.get_json(&self.key).await?;
            state.loaded = Some(stored.unwrap_or_else(|| Value::Object(Default::default())));
        }
        Ok(state.loaded.clone().expect("loaded above"))
    }

    pub(crate) async fn set(&self, value: Value) {
        let mut state = self.state.lock().await;
        state.loaded = Some(value);
        state.dirty = true;
    }

    pub(crate) async fn flush(&self, cache: &CacheStore) -> Result<()> {
        let state = self.state.lock().await;
        if state.dirty {
            if let Some(value) = &state.loaded {
                cache.set_json(&self.key, value).await?;
            }
        }
        Ok(())
    }
}

/// Per-invocation API surface handed to a handler.
pub struct ContextProcessor {
    /// Address of the function instance being invoked.
    pub self_address: Address,
    /// Address of the calling instance; empty fields for external callers.
    pub caller: Address,
    /// Application payload of the invocation.
    pub payload: Value,
    /// Invocation options.
    pub options: Value,
    /// Reply sink, present only in request mode.
    pub reply: Option<Reply>,
    runtime: Arc<RuntimeInner>,
    object_context: Arc<ObjectContextCell>,
}

impl ContextProcessor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        runtime: Arc<RuntimeInner>,
        self_address: Address,
        caller: Address,
        payload: Value,
        options: Value,
        reply: Option<Reply>,
        object_context: Arc<ObjectContextCell>,
    ) -> Self {
        Self {
            self_address,
            caller,
            payload,
            options,
            reply,
            runtime,
            object_context,
        }
    }

    /// The process-local cache over the key/value bucket.
    pub fn global_cache(&self) -> Arc<CacheStore> {
        self.runtime.cache()
    }

    /// Name of the hub domain.
    pub fn hub_domain_name(&self) -> String {
        self.runtime.domain().hub_domain_name().to_string()
    }

    /// Domain encoded in an object id, defaulting to the current domain.
    pub fn get_domain_from_object_id(&self, object_id: &str) -> String {
        self.runtime.domain().get_domain_from_object_id(object_id)
    }

    /// Object id with any domain prefix stripped.
    pub fn get_object_id_without_domain(&self, object_id: &str) -> String {
        self.runtime.domain().get_object_id_without_domain(object_id)
    }

    /// Qualify an object id with a domain.
    pub fn create_object_id_with_domain(&self, domain: &str, object_id: &str) -> String {
        self.runtime
            .domain()
            .create_object_id_with_domain(domain, object_id)
    }

    /// Per-id state, loaded from the bucket on first access.
    pub async fn get_object_context(&self) -> Result<Value> {
        self.object_context.get(&self.runtime.cache()).await
    }

    /// Replace the per-id state; it is flushed after the handler returns.
    pub async fn set_object_context(&self, value: Value) {
        self.object_context.set(value).await;
    }

    /// Emit a signal to `(typename, id)`. The target domain is parsed from
    /// the id, defaulting to the current domain.
    pub async fn signal(
        &self,
        provider: SignalProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> Result<()> {
        self.runtime
            .emit_signal(
                provider,
                Some(&self.self_address),
                None,
                typename,
                id,
                payload,
                options,
            )
            .await
    }

    /// Emit a signal to `(domain, typename, id)` with an explicit domain.
    pub async fn signal_domain(
        &self,
        provider: SignalProvider,
        domain: &str,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> Result<()> {
        self.runtime
            .emit_signal(
                provider,
                Some(&self.self_address),
                Some(domain),
                typename,
                id,
                payload,
                options,
            )
            .await
    }

    /// Issue a synchronous request to `(typename, id)`.
    pub async fn request(
        &self,
        provider: RequestProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> Result<Value> {
        self.runtime
            .perform_request(
                provider,
                Some(&self.self_address),
                None,
                typename,
                id,
                payload,
                options,
            )
            .await
    }

    /// Issue a synchronous request with an explicit target domain.
    pub async fn request_domain(
        &self,
        provider: RequestProvider,
        domain: &str,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> Result<Value> {
        self.runtime
            .perform_request(
                provider,
                Some(&self.self_address),
                Some(domain),
                typename,
                id,
                payload,
                options,
            )
            .await
    }
}
