// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The runtime: wiring, startup and global bookkeeping.
//!
//! A [`Runtime`] connects the substrate, the domain routers, the cache
//! store and the registered function types. `start()` creates the per-type
//! streams, brings up the routers, acquires single-instance locks, attaches
//! consumers and subscribers, and spawns the mutex refresher and the idle
//! garbage collector; subscriptions are live when it returns. A process
//! holds exactly one runtime.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use foliage_substrate::{KeyValueStore, Substrate, SubstrateError};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::CacheStore;
use crate::config::RuntimeConfig;
use crate::context::Address;
use crate::domain::Domain;
use crate::envelope::Envelope;
use crate::error::{Result, StatefunError};
use crate::function_type::{
    FunctionType, FunctionTypeConfig, HandlerFn, RequestProvider, SignalProvider,
};
use crate::kv_mutex::{KeyMutex, MutexError};

type OnAfterStart =
    Box<dyn FnOnce(Runtime) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// A running (or to-be-started) stateful-function runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    substrate: Arc<dyn Substrate>,
    domain: Arc<Domain>,
    kv: Arc<dyn KeyValueStore>,
    key_mutex: KeyMutex,
    cache: OnceLock<Arc<CacheStore>>,
    function_types: RwLock<HashMap<String, Arc<FunctionType>>>,
    held_locks: Mutex<HashMap<String, u64>>,
    on_after_start: Mutex<Vec<OnAfterStart>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    // Global counters: first-ever invocation timestamp, last handler
    // return, and total invocations since the last quiescence report.
    gt0: AtomicI64,
    glce: AtomicI64,
    invocations: AtomicI64,
}

impl Runtime {
    /// Connect the runtime to a substrate, ensuring the key/value bucket.
    pub async fn new(substrate: Arc<dyn Substrate>, config: RuntimeConfig) -> Result<Self> {
        let kv = substrate
            .key_value(&config.key_value_store_bucket_name)
            .await?;
        let key_mutex = KeyMutex::new(
            kv.clone(),
            config.kv_mutex_life_time(),
            config.kv_mutex_polling_interval(),
        );
        let domain = Arc::new(Domain::new(substrate.clone(), config.hub_domain_name.clone()));
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                substrate,
                domain,
                kv,
                key_mutex,
                cache: OnceLock::new(),
                function_types: RwLock::new(HashMap::new()),
                held_locks: Mutex::new(HashMap::new()),
                on_after_start: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                gt0: AtomicI64::new(0),
                glce: AtomicI64::new(0),
                invocations: AtomicI64::new(0),
            }),
        })
    }

    /// Register a function type. Must happen before [`Runtime::start`].
    pub fn register_function_type(
        &self,
        typename: &str,
        handler: HandlerFn,
        config: FunctionTypeConfig,
    ) {
        if self.inner.started.load(Ordering::SeqCst) {
            warn!(typename, "function type registered after start is ignored");
            return;
        }
        let ft = Arc::new(FunctionType::new(
            Arc::downgrade(&self.inner),
            self.inner.domain.name(),
            typename,
            handler,
            config,
        ));
        self.inner
            .function_types
            .write()
            .expect("function types lock")
            .insert(typename.to_string(), ft);
    }

    /// Queue a callback invoked once subscriptions are live.
    pub fn register_on_after_start<F, Fut>(&self, f: F)
    where
        F: FnOnce(Runtime) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .on_after_start
            .lock()
            .expect("after start lock")
            .push(Box::new(move |runtime| Box::pin(f(runtime))));
    }

    /// Bring the runtime up. Subscriptions are live when this returns.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(StatefunError::Startup("runtime already started".into()));
        }
        let inner = &self.inner;

        // One stream per function type. An overlap with a foreign stream is
        // a startup misconfiguration and refuses the start.
        let function_types: Vec<Arc<FunctionType>> = inner
            .function_types
            .read()
            .expect("function types lock")
            .values()
            .cloned()
            .collect();
        for ft in &function_types {
            inner.substrate.ensure_stream(ft.stream_config()).await?;
        }

        let router_tasks = inner.domain.start().await?;
        inner
            .tasks
            .lock()
            .expect("tasks lock")
            .extend(router_tasks);

        info!("initializing the cache store");
        let cache = CacheStore::start(inner.kv.clone()).await?;
        let _ = inner.cache.set(cache);

        for ft in &function_types {
            if !ft.config().multiple_instances_allowed {
                match inner.key_mutex.lock(ft.stream_name(), false).await {
                    Ok(revision) => {
                        inner
                            .held_locks
                            .lock()
                            .expect("held locks lock")
                            .insert(ft.stream_name().to_string(), revision);
                    }
                    Err(MutexError::AlreadyLocked(_)) => {
                        warn!(
                            typename = %ft.name(),
                            "function type is already running somewhere and \
                             multiple instances are not allowed, skipping"
                        );
                        self.spawn_lock_acquirer(ft.clone());
                        continue;
                    }
                    Err(MutexError::Substrate(err)) => return Err(err.into()),
                    Err(err) => {
                        return Err(StatefunError::Startup(format!(
                            "single-instance lock for '{}': {err}",
                            ft.name()
                        )))
                    }
                }
            }
            let handles = attach_function_type(inner, ft).await?;
            inner.tasks.lock().expect("tasks lock").extend(handles);
        }

        self.spawn_mutex_refresher();
        self.spawn_garbage_collector();

        let callbacks: Vec<OnAfterStart> = inner
            .on_after_start
            .lock()
            .expect("after start lock")
            .drain(..)
            .collect();
        for callback in callbacks {
            if let Err(err) = callback(self.clone()).await {
                error!(%err, "on-after-start callback failed");
            }
        }

        info!(domain = %inner.domain.name(), "runtime started");
        Ok(())
    }

    /// Emit a signal as an external publisher (no caller identity).
    pub async fn signal(
        &self,
        provider: SignalProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> Result<()> {
        self.inner
            .emit_signal(provider, None, None, typename, id, payload, options)
            .await
    }

    /// Issue a synchronous request as an external caller.
    pub async fn request(
        &self,
        provider: RequestProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> Result<Value> {
        self.inner
            .perform_request(provider, None, None, typename, id, payload, options)
            .await
    }

    /// The runtime's domain.
    pub fn domain(&self) -> &Domain {
        &self.inner.domain
    }

    /// The process-local cache. Available after [`Runtime::start`].
    pub fn global_cache(&self) -> Arc<CacheStore> {
        self.inner.cache()
    }

    /// Live per-id handlers of a registered typename.
    pub fn live_id_handlers(&self, typename: &str) -> usize {
        self.inner
            .function_type(typename)
            .map(|ft| ft.live_ids())
            .unwrap_or(0)
    }

    /// Abort every runtime task. Single-instance locks are not released;
    /// other processes take them over once the sentinels go stale.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .expect("tasks lock")
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        info!(domain = %self.inner.domain.name(), "runtime shut down");
    }

    /// Retry the single-instance lock in the background and attach the
    /// subscriptions once the previous holder's sentinel goes stale.
    fn spawn_lock_acquirer(&self, ft: Arc<FunctionType>) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match inner.key_mutex.lock(ft.stream_name(), true).await {
                    Ok(revision) => {
                        inner
                            .held_locks
                            .lock()
                            .expect("held locks lock")
                            .insert(ft.stream_name().to_string(), revision);
                        match attach_function_type(&inner, &ft).await {
                            Ok(handles) => {
                                inner.tasks.lock().expect("tasks lock").extend(handles);
                                info!(
                                    typename = %ft.name(),
                                    "took over single-instance function type"
                                );
                            }
                            Err(err) => {
                                error!(typename = %ft.name(), %err, "takeover attach failed");
                            }
                        }
                        return;
                    }
                    Err(err) => {
                        error!(typename = %ft.name(), %err, "single-instance lock retry failed");
                        tokio::time::sleep(inner.config.kv_mutex_polling_interval()).await;
                    }
                }
            }
        });
        self.inner.tasks.lock().expect("tasks lock").push(handle);
    }

    fn spawn_mutex_refresher(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let interval = inner.config.kv_mutex_life_time() / 2;
            loop {
                tokio::time::sleep(interval).await;
                let held: Vec<(String, u64)> = inner
                    .held_locks
                    .lock()
                    .expect("held locks lock")
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect();
                for (key, revision) in held {
                    match inner.key_mutex.lock_update(&key, revision).await {
                        Ok(new_revision) => {
                            inner
                                .held_locks
                                .lock()
                                .expect("held locks lock")
                                .insert(key, new_revision);
                        }
                        Err(err) => {
                            // The handler loops notice unavailability on
                            // their next write; the process keeps running.
                            error!(key = %key, %err, "kv mutex refresh failed");
                        }
                    }
                }
            }
        });
        self.inner.tasks.lock().expect("tasks lock").push(handle);
    }

    fn spawn_garbage_collector(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let function_types: Vec<Arc<FunctionType>> = inner
                    .function_types
                    .read()
                    .expect("function types lock")
                    .values()
                    .cloned()
                    .collect();
                let mut collected = 0;
                let mut running = 0;
                for ft in function_types {
                    let (c, r) = ft.gc(inner.config.function_type_id_lifetime());
                    collected += c;
                    running += r;
                }
                if collected > 0 && running == 0 {
                    let glce = inner.glce.load(Ordering::SeqCst);
                    let gt0 = inner.gt0.load(Ordering::SeqCst);
                    let count = inner.invocations.load(Ordering::SeqCst);
                    let dt = glce - gt0;
                    if count > 0 && dt > 0 {
                        info!(
                            runs = count,
                            total_ms = dt / 1_000_000,
                            per_call_ns = dt / count,
                            rate_hz = count * 1_000_000_000 / dt,
                            "all id handlers quiesced"
                        );
                        inner.invocations.store(0, Ordering::SeqCst);
                    }
                }
            }
        });
        self.inner.tasks.lock().expect("tasks lock").push(handle);
    }
}

async fn attach_function_type(
    inner: &Arc<RuntimeInner>,
    ft: &Arc<FunctionType>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();
    if ft.allows_signal_provider(SignalProvider::Stream) {
        handles.push(
            ft.attach_signal_consumer(
                inner.substrate.clone(),
                inner.domain.clone(),
                inner.config.request_timeout(),
            )
            .await?,
        );
    }
    if ft.config().service_active {
        handles.push(
            ft.attach_request_subscriber(inner.substrate.clone(), inner.domain.clone())
                .await?,
        );
    }
    Ok(handles)
}

impl RuntimeInner {
    pub(crate) fn domain(&self) -> &Domain {
        &self.domain
    }

    pub(crate) fn cache(&self) -> Arc<CacheStore> {
        self.cache.get().expect("runtime not started").clone()
    }

    pub(crate) fn function_type(&self, typename: &str) -> Option<Arc<FunctionType>> {
        self.function_types
            .read()
            .expect("function types lock")
            .get(typename)
            .cloned()
    }

    pub(crate) fn note_invocation_start(&self) {
        let now = now_ns();
        let _ = self
            .gt0
            .compare_exchange(0, now, Ordering::SeqCst, Ordering::SeqCst);
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn note_invocation_end(&self) {
        self.glce.store(now_ns(), Ordering::SeqCst);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn emit_signal(
        &self,
        provider: SignalProvider,
        caller: Option<&Address>,
        explicit_domain: Option<&str>,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> Result<()> {
        let SignalProvider::Stream = provider;
        let target_domain = match explicit_domain {
            Some(domain) => domain.to_string(),
            None => self.domain.get_domain_from_object_id(id),
        };
        let local_id = self.domain.get_object_id_without_domain(id);
        let envelope = Envelope {
            caller_typename: caller.map(|c| c.typename.clone()).unwrap_or_default(),
            caller_id: caller
                .map(|c| self.domain.create_object_id_with_domain(&c.domain, &c.id))
                .unwrap_or_default(),
            payload: non_null(payload),
            options: non_null(options),
        };
        let subject = self.domain.egress_subject(&target_domain, typename, &local_id);
        self.substrate.publish(&subject, envelope.to_bytes()?).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn perform_request(
        &self,
        provider: RequestProvider,
        caller: Option<&Address>,
        explicit_domain: Option<&str>,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> Result<Value> {
        let target_domain = match explicit_domain {
            Some(domain) => domain.to_string(),
            None => self.domain.get_domain_from_object_id(id),
        };
        let local_id = self.domain.get_object_id_without_domain(id);
        let timeout = self.config.request_timeout();

        let use_local = match provider {
            RequestProvider::Local => true,
            RequestProvider::Core => false,
            RequestProvider::Auto => {
                target_domain == self.domain.name()
                    && self
                        .function_type(typename)
                        .is_some_and(|ft| ft.allows_request_provider(RequestProvider::Local))
            }
        };

        if use_local {
            if target_domain != self.domain.name() {
                return Err(StatefunError::ProviderNotAllowed {
                    provider: RequestProvider::Local.as_str().to_string(),
                    typename: typename.to_string(),
                });
            }
            let ft = self
                .function_type(typename)
                .ok_or_else(|| StatefunError::UnknownFunctionType(typename.to_string()))?;
            let caller_address = caller.cloned().unwrap_or_default();
            let reply_rx = ft.send_local_request(&local_id, caller_address, payload, options)?;
            match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(StatefunError::NoReply {
                    typename: typename.to_string(),
                    id: local_id,
                }),
                Err(_) => Err(StatefunError::RequestTimeout {
                    typename: typename.to_string(),
                    id: local_id,
                    timeout,
                }),
            }
        } else {
            let subject = Domain::request_subject(&target_domain, typename, &local_id);
            let envelope = Envelope {
                caller_typename: caller.map(|c| c.typename.clone()).unwrap_or_default(),
                caller_id: caller
                    .map(|c| self.domain.create_object_id_with_domain(&c.domain, &c.id))
                    .unwrap_or_default(),
                payload: non_null(payload),
                options: non_null(options),
            };
            match self
                .substrate
                .request(&subject, envelope.to_bytes()?, timeout)
                .await
            {
                Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
                Err(SubstrateError::RequestTimeout(_)) => Err(StatefunError::RequestTimeout {
                    typename: typename.to_string(),
                    id: local_id,
                    timeout,
                }),
                Err(err) => Err(err.into()),
            }
        }
    }
}

fn non_null(value: Value) -> Option<Value> {
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
