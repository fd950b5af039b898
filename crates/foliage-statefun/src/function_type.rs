// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function types: per-typename subscriptions and per-id handler loops.
//!
//! Every registered typename owns one stream capturing
//! `$SI.<domain>.signal.*.<typename>.*`. The signal consumer demultiplexes
//! deliveries by the trailing id token into per-id mailboxes. Each distinct
//! id gets a dedicated task with a bounded FIFO inbox: messages for one id
//! are processed strictly in delivery order, distinct ids run concurrently.
//! The underlying delivery is acknowledged only after the handler returns
//! cleanly; handler errors and panics nak. Overflow (id cap or a full
//! inbox) leaves the delivery unsettled so the stream redelivers it after
//! the consumer's ack wait.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use foliage_substrate::{subject, Acker, ConsumerConfig, StreamConfig, Substrate};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::context::{Address, ContextProcessor, ObjectContextCell, Reply};
use crate::domain::{Domain, DOMAIN_INGRESS_PREFIX, SIGNAL_PREFIX};
use crate::envelope::Envelope;
use crate::error::{Result, StatefunError};
use crate::runtime::RuntimeInner;

/// Bound of a per-id inbox.
const ID_INBOX_CAPACITY: usize = 64;
/// In-flight window of a per-typename signal consumer.
const SIGNAL_MAX_ACK_PENDING: usize = 256;

/// Transports permitted to serve synchronous requests to a function type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestProvider {
    /// Pick the in-process path when eligible, the core transport otherwise.
    Auto,
    /// In-process short-circuit only.
    Local,
    /// Core (non-durable) request transport only.
    Core,
}

impl RequestProvider {
    /// Short display name used in policy errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "Auto",
            Self::Local => "Local",
            Self::Core => "Core",
        }
    }
}

/// Transports permitted to deliver signals to a function type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalProvider {
    /// The durable stream plane.
    Stream,
}

/// Per-typename configuration.
#[derive(Debug, Clone)]
pub struct FunctionTypeConfig {
    /// Accept synchronous requests over the core request subject.
    pub service_active: bool,
    /// Permit more than one process to subscribe to the typename. When
    /// false the subscription is gated by a KV mutex.
    pub multiple_instances_allowed: bool,
    /// Transports that may serve synchronous requests to this type.
    pub allowed_request_providers: Vec<RequestProvider>,
    /// Transports that may deliver signals to this type.
    pub allowed_signal_providers: Vec<SignalProvider>,
    /// Cap on concurrent distinct ids, `-1` for unbounded.
    pub max_id_handlers: i64,
    /// Per-id idle lifetime; `None` takes the runtime default.
    pub id_lifetime: Option<Duration>,
    /// Share load in the consumer queue group instead of receiving every
    /// message on every subscriber.
    pub balance_needed: bool,
}

impl Default for FunctionTypeConfig {
    fn default() -> Self {
        Self {
            service_active: false,
            multiple_instances_allowed: false,
            allowed_request_providers: vec![RequestProvider::Auto],
            allowed_signal_providers: vec![SignalProvider::Stream],
            max_id_handlers: 20,
            id_lifetime: None,
            balance_needed: true,
        }
    }
}

impl FunctionTypeConfig {
    /// Configuration with the documented defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept synchronous requests over the core request subject.
    pub fn with_service_active(mut self, active: bool) -> Self {
        self.service_active = active;
        self
    }

    /// Allow multiple processes to subscribe to this typename.
    pub fn with_multiple_instances_allowed(mut self, allowed: bool) -> Self {
        self.multiple_instances_allowed = allowed;
        self
    }

    /// Restrict the request transports. An empty list disables requests.
    pub fn with_allowed_request_providers(mut self, providers: Vec<RequestProvider>) -> Self {
        self.allowed_request_providers = providers;
        self
    }

    /// Restrict the signal transports. An empty list disables signals.
    pub fn with_allowed_signal_providers(mut self, providers: Vec<SignalProvider>) -> Self {
        self.allowed_signal_providers = providers;
        self
    }

    /// Cap concurrent distinct ids; `-1` for unbounded.
    pub fn with_max_id_handlers(mut self, max: i64) -> Self {
        self.max_id_handlers = max;
        self
    }

    /// Override the per-id idle lifetime.
    pub fn with_id_lifetime(mut self, lifetime: Duration) -> Self {
        self.id_lifetime = Some(lifetime);
        self
    }

    /// Opt out of queue-group load balancing.
    pub fn with_balance_needed(mut self, balance: bool) -> Self {
        self.balance_needed = balance;
        self
    }
}

/// Outcome type of a handler invocation.
pub type HandlerResult = anyhow::Result<()>;

/// Boxed handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A registered handler.
pub type HandlerFn = Arc<dyn Fn(ContextProcessor) -> HandlerFuture + Send + Sync>;

/// Adapt a plain async fn or closure into a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(ContextProcessor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// How a finished invocation is settled.
pub(crate) enum Completion {
    /// Ack/nak of the underlying stream delivery.
    Signal(Acker),
    /// Reply sink of a synchronous request.
    Request(oneshot::Sender<Value>),
}

/// One message routed into a per-id mailbox.
pub(crate) struct Invocation {
    pub caller: Address,
    pub payload: Value,
    pub options: Value,
    pub completion: Completion,
}

struct IdHandler {
    tx: mpsc::Sender<Invocation>,
    queued: Arc<AtomicUsize>,
    last_activity_ms: Arc<AtomicI64>,
}

/// A registered function type.
pub struct FunctionType {
    name: String,
    subject: String,
    stream_name: String,
    config: FunctionTypeConfig,
    handler: HandlerFn,
    runtime: Weak<RuntimeInner>,
    id_handlers: Mutex<HashMap<String, IdHandler>>,
}

impl FunctionType {
    pub(crate) fn new(
        runtime: Weak<RuntimeInner>,
        domain_name: &str,
        typename: &str,
        handler: HandlerFn,
        config: FunctionTypeConfig,
    ) -> Self {
        let stream_name = format!("{}_{}", domain_name, typename.replace('.', "_"));
        let subject = format!(
            "{DOMAIN_INGRESS_PREFIX}.{domain_name}.{SIGNAL_PREFIX}.*.{typename}.*"
        );
        Self {
            name: typename.to_string(),
            subject,
            stream_name,
            config,
            handler,
            runtime,
            id_handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Typename.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration.
    pub fn config(&self) -> &FunctionTypeConfig {
        &self.config
    }

    /// Name of the per-typename stream (also the single-instance mutex key).
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub(crate) fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: self.stream_name.clone(),
            subjects: vec![self.subject.clone()],
            sources: Vec::new(),
        }
    }

    pub(crate) fn allows_request_provider(&self, provider: RequestProvider) -> bool {
        self.config
            .allowed_request_providers
            .iter()
            .any(|p| *p == provider || *p == RequestProvider::Auto)
    }

    pub(crate) fn allows_signal_provider(&self, provider: SignalProvider) -> bool {
        self.config.allowed_signal_providers.contains(&provider)
    }

    /// Number of live per-id handlers.
    pub(crate) fn live_ids(&self) -> usize {
        self.id_handlers.lock().expect("id handlers lock").len()
    }

    /// Route an invocation into the id's mailbox. On rejection the
    /// invocation is handed back to the caller for settlement.
    pub(crate) fn route(
        self: &Arc<Self>,
        id: &str,
        invocation: Invocation,
    ) -> std::result::Result<(), Invocation> {
        let mut handlers = self.id_handlers.lock().expect("id handlers lock");
        if !handlers.contains_key(id) {
            let cap = self.config.max_id_handlers;
            if cap >= 0 && handlers.len() as i64 >= cap {
                return Err(invocation);
            }
            let entry = self.spawn_id_handler(id);
            handlers.insert(id.to_string(), entry);
        }
        let entry = handlers.get(id).expect("entry inserted above");
        match entry.tx.try_send(invocation) {
            Ok(()) => {
                entry.queued.fetch_add(1, Ordering::SeqCst);
                entry.last_activity_ms.store(now_ms(), Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(invocation))
            | Err(mpsc::error::TrySendError::Closed(invocation)) => Err(invocation),
        }
    }

    /// Route and settle rejections: unsettled signals are left for stream
    /// redelivery after the ack wait, requests are answered with a policy
    /// failure.
    pub(crate) fn dispatch(self: &Arc<Self>, id: &str, invocation: Invocation) {
        if let Err(rejected) = self.route(id, invocation) {
            warn!(
                typename = %self.name,
                id,
                "function type oversubscribed, deferring delivery"
            );
            match rejected.completion {
                // Unsettled: the stream redelivers after ack_wait.
                Completion::Signal(_acker) => {}
                Completion::Request(reply) => {
                    let _ = reply.send(json!({
                        "status": "failed",
                        "result": format!("function type '{}' is oversubscribed", self.name),
                    }));
                }
            }
        }
    }

    fn spawn_id_handler(self: &Arc<Self>, id: &str) -> IdHandler {
        let (tx, rx) = mpsc::channel(ID_INBOX_CAPACITY);
        let queued = Arc::new(AtomicUsize::new(0));
        let last_activity_ms = Arc::new(AtomicI64::new(now_ms()));
        trace!(typename = %self.name, id, "starting id handler");
        tokio::spawn(run_id_handler(
            self.clone(),
            id.to_string(),
            rx,
            queued.clone(),
            last_activity_ms.clone(),
        ));
        IdHandler {
            tx,
            queued,
            last_activity_ms,
        }
    }

    /// Reap id handlers idle beyond `default_lifetime` (or the configured
    /// override) with an empty inbox. Returns (collected, still running).
    pub(crate) fn gc(&self, default_lifetime: Duration) -> (usize, usize) {
        let lifetime_ms = self
            .config
            .id_lifetime
            .unwrap_or(default_lifetime)
            .as_millis() as i64;
        let now = now_ms();
        let mut handlers = self.id_handlers.lock().expect("id handlers lock");
        let before = handlers.len();
        handlers.retain(|id, entry| {
            let idle = now - entry.last_activity_ms.load(Ordering::SeqCst) >= lifetime_ms;
            let empty = entry.queued.load(Ordering::SeqCst) == 0;
            if idle && empty {
                trace!(typename = %self.name, id, "garbage collecting idle id handler");
                false
            } else {
                true
            }
        });
        (before - handlers.len(), handlers.len())
    }

    /// Attach the durable signal consumer and start the dispatch loop.
    pub(crate) async fn attach_signal_consumer(
        self: &Arc<Self>,
        substrate: Arc<dyn Substrate>,
        domain: Arc<Domain>,
        ack_wait: Duration,
    ) -> Result<JoinHandle<()>> {
        let consumer_name = format!("{}-{}-consumer", self.stream_name, domain.name());
        let consumer_group = format!("{consumer_name}-group");
        substrate
            .ensure_consumer(
                &self.stream_name,
                ConsumerConfig {
                    name: consumer_name.clone(),
                    filter_subject: self.subject.clone(),
                    ack_wait,
                    max_ack_pending: SIGNAL_MAX_ACK_PENDING,
                },
            )
            .await?;
        let mut deliveries = substrate
            .consume(&self.stream_name, &consumer_name, &consumer_group)
            .await?;
        debug!(typename = %self.name, stream = %self.stream_name, "signal consumer attached");

        let ft = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let id = subject::last_token(&delivery.subject).to_string();
                let envelope = match Envelope::from_bytes(&delivery.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        // A malformed payload never becomes parseable.
                        warn!(typename = %ft.name, %err, "dropping undecodable signal");
                        delivery.acker.ack();
                        continue;
                    }
                };
                let caller = caller_address(&domain, &envelope);
                ft.dispatch(
                    &id,
                    Invocation {
                        caller,
                        payload: envelope.payload.unwrap_or(Value::Null),
                        options: envelope.options.unwrap_or(Value::Null),
                        completion: Completion::Signal(delivery.acker),
                    },
                );
            }
        }))
    }

    /// Attach the core request subscriber and start its loop.
    pub(crate) async fn attach_request_subscriber(
        self: &Arc<Self>,
        substrate: Arc<dyn Substrate>,
        domain: Arc<Domain>,
    ) -> Result<JoinHandle<()>> {
        let request_subject = Domain::request_subject(domain.name(), &self.name, "*");
        let mut requests = substrate.serve(&request_subject).await?;
        debug!(typename = %self.name, subject = %request_subject, "request subscriber attached");

        let ft = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if !ft.allows_request_provider(RequestProvider::Core) {
                    let _ = request.reply.send(policy_failure(&ft.name));
                    continue;
                }
                let id = subject::last_token(&request.subject).to_string();
                let envelope = match Envelope::from_bytes(&request.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        let _ = request.reply.send(bytes_of(&json!({
                            "status": "failed",
                            "result": format!("undecodable request payload: {err}"),
                        })));
                        continue;
                    }
                };
                let caller = caller_address(&domain, &envelope);
                let (reply_tx, reply_rx) = oneshot::channel();
                ft.dispatch(
                    &id,
                    Invocation {
                        caller,
                        payload: envelope.payload.unwrap_or(Value::Null),
                        options: envelope.options.unwrap_or(Value::Null),
                        completion: Completion::Request(reply_tx),
                    },
                );
                let wire_reply = request.reply;
                tokio::spawn(async move {
                    if let Ok(value) = reply_rx.await {
                        let _ = wire_reply.send(bytes_of(&value));
                    }
                    // A dropped sink leaves the requester to its timeout.
                });
            }
        }))
    }

    /// Inject a synchronous request through the in-process short-circuit.
    pub(crate) fn send_local_request(
        self: &Arc<Self>,
        id: &str,
        caller: Address,
        payload: Value,
        options: Value,
    ) -> Result<oneshot::Receiver<Value>> {
        if !self.allows_request_provider(RequestProvider::Local) {
            return Err(StatefunError::ProviderNotAllowed {
                provider: RequestProvider::Local.as_str().to_string(),
                typename: self.name.clone(),
            });
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.route(
            id,
            Invocation {
                caller,
                payload,
                options,
                completion: Completion::Request(reply_tx),
            },
        )
        .map_err(|_| StatefunError::Oversubscribed(self.name.clone()))?;
        Ok(reply_rx)
    }
}

async fn run_id_handler(
    ft: Arc<FunctionType>,
    id: String,
    mut rx: mpsc::Receiver<Invocation>,
    queued: Arc<AtomicUsize>,
    last_activity_ms: Arc<AtomicI64>,
) {
    while let Some(invocation) = rx.recv().await {
        let Some(runtime) = ft.runtime.upgrade() else {
            return;
        };
        runtime.note_invocation_start();

        let (reply, acker) = match invocation.completion {
            Completion::Signal(acker) => (None, Some(acker)),
            Completion::Request(tx) => (Some(Reply::new(tx)), None),
        };
        let object_context = Arc::new(ObjectContextCell::new(&ft.name, &id));
        let ctx = ContextProcessor::new(
            runtime.clone(),
            Address {
                domain: runtime.domain().name().to_string(),
                typename: ft.name.clone(),
                id: id.clone(),
            },
            invocation.caller,
            invocation.payload,
            invocation.options,
            reply,
            object_context.clone(),
        );

        let outcome = std::panic::AssertUnwindSafe((ft.handler)(ctx))
            .catch_unwind()
            .await;

        if let Err(err) = object_context.flush(&runtime.cache()).await {
            warn!(typename = %ft.name, id = %id, %err, "object context flush failed");
        }

        match outcome {
            Ok(Ok(())) => {
                if let Some(acker) = acker {
                    acker.ack();
                }
            }
            Ok(Err(err)) => {
                error!(typename = %ft.name, id = %id, %err, "handler failed");
                if let Some(acker) = acker {
                    acker.nak();
                }
            }
            Err(_panic) => {
                error!(typename = %ft.name, id = %id, "handler panicked");
                if let Some(acker) = acker {
                    acker.nak();
                }
            }
        }

        runtime.note_invocation_end();
        queued.fetch_sub(1, Ordering::SeqCst);
        last_activity_ms.store(now_ms(), Ordering::SeqCst);
    }
}

fn caller_address(domain: &Domain, envelope: &Envelope) -> Address {
    if envelope.caller_id.is_empty() && envelope.caller_typename.is_empty() {
        return Address::default();
    }
    Address {
        domain: domain.get_domain_from_object_id(&envelope.caller_id),
        typename: envelope.caller_typename.clone(),
        id: domain.get_object_id_without_domain(&envelope.caller_id),
    }
}

fn policy_failure(typename: &str) -> bytes::Bytes {
    bytes_of(&json!({
        "status": "failed",
        "result": format!("core requests are not allowed for function type '{typename}'"),
    }))
}

fn bytes_of(value: &Value) -> bytes::Bytes {
    bytes::Bytes::from(serde_json::to_vec(value).unwrap_or_default())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = FunctionTypeConfig::new();
        assert!(!config.service_active);
        assert!(!config.multiple_instances_allowed);
        assert_eq!(config.allowed_request_providers, vec![RequestProvider::Auto]);
        assert_eq!(config.allowed_signal_providers, vec![SignalProvider::Stream]);
        assert_eq!(config.max_id_handlers, 20);
        assert!(config.id_lifetime.is_none());
        assert!(config.balance_needed);
    }

    #[test]
    fn config_chaining() {
        let config = FunctionTypeConfig::new()
            .with_service_active(true)
            .with_multiple_instances_allowed(true)
            .with_allowed_request_providers(vec![RequestProvider::Core])
            .with_allowed_signal_providers(Vec::new())
            .with_max_id_handlers(-1)
            .with_id_lifetime(Duration::from_millis(100))
            .with_balance_needed(false);
        assert!(config.service_active);
        assert!(config.multiple_instances_allowed);
        assert_eq!(config.max_id_handlers, -1);
        assert_eq!(config.id_lifetime, Some(Duration::from_millis(100)));
        assert!(!config.balance_needed);
    }

    #[test]
    fn auto_provider_implies_both_paths() {
        let config = FunctionTypeConfig::new();
        let ft = FunctionType {
            name: "t".into(),
            subject: String::new(),
            stream_name: String::new(),
            config,
            handler: handler(|_ctx| async { Ok(()) }),
            runtime: Weak::new(),
            id_handlers: Mutex::new(HashMap::new()),
        };
        assert!(ft.allows_request_provider(RequestProvider::Local));
        assert!(ft.allows_request_provider(RequestProvider::Core));

        let ft_core_only = FunctionType {
            config: FunctionTypeConfig::new()
                .with_allowed_request_providers(vec![RequestProvider::Core]),
            ..ft
        };
        assert!(ft_core_only.allows_request_provider(RequestProvider::Core));
        assert!(!ft_core_only.allows_request_provider(RequestProvider::Local));
    }

    #[test]
    fn stream_naming() {
        let ft = FunctionType::new(
            Weak::new(),
            "hub",
            "functions.graph.api.vertex.create",
            handler(|_ctx| async { Ok(()) }),
            FunctionTypeConfig::new(),
        );
        assert_eq!(ft.stream_name(), "hub_functions_graph_api_vertex_create");
        assert_eq!(
            ft.stream_config().subjects,
            vec!["$SI.hub.signal.*.functions.graph.api.vertex.create.*"]
        );
    }
}
