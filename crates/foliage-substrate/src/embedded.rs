// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process substrate implementation.
//!
//! [`EmbeddedCluster`] models a multi-domain cluster inside one process:
//! a global subject space for publishes and core requests, per-domain
//! streams with capture and cross-domain sourcing, durable consumers with
//! explicit acknowledgement and `ack_wait` redelivery, and per-domain
//! key/value buckets with revisions, compare-and-swap and watches.
//!
//! Several runtimes (hub plus leaves) can share one cluster through
//! [`EmbeddedCluster::connect`], which is how cross-domain routing is
//! exercised without a broker. Queue-group balancing collapses to
//! round-robin over the local subscribers of a durable consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Result, SubstrateError};
use crate::subject;
use crate::substrate::{
    AckOp, Acker, ConsumerConfig, Delivery, KeyValueStore, KvEntry, KvEvent, KvWatch, PubAck,
    RequestDelivery, StreamConfig, Substrate,
};

const KV_EVENT_CAPACITY: usize = 1024;
const REQUEST_INBOX_CAPACITY: usize = 64;

/// An in-process multi-domain cluster.
#[derive(Clone, Default)]
pub struct EmbeddedCluster {
    inner: Arc<ClusterInner>,
}

#[derive(Default)]
struct ClusterInner {
    state: Mutex<ClusterState>,
}

#[derive(Default)]
struct ClusterState {
    domains: HashMap<String, DomainState>,
    responders: Vec<ResponderEntry>,
}

#[derive(Default)]
struct DomainState {
    streams: HashMap<String, Arc<StreamShared>>,
    buckets: HashMap<String, Arc<MemoryBucket>>,
}

struct ResponderEntry {
    subject: String,
    tx: mpsc::Sender<RequestDelivery>,
}

struct StoredMessage {
    subject: String,
    payload: Bytes,
}

struct StreamShared {
    domain: String,
    config: StreamConfig,
    messages: Mutex<Vec<StoredMessage>>,
    last_seq: watch::Sender<u64>,
    consumers: Mutex<HashMap<String, Arc<ConsumerShared>>>,
}

impl StreamShared {
    fn append(&self, subject: &str, payload: Bytes) {
        let seq = {
            let mut messages = self.messages.lock().expect("stream messages lock");
            messages.push(StoredMessage {
                subject: subject.to_string(),
                payload,
            });
            messages.len() as u64
        };
        let _ = self.last_seq.send(seq);
    }

    fn message_at(&self, seq: u64) -> Option<(String, Bytes)> {
        let messages = self.messages.lock().expect("stream messages lock");
        messages
            .get((seq - 1) as usize)
            .map(|m| (m.subject.clone(), m.payload.clone()))
    }

    fn next_matching(&self, filter: &str, cursor: &mut u64) -> Option<u64> {
        let messages = self.messages.lock().expect("stream messages lock");
        while (*cursor as usize) < messages.len() {
            *cursor += 1;
            if subject::matches(filter, &messages[(*cursor - 1) as usize].subject) {
                return Some(*cursor);
            }
        }
        None
    }
}

struct ConsumerShared {
    config: ConsumerConfig,
    ctl_tx: mpsc::UnboundedSender<AckOp>,
    ctl_rx: Mutex<Option<mpsc::UnboundedReceiver<AckOp>>>,
    subscribers: Mutex<Vec<mpsc::Sender<Delivery>>>,
    wake: Notify,
    started: AtomicBool,
}

impl EmbeddedCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to the cluster as `domain`, creating the domain on first use.
    pub fn connect(&self, domain: &str) -> Arc<EmbeddedSubstrate> {
        let mut state = self.inner.state.lock().expect("cluster state lock");
        state.domains.entry(domain.to_string()).or_default();
        Arc::new(EmbeddedSubstrate {
            cluster: self.inner.clone(),
            domain: domain.to_string(),
        })
    }
}

/// A domain-bound connection to an [`EmbeddedCluster`].
pub struct EmbeddedSubstrate {
    cluster: Arc<ClusterInner>,
    domain: String,
}

impl EmbeddedSubstrate {
    /// Streams anywhere in the cluster that receive a message published on
    /// `subject`: direct captures first, then transitive source replicas.
    fn capture_targets(&self, subject_str: &str) -> Vec<Arc<StreamShared>> {
        let state = self.cluster.state.lock().expect("cluster state lock");

        let mut domains: Vec<&String> = state.domains.keys().collect();
        domains.sort();

        let mut targets: Vec<Arc<StreamShared>> = Vec::new();
        for domain in &domains {
            let mut names: Vec<&String> = state.domains[*domain].streams.keys().collect();
            names.sort();
            for name in names {
                let stream = &state.domains[*domain].streams[name];
                if stream
                    .config
                    .subjects
                    .iter()
                    .any(|p| subject::matches(p, subject_str))
                {
                    targets.push(stream.clone());
                }
            }
        }

        // Source replication, transitively. A sourcing stream receives the
        // message when its filter matches, regardless of its own domain.
        let mut frontier = targets.clone();
        while let Some(origin) = frontier.pop() {
            for domain in &domains {
                let mut names: Vec<&String> = state.domains[*domain].streams.keys().collect();
                names.sort();
                for name in names {
                    let stream = &state.domains[*domain].streams[name];
                    if targets.iter().any(|t| Arc::ptr_eq(t, stream)) {
                        continue;
                    }
                    let sourced = stream.config.sources.iter().any(|src| {
                        let src_domain = src.domain.as_deref().unwrap_or(&stream.domain);
                        src.stream == origin.config.name
                            && src_domain == origin.domain
                            && subject::matches(&src.filter_subject, subject_str)
                    });
                    if sourced {
                        targets.push(stream.clone());
                        frontier.push(stream.clone());
                    }
                }
            }
        }
        targets
    }
}

#[async_trait]
impl Substrate for EmbeddedSubstrate {
    fn domain_name(&self) -> &str {
        &self.domain
    }

    async fn ensure_stream(&self, config: StreamConfig) -> Result<()> {
        let mut state = self.cluster.state.lock().expect("cluster state lock");
        let domain = state
            .domains
            .get_mut(&self.domain)
            .expect("connected domain exists");

        if domain.streams.contains_key(&config.name) {
            return Ok(());
        }
        for (existing_name, existing) in &domain.streams {
            for have in &existing.config.subjects {
                for want in &config.subjects {
                    if subject::overlaps(have, want) {
                        return Err(SubstrateError::SubjectOverlap {
                            name: config.name.clone(),
                            existing: existing_name.clone(),
                        });
                    }
                }
            }
        }

        debug!(domain = %self.domain, stream = %config.name, "creating stream");
        let (last_seq, _) = watch::channel(0);
        domain.streams.insert(
            config.name.clone(),
            Arc::new(StreamShared {
                domain: self.domain.clone(),
                config,
                messages: Mutex::new(Vec::new()),
                last_seq,
                consumers: Mutex::new(HashMap::new()),
            }),
        );
        Ok(())
    }

    async fn ensure_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<()> {
        let shared = {
            let state = self.cluster.state.lock().expect("cluster state lock");
            state
                .domains
                .get(&self.domain)
                .and_then(|d| d.streams.get(stream))
                .cloned()
                .ok_or_else(|| SubstrateError::StreamNotFound(stream.to_string()))?
        };

        let mut consumers = shared.consumers.lock().expect("stream consumers lock");
        if consumers.contains_key(&config.name) {
            return Ok(());
        }
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        consumers.insert(
            config.name.clone(),
            Arc::new(ConsumerShared {
                config,
                ctl_tx,
                ctl_rx: Mutex::new(Some(ctl_rx)),
                subscribers: Mutex::new(Vec::new()),
                wake: Notify::new(),
                started: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    async fn consume(
        &self,
        stream: &str,
        consumer: &str,
        _queue_group: &str,
    ) -> Result<mpsc::Receiver<Delivery>> {
        let shared = {
            let state = self.cluster.state.lock().expect("cluster state lock");
            state
                .domains
                .get(&self.domain)
                .and_then(|d| d.streams.get(stream))
                .cloned()
                .ok_or_else(|| SubstrateError::StreamNotFound(stream.to_string()))?
        };
        let consumer_shared = {
            let consumers = shared.consumers.lock().expect("stream consumers lock");
            consumers
                .get(consumer)
                .cloned()
                .ok_or_else(|| SubstrateError::ConsumerNotFound {
                    stream: stream.to_string(),
                    consumer: consumer.to_string(),
                })?
        };

        let capacity = consumer_shared.config.max_ack_pending.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        consumer_shared
            .subscribers
            .lock()
            .expect("consumer subscribers lock")
            .push(tx);
        consumer_shared.wake.notify_one();

        if !consumer_shared.started.swap(true, Ordering::SeqCst) {
            let ctl_rx = consumer_shared
                .ctl_rx
                .lock()
                .expect("consumer control lock")
                .take()
                .expect("consumer control receiver present before start");
            tokio::spawn(run_consumer(shared, consumer_shared, ctl_rx));
        }
        Ok(rx)
    }

    async fn publish(&self, subject_str: &str, payload: Bytes) -> Result<PubAck> {
        let targets = self.capture_targets(subject_str);
        let Some(first) = targets.first() else {
            return Err(SubstrateError::NoStream(subject_str.to_string()));
        };
        let ack = PubAck {
            stream: first.config.name.clone(),
            domain: first.domain.clone(),
        };
        for stream in &targets {
            stream.append(subject_str, payload.clone());
        }
        trace!(subject = subject_str, stream = %ack.stream, domain = %ack.domain, "published");
        Ok(ack)
    }

    async fn request(&self, subject_str: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        let responder = {
            let mut state = self.cluster.state.lock().expect("cluster state lock");
            state.responders.retain(|r| !r.tx.is_closed());
            state
                .responders
                .iter()
                .find(|r| subject::matches(&r.subject, subject_str))
                .map(|r| r.tx.clone())
        };
        let Some(responder) = responder else {
            return Err(SubstrateError::NoResponder(subject_str.to_string()));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        responder
            .send(RequestDelivery {
                subject: subject_str.to_string(),
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SubstrateError::NoResponder(subject_str.to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(SubstrateError::NoReply(subject_str.to_string())),
            Err(_) => Err(SubstrateError::RequestTimeout(subject_str.to_string())),
        }
    }

    async fn serve(&self, subject_pattern: &str) -> Result<mpsc::Receiver<RequestDelivery>> {
        let (tx, rx) = mpsc::channel(REQUEST_INBOX_CAPACITY);
        let mut state = self.cluster.state.lock().expect("cluster state lock");
        state.responders.push(ResponderEntry {
            subject: subject_pattern.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn key_value(&self, bucket: &str) -> Result<Arc<dyn KeyValueStore>> {
        let physical = format!("KV_{bucket}");
        let mut state = self.cluster.state.lock().expect("cluster state lock");
        let domain = state
            .domains
            .get_mut(&self.domain)
            .expect("connected domain exists");
        let bucket = domain
            .buckets
            .entry(physical)
            .or_insert_with(|| Arc::new(MemoryBucket::new()))
            .clone();
        Ok(bucket)
    }
}

/// Delivery loop for one durable consumer.
///
/// Tracks a scan cursor over the stream, an in-flight set with redelivery
/// deadlines, and a redelivery queue fed by naks and `ack_wait` expiry.
/// New ids are delivered round-robin over the registered subscribers.
async fn run_consumer(
    stream: Arc<StreamShared>,
    consumer: Arc<ConsumerShared>,
    mut ctl_rx: mpsc::UnboundedReceiver<AckOp>,
) {
    let ack_wait = consumer.config.ack_wait;
    let max_ack_pending = consumer.config.max_ack_pending.max(1);
    let filter = consumer.config.filter_subject.clone();

    let mut cursor: u64 = 0;
    let mut redeliver: VecDeque<u64> = VecDeque::new();
    let mut in_flight: HashMap<u64, Instant> = HashMap::new();
    let mut round_robin: usize = 0;
    let mut seq_rx = stream.last_seq.subscribe();

    loop {
        while in_flight.len() < max_ack_pending {
            let seq = match redeliver.pop_front() {
                Some(seq) => seq,
                None => match stream.next_matching(&filter, &mut cursor) {
                    Some(seq) => seq,
                    None => break,
                },
            };
            let Some((msg_subject, payload)) = stream.message_at(seq) else {
                continue;
            };
            let delivery = Delivery {
                subject: msg_subject,
                payload,
                acker: Acker::new(consumer.ctl_tx.clone(), seq),
            };
            let mut delivered = false;
            {
                let mut subscribers = consumer.subscribers.lock().expect("subscribers lock");
                subscribers.retain(|s| !s.is_closed());
                if !subscribers.is_empty() {
                    let idx = round_robin % subscribers.len();
                    round_robin = round_robin.wrapping_add(1);
                    delivered = subscribers[idx].try_send(delivery).is_ok();
                }
            }
            if delivered {
                in_flight.insert(seq, Instant::now() + ack_wait);
            } else {
                redeliver.push_front(seq);
                break;
            }
        }

        let deadline = in_flight.values().min().copied();
        tokio::select! {
            op = ctl_rx.recv() => match op {
                Some(AckOp::Ack(seq)) => {
                    in_flight.remove(&seq);
                }
                Some(AckOp::Nak(seq)) => {
                    if in_flight.remove(&seq).is_some() {
                        redeliver.push_back(seq);
                    }
                }
                None => return,
            },
            _ = seq_rx.changed() => {},
            _ = consumer.wake.notified() => {},
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                let now = Instant::now();
                let expired: Vec<u64> = in_flight
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in expired {
                    in_flight.remove(&seq);
                    redeliver.push_back(seq);
                    warn!(
                        stream = %stream.config.name,
                        consumer = %consumer.config.name,
                        seq,
                        "ack wait expired, redelivering"
                    );
                }
            }
        }
    }
}

/// In-memory key/value bucket with per-bucket revision numbering.
struct MemoryBucket {
    entries: Mutex<HashMap<String, KvEntry>>,
    revision: AtomicU64,
    events: broadcast::Sender<KvEvent>,
}

impl MemoryBucket {
    fn new() -> Self {
        let (events, _) = broadcast::channel(KV_EVENT_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            revision: AtomicU64::new(0),
            events,
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, key: &str, value: Option<Bytes>, revision: u64) {
        let _ = self.events.send(KvEvent {
            key: key.to_string(),
            value,
            revision,
        });
    }
}

#[async_trait]
impl KeyValueStore for MemoryBucket {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let entries = self.entries.lock().expect("bucket entries lock");
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        let mut entries = self.entries.lock().expect("bucket entries lock");
        let revision = self.next_revision();
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.clone(),
                revision,
            },
        );
        self.emit(key, Some(value), revision);
        Ok(revision)
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64> {
        let mut entries = self.entries.lock().expect("bucket entries lock");
        if entries.contains_key(key) {
            return Err(SubstrateError::KeyAlreadyExists(key.to_string()));
        }
        let revision = self.next_revision();
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.clone(),
                revision,
            },
        );
        self.emit(key, Some(value), revision);
        Ok(revision)
    }

    async fn update(&self, key: &str, value: Bytes, expected_revision: u64) -> Result<u64> {
        let mut entries = self.entries.lock().expect("bucket entries lock");
        let entry = entries
            .get(key)
            .ok_or_else(|| SubstrateError::KeyNotFound(key.to_string()))?;
        if entry.revision != expected_revision {
            return Err(SubstrateError::RevisionMismatch(key.to_string()));
        }
        let revision = self.next_revision();
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.clone(),
                revision,
            },
        );
        self.emit(key, Some(value), revision);
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("bucket entries lock");
        if entries.remove(key).is_some() {
            let revision = self.next_revision();
            self.emit(key, None, revision);
        }
        Ok(())
    }

    async fn delete_revision(&self, key: &str, expected_revision: u64) -> Result<()> {
        let mut entries = self.entries.lock().expect("bucket entries lock");
        let entry = entries
            .get(key)
            .ok_or_else(|| SubstrateError::KeyNotFound(key.to_string()))?;
        if entry.revision != expected_revision {
            return Err(SubstrateError::RevisionMismatch(key.to_string()));
        }
        entries.remove(key);
        let revision = self.next_revision();
        self.emit(key, None, revision);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().expect("bucket entries lock");
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| pattern.is_empty() || subject::matches(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn watch(&self) -> Result<KvWatch> {
        let entries = self.entries.lock().expect("bucket entries lock");
        let events = self.events.subscribe();
        let snapshot = entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(KvWatch {
            entries: snapshot,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::StreamSource;

    fn stream(name: &str, subjects: &[&str]) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            sources: Vec::new(),
        }
    }

    fn consumer(name: &str, filter: &str) -> ConsumerConfig {
        ConsumerConfig {
            name: name.to_string(),
            filter_subject: filter.to_string(),
            ack_wait: Duration::from_millis(100),
            max_ack_pending: 8,
        }
    }

    #[tokio::test]
    async fn publish_capture_consume_ack() {
        let cluster = EmbeddedCluster::new();
        let hub = cluster.connect("hub");
        hub.ensure_stream(stream("events", &["evt.>"])).await.unwrap();
        hub.ensure_consumer("events", consumer("c", "evt.>"))
            .await
            .unwrap();
        let mut rx = hub.consume("events", "c", "c-group").await.unwrap();

        let ack = hub
            .publish("evt.one", Bytes::from_static(b"1"))
            .await
            .unwrap();
        assert_eq!(ack.stream, "events");
        assert_eq!(ack.domain, "hub");

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.subject, "evt.one");
        assert_eq!(&delivery.payload[..], b"1");
        delivery.acker.ack();

        hub.publish("evt.two", Bytes::from_static(b"2"))
            .await
            .unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.subject, "evt.two");
        delivery.acker.ack();
    }

    #[tokio::test]
    async fn publish_without_capturing_stream_fails() {
        let cluster = EmbeddedCluster::new();
        let hub = cluster.connect("hub");
        let err = hub
            .publish("nowhere.x", Bytes::new())
            .await
            .expect_err("no stream captures");
        assert!(matches!(err, SubstrateError::NoStream(_)));
    }

    #[tokio::test]
    async fn nak_triggers_redelivery() {
        let cluster = EmbeddedCluster::new();
        let hub = cluster.connect("hub");
        hub.ensure_stream(stream("events", &["evt.>"])).await.unwrap();
        hub.ensure_consumer("events", consumer("c", "evt.>"))
            .await
            .unwrap();
        let mut rx = hub.consume("events", "c", "c-group").await.unwrap();

        hub.publish("evt.a", Bytes::from_static(b"x")).await.unwrap();
        let first = rx.recv().await.unwrap();
        first.acker.nak();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.subject, "evt.a");
        second.acker.ack();
    }

    #[tokio::test]
    async fn unacked_delivery_redelivers_after_ack_wait() {
        let cluster = EmbeddedCluster::new();
        let hub = cluster.connect("hub");
        hub.ensure_stream(stream("events", &["evt.>"])).await.unwrap();
        hub.ensure_consumer("events", consumer("c", "evt.>"))
            .await
            .unwrap();
        let mut rx = hub.consume("events", "c", "c-group").await.unwrap();

        hub.publish("evt.a", Bytes::from_static(b"x")).await.unwrap();
        let first = rx.recv().await.unwrap();
        drop(first); // never settled
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("redelivery within ack_wait")
            .unwrap();
        assert_eq!(second.subject, "evt.a");
        second.acker.ack();
    }

    #[tokio::test]
    async fn max_ack_pending_caps_in_flight() {
        let cluster = EmbeddedCluster::new();
        let hub = cluster.connect("hub");
        hub.ensure_stream(stream("events", &["evt.>"])).await.unwrap();
        hub.ensure_consumer(
            "events",
            ConsumerConfig {
                name: "c".into(),
                filter_subject: "evt.>".into(),
                ack_wait: Duration::from_secs(10),
                max_ack_pending: 1,
            },
        )
        .await
        .unwrap();
        let mut rx = hub.consume("events", "c", "c-group").await.unwrap();

        hub.publish("evt.a", Bytes::new()).await.unwrap();
        hub.publish("evt.b", Bytes::new()).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.subject, "evt.a");
        // Second delivery must wait for the first acknowledgement.
        let pending = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(pending.is_err());
        first.acker.ack();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.subject, "evt.b");
        second.acker.ack();
    }

    #[tokio::test]
    async fn stream_sourcing_replicates_across_domains() {
        let cluster = EmbeddedCluster::new();
        let hub = cluster.connect("hub");
        let leaf = cluster.connect("leaf");

        hub.ensure_stream(stream("hub_events", &["signal.>"]))
            .await
            .unwrap();
        leaf.ensure_stream(StreamConfig {
            name: "domain_ingress".into(),
            subjects: Vec::new(),
            sources: vec![StreamSource {
                stream: "hub_events".into(),
                filter_subject: "signal.leaf.>".into(),
                domain: Some("hub".into()),
            }],
        })
        .await
        .unwrap();
        leaf.ensure_consumer("domain_ingress", consumer("r", "signal.leaf.>"))
            .await
            .unwrap();
        let mut rx = leaf.consume("domain_ingress", "r", "r-group").await.unwrap();

        // Not for the leaf: captured by the hub stream only.
        hub.publish("signal.other.t.x", Bytes::new()).await.unwrap();
        // For the leaf: captured and sourced into its ingress stream.
        hub.publish("signal.leaf.t.id7", Bytes::from_static(b"p"))
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.subject, "signal.leaf.t.id7");
        delivery.acker.ack();
    }

    #[tokio::test]
    async fn overlapping_subjects_rejected_within_domain() {
        let cluster = EmbeddedCluster::new();
        let hub = cluster.connect("hub");
        hub.ensure_stream(stream("a", &["evt.>"])).await.unwrap();
        // Same name is idempotent.
        hub.ensure_stream(stream("a", &["evt.>"])).await.unwrap();
        let err = hub
            .ensure_stream(stream("b", &["evt.special"]))
            .await
            .expect_err("overlap must be rejected");
        assert!(matches!(err, SubstrateError::SubjectOverlap { .. }));
    }

    #[tokio::test]
    async fn request_reply_roundtrip_and_timeout() {
        let cluster = EmbeddedCluster::new();
        let hub = cluster.connect("hub");
        let mut serving = hub.serve("request.hub.echo.*").await.unwrap();

        tokio::spawn(async move {
            while let Some(req) = serving.recv().await {
                let _ = req.reply.send(req.payload);
            }
        });

        let reply = hub
            .request(
                "request.hub.echo.e1",
                Bytes::from_static(b"{\"n\":42}"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(&reply[..], b"{\"n\":42}");

        let err = hub
            .request("request.hub.absent.x", Bytes::new(), Duration::from_millis(50))
            .await
            .expect_err("no responder");
        assert!(matches!(err, SubstrateError::NoResponder(_)));
    }

    #[tokio::test]
    async fn kv_cas_and_watch() {
        let cluster = EmbeddedCluster::new();
        let hub = cluster.connect("hub");
        let kv = hub.key_value("test_bucket").await.unwrap();

        let rev1 = kv.create("k", Bytes::from_static(b"v1")).await.unwrap();
        let err = kv.create("k", Bytes::from_static(b"v2")).await;
        assert!(matches!(err, Err(SubstrateError::KeyAlreadyExists(_))));

        let watch = kv.watch().await.unwrap();
        assert_eq!(watch.entries.len(), 1);
        let mut events = watch.events;

        let rev2 = kv.update("k", Bytes::from_static(b"v2"), rev1).await.unwrap();
        assert!(rev2 > rev1);
        let stale = kv.update("k", Bytes::from_static(b"v3"), rev1).await;
        assert!(matches!(stale, Err(SubstrateError::RevisionMismatch(_))));

        let event = events.recv().await.unwrap();
        assert_eq!(event.key, "k");
        assert_eq!(event.value.as_deref(), Some(&b"v2"[..]));

        kv.delete_revision("k", rev2).await.unwrap();
        assert!(kv.get("k").await.unwrap().is_none());
        let event = events.recv().await.unwrap();
        assert!(event.value.is_none());
    }

    #[tokio::test]
    async fn kv_pattern_keys() {
        let cluster = EmbeddedCluster::new();
        let hub = cluster.connect("hub");
        let kv = hub.key_value("test_bucket").await.unwrap();

        kv.put("a.out.to.x", Bytes::new()).await.unwrap();
        kv.put("a.out.body.x.b", Bytes::new()).await.unwrap();
        kv.put("b.out.to.y", Bytes::new()).await.unwrap();

        let keys = kv.keys("a.out.>").await.unwrap();
        assert_eq!(keys, vec!["a.out.body.x.b", "a.out.to.x"]);
        let all = kv.keys(">").await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
