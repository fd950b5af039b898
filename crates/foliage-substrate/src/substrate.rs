// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capability traits required of a JetStream-class substrate.
//!
//! The runtime is written against these traits, not a concrete broker. Two
//! planes are modelled:
//!
//! - a **durable plane**: streams capturing subjects, optionally sourcing
//!   from another stream (possibly in a foreign domain), consumed through
//!   durable queue consumers with explicit acknowledgement;
//! - a **core plane**: non-durable request/reply with a timeout.
//!
//! A key/value bucket with per-key revisions and compare-and-swap rounds out
//! the contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::Result;

/// Durable stream definition.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    /// Stream name, unique within its domain.
    pub name: String,
    /// Subject patterns this stream captures from the global subject space.
    pub subjects: Vec<String>,
    /// Streams this stream replicates messages from.
    pub sources: Vec<StreamSource>,
}

/// Replication source for a stream.
#[derive(Debug, Clone)]
pub struct StreamSource {
    /// Name of the source stream.
    pub stream: String,
    /// Only messages matching this filter are replicated.
    pub filter_subject: String,
    /// Domain the source stream lives in. `None` means the same domain as
    /// the sourcing stream (a leaf sources the hub stream externally).
    pub domain: Option<String>,
}

/// Durable queue consumer definition.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Durable consumer name.
    pub name: String,
    /// Only messages matching this filter are delivered.
    pub filter_subject: String,
    /// Redelivery window for unacknowledged deliveries.
    pub ack_wait: Duration,
    /// Maximum in-flight unacknowledged deliveries.
    pub max_ack_pending: usize,
}

/// Acknowledgement for a stream publish: which stream captured the message,
/// and in which domain.
#[derive(Debug, Clone)]
pub struct PubAck {
    /// Capturing stream name.
    pub stream: String,
    /// Domain of the capturing stream.
    pub domain: String,
}

/// Acknowledgement operation sent back to a consumer's delivery loop.
#[derive(Debug)]
pub enum AckOp {
    /// Remove the sequence from the in-flight set.
    Ack(u64),
    /// Negative acknowledgement: redeliver as soon as possible.
    Nak(u64),
}

/// Handle used to settle a single delivery.
///
/// Dropping the handle without calling either method leaves the delivery
/// in-flight; it is redelivered after the consumer's `ack_wait`.
#[derive(Debug)]
pub struct Acker {
    ctl: mpsc::UnboundedSender<AckOp>,
    seq: u64,
}

impl Acker {
    /// Build an acker bound to a consumer control channel.
    pub fn new(ctl: mpsc::UnboundedSender<AckOp>, seq: u64) -> Self {
        Self { ctl, seq }
    }

    /// Acknowledge the delivery.
    pub fn ack(self) {
        let _ = self.ctl.send(AckOp::Ack(self.seq));
    }

    /// Reject the delivery for prompt redelivery.
    pub fn nak(self) {
        let _ = self.ctl.send(AckOp::Nak(self.seq));
    }
}

/// One message handed to a durable consumer subscriber.
#[derive(Debug)]
pub struct Delivery {
    /// Subject the message was published on.
    pub subject: String,
    /// Message payload.
    pub payload: Bytes,
    /// Settlement handle.
    pub acker: Acker,
}

/// One inbound synchronous request handed to a responder.
#[derive(Debug)]
pub struct RequestDelivery {
    /// Subject the request was sent on.
    pub subject: String,
    /// Request payload.
    pub payload: Bytes,
    /// Reply sink. Dropping it without sending leaves the requester to its
    /// timeout.
    pub reply: oneshot::Sender<Bytes>,
}

/// A key/value entry with its revision.
#[derive(Debug, Clone)]
pub struct KvEntry {
    /// Stored bytes.
    pub value: Bytes,
    /// Monotonically increasing per-bucket revision.
    pub revision: u64,
}

/// A change notification from a bucket watch.
#[derive(Debug, Clone)]
pub struct KvEvent {
    /// Key that changed.
    pub key: String,
    /// New value, `None` for a delete.
    pub value: Option<Bytes>,
    /// Revision of the change.
    pub revision: u64,
}

/// Snapshot plus live feed returned by [`KeyValueStore::watch`].
pub struct KvWatch {
    /// Bucket contents at the moment the watch was installed.
    pub entries: Vec<(String, KvEntry)>,
    /// Change events strictly after the snapshot.
    pub events: broadcast::Receiver<KvEvent>,
}

/// Key/value bucket with compare-and-swap semantics.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Unconditionally write a key. Returns the new revision.
    async fn put(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Write a key that must not exist yet. Returns the new revision.
    async fn create(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Compare-and-swap write. Fails with `RevisionMismatch` when the stored
    /// revision differs from `expected_revision`.
    async fn update(&self, key: &str, value: Bytes, expected_revision: u64) -> Result<u64>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Compare-and-swap delete.
    async fn delete_revision(&self, key: &str, expected_revision: u64) -> Result<()>;

    /// Keys matching a `.`-segmented pattern (`*`, `>`). `>` alone lists
    /// the whole bucket.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Install a watch: a consistent snapshot plus subsequent change events.
    async fn watch(&self) -> Result<KvWatch>;
}

/// Connection-level substrate capabilities, bound to one domain.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Domain this connection belongs to.
    fn domain_name(&self) -> &str;

    /// Create a stream if it does not exist. Idempotent for an existing
    /// stream of the same name; fails with `SubjectOverlap` when a
    /// differently-named stream in this domain claims an overlapping
    /// subject.
    async fn ensure_stream(&self, config: StreamConfig) -> Result<()>;

    /// Create a durable consumer on a stream if it does not exist.
    async fn ensure_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<()>;

    /// Attach to a durable consumer's queue group and receive deliveries.
    async fn consume(
        &self,
        stream: &str,
        consumer: &str,
        queue_group: &str,
    ) -> Result<mpsc::Receiver<Delivery>>;

    /// Publish onto the durable plane with capture acknowledgement.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PubAck>;

    /// Synchronous request over the core plane.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes>;

    /// Serve synchronous requests on a subject pattern.
    async fn serve(&self, subject: &str) -> Result<mpsc::Receiver<RequestDelivery>>;

    /// Open (creating if needed) a key/value bucket. The physical bucket
    /// name is `KV_<bucket>`.
    async fn key_value(&self, bucket: &str) -> Result<Arc<dyn KeyValueStore>>;
}
