// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Foliage Substrate - Messaging & Key/Value Adapter
//!
//! This crate defines the capabilities the stateful-function runtime
//! requires of its messaging substrate, and ships an in-process
//! implementation for embedding and tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   foliage-statefun                       │
//! │        (domains, function types, cache, mutex)           │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼  Substrate / KeyValueStore traits
//! ┌──────────────────────────────────────────────────────────┐
//! │                  foliage-substrate                       │
//! │   durable streams · queue consumers · core requests      │
//! │   KV bucket with revisions, CAS and watches              │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//!              EmbeddedCluster (in-process)
//! ```
//!
//! The durable plane gives at-least-once delivery: an unacknowledged
//! delivery is redelivered after the consumer's `ack_wait`, and
//! `max_ack_pending` bounds the in-flight window. The core plane is
//! non-durable request/reply with caller-side timeouts.
//!
//! # Modules
//!
//! - [`subject`]: dotted subject grammar, `*`/`>` matching, overlap tests
//! - [`substrate`]: the capability traits and wire types
//! - [`embedded`]: the in-process multi-domain cluster
//! - [`error`]: error type with retryable classification

#![deny(missing_docs)]

/// Error type for substrate operations.
pub mod error;

/// In-process multi-domain cluster implementation.
pub mod embedded;

/// Subject token grammar and matching.
pub mod subject;

/// Capability traits and wire types.
pub mod substrate;

pub use embedded::{EmbeddedCluster, EmbeddedSubstrate};
pub use error::{Result, SubstrateError};
pub use substrate::{
    AckOp, Acker, ConsumerConfig, Delivery, KeyValueStore, KvEntry, KvEvent, KvWatch, PubAck,
    RequestDelivery, StreamConfig, StreamSource, Substrate,
};
