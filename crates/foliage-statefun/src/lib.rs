// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Foliage Statefun - Stateful-Function Runtime
//!
//! Applications register named *function types*; instances are addressed by
//! `(domain, typename, id)` and invoked either by durable at-least-once
//! **signals** or by synchronous timeout-bounded **requests**. Per-id state
//! lives in the shared key/value bucket, and instances call one another
//! with the same two primitives, forming a cluster-wide compute fabric
//! partitioned by domain.
//!
//! # Execution model
//!
//! ```text
//!  signal.<domain>.<typename>.<id>          request.<domain>.<typename>.<id>
//!        │ (hub stream, sourced                     │ (core plane)
//!        ▼  into domain ingress)                    ▼
//!  ┌───────────────┐   $SI.<domain>.…      ┌──────────────────┐
//!  │ ingress router│ ────────────────────▶ │  function type   │
//!  └───────────────┘                       │  per-id mailboxes│──▶ handler
//!  ┌───────────────┐   $SE.<domain>.…      └──────────────────┘
//!  │ egress router │ ◀──── ctx.signal(…)      │ ctx.request(…) local
//!  └───────────────┘                          ▼ short-circuit
//!        │ signal.<target>.…              target id mailbox
//!        ▼ (back to the hub stream)
//! ```
//!
//! Guarantees: strict FIFO per id, concurrency across ids (capped by
//! `max_id_handlers`), at-least-once delivery (the stream delivery is acked
//! only after the handler returns cleanly), and idle id handlers reclaimed
//! after `id_lifetime`.
//!
//! # Modules
//!
//! - [`cache`]: process-local read-through mirror of the bucket
//! - [`config`]: runtime configuration and defaults
//! - [`context`]: the handler-facing context processor
//! - [`domain`]: stream topology and the two routing consumers
//! - [`envelope`]: the wire payload of signals and requests
//! - [`error`]: runtime error type
//! - [`function_type`]: registration, dispatch, idle GC
//! - [`json`]: dotted-path helpers over `serde_json::Value`
//! - [`kv_mutex`]: renewable single-writer lock over a bucket key
//! - [`runtime`]: wiring and startup

pub mod cache;
pub mod config;
pub mod context;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod function_type;
pub mod json;
pub mod kv_mutex;
pub mod runtime;

pub use cache::CacheStore;
pub use config::RuntimeConfig;
pub use context::{Address, ContextProcessor, Reply};
pub use domain::Domain;
pub use envelope::Envelope;
pub use error::{Result, StatefunError};
pub use function_type::{
    handler, FunctionTypeConfig, HandlerFn, HandlerResult, RequestProvider, SignalProvider,
};
pub use kv_mutex::{KeyMutex, MutexError};
pub use runtime::Runtime;
