// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the stateful-function runtime.

use std::time::Duration;

use foliage_substrate::SubstrateError;
use thiserror::Error;

/// Result type using [`StatefunError`].
pub type Result<T> = std::result::Result<T, StatefunError>;

/// Errors surfaced by the runtime, the context processor and the routers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StatefunError {
    /// Substrate-level failure.
    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    /// A synchronous request exceeded its timeout.
    #[error("request to '{typename}:{id}' timed out after {timeout:?}")]
    RequestTimeout {
        /// Target function typename.
        typename: String,
        /// Target object id.
        id: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The target dropped the request without replying.
    #[error("request to '{typename}:{id}' was dropped without a reply")]
    NoReply {
        /// Target function typename.
        typename: String,
        /// Target object id.
        id: String,
    },

    /// The provider is not permitted by the target's configuration.
    #[error("provider '{provider}' is not allowed for function type '{typename}'")]
    ProviderNotAllowed {
        /// The rejected provider.
        provider: String,
        /// The target function typename.
        typename: String,
    },

    /// The typename is not registered in this process.
    #[error("function type '{0}' is not registered in this process")]
    UnknownFunctionType(String),

    /// The id-handler cap or an id inbox is full.
    #[error("function type '{0}' is oversubscribed")]
    Oversubscribed(String),

    /// `Reply::with` was called more than once.
    #[error("reply already sent")]
    AlreadyReplied,

    /// A signal/ingress subject did not follow the expected grammar.
    #[error("malformed subject '{0}'")]
    MalformedSubject(String),

    /// Payload encode/decode failure.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The runtime could not be brought up.
    #[error("startup failure: {0}")]
    Startup(String),
}
