// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for substrate operations.

use thiserror::Error;

/// Result type using [`SubstrateError`].
pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Errors raised by the messaging and key/value substrate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SubstrateError {
    /// A differently-named stream already claims an overlapping subject.
    #[error("stream '{name}' overlaps subjects of existing stream '{existing}'")]
    SubjectOverlap {
        /// The stream that was being created.
        name: String,
        /// The existing stream claiming an overlapping subject.
        existing: String,
    },

    /// The referenced stream does not exist.
    #[error("stream '{0}' not found")]
    StreamNotFound(String),

    /// The referenced consumer does not exist on the stream.
    #[error("consumer '{consumer}' not found on stream '{stream}'")]
    ConsumerNotFound {
        /// The stream that was looked up.
        stream: String,
        /// The missing consumer.
        consumer: String,
    },

    /// No stream captures the published subject.
    #[error("no stream captures subject '{0}'")]
    NoStream(String),

    /// A `create` hit an existing key.
    #[error("key '{0}' already exists")]
    KeyAlreadyExists(String),

    /// A `get`/`update` referenced an absent key.
    #[error("key '{0}' not found")]
    KeyNotFound(String),

    /// A compare-and-swap operation lost the revision race.
    #[error("revision mismatch for key '{0}'")]
    RevisionMismatch(String),

    /// Nobody serves the request subject.
    #[error("no responder on subject '{0}'")]
    NoResponder(String),

    /// The responder dropped the request without replying.
    #[error("request to '{0}' was dropped without a reply")]
    NoReply(String),

    /// A synchronous request exceeded its timeout.
    #[error("request to '{0}' timed out")]
    RequestTimeout(String),

    /// Connectivity or internal channel failure.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl SubstrateError {
    /// Whether the caller may reasonably retry the operation.
    ///
    /// CAS conflicts are deliberately not retryable here: the caller decides
    /// whether to re-read and retry or to give up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout(_) | Self::NoResponder(_) | Self::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SubstrateError::RequestTimeout("request.hub.t.x".into()).is_retryable());
        assert!(SubstrateError::Transport("disconnected".into()).is_retryable());
        assert!(!SubstrateError::KeyNotFound("k".into()).is_retryable());
        assert!(!SubstrateError::RevisionMismatch("k".into()).is_retryable());
        assert!(!SubstrateError::SubjectOverlap {
            name: "a".into(),
            existing: "b".into()
        }
        .is_retryable());
    }
}
