// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire envelope carried by signals and requests.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// The payload put on the wire for both signals and core requests.
///
/// `caller_id` is domain-qualified (`<domain>#<id>`) so the callee can
/// derive the caller's domain. Replies are raw JSON, not enveloped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Typename of the calling function, empty for external publishers.
    #[serde(default)]
    pub caller_typename: String,
    /// Domain-qualified id of the calling function instance.
    #[serde(default)]
    pub caller_id: String,
    /// Application payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Invocation options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl Envelope {
    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_with_absent_fields() {
        let envelope = Envelope {
            caller_typename: "t".into(),
            caller_id: "hub#id1".into(),
            payload: Some(json!({"v": 1})),
            options: None,
        };
        let bytes = envelope.to_bytes().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(!text.contains("options"));

        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.caller_typename, "t");
        assert_eq!(parsed.caller_id, "hub#id1");
        assert_eq!(parsed.payload, Some(json!({"v": 1})));
        assert!(parsed.options.is_none());
    }

    #[test]
    fn tolerates_missing_caller() {
        let parsed = Envelope::from_bytes(br#"{"payload":{}}"#).unwrap();
        assert!(parsed.caller_typename.is_empty());
        assert!(parsed.caller_id.is_empty());
    }
}
