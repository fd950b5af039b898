// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation stack: the ordered list of low-level mutations performed by a
//! compound operation.
//!
//! Low-level handlers return the op-stack as a pure value inside their
//! reply when asked to (`return_op_stack` option); trigger dispatch is a
//! post-pass over it. This keeps the low-level operations side-effect-local
//! to the key/value bucket.

use foliage_statefun::ContextProcessor;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::keys;

/// One low-level mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpEntry {
    /// Typename of the low-level operation that performed the mutation.
    pub op: String,
    /// Vertex id, for vertex operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Source vertex id, for link operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<String>,
    /// Target vertex id, for link operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,
    /// Link type, for link operations.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    /// Body before the mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_body: Option<Value>,
    /// Body after the mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_body: Option<Value>,
}

/// Ordered mutations of one compound operation.
pub type OpStack = Vec<OpEntry>;

impl OpEntry {
    fn vertex(op: &str, id: &str) -> Self {
        Self {
            op: op.to_string(),
            id: Some(id.to_string()),
            from_id: None,
            to_id: None,
            link_type: None,
            old_body: None,
            new_body: None,
        }
    }

    fn link(op: &str, from: &str, to: &str, link_type: &str) -> Self {
        Self {
            op: op.to_string(),
            id: None,
            from_id: Some(from.to_string()),
            to_id: Some(to.to_string()),
            link_type: Some(link_type.to_string()),
            old_body: None,
            new_body: None,
        }
    }

    /// Entry for a vertex creation.
    pub fn vertex_create(id: &str, new_body: Value) -> Self {
        Self {
            new_body: Some(new_body),
            ..Self::vertex(keys::LL_VERTEX_CREATE, id)
        }
    }

    /// Entry for a vertex body change.
    pub fn vertex_update(id: &str, old_body: Value, new_body: Value) -> Self {
        Self {
            old_body: Some(old_body),
            new_body: Some(new_body),
            ..Self::vertex(keys::LL_VERTEX_UPDATE, id)
        }
    }

    /// Entry for a vertex removal.
    pub fn vertex_delete(id: &str, old_body: Value) -> Self {
        Self {
            old_body: Some(old_body),
            ..Self::vertex(keys::LL_VERTEX_DELETE, id)
        }
    }

    /// Entry for a link creation.
    pub fn link_create(from: &str, to: &str, link_type: &str, new_body: Value) -> Self {
        Self {
            new_body: Some(new_body),
            ..Self::link(keys::LL_LINK_CREATE, from, to, link_type)
        }
    }

    /// Entry for a link mutation.
    pub fn link_update(
        from: &str,
        to: &str,
        link_type: &str,
        old_body: Value,
        new_body: Value,
    ) -> Self {
        Self {
            old_body: Some(old_body),
            new_body: Some(new_body),
            ..Self::link(keys::LL_LINK_UPDATE, from, to, link_type)
        }
    }

    /// Entry for a link removal.
    pub fn link_delete(from: &str, to: &str, link_type: &str, old_body: Value) -> Self {
        Self {
            old_body: Some(old_body),
            ..Self::link(keys::LL_LINK_DELETE, from, to, link_type)
        }
    }
}

/// Whether the caller asked for the op-stack in the reply.
pub(crate) fn op_stack_requested(ctx: &ContextProcessor) -> bool {
    ctx.options
        .get("return_op_stack")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Successful low-level reply, optionally with a result and the op-stack.
pub(crate) fn ll_ok(result: Option<Value>, op_stack: Option<&OpStack>) -> Value {
    let mut reply = json!({"status": "ok"});
    if let Some(result) = result {
        reply["result"] = result;
    }
    if let Some(op_stack) = op_stack {
        reply["op_stack"] = serde_json::to_value(op_stack).unwrap_or(Value::Null);
    }
    reply
}

/// Failed low-level reply with a human message.
pub(crate) fn ll_failed(message: impl Into<String>) -> Value {
    json!({"status": "failed", "result": message.into()})
}
