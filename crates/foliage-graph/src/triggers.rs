// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger propagation derived from operation stacks.
//!
//! After a high-level operation collects an op-stack, this post-pass scans
//! it and fans out fire-and-forget signals to the function names registered
//! under the object type's `triggers` (for vertex ops) or the types-link
//! body's `triggers` (for object-link ops). Trigger failures never
//! propagate back to the initiating operation.

use foliage_statefun::{json, ContextProcessor, SignalProvider};
use serde_json::Value;
use tracing::warn;

use crate::cmdb::{
    get_object_type_triggers, get_objects_link_type_triggers, is_vertex_an_object,
    reference_link_type,
};
use crate::keys;
use crate::ops::OpEntry;

const TRIGGER_KINDS: [&str; 3] = ["create", "update", "delete"];

/// Scan an op-stack value and fire the registered triggers.
pub(crate) async fn execute_triggers_from_op_stack(ctx: &ContextProcessor, op_stack: &Value) {
    let Ok(entries) = serde_json::from_value::<Vec<OpEntry>>(op_stack.clone()) else {
        warn!("malformed op stack, skipping trigger dispatch");
        return;
    };
    for entry in &entries {
        for kind in 0..TRIGGER_KINDS.len() {
            if entry.op == keys::LL_VERTEX_CUD[kind] {
                if let Some(id) = entry.id.as_deref().filter(|id| !id.is_empty()) {
                    if is_vertex_an_object(ctx, id).await {
                        execute_object_triggers(
                            ctx,
                            id,
                            entry.old_body.as_ref(),
                            entry.new_body.as_ref(),
                            kind,
                        )
                        .await;
                    }
                }
            }
            if entry.op == keys::LL_LINK_CUD[kind] {
                let (Some(from), Some(to), Some(link_type)) = (
                    entry.from_id.as_deref(),
                    entry.to_id.as_deref(),
                    entry.link_type.as_deref().filter(|t| !t.is_empty()),
                ) else {
                    continue;
                };
                if is_vertex_an_object(ctx, from).await && is_vertex_an_object(ctx, to).await {
                    execute_link_triggers(
                        ctx,
                        from,
                        to,
                        link_type,
                        entry.old_body.as_ref(),
                        entry.new_body.as_ref(),
                        kind,
                    )
                    .await;
                }
            }
        }
    }
}

/// Object triggers fire for update and delete kinds only.
async fn execute_object_triggers(
    ctx: &ContextProcessor,
    object_id: &str,
    old_body: Option<&Value>,
    new_body: Option<&Value>,
    kind: usize,
) {
    let triggers = get_object_type_triggers(ctx, object_id).await;
    let is_non_empty = triggers.as_object().is_some_and(|o| !o.is_empty());
    if !is_non_empty || kind == 0 {
        return;
    }
    let functions = function_names(&triggers, TRIGGER_KINDS[kind]);
    if functions.is_empty() {
        return;
    }

    let mut trigger_data = Value::Object(Default::default());
    if let Some(old_body) = old_body {
        trigger_data["old_body"] = old_body.clone();
    }
    if let Some(new_body) = new_body {
        trigger_data["new_body"] = new_body.clone();
    }
    let mut payload = Value::Object(Default::default());
    json::set_by_path(
        &mut payload,
        &format!("trigger.object.{}", TRIGGER_KINDS[kind]),
        trigger_data,
    );

    for function in functions {
        if let Err(err) = ctx
            .signal(
                SignalProvider::Stream,
                &function,
                object_id,
                payload.clone(),
                Value::Null,
            )
            .await
        {
            warn!(function = %function, object_id, %err, "object trigger signal failed");
        }
    }
}

async fn execute_link_triggers(
    ctx: &ContextProcessor,
    from_object_id: &str,
    to_object_id: &str,
    link_type: &str,
    old_body: Option<&Value>,
    new_body: Option<&Value>,
    kind: usize,
) {
    let triggers = get_objects_link_type_triggers(ctx, from_object_id, to_object_id).await;
    let is_non_empty = triggers.as_object().is_some_and(|o| !o.is_empty());
    if !is_non_empty {
        return;
    }
    let functions = function_names(&triggers, TRIGGER_KINDS[kind]);
    if functions.is_empty() {
        return;
    }

    // A trigger only fires when the link still carries the type derived
    // from the object types' reference link.
    match reference_link_type(ctx, from_object_id, to_object_id).await {
        Ok(Ok(reference)) if reference == link_type => {}
        _ => return,
    }

    let mut trigger_data = Value::Object(Default::default());
    trigger_data["to"] = Value::String(to_object_id.to_string());
    trigger_data["type"] = Value::String(link_type.to_string());
    if let Some(old_body) = old_body {
        trigger_data["old_body"] = old_body.clone();
    }
    if let Some(new_body) = new_body {
        trigger_data["new_body"] = new_body.clone();
    }
    let mut payload = Value::Object(Default::default());
    json::set_by_path(
        &mut payload,
        &format!("trigger.link.{}", TRIGGER_KINDS[kind]),
        trigger_data,
    );

    for function in functions {
        if let Err(err) = ctx
            .signal(
                SignalProvider::Stream,
                &function,
                from_object_id,
                payload.clone(),
                Value::Null,
            )
            .await
        {
            warn!(function = %function, from_object_id, %err, "link trigger signal failed");
        }
    }
}

fn function_names(triggers: &Value, kind: &str) -> Vec<String> {
    triggers
        .get(kind)
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
