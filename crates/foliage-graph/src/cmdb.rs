// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level CMDB layer over the low-level graph operations.
//!
//! Maintains the object/type meta-graph: every object vertex carries one
//! `__type` link to its type vertex, the type vertex links back with
//! `__object`, and the `objects`/`types` root vertices collect both sides.
//! The link type between two objects is never supplied by callers; it is
//! derived from the `link_type` attribute of the `__type` link between
//! their types.
//!
//! Replies follow the `{"payload": {"status", "result"}}` envelope.

use std::collections::{HashSet, VecDeque};

use foliage_statefun::{ContextProcessor, HandlerResult, RequestProvider, Result, Runtime};
use serde_json::{json, Value};
use tracing::warn;

use crate::keys;
use crate::triggers::execute_triggers_from_op_stack;

// ---------------------------------------------------------------------------
// Meta-graph queries shared with trigger dispatch.
// ---------------------------------------------------------------------------

/// Type of an object, resolved through its `__type` link.
pub(crate) async fn find_object_type(ctx: &ContextProcessor, object_id: &str) -> Option<String> {
    let pattern = format!("{object_id}.out.ltp_oid-bdy.{}.>", keys::TYPE_LINK);
    let found = ctx.global_cache().get_keys_by_pattern(&pattern);
    found
        .first()
        .map(|key| keys::key_last_token(key).to_string())
}

/// Whether a vertex participates in the object meta-graph.
pub(crate) async fn is_vertex_an_object(ctx: &ContextProcessor, id: &str) -> bool {
    find_object_type(ctx, id).await.is_some()
}

/// Objects of a type, resolved through its `__object` links.
pub(crate) async fn find_type_objects(ctx: &ContextProcessor, type_id: &str) -> Vec<String> {
    let pattern = format!("{type_id}.out.ltp_oid-bdy.{}.>", keys::OBJECT_LINK);
    ctx.global_cache()
        .get_keys_by_pattern(&pattern)
        .iter()
        .map(|key| keys::key_last_token(key).to_string())
        .collect()
}

/// Body of the `__type` link between two type vertices.
pub(crate) async fn get_types_link_body(
    ctx: &ContextProcessor,
    from_type: &str,
    to_type: &str,
) -> Result<Option<Value>> {
    ctx.global_cache()
        .get_json(&keys::out_type_index_key(from_type, keys::TYPE_LINK, to_type))
        .await
}

/// Link type between two objects, derived from their types' `__type` link.
/// The inner error is the human-readable operation failure.
pub(crate) async fn reference_link_type(
    ctx: &ContextProcessor,
    from_object_id: &str,
    to_object_id: &str,
) -> Result<std::result::Result<String, String>> {
    let Some(from_type) = find_object_type(ctx, from_object_id).await else {
        return Ok(Err(format!("object '{from_object_id}' has no type")));
    };
    let Some(to_type) = find_object_type(ctx, to_object_id).await else {
        return Ok(Err(format!("object '{to_object_id}' has no type")));
    };
    let Some(body) = get_types_link_body(ctx, &from_type, &to_type).await? else {
        return Ok(Err(format!("link {from_type}, {to_type} not found")));
    };
    match body.get("link_type").and_then(Value::as_str) {
        Some(link_type) => Ok(Ok(link_type.to_string())),
        None => Ok(Err("type of a link was not defined in link type".to_string())),
    }
}

/// `triggers` object of an object's type body, `{}` when absent.
pub(crate) async fn get_object_type_triggers(ctx: &ContextProcessor, object_id: &str) -> Value {
    let empty = Value::Object(Default::default());
    let Some(type_name) = find_object_type(ctx, object_id).await else {
        return empty;
    };
    match ctx.global_cache().get_json(&type_name).await {
        Ok(Some(type_body)) => type_body.get("triggers").cloned().unwrap_or(empty),
        _ => empty,
    }
}

/// `triggers` object of the types' `__type` link body, `{}` when absent.
pub(crate) async fn get_objects_link_type_triggers(
    ctx: &ContextProcessor,
    from_object_id: &str,
    to_object_id: &str,
) -> Value {
    let empty = Value::Object(Default::default());
    let (Some(from_type), Some(to_type)) = (
        find_object_type(ctx, from_object_id).await,
        find_object_type(ctx, to_object_id).await,
    ) else {
        return empty;
    };
    match get_types_link_body(ctx, &from_type, &to_type).await {
        Ok(Some(body)) => body.get("triggers").cloned().unwrap_or(empty),
        _ => empty,
    }
}

// ---------------------------------------------------------------------------
// Reply plumbing.
// ---------------------------------------------------------------------------

fn hl_reply(status: &str, result: Value) -> Value {
    json!({"payload": {"status": status, "result": result}})
}

fn hl_ok() -> Value {
    hl_reply("ok", json!([]))
}

fn hl_ok_with(result: Value) -> Value {
    hl_reply("ok", result)
}

fn hl_failed(message: impl Into<String>) -> Value {
    hl_reply("failed", Value::String(message.into()))
}

fn check_request(result: &Value) -> std::result::Result<(), String> {
    if result
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("failed")
        == "failed"
    {
        Err(result
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string())
    } else {
        Ok(())
    }
}

/// Low-level request through the in-process short-circuit, surfacing both
/// transport errors and `status=failed` replies as error messages.
async fn ll_checked(
    ctx: &ContextProcessor,
    typename: &str,
    id: &str,
    payload: Value,
    options: Value,
) -> std::result::Result<Value, String> {
    let result = ctx
        .request(RequestProvider::Local, typename, id, payload, options)
        .await
        .map_err(|err| err.to_string())?;
    check_request(&result)?;
    Ok(result)
}

fn op_stack_options() -> Value {
    json!({"return_op_stack": true})
}

async fn fire_triggers(ctx: &ContextProcessor, result: &Value) {
    if let Some(op_stack) = result.get("op_stack") {
        execute_triggers_from_op_stack(ctx, op_stack).await;
    }
}

async fn reply_with(mut ctx: ContextProcessor, response: Value) -> HandlerResult {
    if let Some(reply) = ctx.reply.as_mut() {
        reply.with(response)?;
    }
    Ok(())
}

fn string_field<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload.get(field).and_then(Value::as_str)
}

// ---------------------------------------------------------------------------
// Types.
// ---------------------------------------------------------------------------

async fn do_create_type(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let prefix = string_field(&ctx.payload, "prefix").unwrap_or("");

    if let Err(err) = ll_checked(
        ctx,
        keys::LL_VERTEX_CREATE,
        &self_id,
        ctx.payload.clone(),
        Value::Null,
    )
    .await
    {
        return hl_failed(err);
    }

    let link = json!({
        "descendant_uuid": self_id,
        "link_type": keys::TYPE_LINK,
        "link_body": {"tags": [format!("TYPE_{self_id}")]},
    });
    if let Err(err) = ll_checked(
        ctx,
        keys::LL_LINK_CREATE,
        &format!("{prefix}{}", keys::TYPES_ROOT),
        link,
        Value::Null,
    )
    .await
    {
        return hl_failed(err);
    }

    hl_ok()
}

async fn do_update_type(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    match ll_checked(
        ctx,
        keys::LL_VERTEX_UPDATE,
        &self_id,
        ctx.payload.clone(),
        Value::Null,
    )
    .await
    {
        Ok(_) => hl_ok(),
        Err(err) => hl_failed(err),
    }
}

// ---------------------------------------------------------------------------
// Objects.
// ---------------------------------------------------------------------------

async fn do_create_object(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let Some(origin_type) = string_field(&ctx.payload, "origin_type") else {
        return hl_failed("origin_type undefined");
    };
    let prefix = string_field(&ctx.payload, "prefix").unwrap_or("");

    let result = match ll_checked(
        ctx,
        keys::LL_VERTEX_CREATE,
        &self_id,
        ctx.payload.clone(),
        op_stack_options(),
    )
    .await
    {
        Ok(result) => result,
        Err(err) => return hl_failed(err),
    };

    let needed_links = [
        (format!("{prefix}{}", keys::OBJECTS_ROOT), self_id.clone(), keys::OBJECT_LINK),
        (self_id.clone(), format!("{prefix}{origin_type}"), keys::TYPE_LINK),
        (format!("{prefix}{origin_type}"), self_id.clone(), keys::OBJECT_LINK),
    ];
    for (from, to, link_type) in needed_links {
        let mut link = json!({
            "descendant_uuid": to,
            "link_type": link_type,
            "link_body": {},
        });
        if link_type == keys::TYPE_LINK {
            link["link_body"]["tags"] = json!([format!("TYPE_{to}")]);
        }
        if let Err(err) = ll_checked(ctx, keys::LL_LINK_CREATE, &from, link, Value::Null).await {
            return hl_failed(err);
        }
    }

    fire_triggers(ctx, &result).await;
    hl_ok()
}

async fn do_update_object(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let result = match ll_checked(
        ctx,
        keys::LL_VERTEX_UPDATE,
        &self_id,
        ctx.payload.clone(),
        op_stack_options(),
    )
    .await
    {
        Ok(result) => result,
        Err(err) => return hl_failed(err),
    };
    fire_triggers(ctx, &result).await;
    hl_ok()
}

async fn do_delete_object(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let mode = string_field(&ctx.payload, "mode").unwrap_or("vertex");

    match mode {
        "cascade" => {
            // BFS over the per-type link index; every reachable vertex is
            // visited and deleted exactly once.
            let mut visited: HashSet<String> = HashSet::from([self_id.clone()]);
            let mut queue: VecDeque<String> = VecDeque::from([self_id]);
            while let Some(elem) = queue.pop_front() {
                let pattern = format!("{elem}.out.ltp_oid-bdy.>");
                for key in ctx.global_cache().get_keys_by_pattern(&pattern) {
                    let child = keys::key_last_token(&key).to_string();
                    if visited.insert(child.clone()) {
                        queue.push_back(child);
                    }
                }
                let result = match ll_checked(
                    ctx,
                    keys::LL_VERTEX_DELETE,
                    &elem,
                    json!({}),
                    op_stack_options(),
                )
                .await
                {
                    Ok(result) => result,
                    Err(err) => return hl_failed(err),
                };
                fire_triggers(ctx, &result).await;
            }
        }
        "vertex" => {
            let result = match ll_checked(
                ctx,
                keys::LL_VERTEX_DELETE,
                &self_id,
                json!({}),
                op_stack_options(),
            )
            .await
            {
                Ok(result) => result,
                Err(err) => return hl_failed(err),
            };
            fire_triggers(ctx, &result).await;
        }
        other => return hl_failed(format!("unknown delete mode '{other}'")),
    }

    hl_ok()
}

// ---------------------------------------------------------------------------
// Links between types.
// ---------------------------------------------------------------------------

async fn do_create_types_link(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let Some(object_link_type) = string_field(&ctx.payload, "object_link_type") else {
        return hl_failed("object_link_type undefined");
    };
    let Some(to) = string_field(&ctx.payload, "to") else {
        return hl_failed("to undefined");
    };

    let link = json!({
        "descendant_uuid": to,
        "link_type": keys::TYPE_LINK,
        "link_body": {
            "link_type": object_link_type,
            "tags": [format!("TYPE_{to}")],
        },
    });
    match ll_checked(ctx, keys::LL_LINK_CREATE, &self_id, link, Value::Null).await {
        Ok(_) => hl_ok(),
        Err(err) => hl_failed(err),
    }
}

async fn do_update_types_link(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let Some(to) = string_field(&ctx.payload, "to") else {
        return hl_failed("to undefined");
    };
    let object_link_type = string_field(&ctx.payload, "object_link_type").unwrap_or("");
    let body = ctx
        .payload
        .get("body")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    let body_is_empty = !body.as_object().is_some_and(|o| !o.is_empty());
    if object_link_type.is_empty() && body_is_empty {
        return hl_failed("nothing to update");
    }

    let mut update_link_payload = json!({
        "descendant_uuid": to,
        "link_type": keys::TYPE_LINK,
        "link_body": body,
    });
    update_link_payload["link_body"]["tags"] = json!([format!("TYPE_{to}")]);

    let need_object_link_type_update = !object_link_type.is_empty();
    let mut current_object_link_type = String::new();
    if need_object_link_type_update {
        update_link_payload["link_body"]["link_type"] = json!(object_link_type);
        let current_body = match get_types_link_body(ctx, &self_id, to).await {
            Ok(Some(body)) => body,
            Ok(None) => return hl_failed(format!("link {self_id}, {to} not found")),
            Err(err) => return hl_failed(err.to_string()),
        };
        current_object_link_type = current_body
            .get("link_type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
    }

    if let Err(err) = ll_checked(
        ctx,
        keys::LL_LINK_UPDATE,
        &self_id,
        update_link_payload,
        Value::Null,
    )
    .await
    {
        return hl_failed(err);
    }

    // Rewrite the links of every object of this type that still carry the
    // old link type. Idempotent per (object, to).
    if need_object_link_type_update {
        let objects = find_type_objects(ctx, &self_id).await;
        for object_id in objects {
            let pattern =
                format!("{object_id}.out.ltp_oid-bdy.{current_object_link_type}.>");
            for key in ctx.global_cache().get_keys_by_pattern(&pattern) {
                let to_object_id = keys::key_last_token(&key).to_string();
                let update_object_link_payload = json!({
                    "descendant_uuid": to_object_id,
                    "link_type": object_link_type,
                    "link_body": {},
                });
                if let Err(err) = ll_checked(
                    ctx,
                    keys::LL_LINK_UPDATE,
                    &object_id,
                    update_object_link_payload,
                    Value::Null,
                )
                .await
                {
                    return hl_failed(err);
                }
            }
        }
    }

    hl_ok()
}

// ---------------------------------------------------------------------------
// Links between objects.
// ---------------------------------------------------------------------------

async fn do_create_objects_link(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let Some(to) = string_field(&ctx.payload, "to") else {
        return hl_failed("to undefined");
    };
    let link_type = match reference_link_type(ctx, &self_id, to).await {
        Ok(Ok(link_type)) => link_type,
        Ok(Err(message)) => return hl_failed(message),
        Err(err) => return hl_failed(err.to_string()),
    };

    let object_link = json!({
        "descendant_uuid": to,
        "link_type": link_type,
        "link_body": {},
    });
    let result = match ll_checked(
        ctx,
        keys::LL_LINK_CREATE,
        &self_id,
        object_link,
        op_stack_options(),
    )
    .await
    {
        Ok(result) => result,
        Err(err) => return hl_failed(err),
    };
    fire_triggers(ctx, &result).await;
    hl_ok()
}

async fn do_update_objects_link(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let Some(to) = string_field(&ctx.payload, "to") else {
        return hl_failed("to undefined");
    };
    let link_type = match reference_link_type(ctx, &self_id, to).await {
        Ok(Ok(link_type)) => link_type,
        Ok(Err(message)) => return hl_failed(message),
        Err(err) => return hl_failed(err.to_string()),
    };

    let object_link = json!({
        "descendant_uuid": to,
        "link_type": link_type,
        "link_body": ctx.payload.get("body").cloned().unwrap_or_else(|| json!({})),
    });
    let result = match ll_checked(
        ctx,
        keys::LL_LINK_UPDATE,
        &self_id,
        object_link,
        op_stack_options(),
    )
    .await
    {
        Ok(result) => result,
        Err(err) => return hl_failed(err),
    };
    fire_triggers(ctx, &result).await;
    hl_ok()
}

async fn do_delete_objects_link(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let Some(to) = string_field(&ctx.payload, "to") else {
        return hl_failed("to undefined");
    };
    let link_type = match reference_link_type(ctx, &self_id, to).await {
        Ok(Ok(link_type)) => link_type,
        Ok(Err(message)) => return hl_failed(message),
        Err(err) => return hl_failed(err.to_string()),
    };

    let object_link = json!({
        "descendant_uuid": to,
        "link_type": link_type,
    });
    let result = match ll_checked(
        ctx,
        keys::LL_LINK_DELETE,
        &self_id,
        object_link,
        op_stack_options(),
    )
    .await
    {
        Ok(result) => result,
        Err(err) => return hl_failed(err),
    };
    fire_triggers(ctx, &result).await;
    hl_ok()
}

// ---------------------------------------------------------------------------
// Helper function types.
// ---------------------------------------------------------------------------

async fn do_find_object_type(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    match find_object_type(ctx, &self_id).await {
        Some(type_name) => hl_ok_with(Value::String(type_name)),
        None => hl_failed(format!("object '{self_id}' has no type")),
    }
}

async fn do_find_type_objects(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let objects = find_type_objects(ctx, &self_id).await;
    hl_ok_with(json!(objects))
}

async fn do_delete_object_filtered_out_links(ctx: &ContextProcessor) -> Value {
    let self_id = ctx.self_address.id.clone();
    let Some(link_type) = string_field(&ctx.payload, "link_type") else {
        return hl_failed("link_type undefined");
    };

    let pattern = format!("{self_id}.out.ltp_oid-bdy.{link_type}.>");
    for key in ctx.global_cache().get_keys_by_pattern(&pattern) {
        let to = keys::key_last_token(&key).to_string();
        let payload = json!({
            "descendant_uuid": to,
            "link_type": link_type,
        });
        let result = match ll_checked(
            ctx,
            keys::LL_LINK_DELETE,
            &self_id,
            payload,
            op_stack_options(),
        )
        .await
        {
            Ok(result) => result,
            Err(err) => return hl_failed(err),
        };
        fire_triggers(ctx, &result).await;
    }
    hl_ok()
}

// ---------------------------------------------------------------------------
// Handler entry points.
// ---------------------------------------------------------------------------

/// `functions.cmdb.api.type.create`
pub(crate) async fn create_type(ctx: ContextProcessor) -> HandlerResult {
    let response = do_create_type(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.type.update`
pub(crate) async fn update_type(ctx: ContextProcessor) -> HandlerResult {
    let response = do_update_type(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.type.delete`
///
/// Replies OK without touching the graph. Cascading type deletion is not
/// implemented.
pub(crate) async fn delete_type(ctx: ContextProcessor) -> HandlerResult {
    reply_with(ctx, hl_ok()).await
}

/// `functions.cmdb.api.object.create`
pub(crate) async fn create_object(ctx: ContextProcessor) -> HandlerResult {
    let response = do_create_object(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.object.update`
pub(crate) async fn update_object(ctx: ContextProcessor) -> HandlerResult {
    let response = do_update_object(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.object.delete`
pub(crate) async fn delete_object(ctx: ContextProcessor) -> HandlerResult {
    let response = do_delete_object(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.types.link.create`
pub(crate) async fn create_types_link(ctx: ContextProcessor) -> HandlerResult {
    let response = do_create_types_link(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.types.link.update`
pub(crate) async fn update_types_link(ctx: ContextProcessor) -> HandlerResult {
    let response = do_update_types_link(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.types.link.delete`
///
/// Replies OK without cascading, like `type.delete`.
pub(crate) async fn delete_types_link(ctx: ContextProcessor) -> HandlerResult {
    reply_with(ctx, hl_ok()).await
}

/// `functions.cmdb.api.objects.link.create`
pub(crate) async fn create_objects_link(ctx: ContextProcessor) -> HandlerResult {
    let response = do_create_objects_link(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.objects.link.update`
pub(crate) async fn update_objects_link(ctx: ContextProcessor) -> HandlerResult {
    let response = do_update_objects_link(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.objects.link.delete`
pub(crate) async fn delete_objects_link(ctx: ContextProcessor) -> HandlerResult {
    let response = do_delete_objects_link(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.find_object_type`
pub(crate) async fn find_object_type_statefun(ctx: ContextProcessor) -> HandlerResult {
    let response = do_find_object_type(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.find_type_objects`
pub(crate) async fn find_type_objects_statefun(ctx: ContextProcessor) -> HandlerResult {
    let response = do_find_type_objects(&ctx).await;
    reply_with(ctx, response).await
}

/// `functions.cmdb.api.delete_object_filtered_out_links`
pub(crate) async fn delete_object_filtered_out_links_statefun(
    ctx: ContextProcessor,
) -> HandlerResult {
    let response = do_delete_object_filtered_out_links(&ctx).await;
    reply_with(ctx, response).await
}

/// Ensure the `objects` and `types` root vertices exist. Runs on the hub
/// once subscriptions are live.
pub(crate) async fn cmdb_schema_prepare(runtime: Runtime) -> anyhow::Result<()> {
    for root in [keys::OBJECTS_ROOT, keys::TYPES_ROOT] {
        let result = runtime
            .request(
                RequestProvider::Local,
                keys::LL_VERTEX_CREATE,
                root,
                json!({"body": {}}),
                Value::Null,
            )
            .await?;
        if let Err(message) = check_request(&result) {
            if !message.contains("already exists") {
                warn!(root, message, "cmdb schema prepare");
            }
        }
    }
    Ok(())
}
