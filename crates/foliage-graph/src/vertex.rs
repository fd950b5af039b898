// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Low-level vertex operations.

use foliage_statefun::{json, ContextProcessor, HandlerResult, Result};
use serde_json::Value;

use crate::link::{delete_link_records, find_link, list_outgoing_links};
use crate::ops::{ll_failed, ll_ok, op_stack_requested, OpEntry, OpStack};

const STRATEGY_DEEP_MERGE: &str = "DeepMerge";
const STRATEGY_REPLACE: &str = "Replace";

fn payload_body(ctx: &ContextProcessor) -> Value {
    ctx.payload
        .get("body")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()))
}

async fn do_create(ctx: &ContextProcessor) -> Result<Value> {
    let id = ctx.self_address.id.as_str();
    let cache = ctx.global_cache();

    if cache.get(id).await?.is_some() {
        return Ok(ll_failed(format!("vertex '{id}' already exists")));
    }
    let body = payload_body(ctx);
    cache.set_json(id, &body).await?;

    let op_stack: OpStack = vec![OpEntry::vertex_create(id, body)];
    Ok(ll_ok(None, op_stack_requested(ctx).then_some(&op_stack)))
}

async fn do_read(ctx: &ContextProcessor) -> Result<Value> {
    let id = ctx.self_address.id.as_str();
    match ctx.global_cache().get_json(id).await? {
        Some(body) => Ok(ll_ok(Some(body), None)),
        None => Ok(ll_failed(format!("vertex '{id}' not found"))),
    }
}

async fn do_update(ctx: &ContextProcessor) -> Result<Value> {
    let id = ctx.self_address.id.as_str();
    let cache = ctx.global_cache();

    let Some(old_body) = cache.get_json(id).await? else {
        return Ok(ll_failed(format!("vertex '{id}' not found")));
    };
    let patch = payload_body(ctx);
    let strategy = ctx
        .payload
        .get("strategy")
        .and_then(Value::as_str)
        .unwrap_or(STRATEGY_DEEP_MERGE);
    let new_body = match strategy {
        STRATEGY_REPLACE => patch,
        STRATEGY_DEEP_MERGE => {
            let mut merged = old_body.clone();
            json::deep_merge(&mut merged, &patch);
            merged
        }
        other => return Ok(ll_failed(format!("unknown update strategy '{other}'"))),
    };
    cache.set_json(id, &new_body).await?;

    let op_stack: OpStack = vec![OpEntry::vertex_update(id, old_body, new_body)];
    Ok(ll_ok(None, op_stack_requested(ctx).then_some(&op_stack)))
}

/// Delete the body and cascade every link record touching this vertex:
/// all outgoing links, and the source-side records of every incoming link.
async fn do_delete(ctx: &ContextProcessor) -> Result<Value> {
    let id = ctx.self_address.id.as_str();
    let cache = ctx.global_cache();

    let Some(old_body) = cache.get_json(id).await? else {
        return Ok(ll_failed(format!("vertex '{id}' not found")));
    };
    let mut op_stack: OpStack = Vec::new();

    for link in list_outgoing_links(&cache, id).await? {
        delete_link_records(&cache, &link).await?;
        op_stack.push(OpEntry::link_delete(id, &link.to, &link.link_type, link.body));
    }

    let in_prefix = format!("{id}.in.");
    for key in cache.get_keys_by_pattern(&format!("{id}.in.>")) {
        let Some(rest) = key.strip_prefix(&in_prefix) else {
            continue;
        };
        let Some((from, name)) = rest.split_once('.') else {
            continue;
        };
        match find_link(&cache, from, Some(id), Some(name), None).await? {
            Some(link) => {
                delete_link_records(&cache, &link).await?;
                op_stack.push(OpEntry::link_delete(from, id, &link.link_type, link.body));
            }
            // Stray reverse record without a source side.
            None => cache.delete(&key).await?,
        }
    }

    cache.delete(id).await?;
    op_stack.push(OpEntry::vertex_delete(id, old_body));
    Ok(ll_ok(None, op_stack_requested(ctx).then_some(&op_stack)))
}

async fn reply_with(mut ctx: ContextProcessor, response: Value) -> HandlerResult {
    if let Some(reply) = ctx.reply.as_mut() {
        reply.with(response)?;
    }
    Ok(())
}

/// `functions.graph.api.vertex.create`
pub(crate) async fn vertex_create(ctx: ContextProcessor) -> HandlerResult {
    let response = do_create(&ctx).await?;
    reply_with(ctx, response).await
}

/// `functions.graph.api.vertex.read`
pub(crate) async fn vertex_read(ctx: ContextProcessor) -> HandlerResult {
    let response = do_read(&ctx).await?;
    reply_with(ctx, response).await
}

/// `functions.graph.api.vertex.update`
pub(crate) async fn vertex_update(ctx: ContextProcessor) -> HandlerResult {
    let response = do_update(&ctx).await?;
    reply_with(ctx, response).await
}

/// `functions.graph.api.vertex.delete`
pub(crate) async fn vertex_delete(ctx: ContextProcessor) -> HandlerResult {
    let response = do_delete(&ctx).await?;
    reply_with(ctx, response).await
}
