// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Low-level link operations.
//!
//! A stored link is four records (target, body, per-type index, reverse)
//! plus attribute index entries for `link_body.tags`. The link name
//! defaults to the link type when the caller does not supply one, so one
//! vertex can fan out several links under the same name (the object/type
//! meta-graph does exactly that); uniqueness is enforced per
//! `(from, name, to)` and the target record carries the name's most recent
//! target. A type change on a name-defaulted link moves the name along
//! with the type. All records of one source vertex are mutated through
//! that vertex's handler, which serializes writers per source.

use bytes::Bytes;
use foliage_statefun::{json, CacheStore, ContextProcessor, HandlerResult, Result};
use serde_json::Value;

use crate::keys;
use crate::ops::{ll_failed, ll_ok, op_stack_requested, OpEntry, OpStack};

/// One fully-resolved stored link.
#[derive(Debug, Clone)]
pub(crate) struct StoredLink {
    pub from: String,
    pub name: String,
    pub link_type: String,
    pub to: String,
    pub body: Value,
}

fn tags_of(body: &Value) -> Vec<String> {
    body.get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve the link type of the `(from, name, to)` pair: the target record
/// when it still points at `to`, the per-type index otherwise.
async fn resolve_pair_type(
    cache: &CacheStore,
    from: &str,
    name: &str,
    to: &str,
) -> Result<Option<String>> {
    if let Some(target) = cache.get(&keys::out_target_key(from, name)).await? {
        let target = String::from_utf8_lossy(&target).to_string();
        if let Some((link_type, target_to)) = keys::parse_target_value(&target) {
            if target_to == to {
                return Ok(Some(link_type.to_string()));
            }
        }
    }
    let prefix = format!("{from}.out.ltp_oid-bdy.");
    for key in cache.get_keys_by_pattern(&format!("{from}.out.ltp_oid-bdy.>")) {
        let Some(suffix) = key.strip_prefix(&prefix) else {
            continue;
        };
        if let Some((link_type, target_to)) = suffix.rsplit_once('.') {
            if target_to == to {
                return Ok(Some(link_type.to_string()));
            }
        }
    }
    Ok(None)
}

/// All outgoing links of a vertex, resolved from the body records.
pub(crate) async fn list_outgoing_links(cache: &CacheStore, from: &str) -> Result<Vec<StoredLink>> {
    let prefix = format!("{from}.out.body.");
    let mut links = Vec::new();
    for key in cache.get_keys_by_pattern(&format!("{from}.out.body.>")) {
        let Some(suffix) = key.strip_prefix(&prefix) else {
            continue;
        };
        let Some((name, to)) = suffix.rsplit_once('.') else {
            continue;
        };
        let body = cache
            .get_json(&key)
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        // A link stored without a resolvable type keeps the name as its
        // type, matching the defaulted naming.
        let link_type = resolve_pair_type(cache, from, name, to)
            .await?
            .unwrap_or_else(|| name.to_string());
        links.push(StoredLink {
            from: from.to_string(),
            name: name.to_string(),
            link_type,
            to: to.to_string(),
            body,
        });
    }
    Ok(links)
}

/// Find one link of `from`, filtered by target, name and type.
pub(crate) async fn find_link(
    cache: &CacheStore,
    from: &str,
    to: Option<&str>,
    name: Option<&str>,
    link_type: Option<&str>,
) -> Result<Option<StoredLink>> {
    for link in list_outgoing_links(cache, from).await? {
        if to.map_or(true, |t| t == link.to)
            && name.map_or(true, |n| n == link.name)
            && link_type.map_or(true, |t| t == link.link_type)
        {
            return Ok(Some(link));
        }
    }
    Ok(None)
}

/// Write all records of a link.
pub(crate) async fn write_link_records(cache: &CacheStore, link: &StoredLink) -> Result<()> {
    cache
        .set(
            &keys::out_target_key(&link.from, &link.name),
            Bytes::from(keys::target_value(&link.link_type, &link.to)),
        )
        .await?;
    cache
        .set_json(
            &keys::out_body_key(&link.from, &link.name, &link.to),
            &link.body,
        )
        .await?;
    cache
        .set_json(
            &keys::out_type_index_key(&link.from, &link.link_type, &link.to),
            &link.body,
        )
        .await?;
    cache
        .set(&keys::in_key(&link.to, &link.from, &link.name), Bytes::new())
        .await?;
    for tag in tags_of(&link.body) {
        cache
            .set(
                &keys::out_index_key(&link.from, &link.name, keys::TAG_ATTRIBUTE, &tag),
                Bytes::new(),
            )
            .await?;
    }
    Ok(())
}

/// Remove all records of a link, index entries included. The shared target
/// record is removed only while it still points at this link's target.
pub(crate) async fn delete_link_records(cache: &CacheStore, link: &StoredLink) -> Result<()> {
    let target_key = keys::out_target_key(&link.from, &link.name);
    if let Some(target) = cache.get(&target_key).await? {
        let target = String::from_utf8_lossy(&target).to_string();
        if keys::parse_target_value(&target).is_some_and(|(_, to)| to == link.to) {
            cache.delete(&target_key).await?;
        }
    }
    cache
        .delete(&keys::out_body_key(&link.from, &link.name, &link.to))
        .await?;
    cache
        .delete(&keys::out_type_index_key(
            &link.from,
            &link.link_type,
            &link.to,
        ))
        .await?;
    cache
        .delete(&keys::in_key(&link.to, &link.from, &link.name))
        .await?;
    for key in cache.get_keys_by_pattern(&format!("{}.out.index.{}.>", link.from, link.name)) {
        cache.delete(&key).await?;
    }
    Ok(())
}

fn payload_string<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload.get(field).and_then(Value::as_str)
}

async fn do_create(ctx: &ContextProcessor) -> Result<Value> {
    let from = ctx.self_address.id.as_str();
    let cache = ctx.global_cache();

    let Some(to) = payload_string(&ctx.payload, "descendant_uuid") else {
        return Ok(ll_failed("descendant_uuid undefined"));
    };
    let Some(link_type) = payload_string(&ctx.payload, "link_type") else {
        return Ok(ll_failed("link_type undefined"));
    };
    let name = payload_string(&ctx.payload, "link_name").unwrap_or(link_type);
    let body = ctx
        .payload
        .get("link_body")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    if cache
        .get(&keys::out_body_key(from, name, to))
        .await?
        .is_some()
    {
        return Ok(ll_failed(format!(
            "link '{name}' from vertex '{from}' to '{to}' already exists"
        )));
    }

    let link = StoredLink {
        from: from.to_string(),
        name: name.to_string(),
        link_type: link_type.to_string(),
        to: to.to_string(),
        body: body.clone(),
    };
    write_link_records(&cache, &link).await?;

    let op_stack: OpStack = vec![OpEntry::link_create(from, to, link_type, body)];
    Ok(ll_ok(None, op_stack_requested(ctx).then_some(&op_stack)))
}

async fn do_update(ctx: &ContextProcessor) -> Result<Value> {
    let from = ctx.self_address.id.as_str();
    let cache = ctx.global_cache();

    let Some(to) = payload_string(&ctx.payload, "descendant_uuid") else {
        return Ok(ll_failed("descendant_uuid undefined"));
    };
    let Some(new_type) = payload_string(&ctx.payload, "link_type") else {
        return Ok(ll_failed("link_type undefined"));
    };
    let name_hint = payload_string(&ctx.payload, "link_name");

    let Some(existing) = find_link(&cache, from, Some(to), name_hint, None).await? else {
        return Ok(ll_failed(format!(
            "link body from '{from}' to '{to}' not found"
        )));
    };

    let patch = ctx
        .payload
        .get("link_body")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    let new_body = match payload_string(&ctx.payload, "strategy") {
        Some("Replace") => patch,
        _ => {
            let mut merged = existing.body.clone();
            json::deep_merge(&mut merged, &patch);
            merged
        }
    };

    // A link created without an explicit name carries its type as the name;
    // the name follows the type on a type change.
    let new_name = match name_hint {
        Some(name) => name.to_string(),
        None if existing.name == existing.link_type && new_type != existing.link_type => {
            new_type.to_string()
        }
        None => existing.name.clone(),
    };

    delete_link_records(&cache, &existing).await?;
    let updated = StoredLink {
        from: from.to_string(),
        name: new_name,
        link_type: new_type.to_string(),
        to: to.to_string(),
        body: new_body.clone(),
    };
    write_link_records(&cache, &updated).await?;

    let op_stack: OpStack = vec![OpEntry::link_update(
        from,
        to,
        new_type,
        existing.body,
        new_body,
    )];
    Ok(ll_ok(None, op_stack_requested(ctx).then_some(&op_stack)))
}

async fn do_delete(ctx: &ContextProcessor) -> Result<Value> {
    let from = ctx.self_address.id.as_str();
    let cache = ctx.global_cache();

    let Some(to) = payload_string(&ctx.payload, "descendant_uuid") else {
        return Ok(ll_failed("descendant_uuid undefined"));
    };
    let name_hint = payload_string(&ctx.payload, "link_name");
    let type_filter = payload_string(&ctx.payload, "link_type");

    let Some(existing) = find_link(&cache, from, Some(to), name_hint, type_filter).await? else {
        return Ok(ll_failed(format!("link from '{from}' to '{to}' not found")));
    };

    delete_link_records(&cache, &existing).await?;
    let op_stack: OpStack = vec![OpEntry::link_delete(
        from,
        to,
        &existing.link_type,
        existing.body,
    )];
    Ok(ll_ok(None, op_stack_requested(ctx).then_some(&op_stack)))
}

async fn do_read(ctx: &ContextProcessor) -> Result<Value> {
    let from = ctx.self_address.id.as_str();
    let cache = ctx.global_cache();

    let to = payload_string(&ctx.payload, "descendant_uuid");
    let name = payload_string(&ctx.payload, "link_name");
    if to.is_none() && name.is_none() {
        return Ok(ll_failed("link_name or descendant_uuid undefined"));
    }
    let type_filter = payload_string(&ctx.payload, "link_type");

    match find_link(&cache, from, to, name, type_filter).await? {
        Some(link) => Ok(ll_ok(Some(link.body), None)),
        None => Ok(ll_failed(format!("link body of vertex '{from}' not found"))),
    }
}

async fn reply_with(mut ctx: ContextProcessor, response: Value) -> HandlerResult {
    if let Some(reply) = ctx.reply.as_mut() {
        reply.with(response)?;
    }
    Ok(())
}

/// `functions.graph.api.link.create`
pub(crate) async fn link_create(ctx: ContextProcessor) -> HandlerResult {
    let response = do_create(&ctx).await?;
    reply_with(ctx, response).await
}

/// `functions.graph.api.link.update`
pub(crate) async fn link_update(ctx: ContextProcessor) -> HandlerResult {
    let response = do_update(&ctx).await?;
    reply_with(ctx, response).await
}

/// `functions.graph.api.link.delete`
pub(crate) async fn link_delete(ctx: ContextProcessor) -> HandlerResult {
    let response = do_delete(&ctx).await?;
    reply_with(ctx, response).await
}

/// `functions.graph.api.link.read`
pub(crate) async fn link_read(ctx: ContextProcessor) -> HandlerResult {
    let response = do_read(&ctx).await?;
    reply_with(ctx, response).await
}
