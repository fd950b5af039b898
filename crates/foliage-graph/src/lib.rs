// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Foliage Graph - CMDB State Machines
//!
//! Vertex and link CRUD over the key/value bucket, exposed as stateful
//! function types, plus the higher-level object/type layer and trigger
//! propagation.
//!
//! Two API levels:
//!
//! - **Low-level** (`functions.graph.api.vertex.*`, `functions.graph.api.link.*`):
//!   key-layout state machines. Addressed by the vertex id, so the per-id
//!   discipline of the runtime serializes all writers of one vertex.
//! - **High-level** (`functions.cmdb.api.*`): the object/type meta-graph.
//!   Composes the low-level layer through in-process requests, collects
//!   op-stacks, and fires triggers.

pub mod keys;
pub mod ops;

mod cmdb;
mod link;
mod triggers;
mod vertex;

use foliage_statefun::{handler, FunctionTypeConfig, RequestProvider, Runtime};

pub use ops::{OpEntry, OpStack};

fn api_config() -> FunctionTypeConfig {
    FunctionTypeConfig::new()
        .with_allowed_request_providers(vec![RequestProvider::Auto])
        .with_max_id_handlers(-1)
}

fn request_only_config() -> FunctionTypeConfig {
    api_config().with_allowed_signal_providers(Vec::new())
}

/// Register every graph and CMDB function type on a runtime. On the hub
/// domain the CMDB schema (root vertices) is prepared once subscriptions
/// are live.
pub fn register_all_function_types(runtime: &Runtime) {
    // High-level API helpers.
    runtime.register_function_type(
        keys::HL_DELETE_OBJECT_FILTERED_OUT_LINKS,
        handler(cmdb::delete_object_filtered_out_links_statefun),
        request_only_config(),
    );
    runtime.register_function_type(
        keys::HL_FIND_OBJECT_TYPE,
        handler(cmdb::find_object_type_statefun),
        request_only_config(),
    );
    runtime.register_function_type(
        keys::HL_FIND_TYPE_OBJECTS,
        handler(cmdb::find_type_objects_statefun),
        request_only_config(),
    );

    // High-level API.
    runtime.register_function_type(keys::HL_TYPE_CREATE, handler(cmdb::create_type), api_config());
    runtime.register_function_type(keys::HL_TYPE_UPDATE, handler(cmdb::update_type), api_config());
    runtime.register_function_type(keys::HL_TYPE_DELETE, handler(cmdb::delete_type), api_config());

    runtime.register_function_type(
        keys::HL_TYPES_LINK_CREATE,
        handler(cmdb::create_types_link),
        api_config(),
    );
    runtime.register_function_type(
        keys::HL_TYPES_LINK_UPDATE,
        handler(cmdb::update_types_link),
        api_config(),
    );
    runtime.register_function_type(
        keys::HL_TYPES_LINK_DELETE,
        handler(cmdb::delete_types_link),
        api_config(),
    );

    runtime.register_function_type(
        keys::HL_OBJECT_CREATE,
        handler(cmdb::create_object),
        api_config(),
    );
    runtime.register_function_type(
        keys::HL_OBJECT_UPDATE,
        handler(cmdb::update_object),
        api_config(),
    );
    runtime.register_function_type(
        keys::HL_OBJECT_DELETE,
        handler(cmdb::delete_object),
        api_config(),
    );

    runtime.register_function_type(
        keys::HL_OBJECTS_LINK_CREATE,
        handler(cmdb::create_objects_link),
        api_config(),
    );
    runtime.register_function_type(
        keys::HL_OBJECTS_LINK_UPDATE,
        handler(cmdb::update_objects_link),
        api_config(),
    );
    runtime.register_function_type(
        keys::HL_OBJECTS_LINK_DELETE,
        handler(cmdb::delete_objects_link),
        api_config(),
    );

    // Low-level API.
    runtime.register_function_type(
        keys::LL_VERTEX_CREATE,
        handler(vertex::vertex_create),
        api_config(),
    );
    runtime.register_function_type(
        keys::LL_VERTEX_UPDATE,
        handler(vertex::vertex_update),
        api_config(),
    );
    runtime.register_function_type(
        keys::LL_VERTEX_DELETE,
        handler(vertex::vertex_delete),
        api_config(),
    );
    runtime.register_function_type(
        keys::LL_VERTEX_READ,
        handler(vertex::vertex_read),
        api_config(),
    );

    runtime.register_function_type(keys::LL_LINK_CREATE, handler(link::link_create), api_config());
    runtime.register_function_type(keys::LL_LINK_UPDATE, handler(link::link_update), api_config());
    runtime.register_function_type(keys::LL_LINK_DELETE, handler(link::link_delete), api_config());
    runtime.register_function_type(keys::LL_LINK_READ, handler(link::link_read), api_config());

    if runtime.domain().name() == runtime.domain().hub_domain_name() {
        runtime.register_on_after_start(cmdb::cmdb_schema_prepare);
    }
}
