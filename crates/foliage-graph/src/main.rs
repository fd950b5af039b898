// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Foliage Node - a runnable graph/CMDB node.
//!
//! Wires an embedded substrate, the stateful-function runtime and the
//! graph function types into one process. The domain is taken from
//! `FOLIAGE_DOMAIN` (default: the hub domain).

use anyhow::Result;
use tracing::info;

use foliage_statefun::{Runtime, RuntimeConfig};
use foliage_substrate::EmbeddedCluster;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("foliage_substrate=info".parse().unwrap())
                .add_directive("foliage_statefun=info".parse().unwrap())
                .add_directive("foliage_graph=info".parse().unwrap()),
        )
        .init();

    info!("Starting Foliage node");

    let config = RuntimeConfig::from_env()?;
    let domain = std::env::var("FOLIAGE_DOMAIN").unwrap_or_else(|_| config.hub_domain_name.clone());
    info!(
        domain = %domain,
        bucket = %config.key_value_store_bucket_name,
        "Configuration loaded"
    );

    let cluster = EmbeddedCluster::new();
    let substrate = cluster.connect(&domain);

    let runtime = Runtime::new(substrate, config).await?;
    foliage_graph::register_all_function_types(&runtime);
    runtime.start().await?;
    info!("Foliage node is up");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    runtime.shutdown().await;
    Ok(())
}
