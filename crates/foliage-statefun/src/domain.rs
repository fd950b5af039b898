// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multi-domain routing plane.
//!
//! Each domain owns three streams. The hub additionally owns the global
//! signal bus:
//!
//! - `hub_events` (hub only): captures `signal.>`, the global signal bus;
//! - `domain_ingress`: sources `signal.<thisDomain>.>` from `hub_events`
//!   (leaves source it from the hub's JetStream domain);
//! - `domain_egress`: captures `$SE.<thisDomain>.>`, fed by local handlers.
//!
//! Two routing consumers run per domain. The ingress router republishes
//! `signal.<thisDomain>.…` as `$SI.<thisDomain>.signal.<thisDomain>.…`,
//! which per-function-type streams capture. The egress router unwraps
//! `$SE.<thisDomain>.signal.<target>.…`: same-domain targets short-circuit
//! straight to `$SI`, everything else goes back out on `signal.<target>.…`
//! for the hub stream to capture and source onward. Subjects are only ever
//! rewritten into higher-privilege subject spaces, which keeps the topology
//! loop-free.

use std::sync::Arc;
use std::time::Duration;

use foliage_substrate::{ConsumerConfig, StreamConfig, StreamSource, Substrate};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::{Result, StatefunError};

/// First token of global signal subjects.
pub const SIGNAL_PREFIX: &str = "signal";
/// Prefix of domain-internal ingress subjects.
pub const DOMAIN_INGRESS_PREFIX: &str = "$SI";
/// Prefix of domain-internal egress subjects.
pub const DOMAIN_EGRESS_PREFIX: &str = "$SE";
/// Prefix of core request subjects.
pub const REQUEST_PREFIX: &str = "request";
/// Separator between the domain and the local id in an object id.
pub const OBJECT_ID_DOMAIN_SEPARATOR: char = '#';

pub(crate) const HUB_EVENT_STREAM_NAME: &str = "hub_events";
pub(crate) const DOMAIN_INGRESS_STREAM_NAME: &str = "domain_ingress";
pub(crate) const DOMAIN_EGRESS_STREAM_NAME: &str = "domain_egress";

const ROUTER_CONSUMER_MAX_ACK_WAIT_MS: u64 = 2000;
const LOST_CONNECTION_SINGLE_MSG_PROCESS_TIME_MS: u64 = 700;
// Sized so a single-message processing spike during a disconnect cannot
// exceed one ack-wait window.
const MAX_PENDING_MESSAGES: usize =
    (ROUTER_CONSUMER_MAX_ACK_WAIT_MS / LOST_CONNECTION_SINGLE_MSG_PROCESS_TIME_MS) as usize;

/// One logical cluster partition with its streams and routers.
pub struct Domain {
    hub_domain_name: String,
    name: String,
    substrate: Arc<dyn Substrate>,
}

impl Domain {
    /// Bind a domain to a substrate connection. The domain name comes from
    /// the connection itself.
    pub fn new(substrate: Arc<dyn Substrate>, hub_domain_name: impl Into<String>) -> Self {
        Self {
            hub_domain_name: hub_domain_name.into(),
            name: substrate.domain_name().to_string(),
            substrate,
        }
    }

    /// Name of the hub domain.
    pub fn hub_domain_name(&self) -> &str {
        &self.hub_domain_name
    }

    /// This domain's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Domain encoded in an object id, or the current domain when absent.
    pub fn get_domain_from_object_id(&self, object_id: &str) -> String {
        let tokens: Vec<&str> = object_id.split(OBJECT_ID_DOMAIN_SEPARATOR).collect();
        if tokens.len() > 1 {
            if tokens.len() > 2 {
                warn!(object_id, "object id carries multiple domain separators");
            }
            tokens[0].to_string()
        } else {
            self.name.clone()
        }
    }

    /// Object id with any domain prefix stripped.
    pub fn get_object_id_without_domain(&self, object_id: &str) -> String {
        let tokens: Vec<&str> = object_id.split(OBJECT_ID_DOMAIN_SEPARATOR).collect();
        if tokens.len() > 1 {
            if tokens.len() > 2 {
                warn!(object_id, "object id carries multiple domain separators");
            }
            tokens[tokens.len() - 1].to_string()
        } else {
            object_id.to_string()
        }
    }

    /// Qualify an object id with a domain.
    pub fn create_object_id_with_domain(&self, domain: &str, object_id: &str) -> String {
        format!(
            "{domain}{OBJECT_ID_DOMAIN_SEPARATOR}{}",
            self.get_object_id_without_domain(object_id)
        )
    }

    /// Egress subject for a signal emitted from this domain.
    pub(crate) fn egress_subject(&self, target_domain: &str, typename: &str, id: &str) -> String {
        format!(
            "{DOMAIN_EGRESS_PREFIX}.{}.{SIGNAL_PREFIX}.{target_domain}.{typename}.{id}",
            self.name
        )
    }

    /// Core request subject for a target instance.
    pub(crate) fn request_subject(domain: &str, typename: &str, id: &str) -> String {
        format!("{REQUEST_PREFIX}.{domain}.{typename}.{id}")
    }

    /// Create the domain's streams and start both routers. Returns the
    /// router task handles.
    pub(crate) async fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        if self.hub_domain_name == self.name {
            self.create_hub_signal_stream().await?;
        }
        self.create_ingress_signal_stream().await?;
        self.create_egress_signal_stream().await?;

        let ingress = self
            .create_router(
                DOMAIN_INGRESS_STREAM_NAME,
                format!("{SIGNAL_PREFIX}.{}.>", self.name),
                RouterKind::Ingress,
            )
            .await?;
        let egress = self
            .create_router(
                DOMAIN_EGRESS_STREAM_NAME,
                format!("{DOMAIN_EGRESS_PREFIX}.{}.>", self.name),
                RouterKind::Egress,
            )
            .await?;
        Ok(vec![ingress, egress])
    }

    async fn create_hub_signal_stream(&self) -> Result<()> {
        self.substrate
            .ensure_stream(StreamConfig {
                name: HUB_EVENT_STREAM_NAME.to_string(),
                subjects: vec![format!("{SIGNAL_PREFIX}.>")],
                sources: Vec::new(),
            })
            .await
            .map_err(StatefunError::from)
    }

    async fn create_ingress_signal_stream(&self) -> Result<()> {
        let source_domain = if self.hub_domain_name == self.name {
            None
        } else {
            Some(self.hub_domain_name.clone())
        };
        self.substrate
            .ensure_stream(StreamConfig {
                name: DOMAIN_INGRESS_STREAM_NAME.to_string(),
                subjects: Vec::new(),
                sources: vec![StreamSource {
                    stream: HUB_EVENT_STREAM_NAME.to_string(),
                    filter_subject: format!("{SIGNAL_PREFIX}.{}.>", self.name),
                    domain: source_domain,
                }],
            })
            .await
            .map_err(StatefunError::from)
    }

    async fn create_egress_signal_stream(&self) -> Result<()> {
        self.substrate
            .ensure_stream(StreamConfig {
                name: DOMAIN_EGRESS_STREAM_NAME.to_string(),
                subjects: vec![format!("{DOMAIN_EGRESS_PREFIX}.{}.>", self.name)],
                sources: Vec::new(),
            })
            .await
            .map_err(StatefunError::from)
    }

    async fn create_router(
        &self,
        source_stream: &str,
        filter_subject: String,
        kind: RouterKind,
    ) -> Result<JoinHandle<()>> {
        let consumer_name = format!("{source_stream}-{}-consumer", self.name);
        let consumer_group = format!("{consumer_name}-group");
        debug!(domain = %self.name, stream = source_stream, "starting domain router");

        self.substrate
            .ensure_consumer(
                source_stream,
                ConsumerConfig {
                    name: consumer_name.clone(),
                    filter_subject,
                    ack_wait: Duration::from_millis(ROUTER_CONSUMER_MAX_ACK_WAIT_MS),
                    max_ack_pending: MAX_PENDING_MESSAGES,
                },
            )
            .await?;
        let mut deliveries = self
            .substrate
            .consume(source_stream, &consumer_name, &consumer_group)
            .await?;

        let substrate = self.substrate.clone();
        let domain_name = self.name.clone();
        let stream_name = source_stream.to_string();
        Ok(tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let target = match kind {
                    RouterKind::Ingress => Ok(ingress_target(&domain_name, &delivery.subject)),
                    RouterKind::Egress => egress_target(&delivery.subject),
                };
                match target {
                    Ok(target_subject) => {
                        match substrate.publish(&target_subject, delivery.payload).await {
                            Ok(ack) => {
                                trace!(
                                    from_domain = %domain_name,
                                    from = %delivery.subject,
                                    to_domain = %ack.domain,
                                    to_stream = %ack.stream,
                                    to = %target_subject,
                                    "routed"
                                );
                                delivery.acker.ack();
                            }
                            Err(err) => {
                                error!(
                                    domain = %domain_name,
                                    stream = %stream_name,
                                    %err,
                                    "router cannot republish message"
                                );
                                delivery.acker.nak();
                            }
                        }
                    }
                    Err(err) => {
                        warn!(
                            domain = %domain_name,
                            stream = %stream_name,
                            subject = %delivery.subject,
                            %err,
                            "router cannot compute target subject"
                        );
                        delivery.acker.nak();
                    }
                }
            }
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum RouterKind {
    Ingress,
    Egress,
}

/// Ingress rewrite: wrap the global subject into the domain's `$SI` space.
fn ingress_target(domain: &str, subject: &str) -> String {
    format!("{DOMAIN_INGRESS_PREFIX}.{domain}.{subject}")
}

/// Egress rewrite. `$SE.<domain>.signal.<target>.<typename…>.<id>` either
/// short-circuits into the local `$SI` space (same-domain target) or goes
/// back out on the global `signal.<target>.…` subject.
fn egress_target(subject: &str) -> Result<String> {
    let mut tokens: Vec<&str> = subject.split('.').collect();
    if tokens.len() < 5 {
        return Err(StatefunError::MalformedSubject(subject.to_string()));
    }
    if tokens[1] == tokens[3] {
        tokens[0] = DOMAIN_INGRESS_PREFIX;
        Ok(tokens.join("."))
    } else {
        Ok(tokens[2..].join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foliage_substrate::EmbeddedCluster;

    fn domain(name: &str) -> Domain {
        let cluster = EmbeddedCluster::new();
        Domain::new(cluster.connect(name), "hub")
    }

    #[test]
    fn object_id_domain_helpers() {
        let leaf = domain("leaf");
        assert_eq!(leaf.get_domain_from_object_id("hub#id7"), "hub");
        assert_eq!(leaf.get_domain_from_object_id("id7"), "leaf");
        assert_eq!(leaf.get_object_id_without_domain("hub#id7"), "id7");
        assert_eq!(leaf.get_object_id_without_domain("id7"), "id7");
        assert_eq!(leaf.create_object_id_with_domain("hub", "id7"), "hub#id7");
        assert_eq!(leaf.create_object_id_with_domain("hub", "leaf#id7"), "hub#id7");
    }

    #[test]
    fn first_domain_token_wins_on_multiple_separators() {
        let leaf = domain("leaf");
        assert_eq!(leaf.get_domain_from_object_id("a#b#c"), "a");
        assert_eq!(leaf.get_object_id_without_domain("a#b#c"), "c");
    }

    #[test]
    fn ingress_rewrite() {
        assert_eq!(
            ingress_target("leaf", "signal.leaf.t.id7"),
            "$SI.leaf.signal.leaf.t.id7"
        );
    }

    #[test]
    fn egress_rewrite_short_circuits_same_domain() {
        assert_eq!(
            egress_target("$SE.hub.signal.hub.t.id1").unwrap(),
            "$SI.hub.signal.hub.t.id1"
        );
    }

    #[test]
    fn egress_rewrite_forwards_cross_domain() {
        assert_eq!(
            egress_target("$SE.hub.signal.leaf.t.id7").unwrap(),
            "signal.leaf.t.id7"
        );
    }

    #[test]
    fn egress_rewrite_rejects_short_subjects() {
        assert!(egress_target("$SE.hub.signal.leaf").is_err());
    }

    #[test]
    fn subject_builders() {
        let hub = domain("hub");
        assert_eq!(
            hub.egress_subject("leaf", "t", "id7"),
            "$SE.hub.signal.leaf.t.id7"
        );
        assert_eq!(Domain::request_subject("hub", "echo", "e1"), "request.hub.echo.e1");
    }
}
