// # Kubernetes Event Source
//
// This crate provides an `EventSource` that polls the Kubernetes API server
// for pods (and optionally services and nodes) and turns list differences
// into orchestration events.
//
// ## Sequence Numbers
//
// Events carry the object's `resourceVersion`, which the API server assigns
// from a single monotonically increasing counter. Deletions carry the
// resourceVersion of the list response that no longer contains the object.
//
// Every kind is listed separately, so one poll sees each collection at a
// different resourceVersion. The events of a poll are merged and emitted in
// sequence order, and each is stamped with the lowest list resourceVersion
// of the poll as its resume point: a later poll can still report a change
// above that version but never one at or below it.
//
// ## Change Significance
//
// An object whose resourceVersion moved but whose network-relevant fields
// (phase, IP, node, labels, MAC/interface annotations) did not change does
// not produce an event.
//
// ## Limitations
//
// Objects deleted while no subscription was running are not reported; the
// subscriber only learns about objects it saw disappear.

use coe_core::config::EventSourceConfig;
use coe_core::traits::{EventSource, EventSourceFactory, EventStream};
use coe_core::{
    ComponentRegistry, EndpointId, EndpointPhase, Error, OrchestrationEvent, Result,
    WorkloadEndpoint, WorkloadKind,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Annotation carrying the workload interface MAC address
pub const MAC_ANNOTATION: &str = "coe.opendaylight.org/mac-address";

/// Annotation carrying the overlay interface id
pub const INTERFACE_ANNOTATION: &str = "coe.opendaylight.org/interface-id";

const PODS_PATH: &str = "/api/v1/pods";
const SERVICES_PATH: &str = "/api/v1/services";
const NODES_PATH: &str = "/api/v1/nodes";

/// One listing of a resource collection
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    /// resourceVersion of the list itself
    pub resource_version: u64,
    /// Parsed objects with their own resourceVersion
    pub items: Vec<(u64, WorkloadEndpoint)>,
}

/// Parse a `PodList`, `ServiceList` or `NodeList` response
///
/// Items that lack a name, namespace (except nodes) or numeric
/// resourceVersion are skipped.
pub fn parse_list(kind: WorkloadKind, body: &Value) -> Result<Listing> {
    let resource_version = parse_resource_version(&body["metadata"]).ok_or_else(|| {
        Error::event_source(format!("{} list without a resourceVersion", kind))
    })?;

    let items = body["items"]
        .as_array()
        .ok_or_else(|| Error::event_source(format!("{} list without items", kind)))?
        .iter()
        .filter_map(|item| {
            let parsed = match kind {
                WorkloadKind::Pod => parse_pod(item),
                WorkloadKind::Service => parse_service(item),
                WorkloadKind::Node => parse_node(item),
            };
            if parsed.is_none() {
                tracing::debug!("Skipping unparseable {} item", kind);
            }
            parsed
        })
        .collect();

    Ok(Listing {
        resource_version,
        items,
    })
}

fn parse_resource_version(metadata: &Value) -> Option<u64> {
    metadata["resourceVersion"].as_str()?.parse().ok()
}

/// Identity, version and common metadata of an object
fn parse_metadata(kind: WorkloadKind, item: &Value) -> Option<(u64, WorkloadEndpoint)> {
    let metadata = &item["metadata"];
    let name = metadata["name"].as_str()?;
    let namespace = metadata["namespace"].as_str()?;
    let resource_version = parse_resource_version(metadata)?;

    let mut endpoint = WorkloadEndpoint::new(EndpointId::new(kind, namespace, name));
    if let Some(uid) = metadata["uid"].as_str() {
        endpoint = endpoint.with_uid(uid);
    }
    if let Some(labels) = metadata["labels"].as_object() {
        for (key, value) in labels {
            if let Some(value) = value.as_str() {
                endpoint = endpoint.with_label(key.as_str(), value);
            }
        }
    }
    if let Some(mac) = metadata["annotations"][MAC_ANNOTATION].as_str() {
        endpoint = endpoint.with_mac(mac);
    }
    if let Some(interface) = metadata["annotations"][INTERFACE_ANNOTATION].as_str() {
        endpoint = endpoint.with_interface(interface);
    }

    Some((resource_version, endpoint))
}

fn parse_pod(item: &Value) -> Option<(u64, WorkloadEndpoint)> {
    let (resource_version, mut endpoint) = parse_metadata(WorkloadKind::Pod, item)?;

    endpoint.phase = if item["metadata"]["deletionTimestamp"].is_string() {
        EndpointPhase::Terminating
    } else {
        match item["status"]["phase"].as_str() {
            Some("Running") => EndpointPhase::Active,
            Some("Succeeded") | Some("Failed") => EndpointPhase::Deleted,
            _ => EndpointPhase::Pending,
        }
    };

    if let Some(ip) = item["status"]["podIP"].as_str().and_then(|ip| ip.parse::<IpAddr>().ok()) {
        endpoint = endpoint.with_ip(ip);
    }
    if let Some(node) = item["spec"]["nodeName"].as_str() {
        endpoint = endpoint.with_node(node);
    }

    Some((resource_version, endpoint))
}

fn parse_service(item: &Value) -> Option<(u64, WorkloadEndpoint)> {
    let (resource_version, mut endpoint) = parse_metadata(WorkloadKind::Service, item)?;

    endpoint.phase = if item["metadata"]["deletionTimestamp"].is_string() {
        EndpointPhase::Terminating
    } else {
        EndpointPhase::Active
    };

    // Headless services report "None"
    if let Some(ip) = item["spec"]["clusterIP"]
        .as_str()
        .and_then(|ip| ip.parse::<IpAddr>().ok())
    {
        endpoint = endpoint.with_ip(ip);
    }

    Some((resource_version, endpoint))
}

/// Nodes are cluster-scoped; their addresses come from `status.addresses`
fn parse_node(item: &Value) -> Option<(u64, WorkloadEndpoint)> {
    let metadata = &item["metadata"];
    let name = metadata["name"].as_str()?;
    let resource_version = parse_resource_version(metadata)?;

    let phase = if metadata["deletionTimestamp"].is_string() {
        EndpointPhase::Terminating
    } else {
        EndpointPhase::Active
    };
    let mut endpoint = WorkloadEndpoint::new(EndpointId::node(name)).with_phase(phase);
    if let Some(uid) = metadata["uid"].as_str() {
        endpoint = endpoint.with_uid(uid);
    }

    let addresses = item["status"]["addresses"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();
    for address in addresses {
        let Some(value) = address["address"].as_str() else {
            continue;
        };
        // First address of each type wins
        match address["type"].as_str() {
            Some("Hostname") if endpoint.node.is_none() => endpoint = endpoint.with_node(value),
            Some("InternalIP") if endpoint.ip_address.is_none() => {
                if let Ok(ip) = value.parse::<IpAddr>() {
                    endpoint = endpoint.with_ip(ip);
                }
            }
            Some("ExternalIP") if endpoint.external_ip.is_none() => {
                if let Ok(ip) = value.parse::<IpAddr>() {
                    endpoint = endpoint.with_external_ip(ip);
                }
            }
            _ => {}
        }
    }

    Some((resource_version, endpoint))
}

/// Whether a change between two observations matters to the network side
fn is_significant(old: &WorkloadEndpoint, new: &WorkloadEndpoint) -> bool {
    old.phase != new.phase
        || old.ip_address != new.ip_address
        || old.mac_address != new.mac_address
        || old.interface_id != new.interface_id
        || old.node != new.node
        || old.external_ip != new.external_ip
        || old.uid != new.uid
        || old.labels != new.labels
}

/// Turns consecutive listings into orchestration events
#[derive(Debug, Default)]
pub struct ListTracker {
    known: HashMap<EndpointId, WorkloadEndpoint>,
    after: Option<u64>,
}

impl ListTracker {
    /// Track listings, emitting only events with `seq > after`
    pub fn new(after: Option<u64>) -> Self {
        Self {
            known: HashMap::new(),
            after,
        }
    }

    /// Fold one listing of `kind` into the tracker
    ///
    /// Returns the create, update and delete events it implies, ordered by
    /// sequence number.
    pub fn observe(&mut self, kind: WorkloadKind, listing: Listing) -> Vec<OrchestrationEvent> {
        let mut events = Vec::new();
        let mut seen = HashSet::with_capacity(listing.items.len());

        for (resource_version, endpoint) in listing.items {
            let id = endpoint.id.clone();
            seen.insert(id.clone());

            let event = match self.known.get(&id) {
                None => Some(OrchestrationEvent::create(resource_version, endpoint.clone())),
                Some(old) if is_significant(old, &endpoint) => {
                    Some(OrchestrationEvent::update(resource_version, endpoint.clone()))
                }
                Some(_) => None,
            };
            self.known.insert(id, endpoint);
            events.extend(event);
        }

        let gone: Vec<EndpointId> = self
            .known
            .keys()
            .filter(|id| id.kind == kind && !seen.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(endpoint) = self.known.remove(&id) {
                events.push(OrchestrationEvent::delete(
                    listing.resource_version,
                    endpoint.with_phase(EndpointPhase::Deleted),
                ));
            }
        }

        events.retain(|event| self.after.is_none_or(|after| event.seq > after));
        events.sort_by_key(|event| event.seq);
        events
    }

    /// Fold the listings of one poll, one per kind, into the tracker
    ///
    /// The events of all kinds are returned in one sequence order, each
    /// carrying the lowest list resourceVersion as its resume point.
    pub fn observe_poll(
        &mut self,
        listings: Vec<(WorkloadKind, Listing)>,
    ) -> Vec<OrchestrationEvent> {
        let floor = listings.iter().map(|(_, listing)| listing.resource_version).min();
        let Some(floor) = floor else {
            return Vec::new();
        };

        let mut events: Vec<OrchestrationEvent> = listings
            .into_iter()
            .flat_map(|(kind, listing)| self.observe(kind, listing))
            .collect();
        events.sort_by_key(|event| event.seq);

        events
            .into_iter()
            .map(|event| event.with_resume_after(floor))
            .collect()
    }
}

/// HTTP side of the source, shared with polling tasks
struct KubeClient {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl KubeClient {
    async fn list(&self, kind: WorkloadKind) -> Result<Listing> {
        let path = match kind {
            WorkloadKind::Pod => PODS_PATH,
            WorkloadKind::Service => SERVICES_PATH,
            WorkloadKind::Node => NODES_PATH,
        };
        let url = format!("{}{}", self.url.trim_end_matches('/'), path);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::transient(format!("Kubernetes API request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => Error::event_source(format!(
                    "Kubernetes API rejected credentials. Status: {}",
                    status
                )),
                429 | 500..=599 => {
                    Error::transient(format!("Kubernetes API unavailable. Status: {}", status))
                }
                _ => Error::http(format!("Listing {} failed: {}", path, status)),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::http(format!("Failed to parse {} response: {}", path, e)))?;
        parse_list(kind, &body)
    }
}

/// Polling Kubernetes event source
pub struct KubeEventSource {
    client: Arc<KubeClient>,
    interval: Duration,
    services: bool,
    nodes: bool,
}

// Custom Debug implementation that hides the token
impl std::fmt::Debug for KubeEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventSource")
            .field("url", &self.client.url)
            .field("token", &self.client.token.as_ref().map(|_| "<REDACTED>"))
            .field("interval", &self.interval)
            .field("services", &self.services)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl KubeEventSource {
    /// Create a new source
    ///
    /// # Parameters
    ///
    /// - `url`: API server URL, e.g. `https://10.96.0.1:443`
    /// - `token`: bearer token (service account), if required
    /// - `interval`: polling interval
    /// - `services`: also report services
    /// - `nodes`: also report cluster nodes
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        interval: Duration,
        services: bool,
        nodes: bool,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client: Arc::new(KubeClient {
                url: url.into(),
                token,
                client,
            }),
            interval,
            services,
            nodes,
        })
    }

    fn kinds(&self) -> Vec<WorkloadKind> {
        let mut kinds = vec![WorkloadKind::Pod];
        if self.services {
            kinds.push(WorkloadKind::Service);
        }
        if self.nodes {
            kinds.push(WorkloadKind::Node);
        }
        kinds
    }
}

impl EventSource for KubeEventSource {
    fn subscribe(&self, after: Option<u64>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = Arc::clone(&self.client);
        let interval = self.interval;
        let kinds = self.kinds();

        tokio::spawn(async move {
            tracing::info!(
                "Starting Kubernetes polling (url={}, interval={:?}, after={:?})",
                client.url,
                interval,
                after
            );

            let mut tracker = ListTracker::new(after);

            loop {
                let mut listings = Vec::with_capacity(kinds.len());
                for &kind in &kinds {
                    match client.list(kind).await {
                        Ok(listing) => listings.push((kind, listing)),
                        Err(e) => {
                            tracing::warn!("Listing {}s failed: {}", kind, e);
                            // The subscriber resubscribes after its last resume point
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }

                for event in tracker.observe_poll(listings) {
                    if tx.send(Ok(event)).is_err() {
                        tracing::debug!("Receiver dropped, stopping Kubernetes polling");
                        return;
                    }
                }

                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            tracing::debug!("Kubernetes polling stopped");
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }

    fn source_name(&self) -> &'static str {
        "kube"
    }
}

/// Factory for creating Kubernetes event sources
pub struct KubeFactory;

impl EventSourceFactory for KubeFactory {
    fn create(&self, config: &EventSourceConfig) -> Result<Arc<dyn EventSource>> {
        match config {
            EventSourceConfig::Kube {
                url,
                token,
                interval_secs,
                services,
                nodes,
            } => Ok(Arc::new(KubeEventSource::new(
                url.clone(),
                token.clone(),
                Duration::from_secs(*interval_secs),
                *services,
                *nodes,
            )?)),
            _ => Err(Error::config("Invalid config for Kubernetes event source")),
        }
    }
}

/// Register the Kubernetes event source with a registry
pub fn register(registry: &ComponentRegistry) {
    registry.register_event_source("kube", Box::new(KubeFactory));
}
