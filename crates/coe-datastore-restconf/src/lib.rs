// # RESTCONF Datastore
//
// This crate provides a `Datastore` implementation over the config datastore
// of an SDN controller exposed through RESTCONF.
//
// ## Node Layout
//
// Every datastore node is a RESTCONF container at its path below the base
// URL, wrapping the value in an envelope that carries its revision:
//
// ```json
// { "w1": { "coe-node": { "revision": 1718000000000000, "value": { ... } } } }
// ```
//
// Revisions are microsecond timestamps, bumped past the previous revision
// when the clock lags, so they only grow for a given path.
//
// ## Transactions
//
// RESTCONF has no multi-resource transactions. A commit carries exactly one
// mutation: the node is read, the precondition checked, and the write sent
// with `If-Match` / `If-None-Match` so a controller that enforces entity tags
// rejects a lost race with 409 or 412. Both map to `Error::Conflict`.
//
// ## Change Notifications
//
// `subscribe` polls the subtree and diffs consecutive reads. A failed poll
// is reported once as an `Err` item so the subscriber resynchronizes.
//
// ## Responsibilities
//
// - No retry logic (owned by the reconciliation engine)
// - Credentials never appear in logs or `Debug` output

use async_trait::async_trait;
use coe_core::config::DatastoreConfig;
use coe_core::traits::{
    ChangeKind, ChangeNotification, ChangeStream, CommitInfo, DataPath, Datastore,
    DatastoreFactory, Mutation, Precondition, Snapshot, VersionedNode, WriteTransaction,
};
use coe_core::{ComponentRegistry, Error, Result};
use reqwest::header::{CONTENT_TYPE, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Key of the envelope object wrapping every stored value
const NODE_KEY: &str = "coe-node";

/// Default HTTP timeout for RESTCONF requests
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    revision: u64,
    value: Value,
}

/// HTTP side of the datastore, shared with polling tasks
struct RestconfClient {
    base: Url,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl RestconfClient {
    fn request(&self, method: Method, path: &DataPath) -> Result<reqwest::RequestBuilder> {
        let url = node_url(&self.base, path)?;
        Ok(self
            .client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "application/json"))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| Error::transient(format!("RESTCONF request failed: {}", e)))
    }

    /// Every node at or below `prefix`
    async fn read_subtree(&self, prefix: &DataPath) -> Result<BTreeMap<DataPath, VersionedNode>> {
        let response = self.send(self.request(Method::GET, prefix)?).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(BTreeMap::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, prefix, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::http(format!("Failed to parse RESTCONF response: {}", e)))?;
        Ok(flatten(prefix, &body))
    }

    async fn write(
        &self,
        method: Method,
        path: &DataPath,
        precondition: Precondition,
        body: Option<Value>,
    ) -> Result<()> {
        let mut request = self.request(method, path)?;
        request = match precondition {
            Precondition::Any => request,
            Precondition::Absent => request.header(IF_NONE_MATCH, "*"),
            Precondition::Version(version) => request.header(IF_MATCH, format!("\"{}\"", version)),
        };
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = self.send(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND && precondition == Precondition::Any {
            // Deleting what is already gone
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, path, &body))
    }
}

/// RESTCONF config datastore
pub struct RestconfDatastore {
    client: Arc<RestconfClient>,
    poll_interval: Duration,
}

// Custom Debug implementation that hides the password
impl std::fmt::Debug for RestconfDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestconfDatastore")
            .field("base", &self.client.base.as_str())
            .field("username", &self.client.username)
            .field("password", &"<REDACTED>")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl RestconfDatastore {
    /// Create a datastore client
    ///
    /// # Parameters
    ///
    /// - `url`: config datastore root, e.g. `http://odl:8181/restconf/config`
    /// - `username` / `password`: basic-auth credentials
    /// - `poll_interval`: change-detection cadence for subscriptions
    ///
    /// # Errors
    ///
    /// `Error::FatalConfig` if the URL does not parse or the HTTP client
    /// cannot be built.
    pub fn new(
        url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let base = Url::parse(url)
            .map_err(|e| Error::config(format!("Invalid RESTCONF URL '{}': {}", url, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::config(format!("RESTCONF URL '{}' cannot be a base", url)));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client: Arc::new(RestconfClient {
                base,
                username: username.into(),
                password: password.into(),
                client,
            }),
            poll_interval,
        })
    }
}

#[async_trait]
impl Datastore for RestconfDatastore {
    async fn read_transaction(&self, prefix: &DataPath) -> Result<Snapshot> {
        Ok(Snapshot::new(self.client.read_subtree(prefix).await?))
    }

    async fn commit(&self, tx: WriteTransaction) -> Result<CommitInfo> {
        let mut mutations = tx.into_mutations();
        let mutation = match mutations.len() {
            0 => {
                return Ok(CommitInfo {
                    revision: 0,
                    versions: BTreeMap::new(),
                });
            }
            1 => mutations.remove(0),
            n => {
                return Err(Error::datastore(format!(
                    "RESTCONF commits carry one mutation, got {}",
                    n
                )));
            }
        };

        let path = mutation.path().clone();
        let current = self.client.read_subtree(&path).await?.remove(&path);
        check_precondition(&path, mutation.precondition(), current.as_ref())?;

        match mutation {
            Mutation::Put {
                value,
                precondition,
                ..
            } => {
                let revision = next_revision(current.as_ref());
                let body = envelope_body(&path, revision, value)?;
                tracing::debug!("PUT {} (revision {})", path, revision);
                self.client
                    .write(Method::PUT, &path, precondition, Some(body))
                    .await?;

                Ok(CommitInfo {
                    revision,
                    versions: BTreeMap::from([(path, Some(revision))]),
                })
            }
            Mutation::Delete { precondition, .. } => {
                let Some(node) = current else {
                    return Ok(CommitInfo {
                        revision: 0,
                        versions: BTreeMap::from([(path, None)]),
                    });
                };
                tracing::debug!("DELETE {} (revision {})", path, node.version);
                self.client
                    .write(Method::DELETE, &path, precondition, None)
                    .await?;

                Ok(CommitInfo {
                    revision: node.version + 1,
                    versions: BTreeMap::from([(path, None)]),
                })
            }
        }
    }

    fn subscribe(&self, prefix: &DataPath) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::clone(&self.client);
        let prefix = prefix.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            tracing::info!(
                "Polling RESTCONF subtree {} every {:?}",
                prefix,
                poll_interval
            );

            let mut known: Option<BTreeMap<DataPath, VersionedNode>> = None;
            let mut failing = false;

            loop {
                match client.read_subtree(&prefix).await {
                    Ok(nodes) => {
                        if let Some(previous) = &known {
                            for change in diff(previous, &nodes) {
                                if tx.send(Ok(change)).is_err() {
                                    return;
                                }
                            }
                        }
                        known = Some(nodes);
                        failing = false;
                    }
                    Err(e) => {
                        tracing::warn!("RESTCONF poll of {} failed: {}", prefix, e);
                        if !failing && tx.send(Err(e)).is_err() {
                            return;
                        }
                        failing = true;
                    }
                }

                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }

            tracing::debug!("RESTCONF poller for {} stopped", prefix);
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }

    fn datastore_name(&self) -> &'static str {
        "restconf"
    }
}

/// URL of the RESTCONF resource at `path`, one URL segment per path segment
fn node_url(base: &Url, path: &DataPath) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::config(format!("RESTCONF URL '{}' cannot be a base", base)))?
        .pop_if_empty()
        .extend(path.segments());
    Ok(url)
}

/// Request body storing `value` at `path`
fn envelope_body(path: &DataPath, revision: u64, value: Value) -> Result<Value> {
    let name = path
        .segments()
        .last()
        .ok_or_else(|| Error::datastore("cannot write the datastore root"))?;

    let envelope = serde_json::to_value(Envelope { revision, value })?;
    let mut node = Map::new();
    node.insert(NODE_KEY.to_string(), envelope);
    let mut body = Map::new();
    body.insert(name.to_string(), Value::Object(node));
    Ok(Value::Object(body))
}

/// Collect the envelopes of a RESTCONF subtree response into datastore nodes
///
/// A node whose envelope does not parse is kept with its raw body as the
/// value, so the engine sees it as undecodable and cleans it up instead of
/// the whole read failing.
fn flatten(prefix: &DataPath, body: &Value) -> BTreeMap<DataPath, VersionedNode> {
    // RESTCONF wraps the target resource in an object keyed by its name
    let root = match (prefix.segments().last(), body) {
        (Some(name), Value::Object(map)) if map.len() == 1 && map.contains_key(name) => &map[name],
        _ => body,
    };

    let mut nodes = BTreeMap::new();
    collect(prefix, root, &mut nodes);
    nodes
}

fn collect(path: &DataPath, value: &Value, nodes: &mut BTreeMap<DataPath, VersionedNode>) {
    let Value::Object(map) = value else {
        return;
    };

    for (key, child) in map {
        if key == NODE_KEY {
            nodes.insert(path.clone(), decode_envelope(path, child));
        } else {
            collect(&path.child(key), child, nodes);
        }
    }
}

fn decode_envelope(path: &DataPath, envelope: &Value) -> VersionedNode {
    match serde_json::from_value::<Envelope>(envelope.clone()) {
        Ok(envelope) => VersionedNode {
            value: envelope.value,
            version: envelope.revision,
        },
        Err(e) => {
            tracing::warn!("Malformed node envelope at {}: {}", path, e);
            VersionedNode {
                value: envelope.clone(),
                version: envelope
                    .get("revision")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            }
        }
    }
}

/// Changes between two consecutive polls
fn diff(
    previous: &BTreeMap<DataPath, VersionedNode>,
    current: &BTreeMap<DataPath, VersionedNode>,
) -> Vec<ChangeNotification> {
    let mut changes = Vec::new();

    for (path, node) in current {
        let kind = match previous.get(path) {
            None => ChangeKind::Added,
            Some(old) if old != node => ChangeKind::Updated,
            Some(_) => continue,
        };
        changes.push(ChangeNotification {
            path: path.clone(),
            kind,
            value: Some(node.value.clone()),
            version: node.version,
        });
    }

    for (path, node) in previous {
        if !current.contains_key(path) {
            changes.push(ChangeNotification {
                path: path.clone(),
                kind: ChangeKind::Removed,
                value: None,
                version: node.version + 1,
            });
        }
    }

    changes
}

fn check_precondition(
    path: &DataPath,
    precondition: Precondition,
    current: Option<&VersionedNode>,
) -> Result<()> {
    let satisfied = match (precondition, current) {
        (Precondition::Any, _) => true,
        (Precondition::Absent, None) => true,
        (Precondition::Version(expected), Some(node)) => node.version == expected,
        _ => false,
    };

    if satisfied {
        Ok(())
    } else {
        Err(Error::conflict(
            path,
            format!(
                "precondition {:?} failed (current revision {:?})",
                precondition,
                current.map(|node| node.version)
            ),
        ))
    }
}

fn next_revision(current: Option<&VersionedNode>) -> u64 {
    let now = u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0);
    current.map_or(now, |node| now.max(node.version + 1))
}

/// Map a RESTCONF error status to the engine's error taxonomy
fn status_error(status: StatusCode, path: &DataPath, body: &str) -> Error {
    match status.as_u16() {
        409 | 412 => Error::conflict(path, format!("controller rejected write ({})", status)),
        401 | 403 => Error::datastore(format!(
            "Authentication failed: invalid credentials or insufficient permissions. Status: {}",
            status
        )),
        404 => Error::not_found(format!("RESTCONF resource not found: {}", path)),
        408 | 429 | 500..=599 => {
            Error::transient(format!("Controller unavailable ({}): {}", status, body))
        }
        _ => Error::http(format!("RESTCONF request on {} failed: {} - {}", path, status, body)),
    }
}

/// Factory for creating RESTCONF datastores
pub struct RestconfDatastoreFactory;

impl DatastoreFactory for RestconfDatastoreFactory {
    fn create(&self, config: &DatastoreConfig) -> Result<Arc<dyn Datastore>> {
        match config {
            DatastoreConfig::Restconf {
                url,
                username,
                password,
                poll_interval_secs,
            } => {
                if username.is_empty() {
                    return Err(Error::config("RESTCONF username is required"));
                }
                Ok(Arc::new(RestconfDatastore::new(
                    url,
                    username.clone(),
                    password.clone(),
                    Duration::from_secs(*poll_interval_secs),
                )?))
            }
            _ => Err(Error::config("Invalid config for RESTCONF datastore")),
        }
    }
}

/// Register the RESTCONF datastore with a registry
///
/// # Example
///
/// ```rust
/// use coe_core::ComponentRegistry;
///
/// let registry = ComponentRegistry::with_builtins();
/// coe_datastore_restconf::register(&registry);
/// assert!(registry.has_datastore("restconf"));
/// ```
pub fn register(registry: &ComponentRegistry) {
    registry.register_datastore("restconf", Box::new(RestconfDatastoreFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use coe_core::model::StoredBinding;
    use serde_json::json;

    fn datastore(url: &str) -> RestconfDatastore {
        RestconfDatastore::new(url, "admin", "secret-password", Duration::from_secs(1)).unwrap()
    }

    fn node(version: u64, value: Value) -> VersionedNode {
        VersionedNode { value, version }
    }

    #[test]
    fn test_node_url_encodes_segments() {
        let base = Url::parse("http://odl:8181/restconf/config/").unwrap();
        let url = node_url(&base, &DataPath::new("coe/bindings/pod/a/w 1")).unwrap();

        assert_eq!(
            url.as_str(),
            "http://odl:8181/restconf/config/coe/bindings/pod/a/w%201"
        );
    }

    #[test]
    fn test_flatten_unwraps_and_collects_envelopes() {
        let prefix = DataPath::new("coe/bindings");
        let body = json!({
            "bindings": {
                "pod": {
                    "a": {
                        "w1": { "coe-node": { "revision": 7, "value": { "x": 1 } } },
                        "w2": { "coe-node": { "revision": 9, "value": { "x": 2 } } }
                    }
                }
            }
        });

        let nodes = flatten(&prefix, &body);
        assert_eq!(nodes.len(), 2);
        assert_eq!(
            nodes.get(&DataPath::new("coe/bindings/pod/a/w1")),
            Some(&node(7, json!({ "x": 1 })))
        );
    }

    #[test]
    fn test_flatten_keeps_siblings_of_malformed_envelope() {
        let prefix = DataPath::new("coe/bindings");
        let body = json!({
            "bindings": {
                "pod": {
                    "a": {
                        "good": { "coe-node": { "revision": 7, "value": { "x": 1 } } },
                        "bad": { "coe-node": { "value": { "x": 2 } } }
                    }
                }
            }
        });

        let nodes = flatten(&prefix, &body);
        assert_eq!(nodes.len(), 2);
        assert_eq!(
            nodes.get(&DataPath::new("coe/bindings/pod/a/good")),
            Some(&node(7, json!({ "x": 1 })))
        );

        // Surfaced raw so the engine treats it as an undecodable binding
        let bad = nodes.get(&DataPath::new("coe/bindings/pod/a/bad")).unwrap();
        assert_eq!(bad.version, 0);
        assert_eq!(bad.value, json!({ "value": { "x": 2 } }));
        assert!(StoredBinding::from_value(&bad.value).is_err());
    }

    #[test]
    fn test_envelope_body_roundtrips_through_flatten() {
        let path = DataPath::new("coe/bindings/pod/a/w1");
        let body = envelope_body(&path, 42, json!({ "ip": "10.0.0.5" })).unwrap();

        let nodes = flatten(&path, &body);
        assert_eq!(nodes.get(&path), Some(&node(42, json!({ "ip": "10.0.0.5" }))));
    }

    #[test]
    fn test_diff_reports_added_updated_removed() {
        let a = DataPath::new("coe/bindings/pod/a/a");
        let b = DataPath::new("coe/bindings/pod/a/b");
        let c = DataPath::new("coe/bindings/pod/a/c");

        let previous = BTreeMap::from([(a.clone(), node(1, json!(1))), (b.clone(), node(1, json!(1)))]);
        let current = BTreeMap::from([(a.clone(), node(1, json!(1))), (b.clone(), node(2, json!(2))), (c.clone(), node(3, json!(3)))]);

        let changes = diff(&previous, &current);
        let kinds: Vec<_> = changes.iter().map(|c| (c.path.clone(), c.kind)).collect();
        assert_eq!(kinds, vec![(b.clone(), ChangeKind::Updated), (c, ChangeKind::Added)]);

        let removed = diff(&current, &previous);
        let gone = removed.iter().find(|c| c.kind == ChangeKind::Removed).unwrap();
        assert_eq!(gone.version, 4);
        assert!(gone.value.is_none());
    }

    #[test]
    fn test_status_mapping() {
        let path = DataPath::new("coe/bindings/pod/a/w1");

        assert!(status_error(StatusCode::PRECONDITION_FAILED, &path, "").is_retryable());
        assert!(status_error(StatusCode::CONFLICT, &path, "").is_retryable());
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, &path, "").is_retryable());
        assert!(!status_error(StatusCode::UNAUTHORIZED, &path, "").is_retryable());
        assert!(!status_error(StatusCode::BAD_REQUEST, &path, "").is_retryable());
    }

    #[test]
    fn test_precondition_check() {
        let path = DataPath::new("coe/bindings/pod/a/w1");
        let existing = node(5, json!({}));

        assert!(check_precondition(&path, Precondition::Absent, None).is_ok());
        assert!(check_precondition(&path, Precondition::Version(5), Some(&existing)).is_ok());
        assert!(matches!(
            check_precondition(&path, Precondition::Version(4), Some(&existing)),
            Err(Error::Conflict { .. })
        ));
        assert!(matches!(
            check_precondition(&path, Precondition::Absent, Some(&existing)),
            Err(Error::Conflict { .. })
        ));
    }

    #[test]
    fn test_revisions_only_grow() {
        let far_future = node(u64::MAX / 2, json!({}));
        assert_eq!(next_revision(Some(&far_future)), u64::MAX / 2 + 1);
        assert!(next_revision(None) > 0);
    }

    #[test]
    fn test_password_not_exposed_in_debug() {
        let debug_str = format!("{:?}", datastore("http://odl:8181/restconf/config"));

        assert!(!debug_str.contains("secret-password"));
        assert!(debug_str.contains("RestconfDatastore"));
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = RestconfDatastore::new("not a url", "admin", "admin", Duration::from_secs(1));
        assert!(matches!(result, Err(Error::FatalConfig(_))));
    }

    #[test]
    fn test_factory_creation() {
        let factory = RestconfDatastoreFactory;
        let config = DatastoreConfig::Restconf {
            url: "http://odl:8181/restconf/config".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            poll_interval_secs: 5,
        };

        let datastore = factory.create(&config).unwrap();
        assert_eq!(datastore.datastore_name(), "restconf");
        assert!(factory.create(&DatastoreConfig::Memory).is_err());
    }

    #[tokio::test]
    async fn test_multi_mutation_commit_is_rejected() {
        let datastore = datastore("http://127.0.0.1:1/restconf/config");
        let mut tx = datastore.write_transaction();
        tx.put(DataPath::new("coe/a"), json!(1), Precondition::Any)
            .put(DataPath::new("coe/b"), json!(2), Precondition::Any);

        assert!(matches!(datastore.commit(tx).await, Err(Error::Datastore(_))));
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_transient() {
        let datastore = datastore("http://127.0.0.1:1/restconf/config");

        let err = datastore
            .read_transaction(&DataPath::new("coe/bindings"))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "expected transient error, got {}", err);
    }
}
