//! Configuration types for the COE reconciler
//!
//! This module defines all configuration structures used throughout the crate.

use crate::model::NetworkType;
use crate::traits::datastore::DataPath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main COE configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoeConfig {
    /// Datastore backend configuration
    #[serde(default)]
    pub datastore: DatastoreConfig,

    /// Orchestration event source configuration
    #[serde(default)]
    pub event_source: EventSourceConfig,

    /// Checkpoint store configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Workload → binding translation settings
    #[serde(default)]
    pub translator: TranslatorConfig,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl CoeConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    ///
    /// Every failure is an `Error::FatalConfig`, which makes `start()` fail.
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.datastore.validate()?;
        self.event_source.validate()?;
        self.checkpoint.validate()?;
        self.translator.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// Datastore backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatastoreConfig {
    /// In-process datastore (testing, dry runs)
    #[default]
    Memory,

    /// RESTCONF config datastore of an SDN controller
    Restconf {
        /// Base URL, e.g. `http://odl:8181/restconf/config`
        url: String,
        /// Basic-auth user
        username: String,
        /// Basic-auth password
        password: String,
        /// Change-detection polling interval in seconds
        poll_interval_secs: u64,
    },

    /// Custom datastore
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl DatastoreConfig {
    /// Validate the datastore configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            DatastoreConfig::Memory => Ok(()),
            DatastoreConfig::Restconf {
                url,
                poll_interval_secs,
                ..
            } => {
                if url.is_empty() {
                    return Err(crate::Error::config("RESTCONF URL cannot be empty"));
                }
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(crate::Error::config(format!(
                        "RESTCONF URL must use http or https: {}",
                        url
                    )));
                }
                if *poll_interval_secs == 0 {
                    return Err(crate::Error::config("RESTCONF poll interval must be > 0"));
                }
                Ok(())
            }
            DatastoreConfig::Custom { factory, .. } => {
                if factory.is_empty() {
                    return Err(crate::Error::config("Custom datastore factory cannot be empty"));
                }
                Ok(())
            }
        }
    }

    /// Get the datastore type name
    pub fn type_name(&self) -> &str {
        match self {
            DatastoreConfig::Memory => "memory",
            DatastoreConfig::Restconf { .. } => "restconf",
            DatastoreConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Orchestration event source configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventSourceConfig {
    /// In-process feed (testing, embedding)
    #[default]
    Memory,

    /// Kubernetes API server polling
    Kube {
        /// API server URL, e.g. `https://10.96.0.1:443`
        url: String,
        /// Bearer token (optional)
        token: Option<String>,
        /// Polling interval in seconds
        interval_secs: u64,
        /// Also watch services
        #[serde(default = "default_true")]
        services: bool,
        /// Also register cluster nodes
        #[serde(default = "default_true")]
        nodes: bool,
    },

    /// Custom event source
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl EventSourceConfig {
    /// Validate the event source configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            EventSourceConfig::Memory => Ok(()),
            EventSourceConfig::Kube {
                url, interval_secs, ..
            } => {
                if url.is_empty() {
                    return Err(crate::Error::config("Kubernetes API URL cannot be empty"));
                }
                if *interval_secs == 0 {
                    return Err(crate::Error::config("Kubernetes polling interval must be > 0"));
                }
                Ok(())
            }
            EventSourceConfig::Custom { factory, .. } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom event source factory cannot be empty",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Get the event source type name
    pub fn type_name(&self) -> &str {
        match self {
            EventSourceConfig::Memory => "memory",
            EventSourceConfig::Kube { .. } => "kube",
            EventSourceConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Checkpoint store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointConfig {
    /// File-based checkpoint store
    File {
        /// Path to the checkpoint file
        path: String,
    },

    /// In-memory checkpoint store (not persistent)
    #[default]
    Memory,

    /// Custom checkpoint store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl CheckpointConfig {
    /// Validate the checkpoint configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            CheckpointConfig::File { path } if path.is_empty() => {
                Err(crate::Error::config("Checkpoint file path cannot be empty"))
            }
            CheckpointConfig::Custom { factory, .. } if factory.is_empty() => Err(
                crate::Error::config("Custom checkpoint store factory cannot be empty"),
            ),
            _ => Ok(()),
        }
    }

    /// Get the checkpoint store type name
    pub fn type_name(&self) -> &str {
        match self {
            CheckpointConfig::File { .. } => "file",
            CheckpointConfig::Memory => "memory",
            CheckpointConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Translation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    /// Overlay network type for every binding
    #[serde(default = "default_network_type")]
    pub network_type: NetworkType,

    /// Network id written into address bindings
    #[serde(default = "default_network_id")]
    pub network_id: String,

    /// Default segmentation id (VLAN id / VNI)
    #[serde(default)]
    pub segmentation_id: u32,

    /// Per-namespace segmentation id overrides
    #[serde(default)]
    pub namespace_segments: BTreeMap<String, u32>,

    /// Label whose comma-separated value lists policies for the endpoint
    #[serde(default = "default_policy_label")]
    pub policy_label: String,

    /// Attach an `isolate-<namespace>` policy to every binding
    #[serde(default)]
    pub isolate_namespaces: bool,

    /// Reject IPv6 endpoint addresses
    #[serde(default)]
    pub ipv4_only: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            network_type: default_network_type(),
            network_id: default_network_id(),
            segmentation_id: 0,
            namespace_segments: BTreeMap::new(),
            policy_label: default_policy_label(),
            isolate_namespaces: false,
            ipv4_only: false,
        }
    }
}

impl TranslatorConfig {
    /// Validate the translator configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.network_id.is_empty() {
            return Err(crate::Error::config("Network id cannot be empty"));
        }
        if self.policy_label.is_empty() {
            return Err(crate::Error::config("Policy label cannot be empty"));
        }

        let max = self.network_type.max_segmentation_id();
        let segments = std::iter::once(("<default>", &self.segmentation_id)).chain(
            self.namespace_segments
                .iter()
                .map(|(namespace, id)| (namespace.as_str(), id)),
        );
        for (scope, id) in segments {
            if *id > max {
                return Err(crate::Error::config(format!(
                    "Segmentation id {} for {} exceeds {} for {:?} networks",
                    id, scope, max, self.network_type
                )));
            }
        }

        Ok(())
    }
}

fn default_network_type() -> NetworkType {
    NetworkType::Flat
}

fn default_network_id() -> String {
    "00000000-0000-0000-0000-000000000000".to_string()
}

fn default_policy_label() -> String {
    "coe.opendaylight.org/policies".to_string()
}

fn default_true() -> bool {
    true
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Datastore subtree holding the bindings
    #[serde(default = "default_bindings_prefix")]
    pub bindings_prefix: String,

    /// Write attempts per task before the entry is marked `Error`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay, doubled after every failed attempt
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single backoff delay
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Capacity of the engine inbox shared by both providers
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    /// Capacity of the engine event channel
    ///
    /// When full, new engine events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Time allowed for draining queued tasks on stop
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Delay before the northbound provider resubscribes a broken feed
    #[serde(default = "default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bindings_prefix: default_bindings_prefix(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            inbox_capacity: default_inbox_capacity(),
            event_channel_capacity: default_event_channel_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            resubscribe_delay_ms: default_resubscribe_delay_ms(),
        }
    }
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if DataPath::new(&self.bindings_prefix).as_str().is_empty() {
            return Err(crate::Error::config("Bindings prefix cannot be empty"));
        }
        if self.max_attempts == 0 {
            return Err(crate::Error::config("max_attempts must be > 0"));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(crate::Error::config(
                "retry_max_delay_ms must be >= retry_base_delay_ms",
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(crate::Error::config("inbox_capacity must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("event_channel_capacity must be > 0"));
        }
        Ok(())
    }

    pub fn bindings_root(&self) -> DataPath {
        DataPath::new(&self.bindings_prefix)
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

fn default_bindings_prefix() -> String {
    "coe/bindings".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_inbox_capacity() -> usize {
    1024
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_resubscribe_delay_ms() -> u64 {
    1_000
}
