// # coed - COE Reconciler Daemon
//
// Thin integration layer: configuration, runtime, backend registration and
// signal handling. All reconciliation logic lives in coe-core.
//
// The daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing tracing and the runtime
// 3. Registering datastore and event source backends
// 4. Starting the COE service and stopping it on SIGTERM/SIGINT
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Datastore
// - `COE_DATASTORE_TYPE`: restconf, memory
// - `COE_DATASTORE_URL`: RESTCONF config base URL
// - `COE_DATASTORE_USERNAME` / `COE_DATASTORE_PASSWORD`: basic-auth credentials
// - `COE_DATASTORE_POLL_INTERVAL`: change polling interval in seconds
//
// ### Event Source
// - `COE_SOURCE_TYPE`: kube, memory
// - `COE_SOURCE_URL`: Kubernetes API server URL
// - `COE_SOURCE_TOKEN`: bearer token (optional)
// - `COE_SOURCE_INTERVAL`: polling interval in seconds
// - `COE_SOURCE_SERVICES`: also reconcile services (default true)
// - `COE_SOURCE_NODES`: also register cluster nodes (default true)
//
// ### Checkpoint
// - `COE_CHECKPOINT_TYPE`: file, memory
// - `COE_CHECKPOINT_PATH`: checkpoint file (for file)
//
// ### Translation
// - `COE_NETWORK_TYPE`: flat, vlan, vxlan
// - `COE_NETWORK_ID`: network id written into bindings
// - `COE_SEGMENTATION_ID`: default VLAN id / VNI
// - `COE_NAMESPACE_SEGMENTS`: per-namespace overrides, `ns=id,ns=id`
// - `COE_POLICY_LABEL`: label listing policies for an endpoint
// - `COE_ISOLATE_NAMESPACES`: attach `isolate-<namespace>` policies
// - `COE_IPV4_ONLY`: reject IPv6 endpoints
//
// ### Engine
// - `COE_BINDINGS_PREFIX`: datastore subtree holding the bindings
// - `COE_MAX_ATTEMPTS`: write attempts before an entry is marked failed
// - `COE_RETRY_BASE_DELAY_MS` / `COE_RETRY_MAX_DELAY_MS`: backoff bounds
// - `COE_SHUTDOWN_GRACE_MS`: drain time allowed on stop
// - `COE_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export COE_DATASTORE_TYPE=restconf
// export COE_DATASTORE_URL=http://odl:8181/restconf/config
// export COE_DATASTORE_USERNAME=admin
// export COE_DATASTORE_PASSWORD=admin
// export COE_SOURCE_TYPE=kube
// export COE_SOURCE_URL=https://10.96.0.1:443
// export COE_CHECKPOINT_TYPE=file
// export COE_CHECKPOINT_PATH=/var/lib/coe/checkpoint.json
//
// coed
// ```

use anyhow::{Context, Result};
use coe_core::{
    CheckpointConfig, CoeConfig, CoeService, ComponentRegistry, DatastoreConfig, EngineConfig,
    EngineEvent, EventSourceConfig, NetworkType, TranslatorConfig,
};
use std::collections::BTreeMap;
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum CoeExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<CoeExitCode> for ExitCode {
    fn from(code: CoeExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration: the service configuration plus process settings
#[derive(Debug)]
struct Config {
    coe: CoeConfig,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from a variable lookup
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let datastore = match var("COE_DATASTORE_TYPE").as_deref().unwrap_or("restconf") {
            "memory" => DatastoreConfig::Memory,
            "restconf" => DatastoreConfig::Restconf {
                url: var("COE_DATASTORE_URL")
                    .context("COE_DATASTORE_URL is required when COE_DATASTORE_TYPE=restconf")?,
                username: var("COE_DATASTORE_USERNAME").unwrap_or_else(|| "admin".to_string()),
                password: var("COE_DATASTORE_PASSWORD").unwrap_or_default(),
                poll_interval_secs: parse_or(&var, "COE_DATASTORE_POLL_INTERVAL", 5)?,
            },
            other => anyhow::bail!(
                "COE_DATASTORE_TYPE '{}' is not supported. Supported types: restconf, memory",
                other
            ),
        };

        let event_source = match var("COE_SOURCE_TYPE").as_deref().unwrap_or("kube") {
            "memory" => EventSourceConfig::Memory,
            "kube" => EventSourceConfig::Kube {
                url: var("COE_SOURCE_URL")
                    .context("COE_SOURCE_URL is required when COE_SOURCE_TYPE=kube")?,
                token: var("COE_SOURCE_TOKEN"),
                interval_secs: parse_or(&var, "COE_SOURCE_INTERVAL", 10)?,
                services: parse_or(&var, "COE_SOURCE_SERVICES", true)?,
                nodes: parse_or(&var, "COE_SOURCE_NODES", true)?,
            },
            other => anyhow::bail!(
                "COE_SOURCE_TYPE '{}' is not supported. Supported types: kube, memory",
                other
            ),
        };

        let checkpoint = match var("COE_CHECKPOINT_TYPE").as_deref().unwrap_or("file") {
            "memory" => CheckpointConfig::Memory,
            "file" => CheckpointConfig::File {
                path: var("COE_CHECKPOINT_PATH")
                    .unwrap_or_else(|| "/var/lib/coe/checkpoint.json".to_string()),
            },
            other => anyhow::bail!(
                "COE_CHECKPOINT_TYPE '{}' is not supported. Supported types: file, memory",
                other
            ),
        };

        let defaults = TranslatorConfig::default();
        let translator = TranslatorConfig {
            network_type: match var("COE_NETWORK_TYPE") {
                Some(value) => parse_network_type(&value)?,
                None => defaults.network_type,
            },
            network_id: var("COE_NETWORK_ID").unwrap_or(defaults.network_id),
            segmentation_id: parse_or(&var, "COE_SEGMENTATION_ID", 0)?,
            namespace_segments: match var("COE_NAMESPACE_SEGMENTS") {
                Some(value) => parse_namespace_segments(&value)?,
                None => BTreeMap::new(),
            },
            policy_label: var("COE_POLICY_LABEL").unwrap_or(defaults.policy_label),
            isolate_namespaces: parse_or(&var, "COE_ISOLATE_NAMESPACES", false)?,
            ipv4_only: parse_or(&var, "COE_IPV4_ONLY", false)?,
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            bindings_prefix: var("COE_BINDINGS_PREFIX").unwrap_or(defaults.bindings_prefix),
            max_attempts: parse_or(&var, "COE_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_base_delay_ms: parse_or(
                &var,
                "COE_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            retry_max_delay_ms: parse_or(
                &var,
                "COE_RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay_ms,
            )?,
            shutdown_grace_ms: parse_or(&var, "COE_SHUTDOWN_GRACE_MS", defaults.shutdown_grace_ms)?,
            ..defaults
        };

        Ok(Self {
            coe: CoeConfig {
                datastore,
                event_source,
                checkpoint,
                translator,
                engine,
            },
            log_level: var("COE_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    ///
    /// Library-level checks come from `CoeConfig::validate`; this adds the
    /// checks that only make sense for a deployed daemon.
    fn validate(&self) -> Result<()> {
        self.coe.validate()?;

        if let DatastoreConfig::Restconf {
            url, password, ..
        } = &self.coe.datastore
        {
            if password.is_empty() {
                anyhow::bail!(
                    "COE_DATASTORE_PASSWORD is required when COE_DATASTORE_TYPE=restconf"
                );
            }
            if url.starts_with("http://") {
                eprintln!(
                    "WARNING: COE_DATASTORE_URL uses HTTP (not HTTPS). \
                    Controller credentials are sent in clear text."
                );
            }
        }

        if let EventSourceConfig::Kube { url, .. } = &self.coe.event_source
            && !url.starts_with("https://")
            && !url.starts_with("http://")
        {
            anyhow::bail!("COE_SOURCE_URL must use HTTP or HTTPS scheme. Got: {}", url);
        }

        if let CheckpointConfig::File { path } = &self.coe.checkpoint
            && let Some(parent) = std::path::Path::new(path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            anyhow::bail!(
                "COE_CHECKPOINT_PATH parent directory does not exist: {}. \
                Create it first: sudo mkdir -p {}",
                parent.display(),
                parent.display()
            );
        }

        parse_log_level(&self.log_level)?;
        Ok(())
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", key, value, e)),
        None => Ok(default),
    }
}

fn parse_network_type(value: &str) -> Result<NetworkType> {
    match value.to_lowercase().as_str() {
        "flat" => Ok(NetworkType::Flat),
        "vlan" => Ok(NetworkType::Vlan),
        "vxlan" => Ok(NetworkType::Vxlan),
        _ => anyhow::bail!(
            "COE_NETWORK_TYPE '{}' is not valid. Valid types: flat, vlan, vxlan",
            value
        ),
    }
}

fn parse_namespace_segments(value: &str) -> Result<BTreeMap<String, u32>> {
    let mut segments = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (namespace, id) = pair.split_once('=').with_context(|| {
            format!("COE_NAMESPACE_SEGMENTS entry '{}' must be namespace=id", pair)
        })?;
        let id = id
            .trim()
            .parse()
            .with_context(|| format!("COE_NAMESPACE_SEGMENTS entry '{}' has an invalid id", pair))?;
        segments.insert(namespace.trim().to_string(), id);
    }
    Ok(segments)
}

fn parse_log_level(value: &str) -> Result<Level> {
    match value.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "COE_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            value
        ),
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return CoeExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return CoeExitCode::ConfigError.into();
    }

    let log_level = parse_log_level(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return CoeExitCode::ConfigError.into();
    }

    info!("Starting coed daemon");
    info!(
        "Datastore: {}, event source: {}, checkpoint: {}",
        config.coe.datastore.type_name(),
        config.coe.event_source.type_name(),
        config.coe.checkpoint.type_name()
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CoeExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        match run_daemon(config).await {
            Ok(()) => CoeExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {:#}", e);
                CoeExitCode::RuntimeError
            }
        }
    });

    result.into()
}

/// Run the daemon until a shutdown signal arrives
async fn run_daemon(config: Config) -> Result<()> {
    let registry = ComponentRegistry::with_builtins();

    #[cfg(feature = "restconf")]
    {
        info!("Registering RESTCONF datastore");
        coe_datastore_restconf::register(&registry);
    }

    #[cfg(feature = "kube")]
    {
        info!("Registering Kubernetes event source");
        coe_source_kube::register(&registry);
    }

    let datastore = registry
        .create_datastore(&config.coe.datastore)
        .context("Failed to create datastore")?;
    let source = registry
        .create_event_source(&config.coe.event_source)
        .context("Failed to create event source")?;
    let checkpoints = registry
        .create_checkpoint_store(&config.coe.checkpoint)
        .await
        .context("Failed to create checkpoint store")?;

    let service = CoeService::new(datastore, source, checkpoints, config.coe);
    service.start().await.context("Failed to start COE service")?;

    let logger = service.take_events().map(|events| tokio::spawn(log_events(events)));

    info!("Daemon initialized successfully");

    let signal = wait_for_shutdown().await?;
    info!("Received shutdown signal: {}", signal);

    let report = service.stop().await;
    info!(
        "COE service stopped: {} task(s) drained, {} discarded",
        report.processed, report.discarded
    );

    if let Some(logger) = logger
        && let Err(e) = logger.await
    {
        warn!("Event logger ended abnormally: {}", e);
    }

    Ok(())
}

/// Log engine events until the engine closes the channel
async fn log_events(mut events: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Started { entries } => {
                info!("Engine started with {} binding(s) rehydrated", entries)
            }
            EngineEvent::Quarantined { id, reason } => warn!("{} quarantined: {}", id, reason),
            EngineEvent::TaskFailed {
                id,
                error,
                attempts,
            } => error!("{} failed after {} attempt(s): {}", id, attempts, error),
            EngineEvent::DriftDetected { id } => warn!("Drift detected on {}", id),
            EngineEvent::OrphanRemoved { id } => info!("Removed orphan binding {}", id),
            EngineEvent::TaskDiscarded { id, action } => {
                warn!("Discarded {} task for {} at shutdown", action, id)
            }
            other => debug!("{:?}", other),
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    fn memory_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            ("COE_DATASTORE_TYPE", "memory"),
            ("COE_SOURCE_TYPE", "memory"),
            ("COE_CHECKPOINT_TYPE", "memory"),
        ]
    }

    #[test]
    fn test_memory_config_is_valid() {
        let config = config_from(&memory_vars()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.coe.engine.bindings_prefix, "coe/bindings");
    }

    #[test]
    fn test_restconf_requires_url() {
        let err = config_from(&[("COE_SOURCE_TYPE", "memory")]).unwrap_err();
        assert!(err.to_string().contains("COE_DATASTORE_URL"));
    }

    #[test]
    fn test_restconf_requires_password() {
        let mut vars = memory_vars();
        vars[0] = ("COE_DATASTORE_TYPE", "restconf");
        vars.push(("COE_DATASTORE_URL", "https://odl:8181/restconf/config"));
        let config = config_from(&vars).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_types_rejected() {
        assert!(config_from(&[("COE_DATASTORE_TYPE", "etcd")]).is_err());
        let mut vars = memory_vars();
        vars[1] = ("COE_SOURCE_TYPE", "mesos");
        assert!(config_from(&vars).is_err());
    }

    #[test]
    fn test_translation_settings() {
        let mut vars = memory_vars();
        vars.extend([
            ("COE_NETWORK_TYPE", "VXLAN"),
            ("COE_SEGMENTATION_ID", "100"),
            ("COE_NAMESPACE_SEGMENTS", "a=2001, b=2002"),
            ("COE_ISOLATE_NAMESPACES", "true"),
        ]);
        let config = config_from(&vars).unwrap();
        config.validate().unwrap();

        let translator = &config.coe.translator;
        assert_eq!(translator.network_type, NetworkType::Vxlan);
        assert_eq!(translator.segmentation_id, 100);
        assert_eq!(translator.namespace_segments.get("b"), Some(&2002));
        assert!(translator.isolate_namespaces);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut vars = memory_vars();
        vars.push(("COE_MAX_ATTEMPTS", "many"));
        assert!(config_from(&vars).is_err());

        let mut vars = memory_vars();
        vars.push(("COE_NAMESPACE_SEGMENTS", "a:2001"));
        assert!(config_from(&vars).is_err());

        let mut vars = memory_vars();
        vars.push(("COE_LOG_LEVEL", "loud"));
        assert!(config_from(&vars).unwrap().validate().is_err());
    }

    #[test]
    fn test_flat_network_rejects_segment() {
        let mut vars = memory_vars();
        vars.push(("COE_SEGMENTATION_ID", "10"));
        assert!(config_from(&vars).unwrap().validate().is_err());
    }

    #[test]
    fn test_kube_source_kinds() {
        let mut vars = memory_vars();
        vars[1] = ("COE_SOURCE_TYPE", "kube");
        vars.extend([
            ("COE_SOURCE_URL", "https://10.96.0.1:443"),
            ("COE_SOURCE_NODES", "false"),
        ]);
        let config = config_from(&vars).unwrap();

        match config.coe.event_source {
            EventSourceConfig::Kube {
                services, nodes, ..
            } => {
                assert!(services);
                assert!(!nodes);
            }
            other => panic!("expected kube source, got {:?}", other),
        }
    }
}
