//! Configuration reader seam and recognised options
//!
//! The core never reads files or environment on its own; a [`ConfigReader`]
//! is injected by the caller. Typed accessors on [`Config`] apply the
//! documented defaults when a key is absent or unparsable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Namespace scope for discovery; empty means all namespaces
pub const DISCOVERY_NAMESPACE: &str = "discovery.namespace";

/// Target contract for an upgrade apply
pub const UPGRADE_CONTRACT: &str = "upgrade.contract";

/// Instance name of the core provider driving an upgrade apply
pub const UPGRADE_CORE_PROVIDER: &str = "upgrade.coreProvider";

/// Namespace scope for a move; empty means all namespaces
pub const MOVE_NAMESPACE: &str = "move.namespace";

/// Kubeconfig for the move destination
pub const MOVE_TO_KUBECONFIG: &str = "move.toKubeconfig";

/// Kubeconfig for the move source
pub const MOVE_FROM_KUBECONFIG: &str = "move.fromKubeconfig";

/// Bounded fan-out for independent list calls
pub const CONCURRENCY_FAN_OUT: &str = "concurrency.fanOut";

/// Per-remote-call timeout, in seconds
pub const TIMEOUT_PER_CALL: &str = "timeouts.perCall";

/// Whole-invocation timeout, in seconds
pub const TIMEOUT_INVOCATION: &str = "timeouts.invocation";

/// Default bounded fan-out for parallel list calls
pub const DEFAULT_FAN_OUT: usize = 10;

/// Default per-call timeout
pub const DEFAULT_PER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default invocation timeout
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Read-only key/value configuration source
pub trait ConfigReader: Send + Sync {
    /// Get the value for a key, or None if unset
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory reader, used by tests and by callers that assemble
/// configuration programmatically
#[derive(Debug, Default, Clone)]
pub struct MemoryConfigReader {
    values: BTreeMap<String, String>,
}

impl MemoryConfigReader {
    /// Create an empty reader
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, builder style
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

impl ConfigReader for MemoryConfigReader {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Typed view over a [`ConfigReader`] with the documented defaults
#[derive(Clone)]
pub struct Config {
    reader: Arc<dyn ConfigReader>,
}

impl Config {
    /// Wrap a reader
    pub fn new(reader: Arc<dyn ConfigReader>) -> Self {
        Self { reader }
    }

    /// Raw access to the underlying reader
    pub fn get(&self, key: &str) -> Option<String> {
        self.reader.get(key)
    }

    /// Namespace scope for discovery (empty = all)
    pub fn discovery_namespace(&self) -> String {
        self.reader.get(DISCOVERY_NAMESPACE).unwrap_or_default()
    }

    /// Namespace scope for a move (empty = all)
    pub fn move_namespace(&self) -> String {
        self.reader.get(MOVE_NAMESPACE).unwrap_or_default()
    }

    /// Bounded fan-out for independent list calls
    pub fn fan_out(&self) -> usize {
        self.reader
            .get(CONCURRENCY_FAN_OUT)
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_FAN_OUT)
    }

    /// Per-remote-call timeout
    pub fn per_call_timeout(&self) -> Duration {
        self.reader
            .get(TIMEOUT_PER_CALL)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PER_CALL_TIMEOUT)
    }

    /// Whole-invocation timeout
    pub fn invocation_timeout(&self) -> Duration {
        self.reader
            .get(TIMEOUT_INVOCATION)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INVOCATION_TIMEOUT)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Arc::new(MemoryConfigReader::new()))
    }
}
