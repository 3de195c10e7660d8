//! Engine and bridge configuration.
//!
//! Defaults can be overridden from `MCP_AUTOMATION_*` environment variables via
//! [`TrackerConfig::from_env`] / [`BridgeConfig::from_env`].

use std::str::FromStr;
use std::time::Duration;

use crate::coalesce::{ActionCatalog, ActionClass};

pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 25;
pub const DEFAULT_PROGRESS_EXTENSION: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PROGRESS_EXTENSIONS: u32 = 10;
pub const DEFAULT_PROGRESS_STALE_THRESHOLD: u32 = 3;
pub const DEFAULT_ABSOLUTE_MAX_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_QUEUED_REQUESTS: usize = 100;

/// Lower bound applied to per-request soft timeouts chosen by callers.
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

const ENV_MAX_PENDING_REQUESTS: &str = "MCP_AUTOMATION_MAX_PENDING_REQUESTS";
const ENV_PROGRESS_EXTENSION_MS: &str = "MCP_AUTOMATION_PROGRESS_EXTENSION_MS";
const ENV_MAX_PROGRESS_EXTENSIONS: &str = "MCP_AUTOMATION_MAX_PROGRESS_EXTENSIONS";
const ENV_PROGRESS_STALE_THRESHOLD: &str = "MCP_AUTOMATION_PROGRESS_STALE_THRESHOLD";
const ENV_ABSOLUTE_MAX_TIMEOUT_MS: &str = "MCP_AUTOMATION_ABSOLUTE_MAX_TIMEOUT_MS";
const ENV_REQUEST_TIMEOUT_MS: &str = "MCP_AUTOMATION_REQUEST_TIMEOUT_MS";
const ENV_IDEMPOTENT_ACTIONS: &str = "MCP_AUTOMATION_IDEMPOTENT_ACTIONS";
const ENV_MAX_QUEUED_REQUESTS: &str = "MCP_AUTOMATION_MAX_QUEUED_REQUESTS";

/// Limits and timeout policy for the request tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub max_pending_requests: usize,
    /// Soft deadline granted by each accepted progress update.
    pub progress_extension: Duration,
    pub max_progress_extensions: u32,
    /// Length of a run of identical progress percents treated as a stall.
    pub progress_stale_threshold: u32,
    /// Hard ceiling from creation, regardless of extensions.
    pub absolute_max_timeout: Duration,
    pub default_request_timeout: Duration,
    pub actions: ActionCatalog,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            progress_extension: DEFAULT_PROGRESS_EXTENSION,
            max_progress_extensions: DEFAULT_MAX_PROGRESS_EXTENSIONS,
            progress_stale_threshold: DEFAULT_PROGRESS_STALE_THRESHOLD,
            absolute_max_timeout: DEFAULT_ABSOLUTE_MAX_TIMEOUT,
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            actions: ActionCatalog::default(),
        }
    }
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Overlay values from `lookup` (an environment-like source) on the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_var(&lookup, ENV_MAX_PENDING_REQUESTS) {
            config = config.with_max_pending_requests(n);
        }
        if let Some(ms) = parse_var(&lookup, ENV_PROGRESS_EXTENSION_MS) {
            config = config.with_progress_extension(Duration::from_millis(ms));
        }
        if let Some(n) = parse_var(&lookup, ENV_MAX_PROGRESS_EXTENSIONS) {
            config = config.with_max_progress_extensions(n);
        }
        if let Some(n) = parse_var(&lookup, ENV_PROGRESS_STALE_THRESHOLD) {
            config = config.with_progress_stale_threshold(n);
        }
        if let Some(ms) = parse_var(&lookup, ENV_ABSOLUTE_MAX_TIMEOUT_MS) {
            config = config.with_absolute_max_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var(&lookup, ENV_REQUEST_TIMEOUT_MS) {
            config = config.with_default_request_timeout(Duration::from_millis(ms));
        }
        if let Some(list) = lookup(ENV_IDEMPOTENT_ACTIONS) {
            for action in list.split(',').map(str::trim).filter(|a| !a.is_empty()) {
                config.actions.register(action, ActionClass::Idempotent);
            }
        }

        config
    }

    /// Clamped to at least one.
    pub fn with_max_pending_requests(mut self, n: usize) -> Self {
        self.max_pending_requests = n.max(1);
        self
    }

    pub fn with_progress_extension(mut self, extension: Duration) -> Self {
        self.progress_extension = extension;
        self
    }

    pub fn with_max_progress_extensions(mut self, n: u32) -> Self {
        self.max_progress_extensions = n;
        self
    }

    /// Clamped to at least two: a single report can never be a repeat.
    pub fn with_progress_stale_threshold(mut self, n: u32) -> Self {
        self.progress_stale_threshold = n.max(2);
        self
    }

    pub fn with_absolute_max_timeout(mut self, timeout: Duration) -> Self {
        self.absolute_max_timeout = timeout;
        self
    }

    pub fn with_default_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout.max(MIN_REQUEST_TIMEOUT);
        self
    }

    pub fn with_actions(mut self, actions: ActionCatalog) -> Self {
        self.actions = actions;
        self
    }
}

/// Configuration for [`crate::AutomationBridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub tracker: TrackerConfig,
    /// Callers allowed to wait for capacity once the pending limit is hit.
    pub max_queued_requests: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            max_queued_requests: DEFAULT_MAX_QUEUED_REQUESTS,
        }
    }
}

impl BridgeConfig {
    pub fn new(tracker: TrackerConfig) -> Self {
        Self {
            tracker,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new(TrackerConfig::from_lookup(&lookup));
        if let Some(n) = parse_var(&lookup, ENV_MAX_QUEUED_REQUESTS) {
            config.max_queued_requests = n;
        }
        config
    }

    pub fn with_max_queued_requests(mut self, n: usize) -> Self {
        self.max_queued_requests = n;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_policy() {
        let config = TrackerConfig::default();
        assert_eq!(config.max_pending_requests, 25);
        assert_eq!(config.progress_extension, Duration::from_secs(30));
        assert_eq!(config.max_progress_extensions, 10);
        assert_eq!(config.progress_stale_threshold, 3);
        assert_eq!(config.absolute_max_timeout, Duration::from_secs(300));
        assert_eq!(config.default_request_timeout, Duration::from_secs(120));
    }

    #[test]
    fn env_overrides_defaults() {
        let config = TrackerConfig::from_lookup(lookup_from(&[
            ("MCP_AUTOMATION_MAX_PENDING_REQUESTS", "4"),
            ("MCP_AUTOMATION_PROGRESS_EXTENSION_MS", "1500"),
            ("MCP_AUTOMATION_MAX_PROGRESS_EXTENSIONS", "2"),
            ("MCP_AUTOMATION_PROGRESS_STALE_THRESHOLD", "5"),
            ("MCP_AUTOMATION_ABSOLUTE_MAX_TIMEOUT_MS", "60000"),
            ("MCP_AUTOMATION_REQUEST_TIMEOUT_MS", "9000"),
            ("MCP_AUTOMATION_IDEMPOTENT_ACTIONS", "list_widgets, get_widget ,"),
        ]));

        assert_eq!(config.max_pending_requests, 4);
        assert_eq!(config.progress_extension, Duration::from_millis(1500));
        assert_eq!(config.max_progress_extensions, 2);
        assert_eq!(config.progress_stale_threshold, 5);
        assert_eq!(config.absolute_max_timeout, Duration::from_secs(60));
        assert_eq!(config.default_request_timeout, Duration::from_secs(9));
        assert!(config.actions.is_coalescable("list_widgets"));
        assert!(config.actions.is_coalescable("get_widget"));
    }

    #[test]
    fn unparseable_values_fall_back() {
        let config = TrackerConfig::from_lookup(lookup_from(&[
            ("MCP_AUTOMATION_MAX_PENDING_REQUESTS", "lots"),
            ("MCP_AUTOMATION_PROGRESS_EXTENSION_MS", "-5"),
        ]));
        assert_eq!(config.max_pending_requests, DEFAULT_MAX_PENDING_REQUESTS);
        assert_eq!(config.progress_extension, DEFAULT_PROGRESS_EXTENSION);
    }

    #[test]
    fn builder_clamps_degenerate_values() {
        let config = TrackerConfig::new()
            .with_max_pending_requests(0)
            .with_progress_stale_threshold(1)
            .with_default_request_timeout(Duration::from_millis(10));
        assert_eq!(config.max_pending_requests, 1);
        assert_eq!(config.progress_stale_threshold, 2);
        assert_eq!(config.default_request_timeout, MIN_REQUEST_TIMEOUT);
    }

    #[test]
    fn bridge_config_reads_queue_limit() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("MCP_AUTOMATION_MAX_QUEUED_REQUESTS", "7"),
            ("MCP_AUTOMATION_MAX_PENDING_REQUESTS", "3"),
        ]));
        assert_eq!(config.max_queued_requests, 7);
        assert_eq!(config.tracker.max_pending_requests, 3);
    }
}
