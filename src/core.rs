use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::engine::FailurePolicy;
use crate::error::ConfigError;
use crate::events::EventBus;
use crate::plugin::Registry;
use crate::services::Services;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Daemon and build settings.
///
/// Every field has a default, so a config file only needs to mention the
/// values it wants to change:
///
/// ```rust
/// let config: kiln::Config = serde_json::from_str(r#"{ "port": 4321 }"#).unwrap();
/// assert_eq!(config.port, 4321);
/// assert!(config.echo_unknown_commands);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Interface both listeners bind to.
    pub host: String,
    /// Port of the line-delimited command socket.
    pub port: u16,
    /// Port of the WebSocket endpoint.
    pub websocket_port: u16,
    /// Idle read timeout of a connected client, on either protocol. `None`
    /// waits forever.
    pub read_timeout_secs: Option<u64>,
    /// Write timeout of both protocols, so a stalled client can't block a
    /// computation that is reporting progress to it.
    pub write_timeout_secs: Option<u64>,
    /// Unknown command names are echoed back instead of rejected.
    pub echo_unknown_commands: bool,
    /// What happens to the remaining tasks once one of them fails.
    pub failure_policy: FailurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 1234,
            websocket_port: 1240,
            read_timeout_secs: Some(300),
            write_timeout_secs: Some(10),
            echo_unknown_commands: true,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl Config {
    /// Reads a JSON config file.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn websocket_port(mut self, port: u16) -> Self {
        self.websocket_port = port;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout_secs = timeout.map(|t| t.as_secs().max(1));
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout_secs = timeout.map(|t| t.as_secs().max(1));
        self
    }

    pub fn echo_unknown_commands(mut self, echo: bool) -> Self {
        self.echo_unknown_commands = echo;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub(crate) fn read_timeout_duration(&self) -> Option<Duration> {
        self.read_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub(crate) fn write_timeout_duration(&self) -> Option<Duration> {
        self.write_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Everything a component needs, built once at process start and handed to
/// every constructor.
///
/// The context is immutable once built. Shared state that changes while the
/// daemon runs (event listeners, the outbound queue) carries its own lock.
pub struct Context {
    pub config: Config,
    pub registry: Registry,
    pub events: EventBus,
    pub services: Services,
}

impl Context {
    pub fn new(config: Config, registry: Registry, services: Services) -> Arc<Self> {
        Self::with_events(config, registry, services, EventBus::default())
    }

    /// Builds the context around an existing bus, for collaborators that were
    /// handed a clone of it to publish on.
    pub fn with_events(
        config: Config,
        registry: Registry,
        services: Services,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            events,
            services,
        })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
