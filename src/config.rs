//! Client configuration: connection target, credentials, reconnection and
//! timeout policy, and lifecycle callbacks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults;
use crate::schema::SpacesSnapshot;

/// Errors loading a [`Config`] from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A lifecycle event callback. Invoked from the connection actor's task, so
/// it must not block and must not assume any particular thread.
pub type EventCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// The `on` map of `spec.md` §6: callbacks for connection lifecycle events.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub(crate) connected: Option<EventCallback>,
    pub(crate) disconnected: Option<EventCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("connected", &self.connected.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .finish()
    }
}

/// Credentials used during the authentication handshake. Absence of this
/// type on a [`Config`] means no `AUTH` request is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Initial-connect and reconnection policy, grouped so callers can configure
/// connection behavior independently of host/port/credentials and hand the
/// whole bundle to [`ConfigBuilder::options`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConnectOptions {
    #[serde(with = "humantime_serde", default = "defaults::reconnect_period")]
    pub reconnect_period: Duration,
    #[serde(default = "defaults::reconnect_always")]
    pub reconnect_always: bool,
    #[serde(with = "humantime_serde", default = "defaults::connect_timeout")]
    pub connect_timeout: Option<Duration>,
    #[serde(default = "defaults::connect_attempts")]
    pub connect_attempts: usize,
    #[serde(with = "humantime_serde", default = "defaults::request_timeout")]
    pub request_timeout: Option<Duration>,
    #[serde(default = "defaults::max_pending_requests")]
    pub max_pending_requests: Option<usize>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            reconnect_period: defaults::reconnect_period(),
            reconnect_always: defaults::reconnect_always(),
            connect_timeout: defaults::connect_timeout(),
            connect_attempts: defaults::connect_attempts(),
            request_timeout: defaults::request_timeout(),
            max_pending_requests: defaults::max_pending_requests(),
        }
    }
}

/// Configuration recognized by the client constructor (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
#[non_exhaustive]
pub struct Config {
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// A pre-built schema snapshot that bypasses discovery entirely.
    #[serde(skip)]
    pub spaces: Option<SpacesSnapshot>,
    #[serde(with = "humantime_serde", default = "defaults::reconnect_period")]
    pub reconnect_period: Duration,
    #[serde(default = "defaults::reconnect_always")]
    pub reconnect_always: bool,
    #[serde(with = "humantime_serde", default = "defaults::connect_timeout")]
    pub connect_timeout: Option<Duration>,
    #[serde(default = "defaults::connect_attempts")]
    pub connect_attempts: usize,
    #[serde(with = "humantime_serde", default = "defaults::request_timeout")]
    pub request_timeout: Option<Duration>,
    #[serde(default = "defaults::max_pending_requests")]
    pub max_pending_requests: Option<usize>,
    #[serde(skip)]
    pub(crate) on: Callbacks,
}

impl Config {
    /// Start building a [`Config`] pointing at `host:port`, with every other
    /// field at its default.
    pub fn builder(host: impl Into<String>, port: u16) -> ConfigBuilder {
        ConfigBuilder {
            config: Config {
                host: host.into(),
                port,
                credentials: None,
                spaces: None,
                reconnect_period: defaults::reconnect_period(),
                reconnect_always: defaults::reconnect_always(),
                connect_timeout: defaults::connect_timeout(),
                connect_attempts: defaults::connect_attempts(),
                request_timeout: defaults::request_timeout(),
                max_pending_requests: defaults::max_pending_requests(),
                on: Callbacks::default(),
            },
        }
    }

    /// Load a [`Config`] from a TOML file at `path`.
    ///
    /// Matches the teacher's `Config::load` shape: `credentials`,
    /// `connect_timeout`/`request_timeout`/`reconnect_period` are accepted as
    /// human-readable durations (`"30s"`, `"5m"`) via `humantime_serde`.
    pub async fn load(path: impl AsRef<std::path::Path>) -> Result<Config, ConfigError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Builder for [`Config`], mirroring the teacher's fluent `&mut Self`
/// configuration style on [`crate::transport::connection::Connection`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn spaces(mut self, spaces: SpacesSnapshot) -> Self {
        self.config.spaces = Some(spaces);
        self
    }

    pub fn reconnect_period(mut self, period: Duration) -> Self {
        self.config.reconnect_period = period;
        self
    }

    pub fn reconnect_always(mut self, always: bool) -> Self {
        self.config.reconnect_always = always;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn connect_attempts(mut self, attempts: usize) -> Self {
        self.config.connect_attempts = attempts;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_pending_requests(mut self, max: Option<usize>) -> Self {
        self.config.max_pending_requests = max;
        self
    }

    /// Apply a whole [`ConnectOptions`] bundle at once, overriding every
    /// field it covers.
    pub fn options(mut self, options: ConnectOptions) -> Self {
        self.config.reconnect_period = options.reconnect_period;
        self.config.reconnect_always = options.reconnect_always;
        self.config.connect_timeout = options.connect_timeout;
        self.config.connect_attempts = options.connect_attempts;
        self.config.request_timeout = options.request_timeout;
        self.config.max_pending_requests = options.max_pending_requests;
        self
    }

    pub fn on_connected(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.config.on.connected = Some(Arc::new(callback));
        self
    }

    pub fn on_disconnected(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.config.on.disconnected = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_defaults() {
        let config = Config::builder("127.0.0.1", 3301).build();
        assert_eq!(config.port, 3301);
        assert!(config.credentials.is_none());
        assert_eq!(config.reconnect_period, Duration::from_secs(0));
    }

    #[test]
    fn builder_overrides_apply() {
        let config = Config::builder("db.internal", 3301)
            .credentials("alice", "hunter2")
            .reconnect_period(Duration::from_secs(5))
            .reconnect_always(true)
            .connect_attempts(3)
            .build();
        assert_eq!(config.credentials.unwrap().user, "alice");
        assert_eq!(config.reconnect_period, Duration::from_secs(5));
        assert!(config.reconnect_always);
        assert_eq!(config.connect_attempts, 3);
    }

    #[test]
    fn connect_options_bundle_applies_together() {
        let options = ConnectOptions {
            reconnect_period: Duration::from_secs(10),
            reconnect_always: true,
            ..ConnectOptions::default()
        };
        let config = Config::builder("127.0.0.1", 3301).options(options).build();
        assert_eq!(config.reconnect_period, Duration::from_secs(10));
        assert!(config.reconnect_always);
    }

    #[test]
    fn loads_from_toml() {
        let toml = r#"
            host = "127.0.0.1"
            port = 3301
            reconnect_period = "2s"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.reconnect_period, Duration::from_secs(2));
    }
}
