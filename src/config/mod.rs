//! Configuration loading.
//!
//! Sources, lowest precedence first: built-in defaults, an optional
//! `config/default.*` file, then `CHATWIRE_`-prefixed environment variables
//! with `__` between section and key (`CHATWIRE_SESSION__MESSAGE_COUNT=50`).

mod settings;

use crate::client::ClientOptions;
use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{LoggingSettings, SessionSettings, Settings};

/// Loads the configuration from the default file and environment variables
/// and merges it over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Like [`load_config`], reading the optional file at `path` (extension may
/// be omitted).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("CHATWIRE")
                .prefix_separator("_")
                .separator("__"),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    let client = partial.client;
    let session = partial.session;
    let logging = partial.logging;

    Ok(Settings {
        client: ClientOptions {
            subscribe_key: client
                .as_ref()
                .and_then(|c| c.subscribe_key.clone())
                .unwrap_or(default.client.subscribe_key),
            publish_key: client
                .as_ref()
                .and_then(|c| c.publish_key.clone())
                .or(default.client.publish_key),
            origin: client
                .as_ref()
                .and_then(|c| c.origin.clone())
                .unwrap_or(default.client.origin),
            ssl: client
                .as_ref()
                .and_then(|c| c.ssl)
                .unwrap_or(default.client.ssl),
            presence_timeout_secs: client
                .as_ref()
                .and_then(|c| c.presence_timeout_secs)
                .unwrap_or(default.client.presence_timeout_secs),
            heartbeat_interval_secs: client
                .as_ref()
                .and_then(|c| c.heartbeat_interval_secs)
                .or(default.client.heartbeat_interval_secs),
            restore: client
                .as_ref()
                .and_then(|c| c.restore)
                .unwrap_or(default.client.restore),
            uuid: None,
        },
        session: SessionSettings {
            message_count: session
                .as_ref()
                .and_then(|s| s.message_count)
                .unwrap_or(default.session.message_count),
            handshake_timeout_secs: session
                .as_ref()
                .and_then(|s| s.handshake_timeout_secs)
                .or(default.session.handshake_timeout_secs),
        },
        logging: LoggingSettings {
            level: logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    })
}
