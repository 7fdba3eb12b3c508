mod settings;

use std::env;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BridgeSettings, BrokerSettings, ExternalKind, ExternalSettings, LoggingSettings,
    PostActionKind, QueueSettings, RelaySettings, ServerSettings, Settings,
};

/// Flat variable names understood for compatibility with existing deployments,
/// mapped to the configuration key they override.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("SERVER_PORT", "server.port"),
    ("AMQP_SERVER_URL", "broker.url"),
    ("AMQP_PRODUCER_QUEUE_NAME", "broker.producer.queue"),
    ("AMQP_PRODUCER_EXCHANGE_NAME", "broker.producer.exchange"),
    ("AMQP_PRODUCER_ROUTING_KEY", "broker.producer.routing_key"),
    ("AMQP_CONSUMER_QUEUE_NAME", "broker.consumer.queue"),
    ("AMQP_CONSUMER_EXCHANGE_NAME", "broker.consumer.exchange"),
    ("AMQP_CONSUMER_ROUTING_KEY", "broker.consumer.routing_key"),
    ("LOG_FILE_PATH", "logging.file_path"),
    ("LOG_MIN_LEVEL", "logging.level"),
];

/// Loads the configuration from `.env`, the default file and environment variables.
///
/// Sources, lowest precedence first: `config/default.*`, `MQBRIDGE_*`
/// variables (`MQBRIDGE_BRIDGE__REPLY_TIMEOUT_MS`), then the legacy flat
/// names. Whatever is left unset comes from `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    // A missing .env file is normal outside development.
    let _ = dotenvy::dotenv();

    let mut builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("MQBRIDGE")
                .prefix_separator("_")
                .separator("__"),
        );

    for (var, key) in LEGACY_ENV_KEYS {
        builder = builder.set_override_option(*key, env::var(var).ok())?;
    }

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

#[cfg(test)]
mod tests;
