/**
 * config.rs
 *
 * Immutable service configuration: server credentials, peer addresses
 * and protocol timings. Built once at startup, never mutated.
 */

use std::env;
use std::time::Duration;

/// Default connection server, matching a local deployment.
const DEFAULT_CONNECTION_ADDRESS: &str = "127.0.0.1";
const DEFAULT_CONNECTION_PORT: u16 = 16096;

/// Default communication channel name to resolve.
const DEFAULT_CHANNEL: &str = "user.location";

const DEFAULT_TIMEOUT_S: u64 = 60;
const DEFAULT_RETRY_WAIT_S: u64 = 300;
const DEFAULT_UPDATE_INTERVAL_S: u64 = 1;

/// Service configuration
///
/// Credentials and peer endpoints for the location server session.
/// Read-only after construction; the session task holds it behind an
/// `Arc` and never needs synchronization for it.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server account mail
    pub account_mail: String,

    /// Server account password
    pub account_password: String,

    /// Device key identifying this installation
    pub device_key: String,

    /// Device password shared with the paired app client
    pub device_password: String,

    /// Connection server address (primary peer)
    pub connection_address: String,

    /// Connection server port
    pub connection_port: u16,

    /// Communication channel name to resolve into the secondary peer
    pub channel: String,

    /// Timeout for channel-level connect / disconnect operations
    pub timeout: Duration,

    /// Wait between failed dial attempts
    pub retry_wait: Duration,

    /// Wait between ticks while streaming location updates
    pub update_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            account_mail: String::new(),
            account_password: String::new(),
            device_key: String::new(),
            device_password: String::new(),
            connection_address: DEFAULT_CONNECTION_ADDRESS.to_string(),
            connection_port: DEFAULT_CONNECTION_PORT,
            channel: DEFAULT_CHANNEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_S),
            retry_wait: Duration::from_secs(DEFAULT_RETRY_WAIT_S),
            update_interval: Duration::from_secs(DEFAULT_UPDATE_INTERVAL_S),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from environment variables, falling back
    /// to defaults for anything unset.
    ///
    /// Recognized variables:
    ///   LODESTONE_ACCOUNT_MAIL
    ///   LODESTONE_ACCOUNT_PASSWORD
    ///   LODESTONE_DEVICE_KEY
    ///   LODESTONE_DEVICE_PASSWORD
    ///   LODESTONE_CONNECTION_ADDRESS
    ///   LODESTONE_CONNECTION_PORT
    ///   LODESTONE_CHANNEL
    ///   LODESTONE_TIMEOUT_S
    ///   LODESTONE_RETRY_WAIT_S
    ///   LODESTONE_UPDATE_INTERVAL_S
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            account_mail: env_or("LODESTONE_ACCOUNT_MAIL", defaults.account_mail),
            account_password: env_or("LODESTONE_ACCOUNT_PASSWORD", defaults.account_password),
            device_key: env_or("LODESTONE_DEVICE_KEY", defaults.device_key),
            device_password: env_or("LODESTONE_DEVICE_PASSWORD", defaults.device_password),
            connection_address: env_or(
                "LODESTONE_CONNECTION_ADDRESS",
                defaults.connection_address,
            ),
            connection_port: env_parsed("LODESTONE_CONNECTION_PORT", defaults.connection_port),
            channel: env_or("LODESTONE_CHANNEL", defaults.channel),
            timeout: Duration::from_secs(env_parsed("LODESTONE_TIMEOUT_S", DEFAULT_TIMEOUT_S)),
            retry_wait: Duration::from_secs(env_parsed(
                "LODESTONE_RETRY_WAIT_S",
                DEFAULT_RETRY_WAIT_S,
            )),
            update_interval: Duration::from_secs(env_parsed(
                "LODESTONE_UPDATE_INTERVAL_S",
                DEFAULT_UPDATE_INTERVAL_S,
            )),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
