//! Daemon configuration, loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Transport used for the Electrum socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Ssl,
}

impl Transport {
    /// Conventional Fulcrum port for this transport.
    pub fn default_port(&self) -> u16 {
        match self {
            Transport::Tcp => 50001,
            Transport::Ssl => 50002,
        }
    }
}

impl FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "ssl" | "tls" => Ok(Transport::Ssl),
            other => bail!("unsupported electrum transport: {other}"),
        }
    }
}

/// Connection settings for the Electrum client.
#[derive(Debug, Clone)]
pub struct ElectrumSettings {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    /// Verify the server certificate on SSL transports. Defaults to on;
    /// disable only against lab servers with self-signed certificates.
    pub tls_verify: bool,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Postgres NOTIFY channel carrying watch-table changes.
    pub db_channel: String,
    pub electrum: ElectrumSettings,
    /// Reconciliation cadence of the monitor.
    pub sync_interval: Duration,
    /// Watchdog ping cadence.
    pub ping_interval: Duration,
    pub price_refresh_interval: Duration,
}

impl Config {
    /// Load configuration from `PAYWATCH_*` environment variables.
    ///
    /// `PAYWATCH_DATABASE_URL` and `PAYWATCH_ELECTRUM_HOST` are required;
    /// everything else has a default.
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("PAYWATCH_DATABASE_URL").context("PAYWATCH_DATABASE_URL is not set")?;
        let host =
            env::var("PAYWATCH_ELECTRUM_HOST").context("PAYWATCH_ELECTRUM_HOST is not set")?;

        let transport = match env::var("PAYWATCH_ELECTRUM_TRANSPORT") {
            Ok(v) => v.parse()?,
            Err(_) => Transport::Ssl,
        };
        let port = match env::var("PAYWATCH_ELECTRUM_PORT") {
            Ok(v) => v
                .parse::<u16>()
                .context("PAYWATCH_ELECTRUM_PORT is not a valid port")?,
            Err(_) => transport.default_port(),
        };
        let tls_verify = env_bool("PAYWATCH_ELECTRUM_TLS_VERIFY", true);

        let db_channel = env::var("PAYWATCH_DB_CHANNEL")
            .unwrap_or_else(|_| "bch_table_changes".to_string());

        Ok(Self {
            database_url,
            db_channel,
            electrum: ElectrumSettings {
                host,
                port,
                transport,
                tls_verify,
                request_timeout: env_secs("PAYWATCH_REQUEST_TIMEOUT_SECS", 30)?,
            },
            sync_interval: env_secs("PAYWATCH_SYNC_INTERVAL_SECS", 2)?,
            ping_interval: env_secs("PAYWATCH_PING_INTERVAL_SECS", 15)?,
            price_refresh_interval: env_secs("PAYWATCH_PRICE_REFRESH_SECS", 600)?,
        })
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim();
            !(v.eq_ignore_ascii_case("false") || v == "0" || v.eq_ignore_ascii_case("off"))
        }
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: u64) -> Result<Duration> {
    let secs = match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{key} is not a valid number of seconds"))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_parsing() {
        assert_eq!("tcp".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!("SSL".parse::<Transport>().unwrap(), Transport::Ssl);
        assert_eq!("tls".parse::<Transport>().unwrap(), Transport::Ssl);
        assert!("quic".parse::<Transport>().is_err());
    }

    #[test]
    fn default_ports_follow_transport() {
        assert_eq!(Transport::Tcp.default_port(), 50001);
        assert_eq!(Transport::Ssl.default_port(), 50002);
    }

    #[test]
    fn malformed_cadence_values_are_rejected() {
        std::env::set_var("PAYWATCH_TEST_SECS_BAD", "abc");
        assert!(env_secs("PAYWATCH_TEST_SECS_BAD", 5).is_err());

        std::env::set_var("PAYWATCH_TEST_SECS_OK", "7");
        assert_eq!(
            env_secs("PAYWATCH_TEST_SECS_OK", 5).unwrap(),
            Duration::from_secs(7)
        );
        assert_eq!(
            env_secs("PAYWATCH_TEST_SECS_UNSET", 5).unwrap(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn env_bool_treats_only_explicit_negatives_as_false() {
        assert!(env_bool("PAYWATCH_TEST_UNSET_FLAG", true));
        assert!(!env_bool("PAYWATCH_TEST_UNSET_FLAG", false));
        std::env::set_var("PAYWATCH_TEST_FLAG_OFF", "false");
        assert!(!env_bool("PAYWATCH_TEST_FLAG_OFF", true));
        std::env::set_var("PAYWATCH_TEST_FLAG_ON", "yes");
        assert!(env_bool("PAYWATCH_TEST_FLAG_ON", false));
    }
}
