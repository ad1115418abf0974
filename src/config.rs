// src/config.rs
use crate::error::{GatewayError, Result};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Which broker deployment requests are sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Sandbox,
    Production,
}

impl FromStr for Environment {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" | "dev" | "development" | "test" => Ok(Environment::Sandbox),
            "production" | "prod" | "live" => Ok(Environment::Production),
            other => Err(GatewayError::Config(format!(
                "BROKER_ENV must be sandbox or production, got {:?}",
                other
            ))),
        }
    }
}

/// REST and WebSocket hosts for the selected environment.
#[derive(Debug, Clone)]
pub struct BrokerEndpoints {
    pub rest_url: String,
    pub ws_url: String,
    pub default_segment: String,
    pub request_timeout: Duration,
    pub quote_timeout: Duration,
}

/// Cache lifetimes in seconds, one per upstream resource.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtl {
    pub quote: u64,
    pub positions: u64,
    pub orders: u64,
    pub funds: u64,
    pub holdings: u64,
    pub trade_history: u64,
    pub ledger: u64,
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            quote: 2,
            positions: 10,
            orders: 10,
            funds: 15,
            holdings: 30,
            trade_history: 60,
            ledger: 120,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub endpoints: BrokerEndpoints,
    pub bind_addr: SocketAddr,
    pub scylla_uri: String,
    pub jwt_secret: String,
    pub quote_wait_timeout: Duration,
    pub cache_sweep_interval: Duration,
    pub ttl: CacheTtl,
}

const SANDBOX_REST_URL: &str = "https://sandbox.dhan.co/v2";
const PRODUCTION_REST_URL: &str = "https://api.dhan.co/v2";
const SANDBOX_WS_URL: &str = "wss://sandbox-feed.dhan.co";
const PRODUCTION_WS_URL: &str = "wss://api-feed.dhan.co";

impl Config {
    /// Reads configuration from the process environment, loading `.env` first
    /// when present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let environment: Environment = get("BROKER_ENV", "sandbox").parse()?;
        let (rest_url, ws_url) = match environment {
            Environment::Sandbox => (
                get("BROKER_SANDBOX_URL", SANDBOX_REST_URL),
                get("BROKER_SANDBOX_WS_URL", SANDBOX_WS_URL),
            ),
            Environment::Production => (
                get("BROKER_PRODUCTION_URL", PRODUCTION_REST_URL),
                get("BROKER_PRODUCTION_WS_URL", PRODUCTION_WS_URL),
            ),
        };

        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::Config("JWT_SECRET is required".to_string()))?;

        let bind_addr = get("BIND_ADDR", "127.0.0.1:3030")
            .parse::<SocketAddr>()
            .map_err(|e| GatewayError::Config(format!("BIND_ADDR: {}", e)))?;

        Ok(Config {
            environment,
            endpoints: BrokerEndpoints {
                rest_url: rest_url.trim_end_matches('/').to_string(),
                ws_url,
                default_segment: get("BROKER_DEFAULT_SEGMENT", "NSE_EQ"),
                request_timeout: millis(&get("BROKER_TIMEOUT_MS", "15000"), "BROKER_TIMEOUT_MS")?,
                quote_timeout: millis(&get("QUOTE_TIMEOUT_MS", "8000"), "QUOTE_TIMEOUT_MS")?,
            },
            bind_addr,
            scylla_uri: get("SCYLLA_URI", "127.0.0.1:9042"),
            jwt_secret,
            quote_wait_timeout: millis(
                &get("QUOTE_WAIT_TIMEOUT_MS", "10000"),
                "QUOTE_WAIT_TIMEOUT_MS",
            )?,
            cache_sweep_interval: millis(
                &get("CACHE_SWEEP_INTERVAL_MS", "30000"),
                "CACHE_SWEEP_INTERVAL_MS",
            )?,
            ttl: CacheTtl::default(),
        })
    }
}

fn millis(raw: &str, key: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| GatewayError::Config(format!("{}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_sandbox_hosts() {
        let config = config_from(&[("JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(config.environment, Environment::Sandbox);
        assert_eq!(config.endpoints.rest_url, SANDBOX_REST_URL);
        assert_eq!(config.endpoints.ws_url, SANDBOX_WS_URL);
        assert_eq!(config.endpoints.quote_timeout, Duration::from_millis(8000));
        assert_eq!(config.ttl.quote, 2);
    }

    #[test]
    fn production_selects_production_hosts() {
        let config = config_from(&[
            ("JWT_SECRET", "s3cret"),
            ("BROKER_ENV", "production"),
            ("BROKER_PRODUCTION_URL", "https://broker.example/v2/"),
        ])
        .unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.endpoints.rest_url, "https://broker.example/v2");
        assert_eq!(config.endpoints.ws_url, PRODUCTION_WS_URL);
    }

    #[test]
    fn rejects_unknown_environment_and_missing_secret() {
        assert!(matches!(
            config_from(&[("JWT_SECRET", "x"), ("BROKER_ENV", "staging")]),
            Err(GatewayError::Config(_))
        ));
        assert!(matches!(config_from(&[]), Err(GatewayError::Config(_))));
    }
}
