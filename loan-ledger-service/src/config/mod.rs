//! Configuration module for loan-ledger-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct LoanLedgerConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Payment network credentials for outbound payouts.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: Secret<String>,
    pub shortcode: String,
    pub initiator_name: String,
    pub security_credential: Secret<String>,
    pub result_url: String,
    pub timeout_url: String,
}

/// Servicing policy knobs.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub msisdn_country_code: String,
    /// Zero disables the background overdue sweep.
    pub sweep_interval_seconds: u64,
    pub grace_days_weekly: i64,
    pub grace_days_monthly: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            msisdn_country_code: "254".to_string(),
            sweep_interval_seconds: 3600,
            grace_days_weekly: 14,
            grace_days_monthly: 30,
        }
    }
}

impl LoanLedgerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let policy_defaults = PolicyConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "loan-ledger-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: Secret::new(env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            gateway: GatewayConfig {
                base_url: env::var("GATEWAY_BASE_URL")
                    .unwrap_or_else(|_| "https://sandbox.safaricom.co.ke".to_string()),
                consumer_key: env::var("GATEWAY_CONSUMER_KEY").unwrap_or_default(),
                consumer_secret: Secret::new(
                    env::var("GATEWAY_CONSUMER_SECRET").unwrap_or_default(),
                ),
                shortcode: env::var("GATEWAY_SHORTCODE").unwrap_or_default(),
                initiator_name: env::var("GATEWAY_INITIATOR_NAME").unwrap_or_default(),
                security_credential: Secret::new(
                    env::var("GATEWAY_SECURITY_CREDENTIAL").unwrap_or_default(),
                ),
                result_url: env::var("GATEWAY_RESULT_URL").unwrap_or_default(),
                timeout_url: env::var("GATEWAY_TIMEOUT_URL").unwrap_or_default(),
            },
            policy: PolicyConfig {
                msisdn_country_code: env::var("MSISDN_COUNTRY_CODE")
                    .unwrap_or(policy_defaults.msisdn_country_code),
                sweep_interval_seconds: parse_or(
                    "SWEEP_INTERVAL_SECONDS",
                    policy_defaults.sweep_interval_seconds,
                ),
                grace_days_weekly: parse_or("GRACE_DAYS_WEEKLY", policy_defaults.grace_days_weekly),
                grace_days_monthly: parse_or(
                    "GRACE_DAYS_MONTHLY",
                    policy_defaults.grace_days_monthly,
                ),
            },
        })
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
