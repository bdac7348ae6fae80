// config.rs
use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::errors::{AppError, Result};

const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mpesa_consumer_key: String,
    pub mpesa_consumer_secret: String,
    pub mpesa_short_code: String,
    pub mpesa_passkey: String,
    pub mpesa_callback_url: String,
    pub mpesa_environment: String,
    pub mpesa_base_url: String,
    pub http_timeout: Duration,
    pub token_retry_backoff: Duration,
    pub pending_timeout: Duration,
    pub sweep_interval: Duration,
    pub callback_lookup_retries: u32,
    pub callback_lookup_delay: Duration,
    pub database_url: Option<String>,
    pub database_name: String,
    pub port: u16,
    pub host: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests do not touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mpesa_environment = optional(&lookup, "MPESA_ENVIRONMENT")
            .unwrap_or_else(|| "sandbox".to_string());

        let mpesa_base_url = match optional(&lookup, "MPESA_BASE_URL") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => match mpesa_environment.as_str() {
                "production" => PRODUCTION_BASE_URL.to_string(),
                "sandbox" => SANDBOX_BASE_URL.to_string(),
                other => {
                    return Err(AppError::configuration(format!(
                        "MPESA_ENVIRONMENT must be sandbox or production, got {}",
                        other
                    )))
                }
            },
        };

        let config = AppConfig {
            mpesa_consumer_key: required(&lookup, "MPESA_CONSUMER_KEY")?,
            mpesa_consumer_secret: required(&lookup, "MPESA_CONSUMER_SECRET")?,
            mpesa_short_code: required(&lookup, "MPESA_SHORT_CODE")?,
            mpesa_passkey: required(&lookup, "MPESA_PASSKEY")?,
            mpesa_callback_url: required(&lookup, "MPESA_CALLBACK_URL")?,
            mpesa_environment,
            mpesa_base_url,
            http_timeout: Duration::from_secs(parsed(&lookup, "MPESA_HTTP_TIMEOUT_SECS", 30)?),
            token_retry_backoff: Duration::from_secs(parsed(
                &lookup,
                "MPESA_TOKEN_RETRY_BACKOFF_SECS",
                5,
            )?),
            pending_timeout: Duration::from_secs(parsed(
                &lookup,
                "MPESA_PENDING_TIMEOUT_SECS",
                180,
            )?),
            sweep_interval: Duration::from_secs(parsed(&lookup, "MPESA_SWEEP_INTERVAL_SECS", 30)?),
            callback_lookup_retries: parsed(&lookup, "MPESA_CALLBACK_LOOKUP_RETRIES", 3)?,
            callback_lookup_delay: Duration::from_millis(parsed(
                &lookup,
                "MPESA_CALLBACK_LOOKUP_DELAY_MS",
                250,
            )?),
            database_url: optional(&lookup, "DATABASE_URL"),
            database_name: optional(&lookup, "DATABASE_NAME")
                .unwrap_or_else(|| "checkout".to_string()),
            port: parsed(&lookup, "PORT", 3000)?,
            host: optional(&lookup, "HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
        };

        if config.sweep_interval.is_zero() {
            return Err(AppError::configuration(
                "MPESA_SWEEP_INTERVAL_SECS must be greater than 0",
            ));
        }

        info!(
            environment = %config.mpesa_environment,
            base_url = %config.mpesa_base_url,
            short_code = %config.mpesa_short_code,
            "M-Pesa configuration loaded"
        );

        Ok(config)
    }

    pub fn get_mpesa_urls(&self) -> (String, String) {
        let auth_url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.mpesa_base_url
        );
        let stk_url = format!("{}/mpesa/stkpush/v1/processrequest", self.mpesa_base_url);

        (auth_url, stk_url)
    }

    pub fn is_production(&self) -> bool {
        self.mpesa_environment == "production"
    }

    pub fn get_config_info(&self) -> serde_json::Value {
        serde_json::json!({
            "environment": self.mpesa_environment,
            "is_production": self.is_production(),
            "business_shortcode": self.mpesa_short_code,
            "callback_url": self.mpesa_callback_url,
            "consumer_key_set": !self.mpesa_consumer_key.is_empty(),
            "consumer_secret_set": !self.mpesa_consumer_secret.is_empty(),
            "pending_timeout_secs": self.pending_timeout.as_secs(),
            "persistent_store": self.database_url.is_some(),
        })
    }
}

fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, key).ok_or_else(|| AppError::configuration(format!("{} must be set", key)))
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match optional(lookup, key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::configuration(format!("{} must be a number, got {}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("MPESA_CONSUMER_KEY", "key"),
            ("MPESA_CONSUMER_SECRET", "secret"),
            ("MPESA_SHORT_CODE", "174379"),
            ("MPESA_PASSKEY", "passkey"),
            ("MPESA_CALLBACK_URL", "https://example.com/api/mpesa/callback"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<AppConfig> {
        AppConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_to_sandbox() {
        let config = load(&base_env()).unwrap();
        assert!(!config.is_production());
        assert_eq!(config.mpesa_base_url, SANDBOX_BASE_URL);
        assert_eq!(config.pending_timeout, Duration::from_secs(180));
        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());

        let (auth_url, stk_url) = config.get_mpesa_urls();
        assert_eq!(
            auth_url,
            "https://sandbox.safaricom.co.ke/oauth/v1/generate?grant_type=client_credentials"
        );
        assert_eq!(
            stk_url,
            "https://sandbox.safaricom.co.ke/mpesa/stkpush/v1/processrequest"
        );
    }

    #[test]
    fn production_and_base_url_override() {
        let mut env = base_env();
        env.insert("MPESA_ENVIRONMENT", "production");
        assert_eq!(load(&env).unwrap().mpesa_base_url, PRODUCTION_BASE_URL);

        env.insert("MPESA_BASE_URL", "http://127.0.0.1:9000/");
        assert_eq!(load(&env).unwrap().mpesa_base_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn missing_credential_is_a_configuration_error() {
        for key in [
            "MPESA_CONSUMER_KEY",
            "MPESA_CONSUMER_SECRET",
            "MPESA_SHORT_CODE",
            "MPESA_PASSKEY",
            "MPESA_CALLBACK_URL",
        ] {
            let mut env = base_env();
            env.remove(key);
            match load(&env) {
                Err(AppError::ConfigurationError(msg)) => assert!(msg.contains(key)),
                other => panic!("expected configuration error for {}, got {:?}", key, other),
            }
        }
    }

    #[test]
    fn blank_values_count_as_missing() {
        let mut env = base_env();
        env.insert("MPESA_PASSKEY", "   ");
        assert!(matches!(load(&env), Err(AppError::ConfigurationError(_))));
    }

    #[test]
    fn config_info_reports_setup_without_secrets() {
        let mut env = base_env();
        env.insert("DATABASE_URL", "mongodb://localhost:27017");
        let info = load(&env).unwrap().get_config_info();

        assert_eq!(info["environment"], "sandbox");
        assert_eq!(info["is_production"], false);
        assert_eq!(info["business_shortcode"], "174379");
        assert_eq!(info["consumer_key_set"], true);
        assert_eq!(info["pending_timeout_secs"], 180);
        assert_eq!(info["persistent_store"], true);

        let rendered = info.to_string();
        assert!(!rendered.contains("\"secret\""));
        assert!(!rendered.contains("\"passkey\""));
    }

    #[test]
    fn rejects_unknown_environment_and_bad_numbers() {
        let mut env = base_env();
        env.insert("MPESA_ENVIRONMENT", "staging");
        assert!(matches!(load(&env), Err(AppError::ConfigurationError(_))));

        let mut env = base_env();
        env.insert("MPESA_PENDING_TIMEOUT_SECS", "soon");
        assert!(matches!(load(&env), Err(AppError::ConfigurationError(_))));
    }
}
