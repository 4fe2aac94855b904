use std::collections::HashMap;

use anyhow::{Context, Result};
use ::config::{Config, Environment};
use serde::Deserialize;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_STATSD_HOST: &str = "localhost";
pub const DEFAULT_STATSD_PORT: u16 = 8125;

/// Application settings read from the environment
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// PostgreSQL connection string
    pub postgres_dsn: String,

    pub openai_api_key: String,

    pub openai_base_url: String,

    /// Outbound proxy for the OpenAI client
    #[serde(default)]
    pub proxy: Option<String>,

    /// StatsD sink as `host` or `host:port`
    pub statsd_host: String,

    #[serde(default)]
    pub statsd_prefix: Option<String>,
}

impl Settings {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::load(Environment::default())
    }

    /// Load settings from an explicit set of variables instead of the process environment
    pub fn from_map(vars: HashMap<String, String>) -> Result<Self> {
        Self::load(Environment::default().source(Some(vars)))
    }

    fn load(environment: Environment) -> Result<Self> {
        let settings: Settings = Config::builder()
            .set_default("openai_base_url", DEFAULT_OPENAI_BASE_URL)?
            .set_default("statsd_host", DEFAULT_STATSD_HOST)?
            .add_source(environment)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("POSTGRES_DSN and OPENAI_API_KEY must be set in environment variables")?;

        Ok(settings.normalized())
    }

    fn normalized(mut self) -> Self {
        self.proxy = self.proxy.filter(|proxy| !proxy.trim().is_empty());
        self.statsd_prefix = self.statsd_prefix.filter(|prefix| !prefix.trim().is_empty());
        self
    }

    /// StatsD address with the default port filled in when omitted
    pub fn statsd_addr(&self) -> String {
        let host = self.statsd_host.trim();
        let has_port = match host.rsplit_once(':') {
            Some((name, port)) => {
                !name.is_empty() && !name.ends_with(':') && port.parse::<u16>().is_ok()
            }
            None => false,
        };

        if has_port {
            host.to_string()
        } else {
            format!("{}:{}", host, DEFAULT_STATSD_PORT)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn applies_defaults_for_optional_keys() {
        let settings = Settings::from_map(vars(&[
            ("POSTGRES_DSN", "postgres://bot@localhost/bot"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();

        assert_eq!(settings.postgres_dsn, "postgres://bot@localhost/bot");
        assert_eq!(settings.openai_api_key, "sk-test");
        assert_eq!(settings.openai_base_url, DEFAULT_OPENAI_BASE_URL);
        assert_eq!(settings.proxy, None);
        assert_eq!(settings.statsd_host, DEFAULT_STATSD_HOST);
        assert_eq!(settings.statsd_prefix, None);
        assert_eq!(settings.statsd_addr(), "localhost:8125");
    }

    #[test]
    fn reads_all_recognized_keys() {
        let settings = Settings::from_map(vars(&[
            ("POSTGRES_DSN", "postgres://db/bot"),
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_BASE_URL", "https://llm.internal/v1"),
            ("PROXY", "http://proxy:3128"),
            ("STATSD_HOST", "metrics:9125"),
            ("STATSD_PREFIX", "tgbot"),
        ]))
        .unwrap();

        assert_eq!(settings.openai_base_url, "https://llm.internal/v1");
        assert_eq!(settings.proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(settings.statsd_addr(), "metrics:9125");
        assert_eq!(settings.statsd_prefix.as_deref(), Some("tgbot"));
    }

    #[test]
    fn empty_optional_values_are_treated_as_unset() {
        let settings = Settings::from_map(vars(&[
            ("POSTGRES_DSN", "postgres://db/bot"),
            ("OPENAI_API_KEY", "sk-test"),
            ("PROXY", ""),
            ("STATSD_PREFIX", " "),
        ]))
        .unwrap();

        assert_eq!(settings.proxy, None);
        assert_eq!(settings.statsd_prefix, None);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let result = Settings::from_map(vars(&[("OPENAI_API_KEY", "sk-test")]));

        assert!(result.is_err());
    }
}
