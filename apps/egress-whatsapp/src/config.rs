use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use gwb_core::platforms::whatsapp::{DEFAULT_API_BASE, SendMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressConfig {
    pub database: String,
    pub api_base: String,
    pub graph_timeout: Duration,
    pub poll_interval: Duration,
    pub batch: usize,
    pub mode: SendMode,
    /// Signature used when the message has no contact author.
    pub sender_name: String,
}

impl EgressConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let number = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} is not a number: {raw}")),
                None => Ok(default),
            }
        };
        let strict = lookup("EGRESS_STRICT")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Ok(Self {
            database: lookup("GATEWAY_DB").unwrap_or_else(|| "gateway.db".into()),
            api_base: lookup("GRAPH_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.into()),
            graph_timeout: Duration::from_secs(number("GRAPH_TIMEOUT_SECS", 10)?),
            poll_interval: Duration::from_secs(number("EGRESS_POLL_SECS", 5)?.max(1)),
            batch: usize::try_from(number("EGRESS_BATCH", 50)?).unwrap_or(usize::MAX),
            mode: if strict {
                SendMode::Strict
            } else {
                SendMode::Lenient
            },
            sender_name: lookup("EGRESS_SENDER_NAME").unwrap_or_else(|| "Bot".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_lenient() {
        let cfg = EgressConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.batch, 50);
        assert_eq!(cfg.mode, SendMode::Lenient);
        assert_eq!(cfg.sender_name, "Bot");
    }

    #[test]
    fn strict_and_batch_overrides() {
        let cfg = EgressConfig::from_lookup(lookup(&[
            ("EGRESS_STRICT", "true"),
            ("EGRESS_BATCH", "5"),
            ("EGRESS_POLL_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.mode, SendMode::Strict);
        assert_eq!(cfg.batch, 5);
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn invalid_number_is_an_error() {
        assert!(EgressConfig::from_lookup(lookup(&[("EGRESS_BATCH", "many")])).is_err());
    }
}
