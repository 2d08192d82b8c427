use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use gwb_core::platforms::whatsapp::DEFAULT_API_BASE;

/// Process settings of the ingress service, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressConfig {
    pub bind: SocketAddr,
    /// SQLite file, or `:memory:` for the in-memory store.
    pub database: String,
    pub bridge_config: Option<PathBuf>,
    pub api_base: String,
    pub graph_timeout: Duration,
    /// `ffmpeg` binary used to convert voice notes; unset keeps the provider codec.
    pub ffmpeg: Option<String>,
}

impl IngressConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = lookup("BIND")
            .unwrap_or_else(|| "0.0.0.0:8069".into())
            .parse()
            .context("BIND must be a socket address")?;
        let graph_timeout = match lookup("GRAPH_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.parse()
                    .with_context(|| format!("GRAPH_TIMEOUT_SECS is not a number: {raw}"))?,
            ),
            None => Duration::from_secs(10),
        };
        Ok(Self {
            bind,
            database: lookup("GATEWAY_DB").unwrap_or_else(|| "gateway.db".into()),
            bridge_config: lookup("GATEWAY_CONFIG").map(PathBuf::from),
            api_base: lookup("GRAPH_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.into()),
            graph_timeout,
            ffmpeg: lookup("FFMPEG_BIN").filter(|value| !value.is_empty()),
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
    fn defaults() {
        let cfg = IngressConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:8069".parse().unwrap());
        assert_eq!(cfg.database, "gateway.db");
        assert_eq!(cfg.api_base, "https://graph.facebook.com");
        assert_eq!(cfg.graph_timeout, Duration::from_secs(10));
        assert!(cfg.bridge_config.is_none());
        assert!(cfg.ffmpeg.is_none());
    }

    #[test]
    fn rejects_bad_timeout() {
        let err = IngressConfig::from_lookup(lookup(&[("GRAPH_TIMEOUT_SECS", "soon")]));
        assert!(err.is_err());
    }

    #[test]
    fn overrides() {
        let cfg = IngressConfig::from_lookup(lookup(&[
            ("BIND", "127.0.0.1:9000"),
            ("GATEWAY_DB", ":memory:"),
            ("GATEWAY_CONFIG", "/etc/gateway.yaml"),
            ("FFMPEG_BIN", "/usr/bin/ffmpeg"),
        ]))
        .unwrap();
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.database, ":memory:");
        assert_eq!(cfg.bridge_config, Some(PathBuf::from("/etc/gateway.yaml")));
        assert_eq!(cfg.ffmpeg.as_deref(), Some("/usr/bin/ffmpeg"));
    }
}
