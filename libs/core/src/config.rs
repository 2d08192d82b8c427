//! Declarative bridge configuration loaded from YAML.
//!
//! ```
//! use gwb_core::config::BridgeConfig;
//!
//! let cfg = BridgeConfig::from_yaml("gateways: []\n").unwrap();
//! assert!(cfg.identity.create_contacts);
//! assert_eq!(cfg.identity.landline_lengths, vec![12]);
//! ```

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::actions::ActionRegistry;
use crate::store::{ChangeSet, RecordStore, StoreError};
use crate::types::{ButtonBinding, Gateway, GatewayState, ProviderCredentials, Template, new_id};

pub const WHATSAPP_GATEWAY_TYPE: &str = "whatsapp";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bridge configuration")]
    Parse(#[from] serde_yaml_bw::Error),
    #[error("gateway `{name}` is invalid: {reason}")]
    InvalidGateway { name: String, reason: String },
    #[error("button binding references unknown template `{template}`")]
    UnknownTemplate { template: String },
    #[error("button `{payload}` of template `{template}` is bound to unknown action `{action}`")]
    UnknownAction {
        template: String,
        payload: String,
        action: String,
    },
    #[error("failed to seed configuration")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub gateways: Vec<GatewaySpec>,
    pub templates: Vec<TemplateSpec>,
    pub button_bindings: Vec<ButtonBindingSpec>,
    pub identity: IdentityConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySpec {
    pub name: String,
    pub token: String,
    #[serde(default = "default_gateway_type")]
    pub gateway_type: String,
    pub webhook_secret: String,
    pub verify_token: String,
    pub bearer_token: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub from_phone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    pub template_name: String,
    #[serde(default = "default_lang_code")]
    pub lang_code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ButtonBindingSpec {
    pub template: String,
    pub payload: String,
    pub action: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Sender number lengths (digits plus the leading `+`) stored as landline.
    pub landline_lengths: Vec<usize>,
    /// Create contacts for unknown senders; guests otherwise.
    pub create_contacts: bool,
    pub default_priority: u8,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            landline_lengths: vec![12],
            create_contacts: true,
            default_priority: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFailurePolicy {
    #[default]
    Skip,
    Abort,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Button texts or payloads that close a conversation instead of queueing it.
    pub terminal_actions: Vec<String>,
    /// Automatic reply posted when a conversation enters the queue.
    pub ack_body: Option<String>,
    pub ack_sender_name: String,
    pub media_failure: MediaFailurePolicy,
    pub queue_enabled: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            terminal_actions: ["CONFIRM", "CANCEL", "CONFIRMAR", "CANCELAR"]
                .into_iter()
                .map(String::from)
                .collect(),
            ack_body: None,
            ack_sender_name: "Bot".into(),
            media_failure: MediaFailurePolicy::Skip,
            queue_enabled: true,
        }
    }
}

impl DispatchConfig {
    pub fn is_terminal(&self, value: &str) -> bool {
        self.terminal_actions
            .iter()
            .any(|action| action.eq_ignore_ascii_case(value.trim()))
    }
}

fn default_gateway_type() -> String {
    WHATSAPP_GATEWAY_TYPE.into()
}

fn default_api_version() -> String {
    "20.0".into()
}

fn default_lang_code() -> String {
    "en".into()
}

/// Counts of records written by [`BridgeConfig::seed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub gateways: usize,
    pub templates: usize,
    pub button_bindings: usize,
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml_bw::from_str(raw)?)
    }

    /// Rejects incomplete gateways and bindings to unregistered actions.
    pub fn validate(&self, registry: &ActionRegistry) -> Result<(), ConfigError> {
        let mut owners = HashSet::new();
        for gateway in &self.gateways {
            let missing = [
                ("token", &gateway.token),
                ("webhook_secret", &gateway.webhook_secret),
                ("verify_token", &gateway.verify_token),
                ("bearer_token", &gateway.bearer_token),
                ("from_phone", &gateway.from_phone),
            ]
            .into_iter()
            .find(|(_, value)| value.trim().is_empty());
            if let Some((field, _)) = missing {
                return Err(ConfigError::InvalidGateway {
                    name: gateway.name.clone(),
                    reason: format!("`{field}` must not be empty"),
                });
            }
            if !owners.insert((gateway.token.as_str(), gateway.gateway_type.as_str())) {
                return Err(ConfigError::InvalidGateway {
                    name: gateway.name.clone(),
                    reason: "token already used by another gateway".into(),
                });
            }
        }

        let templates: HashSet<&str> = self.templates.iter().map(|t| t.name.as_str()).collect();
        for binding in &self.button_bindings {
            if !templates.contains(binding.template.as_str()) {
                return Err(ConfigError::UnknownTemplate {
                    template: binding.template.clone(),
                });
            }
            if !registry.contains(&binding.action) {
                return Err(ConfigError::UnknownAction {
                    template: binding.template.clone(),
                    payload: binding.payload.clone(),
                    action: binding.action.clone(),
                });
            }
        }
        Ok(())
    }

    /// Upserts configured records, keeping ids and handshake state of known gateways.
    pub async fn seed(&self, store: &dyn RecordStore) -> Result<SeedReport, ConfigError> {
        let mut changes = ChangeSet::new();
        let mut report = SeedReport::default();

        for spec in &self.gateways {
            let existing = store.gateway(&spec.token, &spec.gateway_type).await?;
            let (id, state) = existing
                .map(|g| (g.id, g.state))
                .unwrap_or_else(|| (new_id(), GatewayState::Pending));
            changes.put(Gateway {
                id,
                name: spec.name.clone(),
                token: spec.token.clone(),
                gateway_type: spec.gateway_type.clone(),
                state,
                webhook_secret: spec.webhook_secret.clone(),
                verify_token: spec.verify_token.clone(),
                credentials: ProviderCredentials {
                    bearer_token: spec.bearer_token.clone(),
                    api_version: spec.api_version.clone(),
                    from_phone: spec.from_phone.clone(),
                },
            });
            report.gateways += 1;
        }

        let mut template_ids = std::collections::HashMap::new();
        for spec in &self.templates {
            let id = store
                .template(&spec.name)
                .await?
                .map(|t| t.id)
                .unwrap_or_else(new_id);
            template_ids.insert(spec.name.clone(), id.clone());
            changes.put(Template {
                id,
                name: spec.name.clone(),
                template_name: spec.template_name.clone(),
                lang_code: spec.lang_code.clone(),
            });
            report.templates += 1;
        }

        for spec in &self.button_bindings {
            let Some(template_id) = template_ids.get(&spec.template) else {
                return Err(ConfigError::UnknownTemplate {
                    template: spec.template.clone(),
                });
            };
            let id = store
                .button_binding(template_id, &spec.payload)
                .await?
                .map(|b| b.id)
                .unwrap_or_else(new_id);
            changes.put(ButtonBinding {
                id,
                template_id: template_id.clone(),
                payload: spec.payload.clone(),
                action: spec.action.clone(),
            });
            report.button_bindings += 1;
        }

        store.commit(changes).await?;
        info!(
            gateways = report.gateways,
            templates = report.templates,
            button_bindings = report.button_bindings,
            "bridge configuration seeded"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    const SAMPLE: &str = r#"
gateways:
  - name: Main line
    token: main
    webhook_secret: app-secret
    verify_token: verify-me
    bearer_token: graph-token
    from_phone: "1098765"
templates:
  - name: booking
    template_name: booking_confirmation
    lang_code: es
button_bindings:
  - template: booking
    payload: CONFIRMAR
    action: lead.confirm
dispatch:
  ack_body: "We will be with you shortly"
  media_failure: abort
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = BridgeConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.gateways[0].gateway_type, "whatsapp");
        assert_eq!(cfg.gateways[0].api_version, "20.0");
        assert_eq!(cfg.dispatch.media_failure, MediaFailurePolicy::Abort);
        assert_eq!(cfg.dispatch.ack_sender_name, "Bot");
        assert!(cfg.dispatch.is_terminal("confirmar"));
        assert!(!cfg.dispatch.is_terminal("maybe"));
    }

    #[test]
    fn rejects_binding_to_unknown_action() {
        let mut cfg = BridgeConfig::from_yaml(SAMPLE).unwrap();
        cfg.button_bindings[0].action = "lead.explode".into();
        let err = cfg.validate(&ActionRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAction { action, .. } if action == "lead.explode"));
    }

    #[test]
    fn rejects_gateway_without_secret() {
        let mut cfg = BridgeConfig::from_yaml(SAMPLE).unwrap();
        cfg.gateways[0].webhook_secret = " ".into();
        let err = cfg.validate(&ActionRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidGateway { .. }));
    }

    #[tokio::test]
    async fn seeding_twice_keeps_ids_and_state() {
        let cfg = BridgeConfig::from_yaml(SAMPLE).unwrap();
        cfg.validate(&ActionRegistry::with_builtins()).unwrap();
        let store = InMemoryStore::new();
        cfg.seed(&store).await.unwrap();
        let gateway = store.gateway("main", "whatsapp").await.unwrap().unwrap();
        assert_eq!(gateway.state, GatewayState::Pending);
        store
            .set_gateway_state(&gateway.id, GatewayState::Integrated)
            .await
            .unwrap();

        let report = cfg.seed(&store).await.unwrap();
        assert_eq!(report.button_bindings, 1);
        let again = store.gateway("main", "whatsapp").await.unwrap().unwrap();
        assert_eq!(again.id, gateway.id);
        assert!(again.is_integrated());
        assert_eq!(store.button_bindings().await.unwrap().len(), 1);
    }
}
