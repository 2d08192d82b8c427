//! Maps a provider sender token to a contact or guest.

use tracing::{debug, info};

use crate::config::IdentityConfig;
use crate::store::{ChangeSet, RecordStore, Result, StoreError};
use crate::text::sanitize_phone;
use crate::types::{Actor, Contact, Gateway, Guest, IdentityLink, PhoneField, new_id};

const ANONYMOUS: &str = "Anonymous";

/// Decides which contact field an incoming number is stored in.
///
/// ```
/// use gwb_core::identity::PhoneClassifier;
/// use gwb_core::PhoneField;
///
/// let classifier = PhoneClassifier::new(vec![12]);
/// assert_eq!(classifier.classify("+34911223344"), PhoneField::Phone);
/// assert_eq!(classifier.classify("+5215512345678"), PhoneField::Mobile);
/// ```
#[derive(Debug, Clone)]
pub struct PhoneClassifier {
    landline_lengths: Vec<usize>,
}

impl PhoneClassifier {
    pub fn new(landline_lengths: Vec<usize>) -> Self {
        Self { landline_lengths }
    }

    pub fn classify(&self, sanitized: &str) -> PhoneField {
        if self.landline_lengths.contains(&sanitized.len()) {
            PhoneField::Phone
        } else {
            PhoneField::Mobile
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    config: IdentityConfig,
    classifier: PhoneClassifier,
}

impl IdentityResolver {
    pub fn new(config: IdentityConfig) -> Self {
        let classifier = PhoneClassifier::new(config.landline_lengths.clone());
        Self { config, classifier }
    }

    /// Resolves `token` on `gateway`, staging any records it has to create.
    ///
    /// Lookup order: identity link, contact by phone, guest. Unknown senders get a
    /// new contact (or guest) named after `display_name`.
    pub async fn resolve(
        &self,
        store: &dyn RecordStore,
        changes: &mut ChangeSet,
        gateway: &Gateway,
        token: &str,
        display_name: Option<&str>,
    ) -> Result<Actor> {
        if let Some(contact_id) = self.linked_contact(store, changes, gateway, token).await? {
            let contact = match changes.contact(&contact_id).cloned() {
                Some(contact) => contact,
                None => store
                    .contact(&contact_id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("contact {contact_id}")))?,
            };
            return Ok(Actor::Contact(contact));
        }

        let sanitized = sanitize_phone(token);
        if let Some(number) = sanitized.as_deref() {
            let found = match changes.contact_by_phone(number).cloned() {
                Some(contact) => Some(contact),
                None => store.contact_by_phone(number).await?,
            };
            if let Some(contact) = found {
                debug!(contact = %contact.id, "linking sender to existing contact");
                changes.put(self.link(gateway, token, &contact));
                return Ok(Actor::Contact(contact));
            }
        }

        let guest = match changes.guest_by_token(&gateway.id, token).cloned() {
            Some(guest) => Some(guest),
            None => store.guest_by_token(&gateway.id, token).await?,
        };
        if let Some(guest) = guest {
            return Ok(Actor::Guest(guest));
        }

        let name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(ANONYMOUS)
            .to_string();

        match sanitized {
            Some(number) if self.config.create_contacts => {
                let field = self.classifier.classify(&number);
                let (phone, mobile) = match field {
                    PhoneField::Phone => (Some(number), None),
                    PhoneField::Mobile => (None, Some(number)),
                };
                let contact = Contact {
                    id: new_id(),
                    name,
                    phone,
                    mobile,
                    whatsapp_field: Some(field),
                    priority: self.config.default_priority,
                };
                info!(contact = %contact.id, field = ?field, "created contact for new sender");
                changes.put(self.link(gateway, token, &contact));
                changes.put(contact.clone());
                Ok(Actor::Contact(contact))
            }
            _ => {
                let guest = Guest {
                    id: new_id(),
                    name,
                    gateway_id: gateway.id.clone(),
                    gateway_token: token.to_string(),
                };
                info!(guest = %guest.id, "created guest for new sender");
                changes.put(guest.clone());
                Ok(Actor::Guest(guest))
            }
        }
    }

    async fn linked_contact(
        &self,
        store: &dyn RecordStore,
        changes: &ChangeSet,
        gateway: &Gateway,
        token: &str,
    ) -> Result<Option<String>> {
        if let Some(link) = changes.identity_link(&gateway.id, token) {
            return Ok(Some(link.contact_id.clone()));
        }
        Ok(store
            .identity_link(&gateway.id, token)
            .await?
            .map(|link| link.contact_id))
    }

    fn link(&self, gateway: &Gateway, token: &str, contact: &Contact) -> IdentityLink {
        IdentityLink {
            id: new_id(),
            name: gateway.name.clone(),
            gateway_id: gateway.id.clone(),
            gateway_token: token.to_string(),
            contact_id: contact.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{GatewayState, ProviderCredentials};

    fn gateway() -> Gateway {
        Gateway {
            id: "gw".into(),
            name: "Main".into(),
            token: "main".into(),
            gateway_type: "whatsapp".into(),
            state: GatewayState::Integrated,
            webhook_secret: "s".into(),
            verify_token: "v".into(),
            credentials: ProviderCredentials {
                bearer_token: "b".into(),
                api_version: "20.0".into(),
                from_phone: "1".into(),
            },
        }
    }

    #[tokio::test]
    async fn new_sender_becomes_contact_with_link() {
        let store = InMemoryStore::new();
        let resolver = IdentityResolver::new(IdentityConfig::default());
        let mut changes = ChangeSet::new();
        let actor = resolver
            .resolve(&store, &mut changes, &gateway(), "34600000001", Some("Ana"))
            .await
            .unwrap();
        let Actor::Contact(contact) = &actor else {
            panic!("expected contact, got {actor:?}");
        };
        assert_eq!(contact.name, "Ana");
        assert_eq!(contact.phone.as_deref(), Some("+34600000001"));
        assert_eq!(contact.whatsapp_field, Some(PhoneField::Phone));
        assert!(changes.identity_link("gw", "34600000001").is_some());

        let again = resolver
            .resolve(&store, &mut changes, &gateway(), "34600000001", None)
            .await
            .unwrap();
        assert_eq!(again.author_ref(), actor.author_ref());
    }

    #[tokio::test]
    async fn existing_contact_matched_by_phone() {
        let store = InMemoryStore::new();
        let mut seed = ChangeSet::new();
        seed.put(Contact {
            id: "p1".into(),
            name: "Known".into(),
            phone: None,
            mobile: Some("+52 1 55 1234 5678".into()),
            whatsapp_field: None,
            priority: 3,
        });
        store.commit(seed).await.unwrap();

        let resolver = IdentityResolver::new(IdentityConfig::default());
        let mut changes = ChangeSet::new();
        let actor = resolver
            .resolve(&store, &mut changes, &gateway(), "5215512345678", Some("Other"))
            .await
            .unwrap();
        assert_eq!(actor.contact_id(), Some("p1"));
        assert_eq!(actor.priority(), Some(3));
        let link = changes.identity_link("gw", "5215512345678").unwrap();
        assert_eq!(link.contact_id, "p1");
    }

    #[tokio::test]
    async fn guests_when_contact_creation_disabled() {
        let store = InMemoryStore::new();
        let resolver = IdentityResolver::new(IdentityConfig {
            create_contacts: false,
            ..IdentityConfig::default()
        });
        let mut changes = ChangeSet::new();
        let actor = resolver
            .resolve(&store, &mut changes, &gateway(), "34600000001", None)
            .await
            .unwrap();
        assert!(matches!(actor, Actor::Guest(ref g) if g.name == "Anonymous"));
    }
}
