//! Constant-token bouncer, mostly useful for tests and smoke setups.

use async_trait::async_trait;
use subtle::ConstantTimeEq;
use tracing::info;

use super::{AuthOutcome, Bouncer, KeycardRegistry};
use crate::keycard::{Credentials, Keycard};

pub struct TokenTestBouncer {
    name: String,
    token: String,
    /// When set, only these requester ids may authenticate.
    allowed_ids: Option<Vec<String>>,
    registry: KeycardRegistry,
}

impl TokenTestBouncer {
    #[must_use]
    pub fn new(name: &str, token: &str, allowed_ids: Option<Vec<String>>) -> Self {
        Self {
            name: name.to_string(),
            token: token.to_string(),
            allowed_ids,
            registry: KeycardRegistry::new(),
        }
    }
}

#[async_trait]
impl Bouncer for TokenTestBouncer {
    fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &KeycardRegistry {
        &self.registry
    }

    async fn authenticate(&self, keycard: Keycard) -> AuthOutcome {
        let Credentials::Token { token } = &keycard.credentials else {
            return AuthOutcome::Refused;
        };
        if let Some(allowed) = &self.allowed_ids {
            if !allowed.contains(&keycard.requester_id) {
                info!(requester_id = %keycard.requester_id, "refused, requester not allowed");
                return AuthOutcome::Refused;
            }
        }
        if bool::from(token.as_bytes().ct_eq(self.token.as_bytes())) {
            let mut keycard = keycard.authenticated();
            self.registry.add(&mut keycard);
            AuthOutcome::Accepted(keycard)
        } else {
            info!("refused, bad token");
            AuthOutcome::Refused
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_comparison() {
        let bouncer = TokenTestBouncer::new("token", "sesame", None);
        assert!(matches!(
            bouncer.authenticate(Keycard::token("sesame")).await,
            AuthOutcome::Accepted(_)
        ));
        assert!(matches!(
            bouncer.authenticate(Keycard::token("wrong")).await,
            AuthOutcome::Refused
        ));
        assert!(matches!(
            bouncer.authenticate(Keycard::generic()).await,
            AuthOutcome::Refused
        ));
    }

    #[tokio::test]
    async fn test_allowed_ids() {
        let bouncer =
            TokenTestBouncer::new("token", "sesame", Some(vec!["streamer-a".to_string()]));
        let mut card = Keycard::token("sesame");
        card.requester_id = "streamer-a".to_string();
        assert!(matches!(
            bouncer.authenticate(card).await,
            AuthOutcome::Accepted(_)
        ));

        let mut card = Keycard::token("sesame");
        card.requester_id = "streamer-b".to_string();
        assert!(matches!(
            bouncer.authenticate(card).await,
            AuthOutcome::Refused
        ));
    }
}
