//! Bouncers perform authentication decisions on keycards.
//!
//! A bouncer receives a keycard in the `Requesting` state and returns
//! an [`AuthOutcome`]: the card accepted (now `Authenticated`), a
//! challenge to be answered by a second round, a refusal, or an error.
//! Accepted cards are tracked by a [`KeycardRegistry`] which assigns
//! ids, counts down TTLs and honors keep-alive refreshes; callers that
//! cannot reliably remove cards rely on TTL expiry as the backstop.

mod htpasswd;
mod ical;
mod ipfilter;
mod multi;
mod token;

pub use htpasswd::{HtpasswdCryptBouncer, SaltSha256Bouncer};
pub use ical::IcalBouncer;
pub use ipfilter::{IpBouncer, RoutingTable};
pub use multi::MultiBouncer;
pub use token::TokenTestBouncer;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::BouncerConfig;
use crate::keycard::Keycard;
use crate::{Error, Result};

/// How often tracked keycard TTLs are counted down.
pub const KEYCARD_EXPIRE_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Result of a bouncer decision.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Card accepted; state is `Authenticated` and an id is assigned.
    Accepted(Keycard),
    /// Two-phase flow: the returned card carries the challenge data
    /// and must be resubmitted with a response.
    Challenge(Keycard),
    Refused,
    Error(Error),
}

#[async_trait]
pub trait Bouncer: Send + Sync {
    fn name(&self) -> &str;

    /// Decide on a keycard. Terminal outcomes leave the card
    /// `Authenticated` or `Refused`, never `Requesting`.
    async fn authenticate(&self, keycard: Keycard) -> AuthOutcome;

    fn registry(&self) -> &KeycardRegistry;

    /// Forget a keycard the caller no longer needs.
    async fn remove_keycard(&self, keycard_id: &str) -> Result<()> {
        self.registry().remove(keycard_id)?;
        Ok(())
    }

    /// Reset the TTL of every keycard issued under `issuer_name`.
    async fn keep_alive(&self, issuer_name: &str, ttl: u64) -> Result<()> {
        self.registry().keep_alive(issuer_name, ttl);
        Ok(())
    }
}

struct TrackedCard {
    keycard: Keycard,
    /// Seconds until TTL expiry; None when the card never expires.
    remaining: Option<f64>,
}

#[derive(Default)]
struct RegistryInner {
    counter: u64,
    cards: HashMap<String, TrackedCard>,
}

/// Bookkeeping for accepted keycards: id issue, TTL countdown,
/// keep-alive refresh and revocation.
#[derive(Clone, Default)]
pub struct KeycardRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl KeycardRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an id to the card and start tracking it. Adding a card
    /// that is already tracked succeeds and leaves it untouched.
    pub fn add(&self, keycard: &mut Keycard) {
        let mut inner = self.inner.lock();
        if let Some(id) = &keycard.id {
            if inner.cards.contains_key(id) {
                return;
            }
        }
        inner.counter += 1;
        let id = format!("{:016x}", inner.counter);
        keycard.id = Some(id.clone());
        let remaining = (keycard.ttl != 0).then_some(keycard.ttl as f64);
        inner.cards.insert(
            id.clone(),
            TrackedCard {
                keycard: keycard.clone(),
                remaining,
            },
        );
        debug!(keycard_id = %id, "keycard added");
    }

    pub fn remove(&self, keycard_id: &str) -> Result<Keycard> {
        let removed = self.inner.lock().cards.remove(keycard_id);
        match removed {
            Some(card) => {
                debug!(keycard_id, "keycard removed");
                Ok(card.keycard)
            }
            None => Err(Error::NotFound(format!("keycard {keycard_id}"))),
        }
    }

    #[must_use]
    pub fn contains(&self, keycard_id: &str) -> bool {
        self.inner.lock().cards.contains_key(keycard_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().cards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().cards.is_empty()
    }

    /// Reset the TTL of all cards under `issuer_name` to `ttl` seconds
    /// from now.
    pub fn keep_alive(&self, issuer_name: &str, ttl: u64) {
        let mut inner = self.inner.lock();
        let mut refreshed = 0usize;
        for card in inner.cards.values_mut() {
            if card.keycard.issuer_name == issuer_name && card.remaining.is_some() {
                card.remaining = Some(ttl as f64);
                refreshed += 1;
            }
        }
        debug!(issuer_name, refreshed, "keycard keep-alive");
    }

    /// Count down TTLs by `elapsed` and collect the cards that expired.
    pub fn tick(&self, elapsed: Duration) -> Vec<Keycard> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        for (id, card) in &mut inner.cards {
            if let Some(remaining) = &mut card.remaining {
                *remaining -= elapsed.as_secs_f64();
                if *remaining <= 0.0 {
                    expired.push(id.clone());
                }
            }
        }
        expired
            .into_iter()
            .filter_map(|id| inner.cards.remove(&id).map(|c| c.keycard))
            .collect()
    }

    /// Spawn the TTL expirer; `on_expire` runs for every card whose
    /// TTL lapses without a keep-alive.
    pub fn start_expirer(
        &self,
        interval: Duration,
        on_expire: impl Fn(Keycard) + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so the
            // first countdown covers a full interval.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for keycard in registry.tick(interval) {
                    info!(keycard_id = ?keycard.id, "keycard ttl expired");
                    on_expire(keycard);
                }
            }
        })
    }
}

/// Build a bouncer tree from configuration.
pub fn from_config(name: &str, config: &BouncerConfig) -> Result<Arc<dyn Bouncer>> {
    match config {
        BouncerConfig::HtpasswdCrypt { file, data } => Ok(Arc::new(
            HtpasswdCryptBouncer::from_source(name, file.as_deref(), data.as_deref())?,
        )),
        BouncerConfig::SaltSha256 { file, data } => Ok(Arc::new(
            SaltSha256Bouncer::from_source(name, file.as_deref(), data.as_deref())?,
        )),
        BouncerConfig::Ip {
            allow,
            deny,
            deny_default,
        } => Ok(Arc::new(IpBouncer::from_rules(
            name,
            allow,
            deny,
            *deny_default,
        )?)),
        BouncerConfig::Ical {
            file,
            max_keycard_duration_secs,
        } => Ok(Arc::new(IcalBouncer::from_file(
            name,
            std::path::Path::new(file),
            max_keycard_duration_secs.map(Duration::from_secs),
        )?)),
        BouncerConfig::Token { token, allowed_ids } => Ok(Arc::new(TokenTestBouncer::new(
            name,
            token,
            allowed_ids.clone(),
        ))),
        BouncerConfig::Multi {
            combination,
            bouncers,
        } => {
            let mut subs: HashMap<String, Arc<dyn Bouncer>> = HashMap::new();
            for (sub_name, sub_config) in bouncers {
                subs.insert(sub_name.clone(), from_config(sub_name, sub_config)?);
            }
            Ok(Arc::new(MultiBouncer::new(name, combination, subs)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_assigns_unique_ids() {
        let registry = KeycardRegistry::new();
        let mut a = Keycard::generic();
        let mut b = Keycard::generic();
        registry.add(&mut a);
        registry.add(&mut b);
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_add_is_idempotent() {
        let registry = KeycardRegistry::new();
        let mut card = Keycard::generic();
        registry.add(&mut card);
        let id = card.id.clone();
        registry.add(&mut card);
        assert_eq!(card.id, id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ttl_countdown_and_expiry() {
        let registry = KeycardRegistry::new();
        let mut card = Keycard::generic();
        card.ttl = 100;
        registry.add(&mut card);

        assert!(registry.tick(Duration::from_secs(60)).is_empty());
        let expired = registry.tick(Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, card.id);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unlimited_ttl_never_expires() {
        let registry = KeycardRegistry::new();
        let mut card = Keycard::generic();
        registry.add(&mut card);
        assert!(registry.tick(Duration::from_secs(1_000_000)).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_keep_alive_extends_from_call_time() {
        let registry = KeycardRegistry::new();
        let mut card = Keycard::generic();
        card.ttl = 100;
        card.issuer_name = "streamer".to_string();
        registry.add(&mut card);

        assert!(registry.tick(Duration::from_secs(90)).is_empty());
        registry.keep_alive("streamer", 100);
        // 90 elapsed + 90 elapsed would have expired the original ttl,
        // but keep-alive restarted the countdown.
        assert!(registry.tick(Duration::from_secs(90)).is_empty());
        assert_eq!(registry.tick(Duration::from_secs(20)).len(), 1);
    }

    #[test]
    fn test_keep_alive_other_issuer_untouched() {
        let registry = KeycardRegistry::new();
        let mut card = Keycard::generic();
        card.ttl = 100;
        card.issuer_name = "streamer-a".to_string();
        registry.add(&mut card);

        registry.keep_alive("streamer-b", 1000);
        assert_eq!(registry.tick(Duration::from_secs(100)).len(), 1);
    }
}
