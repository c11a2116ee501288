//! htpasswd-backed bouncers.
//!
//! Two variants over the same two-phase challenge protocol:
//! [`HtpasswdCryptBouncer`] verifies crypt(3)-hashed passwords,
//! [`SaltSha256Bouncer`] verifies `sha256(salt || password)` records.
//!
//! The challenge flow: the first call stamps the user's salt and a
//! random challenge on the card and remembers the challenge under the
//! card's id; the second call refuses when the challenge came back
//! altered (tamper detection), otherwise checks the response against
//! the stored credential.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::{AuthOutcome, Bouncer, KeycardRegistry};
use crate::keycard::{Credentials, Keycard};
use crate::{Error, Result};

/// Characters valid in a crypt(3) salt; challenges are drawn from the
/// same alphabet so they can serve as salts for the response hash.
const SALT_CHARS: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const CHALLENGE_LEN: usize = 16;

fn crypt_challenge() -> String {
    let mut rng = rand::rng();
    (0..CHALLENGE_LEN)
        .map(|_| SALT_CHARS[rng.random_range(0..SALT_CHARS.len())] as char)
        .collect()
}

fn fake_salt() -> String {
    let mut rng = rand::rng();
    (0..2)
        .map(|_| SALT_CHARS[rng.random_range(0..SALT_CHARS.len())] as char)
        .collect()
}

fn read_source(file: Option<&str>, data: Option<&str>) -> Result<String> {
    match (file, data) {
        (Some(path), _) => {
            let contents = std::fs::read_to_string(path)?;
            debug!(path, "loaded credential file");
            Ok(contents)
        }
        (None, Some(data)) => Ok(data.to_string()),
        (None, None) => Err(Error::Config(
            "htpasswd bouncer needs either a file or inline data".to_string(),
        )),
    }
}

/// Crypt(3) htpasswd bouncer.
pub struct HtpasswdCryptBouncer {
    name: String,
    db: HashMap<String, String>,
    challenges: Mutex<HashMap<String, String>>,
    registry: KeycardRegistry,
}

impl HtpasswdCryptBouncer {
    pub fn from_source(name: &str, file: Option<&str>, data: Option<&str>) -> Result<Self> {
        let contents = read_source(file, data)?;
        let mut db = HashMap::new();
        for line in contents.lines() {
            if let Some((user, crypted)) = line.trim().split_once(':') {
                db.insert(user.to_string(), crypted.to_string());
            }
        }
        debug!(name, users = db.len(), "htpasswd bouncer ready");
        Ok(Self {
            name: name.to_string(),
            db,
            challenges: Mutex::new(HashMap::new()),
            registry: KeycardRegistry::new(),
        })
    }

    fn salt_for(&self, username: &str) -> String {
        self.db
            .get(username)
            .filter(|c| c.len() >= 2)
            .map_or_else(fake_salt, |c| c[..2].to_string())
    }

    /// crypt the stored credential with the challenge as salt; the
    /// client computes the same and sends it back as the response.
    fn expected_response(challenge: &str, crypted: &str) -> Result<String> {
        pwhash::unix_crypt::hash_with(challenge, crypted)
            .map_err(|e| Error::Internal(format!("crypt failed: {e}")))
    }

    fn check_challenge(&self, keycard: Keycard) -> AuthOutcome {
        let Credentials::UsernameCryptChallenge {
            username,
            challenge,
            response,
            ..
        } = keycard.credentials.clone()
        else {
            return AuthOutcome::Refused;
        };

        match response {
            None => {
                let mut keycard = keycard;
                self.registry.add(&mut keycard);
                let salt = self.salt_for(&username);
                let challenge = crypt_challenge();
                if let Some(id) = &keycard.id {
                    self.challenges
                        .lock()
                        .insert(id.clone(), challenge.clone());
                }
                debug!(username, "issued crypt challenge");
                keycard.credentials = Credentials::UsernameCryptChallenge {
                    username,
                    salt: Some(salt),
                    challenge: Some(challenge),
                    response: None,
                };
                AuthOutcome::Challenge(keycard)
            }
            Some(response) => {
                let Some(id) = keycard.id.clone() else {
                    return AuthOutcome::Refused;
                };
                let stored = self.challenges.lock().get(&id).cloned();
                let Some(stored) = stored else {
                    return AuthOutcome::Refused;
                };
                if challenge.as_deref() != Some(stored.as_str()) {
                    let _ = self.registry.remove(&id);
                    self.challenges.lock().remove(&id);
                    info!(username, "keycard refused, challenge tampered with");
                    return AuthOutcome::Refused;
                }
                self.challenges.lock().remove(&id);

                let Some(crypted) = self.db.get(&username) else {
                    let _ = self.registry.remove(&id);
                    info!(username, "keycard refused, unknown user");
                    return AuthOutcome::Refused;
                };
                let expected = match Self::expected_response(&stored, crypted) {
                    Ok(expected) => expected,
                    Err(e) => return AuthOutcome::Error(e),
                };
                if bool::from(expected.as_bytes().ct_eq(response.as_bytes())) {
                    info!(username, "authenticated login");
                    AuthOutcome::Accepted(keycard.authenticated())
                } else {
                    let _ = self.registry.remove(&id);
                    info!(username, "keycard refused, bad response");
                    AuthOutcome::Refused
                }
            }
        }
    }
}

#[async_trait]
impl Bouncer for HtpasswdCryptBouncer {
    fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &KeycardRegistry {
        &self.registry
    }

    async fn authenticate(&self, keycard: Keycard) -> AuthOutcome {
        match keycard.credentials.clone() {
            Credentials::UsernamePassword { username, password } => {
                let Some(crypted) = self.db.get(&username) else {
                    info!(username, "keycard refused, unknown user");
                    return AuthOutcome::Refused;
                };
                if pwhash::unix::verify(&password, crypted) {
                    let mut keycard = keycard.authenticated();
                    self.registry.add(&mut keycard);
                    info!(username, "authenticated login");
                    AuthOutcome::Accepted(keycard)
                } else {
                    info!(username, "keycard refused, bad password");
                    AuthOutcome::Refused
                }
            }
            Credentials::UsernameCryptChallenge { .. } => self.check_challenge(keycard),
            _ => {
                warn!("keycard type not handled by htpasswd bouncer");
                AuthOutcome::Refused
            }
        }
    }
}

/// Salted SHA-256 bouncer; records are `user:salt:hex(sha256(salt || password))`.
pub struct SaltSha256Bouncer {
    name: String,
    db: HashMap<String, (String, String)>,
    challenges: Mutex<HashMap<String, String>>,
    registry: KeycardRegistry,
}

impl SaltSha256Bouncer {
    pub fn from_source(name: &str, file: Option<&str>, data: Option<&str>) -> Result<Self> {
        let contents = read_source(file, data)?;
        let mut db = HashMap::new();
        for line in contents.lines() {
            let mut parts = line.trim().splitn(3, ':');
            if let (Some(user), Some(salt), Some(hash)) =
                (parts.next(), parts.next(), parts.next())
            {
                db.insert(user.to_string(), (salt.to_string(), hash.to_string()));
            }
        }
        debug!(name, users = db.len(), "salt-sha256 bouncer ready");
        Ok(Self {
            name: name.to_string(),
            db,
            challenges: Mutex::new(HashMap::new()),
            registry: KeycardRegistry::new(),
        })
    }

    /// Hash a password with the user's salt, producing the stored form.
    #[must_use]
    pub fn hash_password(salt: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// The response expected for a challenge against a stored hash.
    #[must_use]
    pub fn expected_response(challenge: &str, stored_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(challenge.as_bytes());
        hasher.update(stored_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl Bouncer for SaltSha256Bouncer {
    fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &KeycardRegistry {
        &self.registry
    }

    async fn authenticate(&self, keycard: Keycard) -> AuthOutcome {
        match keycard.credentials.clone() {
            Credentials::UsernamePassword { username, password } => {
                let Some((salt, stored)) = self.db.get(&username) else {
                    info!(username, "keycard refused, unknown user");
                    return AuthOutcome::Refused;
                };
                let computed = Self::hash_password(salt, &password);
                if bool::from(computed.as_bytes().ct_eq(stored.as_bytes())) {
                    let mut keycard = keycard.authenticated();
                    self.registry.add(&mut keycard);
                    info!(username, "authenticated login");
                    AuthOutcome::Accepted(keycard)
                } else {
                    info!(username, "keycard refused, bad password");
                    AuthOutcome::Refused
                }
            }
            Credentials::UsernameCryptChallenge {
                username,
                challenge,
                response,
                ..
            } => match response {
                None => {
                    let mut keycard = keycard;
                    self.registry.add(&mut keycard);
                    let salt = self
                        .db
                        .get(&username)
                        .map_or_else(fake_salt, |(salt, _)| salt.clone());
                    let challenge = crypt_challenge();
                    if let Some(id) = &keycard.id {
                        self.challenges
                            .lock()
                            .insert(id.clone(), challenge.clone());
                    }
                    keycard.credentials = Credentials::UsernameCryptChallenge {
                        username,
                        salt: Some(salt),
                        challenge: Some(challenge),
                        response: None,
                    };
                    AuthOutcome::Challenge(keycard)
                }
                Some(response) => {
                    let Some(id) = keycard.id.clone() else {
                        return AuthOutcome::Refused;
                    };
                    let stored_challenge = self.challenges.lock().get(&id).cloned();
                    let Some(stored_challenge) = stored_challenge else {
                        return AuthOutcome::Refused;
                    };
                    if challenge.as_deref() != Some(stored_challenge.as_str()) {
                        let _ = self.registry.remove(&id);
                        self.challenges.lock().remove(&id);
                        info!(username, "keycard refused, challenge tampered with");
                        return AuthOutcome::Refused;
                    }
                    self.challenges.lock().remove(&id);

                    let Some((_, stored_hash)) = self.db.get(&username) else {
                        let _ = self.registry.remove(&id);
                        return AuthOutcome::Refused;
                    };
                    let expected = Self::expected_response(&stored_challenge, stored_hash);
                    if bool::from(expected.as_bytes().ct_eq(response.as_bytes())) {
                        info!(username, "authenticated login");
                        AuthOutcome::Accepted(keycard.authenticated())
                    } else {
                        let _ = self.registry.remove(&id);
                        info!(username, "keycard refused, bad response");
                        AuthOutcome::Refused
                    }
                }
            },
            _ => AuthOutcome::Refused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keycard::KeycardState;

    // "test" crypted with salt "qi", the classic example pair.
    const CRYPT_DB: &str = "user:qi1Lftt0GZC0o\n";

    fn challenge_card(username: &str) -> Keycard {
        Keycard::new(Credentials::UsernameCryptChallenge {
            username: username.to_string(),
            salt: None,
            challenge: None,
            response: None,
        })
    }

    #[tokio::test]
    async fn test_crypt_plain_password() {
        let bouncer =
            HtpasswdCryptBouncer::from_source("htpasswd", None, Some(CRYPT_DB)).expect("setup");

        let card = Keycard::username_password("user", "test");
        match bouncer.authenticate(card).await {
            AuthOutcome::Accepted(card) => {
                assert_eq!(card.state, KeycardState::Authenticated);
                assert!(card.id.is_some());
            }
            other => panic!("expected acceptance, got {other:?}"),
        }

        let card = Keycard::username_password("user", "wrong");
        assert!(matches!(
            bouncer.authenticate(card).await,
            AuthOutcome::Refused
        ));

        let card = Keycard::username_password("ghost", "test");
        assert!(matches!(
            bouncer.authenticate(card).await,
            AuthOutcome::Refused
        ));
    }

    #[tokio::test]
    async fn test_crypt_challenge_round_trip() {
        let bouncer =
            HtpasswdCryptBouncer::from_source("htpasswd", None, Some(CRYPT_DB)).expect("setup");

        let AuthOutcome::Challenge(card) = bouncer.authenticate(challenge_card("user")).await
        else {
            panic!("expected a challenge");
        };
        let Credentials::UsernameCryptChallenge {
            salt, challenge, ..
        } = &card.credentials
        else {
            panic!("challenge credentials expected");
        };
        assert_eq!(salt.as_deref(), Some("qi"));
        let challenge = challenge.clone().expect("challenge set");

        // The client crypts its own crypted password with the challenge.
        let response =
            pwhash::unix_crypt::hash_with(challenge.as_str(), "qi1Lftt0GZC0o").expect("crypt");

        let mut answered = card.clone();
        answered.credentials = Credentials::UsernameCryptChallenge {
            username: "user".to_string(),
            salt: salt.clone(),
            challenge: Some(challenge.clone()),
            response: Some(response),
        };
        assert!(matches!(
            bouncer.authenticate(answered).await,
            AuthOutcome::Accepted(_)
        ));
    }

    #[tokio::test]
    async fn test_crypt_challenge_tamper_refused() {
        let bouncer =
            HtpasswdCryptBouncer::from_source("htpasswd", None, Some(CRYPT_DB)).expect("setup");

        let AuthOutcome::Challenge(card) = bouncer.authenticate(challenge_card("user")).await
        else {
            panic!("expected a challenge");
        };

        // Swap the challenge before answering.
        let mut tampered = card.clone();
        tampered.credentials = Credentials::UsernameCryptChallenge {
            username: "user".to_string(),
            salt: Some("qi".to_string()),
            challenge: Some("AAAAAAAAAAAAAAAA".to_string()),
            response: Some("whatever".to_string()),
        };
        assert!(matches!(
            bouncer.authenticate(tampered).await,
            AuthOutcome::Refused
        ));
        // The card was ejected; its id is no longer tracked.
        assert!(!bouncer.registry().contains(card.id.as_deref().unwrap_or("")));
    }

    #[tokio::test]
    async fn test_unknown_user_gets_fake_salt() {
        let bouncer =
            HtpasswdCryptBouncer::from_source("htpasswd", None, Some(CRYPT_DB)).expect("setup");
        let AuthOutcome::Challenge(card) = bouncer.authenticate(challenge_card("ghost")).await
        else {
            panic!("expected a challenge");
        };
        let Credentials::UsernameCryptChallenge { salt, .. } = &card.credentials else {
            panic!("challenge credentials expected");
        };
        assert_eq!(salt.as_deref().map(str::len), Some(2));
    }

    #[tokio::test]
    async fn test_salt_sha256_plain_and_challenge() {
        let stored = SaltSha256Bouncer::hash_password("s4", "secret");
        let data = format!("user:s4:{stored}\n");
        let bouncer =
            SaltSha256Bouncer::from_source("sha", None, Some(&data)).expect("setup");

        let card = Keycard::username_password("user", "secret");
        assert!(matches!(
            bouncer.authenticate(card).await,
            AuthOutcome::Accepted(_)
        ));

        let card = Keycard::username_password("user", "wrong");
        assert!(matches!(
            bouncer.authenticate(card).await,
            AuthOutcome::Refused
        ));

        let AuthOutcome::Challenge(card) = bouncer.authenticate(challenge_card("user")).await
        else {
            panic!("expected a challenge");
        };
        let Credentials::UsernameCryptChallenge {
            salt, challenge, ..
        } = &card.credentials
        else {
            panic!("challenge credentials expected");
        };
        assert_eq!(salt.as_deref(), Some("s4"));
        let challenge = challenge.clone().expect("challenge set");

        let response = SaltSha256Bouncer::expected_response(&challenge, &stored);
        let mut answered = card;
        answered.credentials = Credentials::UsernameCryptChallenge {
            username: "user".to_string(),
            salt: Some("s4".to_string()),
            challenge: Some(challenge),
            response: Some(response),
        };
        assert!(matches!(
            bouncer.authenticate(answered).await,
            AuthOutcome::Accepted(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_source_is_config_error() {
        assert!(HtpasswdCryptBouncer::from_source("h", None, None).is_err());
    }
}
