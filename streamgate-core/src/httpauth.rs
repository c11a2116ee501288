//! Per-request keycard issuance and bouncer dispatch for HTTP
//! streamers.
//!
//! The auth layer issues a keycard for each incoming request (how
//! depends on the configured issuer), runs it through the bouncer, and
//! tracks accepted cards per client: a duration timer ejects the
//! client when its grant runs out, a keep-alive pinger refreshes TTLs
//! on the bouncer side, and revocations the bouncer failed to accept
//! are queued and retried.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bouncer::{AuthOutcome, Bouncer};
use crate::config::AuthConfig;
use crate::keycard::{Credentials, Keycard};
use crate::{Error, Result};

/// The slice of an HTTP request the issuers care about.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub client_ip: IpAddr,
    /// Raw `Authorization` header value, when present.
    pub authorization: Option<String>,
    /// `token` query argument, when present.
    pub token: Option<String>,
}

/// How keycards are built from requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuerKind {
    /// No client credentials; authentication rests on server-side
    /// checks (time windows, addresses).
    Generic,
    /// HTTP Basic credentials.
    Basic,
    /// Bearer token from the `token` query argument.
    Token,
}

impl IssuerKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "generic" => Ok(Self::Generic),
            "basic" => Ok(Self::Basic),
            "token" => Ok(Self::Token),
            other => Err(Error::Config(format!("unknown issuer '{other}'"))),
        }
    }

    /// Build a keycard from the request, or nothing when the request
    /// carries no usable credentials.
    #[must_use]
    pub fn issue(&self, request: &RequestInfo) -> Option<Keycard> {
        let card = match self {
            Self::Generic => Keycard::generic(),
            Self::Basic => {
                let header = request.authorization.as_deref()?;
                let encoded = header.strip_prefix("Basic ")?;
                let decoded = BASE64.decode(encoded.trim()).ok()?;
                let decoded = String::from_utf8(decoded).ok()?;
                let (username, password) = decoded.split_once(':')?;
                Keycard::username_password(username, password)
            }
            Self::Token => {
                let token = request.token.as_deref()?;
                Keycard::token(token)
            }
        };
        Some(card.with_address(request.client_ip))
    }
}

/// Removes a client when its keycard grant lapses.
pub trait ClientEjector: Send + Sync {
    fn eject(&self, client_id: &str);
}

struct AuthInner {
    /// client id -> keycard id
    client_to_card: HashMap<String, String>,
    /// keycard id -> (client id, keycard)
    card_to_client: HashMap<String, (String, Keycard)>,
    duration_timers: HashMap<String, tokio::task::JoinHandle<()>>,
    /// Keycards whose bouncer-side removal failed; retried on the next
    /// cleanup.
    cleanup_queue: Vec<Keycard>,
}

/// HTTP authentication front for one streamer instance.
pub struct HttpAuth {
    issuer: IssuerKind,
    bouncer: Option<Arc<dyn Bouncer>>,
    domain: Option<String>,
    requester_id: String,
    default_duration: Option<u64>,
    keepalive_interval: Duration,
    retry_interval: Duration,
    inner: Mutex<AuthInner>,
    ejector: Mutex<Option<Arc<dyn ClientEjector>>>,
}

impl HttpAuth {
    pub fn new(
        config: &AuthConfig,
        requester_id: &str,
        bouncer: Option<Arc<dyn Bouncer>>,
    ) -> Result<Self> {
        Ok(Self {
            issuer: IssuerKind::from_name(&config.issuer)?,
            bouncer,
            domain: config.domain.clone(),
            requester_id: requester_id.to_string(),
            default_duration: config.default_duration_secs,
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs),
            retry_interval: Duration::from_secs(config.retry_interval_secs),
            inner: Mutex::new(AuthInner {
                client_to_card: HashMap::new(),
                card_to_client: HashMap::new(),
                duration_timers: HashMap::new(),
                cleanup_queue: Vec::new(),
            }),
            ejector: Mutex::new(None),
        })
    }

    pub fn set_ejector(&self, ejector: Arc<dyn ClientEjector>) {
        *self.ejector.lock() = Some(ejector);
    }

    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.inner.lock().client_to_card.len()
    }

    /// Issue a keycard for the request and run it through the bouncer.
    ///
    /// `Ok(keycard)` means the client is in; `Error::NotAuthenticated`
    /// maps to 401, anything else to 500.
    pub async fn start_authentication(
        self: &Arc<Self>,
        request: &RequestInfo,
        client_id: &str,
    ) -> Result<Keycard> {
        let Some(mut keycard) = self.issuer.issue(request) else {
            debug!(client_id, "no keycard from issuer");
            return Err(Error::NotAuthenticated);
        };
        keycard.requester_id = self.requester_id.clone();
        keycard.issuer_name = self.requester_id.clone();
        keycard.domain = self.domain.clone();

        let keycard = match &self.bouncer {
            None => {
                debug!(client_id, "no bouncer, accepting");
                keycard.authenticated()
            }
            Some(bouncer) => match bouncer.authenticate(keycard).await {
                AuthOutcome::Accepted(card) => {
                    let id = card.id.clone().unwrap_or_default();
                    let mut inner = self.inner.lock();
                    if inner.card_to_client.contains_key(&id) {
                        // Replay guard.
                        info!(keycard_id = %id, "duplicate keycard id refused");
                        return Err(Error::NotAuthenticated);
                    }
                    inner
                        .client_to_card
                        .insert(client_id.to_string(), id.clone());
                    inner
                        .card_to_client
                        .insert(id, (client_id.to_string(), card.clone()));
                    card
                }
                AuthOutcome::Challenge(_) => {
                    // The HTTP surface has no second round; the client
                    // must answer through the auth header instead.
                    debug!(client_id, "challenge unanswerable over http");
                    return Err(Error::NotAuthenticated);
                }
                AuthOutcome::Refused => {
                    info!(client_id, "client unauthorized");
                    return Err(Error::NotAuthenticated);
                }
                AuthOutcome::Error(e) => {
                    warn!(client_id, error = %e, "bouncer failure");
                    return Err(Error::Internal(format!("bouncer failure: {e}")));
                }
            },
        };

        let duration = match keycard.duration {
            0 => self.default_duration.unwrap_or(0),
            d => d,
        };
        if duration > 0 {
            self.schedule_duration(client_id, duration);
        }

        Ok(keycard)
    }

    fn schedule_duration(self: &Arc<Self>, client_id: &str, duration: u64) {
        debug!(client_id, duration, "connection will expire");
        let auth = Arc::clone(self);
        let client = client_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration)).await;
            debug!(client_id = %client, "duration exceeded, expiring client");
            auth.inner.lock().duration_timers.remove(&client);
            let ejector = auth.ejector.lock().clone();
            if let Some(ejector) = ejector {
                ejector.eject(&client);
            }
        });
        let mut inner = self.inner.lock();
        if let Some(old) = inner
            .duration_timers
            .insert(client_id.to_string(), handle)
        {
            old.abort();
        }
    }

    /// Drop the auth state for a departing client and tell the bouncer
    /// to forget its keycard. Failed removals queue for a later retry.
    pub async fn cleanup_auth(&self, client_id: &str) {
        let (card, timer, retries) = {
            let mut inner = self.inner.lock();
            let card = inner
                .client_to_card
                .remove(client_id)
                .and_then(|id| inner.card_to_client.remove(&id))
                .map(|(_, card)| card);
            let timer = inner.duration_timers.remove(client_id);
            let retries = std::mem::take(&mut inner.cleanup_queue);
            (card, timer, retries)
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        let Some(bouncer) = &self.bouncer else {
            return;
        };
        for queued in retries {
            if let Some(id) = &queued.id {
                if let Err(e) = bouncer.remove_keycard(id).await {
                    debug!(keycard_id = %id, error = %e, "keycard cleanup retry failed");
                    self.inner.lock().cleanup_queue.push(queued);
                }
            }
        }
        if let Some(card) = card {
            if let Some(id) = card.id.clone() {
                debug!(client_id, keycard_id = %id, "removing keycard");
                if let Err(e) = bouncer.remove_keycard(&id).await {
                    warn!(keycard_id = %id, error = %e, "keycard cleanup failed, queued");
                    self.inner.lock().cleanup_queue.push(card);
                }
            }
        }
    }

    /// Force-expire the client bound to a keycard id.
    pub fn expire_keycard(&self, keycard_id: &str) {
        let client = {
            let mut inner = self.inner.lock();
            let client = inner
                .card_to_client
                .get(keycard_id)
                .map(|(client, _)| client.clone());
            if let Some(client) = &client {
                if let Some(timer) = inner.duration_timers.remove(client) {
                    timer.abort();
                }
            }
            client
        };
        if let Some(client) = client {
            debug!(keycard_id, client_id = %client, "expiring client");
            let ejector = self.ejector.lock().clone();
            if let Some(ejector) = ejector {
                ejector.eject(&client);
            }
        }
    }

    /// Start the keep-alive pinger. Every interval it asks the bouncer
    /// to extend the TTL of all keycards this streamer owns; failures
    /// reschedule at the retry interval and never drop served clients.
    pub fn schedule_keep_alive(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let bouncer = self.bouncer.clone()?;
        let auth = Arc::clone(self);
        Some(tokio::spawn(async move {
            // A missed ping must not expire cards before the next one
            // lands, so the granted TTL spans two intervals.
            let ttl = (auth.keepalive_interval * 2).as_secs();
            loop {
                tokio::time::sleep(auth.keepalive_interval).await;
                loop {
                    match bouncer.keep_alive(&auth.requester_id, ttl).await {
                        Ok(()) => break,
                        Err(e) => {
                            warn!(error = %e, "keep-alive failed, retrying");
                            tokio::time::sleep(auth.retry_interval).await;
                        }
                    }
                }
            }
        }))
    }
}
