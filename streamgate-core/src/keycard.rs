//! Keycards: portable credentials with explicit state and lifetime.
//!
//! A keycard is issued per request (or per connection), carried through
//! a bouncer for a decision, and tracked afterwards for TTL and
//! duration accounting. Passing a keycard anywhere copies plain data
//! only; bouncers must never stash secrets on a card.

use std::net::IpAddr;

/// Lifecycle state of a keycard.
///
/// Cards are issued `Requesting`; a bouncer producing a terminal result
/// must leave the card `Authenticated` or `Refused`, never `Requesting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeycardState {
    Requesting,
    Authenticated,
    Refused,
}

/// Credential forms a keycard can carry.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// No client credentials; server-side checks only (time, IP caps).
    Generic,
    /// Plaintext username and password.
    UsernamePassword { username: String, password: String },
    /// Two-phase crypt challenge: the bouncer stamps `salt` and
    /// `challenge` on the first pass, the client supplies `response`
    /// on the second.
    UsernameCryptChallenge {
        username: String,
        salt: Option<String>,
        challenge: Option<String>,
        response: Option<String>,
    },
    /// Decided purely on the client address.
    IpAddress,
    /// Opaque bearer token.
    Token { token: String },
}

#[derive(Debug, Clone)]
pub struct Keycard {
    /// Assigned by the keycard registry on acceptance.
    pub id: Option<String>,
    pub state: KeycardState,
    pub credentials: Credentials,
    /// Identity of the component that requested authentication.
    pub requester_id: String,
    /// Issuer group used by keep-alive TTL refresh.
    pub issuer_name: String,
    pub address: Option<IpAddr>,
    /// Seconds the card stays valid without a keep-alive; 0 = unlimited.
    pub ttl: u64,
    /// Seconds the authenticated client may stay connected; 0 = unlimited.
    pub duration: u64,
    /// Auth realm, when one is configured.
    pub domain: Option<String>,
}

impl Keycard {
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            id: None,
            state: KeycardState::Requesting,
            credentials,
            requester_id: String::new(),
            issuer_name: String::new(),
            address: None,
            ttl: 0,
            duration: 0,
            domain: None,
        }
    }

    #[must_use]
    pub fn generic() -> Self {
        Self::new(Credentials::Generic)
    }

    #[must_use]
    pub fn username_password(username: &str, password: &str) -> Self {
        Self::new(Credentials::UsernamePassword {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    #[must_use]
    pub fn token(token: &str) -> Self {
        Self::new(Credentials::Token {
            token: token.to_string(),
        })
    }

    #[must_use]
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    #[must_use]
    pub fn authenticated(mut self) -> Self {
        self.state = KeycardState::Authenticated;
        self
    }

    #[must_use]
    pub fn refused(mut self) -> Self {
        self.state = KeycardState::Refused;
        self
    }

    /// The username carried by the credentials, when there is one.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        match &self.credentials {
            Credentials::UsernamePassword { username, .. }
            | Credentials::UsernameCryptChallenge { username, .. } => Some(username),
            _ => None,
        }
    }
}
