//! Address-based bouncer over allow/deny routing tables.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info};

use super::{AuthOutcome, Bouncer, KeycardRegistry};
use crate::keycard::Keycard;
use crate::{Error, Result};

/// Longest-prefix matcher over IPv4 networks.
#[derive(Debug, Default, Clone)]
pub struct RoutingTable {
    nets: Vec<Ipv4Net>,
}

impl RoutingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a network in CIDR form, or a bare address (treated as /32).
    pub fn add(&mut self, entry: &str) -> Result<()> {
        let net = if entry.contains('/') {
            entry
                .parse::<Ipv4Net>()
                .map_err(|e| Error::Config(format!("bad network '{entry}': {e}")))?
        } else {
            let addr = entry
                .parse::<Ipv4Addr>()
                .map_err(|e| Error::Config(format!("bad address '{entry}': {e}")))?;
            Ipv4Net::new(addr, 32).map_err(|e| Error::Config(e.to_string()))?
        };
        self.nets.push(net);
        Ok(())
    }

    /// Longest matching prefix for the address, if any.
    #[must_use]
    pub fn route(&self, addr: Ipv4Addr) -> Option<Ipv4Net> {
        self.nets
            .iter()
            .filter(|net| net.contains(&addr))
            .max_by_key(|net| net.prefix_len())
            .copied()
    }

    #[must_use]
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        self.route(addr).is_some()
    }
}

/// Accepts or refuses keycards on the client address alone.
pub struct IpBouncer {
    name: String,
    allow: RoutingTable,
    deny: RoutingTable,
    deny_default: bool,
    registry: KeycardRegistry,
}

impl IpBouncer {
    #[must_use]
    pub fn new(name: &str, allow: RoutingTable, deny: RoutingTable, deny_default: bool) -> Self {
        Self {
            name: name.to_string(),
            allow,
            deny,
            deny_default,
            registry: KeycardRegistry::new(),
        }
    }

    pub fn from_rules(
        name: &str,
        allow: &[String],
        deny: &[String],
        deny_default: bool,
    ) -> Result<Self> {
        let mut allow_table = RoutingTable::new();
        for entry in allow {
            allow_table.add(entry)?;
        }
        let mut deny_table = RoutingTable::new();
        for entry in deny {
            deny_table.add(entry)?;
        }
        debug!(name, allow = allow.len(), deny = deny.len(), deny_default, "ip bouncer ready");
        Ok(Self::new(name, allow_table, deny_table, deny_default))
    }

    fn accepts(&self, addr: Ipv4Addr) -> bool {
        let allowed = self.allow.matches(addr);
        let denied = self.deny.matches(addr);
        if self.deny_default {
            allowed && !denied
        } else {
            allowed || !denied
        }
    }
}

#[async_trait]
impl Bouncer for IpBouncer {
    fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &KeycardRegistry {
        &self.registry
    }

    async fn authenticate(&self, keycard: Keycard) -> AuthOutcome {
        let Some(IpAddr::V4(addr)) = keycard.address else {
            info!("keycard refused, no IPv4 address");
            return AuthOutcome::Refused;
        };
        if self.accepts(addr) {
            let mut keycard = keycard.authenticated();
            self.registry.add(&mut keycard);
            debug!(%addr, "address accepted");
            AuthOutcome::Accepted(keycard)
        } else {
            info!(%addr, "address refused");
            AuthOutcome::Refused
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(ip: &str) -> Keycard {
        Keycard::new(crate::keycard::Credentials::IpAddress)
            .with_address(ip.parse().expect("test address"))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut table = RoutingTable::new();
        table.add("10.0.0.0/8").expect("net");
        table.add("10.1.0.0/16").expect("net");
        let found = table.route("10.1.2.3".parse().expect("addr")).expect("route");
        assert_eq!(found.prefix_len(), 16);
        let found = table.route("10.2.2.3".parse().expect("addr")).expect("route");
        assert_eq!(found.prefix_len(), 8);
        assert!(table.route("11.0.0.1".parse().expect("addr")).is_none());
    }

    #[test]
    fn test_bare_address_is_host_route() {
        let mut table = RoutingTable::new();
        table.add("192.168.1.7").expect("host");
        assert!(table.matches("192.168.1.7".parse().expect("addr")));
        assert!(!table.matches("192.168.1.8".parse().expect("addr")));
    }

    #[test]
    fn test_bad_entry_rejected() {
        let mut table = RoutingTable::new();
        assert!(table.add("not-an-ip").is_err());
        assert!(table.add("10.0.0.0/40").is_err());
    }

    #[tokio::test]
    async fn test_deny_default_truth_table() {
        // allow 10.0.0.0/8, deny 10.1.0.0/16, deny by default
        let bouncer = IpBouncer::from_rules(
            "ip",
            &["10.0.0.0/8".to_string()],
            &["10.1.0.0/16".to_string()],
            true,
        )
        .expect("setup");

        assert!(matches!(
            bouncer.authenticate(card("10.0.5.1")).await,
            AuthOutcome::Accepted(_)
        ));
        assert!(matches!(
            bouncer.authenticate(card("10.1.5.1")).await,
            AuthOutcome::Refused
        ));
        assert!(matches!(
            bouncer.authenticate(card("11.0.0.1")).await,
            AuthOutcome::Refused
        ));
    }

    #[tokio::test]
    async fn test_allow_default_truth_table() {
        let bouncer = IpBouncer::from_rules(
            "ip",
            &["10.1.0.0/16".to_string()],
            &["10.0.0.0/8".to_string()],
            false,
        )
        .expect("setup");

        // In the deny table but also explicitly allowed.
        assert!(matches!(
            bouncer.authenticate(card("10.1.5.1")).await,
            AuthOutcome::Accepted(_)
        ));
        // Denied and not allowed.
        assert!(matches!(
            bouncer.authenticate(card("10.2.5.1")).await,
            AuthOutcome::Refused
        ));
        // Not mentioned anywhere: accepted by default.
        assert!(matches!(
            bouncer.authenticate(card("11.0.0.1")).await,
            AuthOutcome::Accepted(_)
        ));
    }

    #[tokio::test]
    async fn test_ipv6_refused() {
        let bouncer = IpBouncer::from_rules("ip", &[], &[], false).expect("setup");
        assert!(matches!(
            bouncer.authenticate(card("::1")).await,
            AuthOutcome::Refused
        ));
    }
}
