//! Mount-point routing: which backend avatar owns which path.

use std::collections::HashMap;
use tracing::{debug, warn};

pub type AvatarId = String;

/// Exact-path and prefix mappings to backend avatars.
///
/// Exact matches win over prefixes; among matching prefixes the
/// longest wins. Deregistration is accepted only from the avatar that
/// currently holds the mapping.
#[derive(Debug, Default)]
pub struct PathRouter {
    mappings: HashMap<String, AvatarId>,
    prefixes: HashMap<String, AvatarId>,
}

impl PathRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_path(&mut self, path: &str, avatar: &str) {
        debug!(path, avatar, "registering porter path");
        if self.mappings.contains_key(path) {
            warn!(path, "replacing existing mapping");
        }
        self.mappings.insert(path.to_string(), avatar.to_string());
    }

    pub fn deregister_path(&mut self, path: &str, avatar: &str) {
        match self.mappings.get(path) {
            Some(owner) if owner == avatar => {
                debug!(path, "removing porter mapping");
                self.mappings.remove(path);
            }
            Some(_) => warn!(path, "mapping not removed: refers to a different avatar"),
            None => warn!(path, "mapping not removed: no mapping found"),
        }
    }

    pub fn register_prefix(&mut self, prefix: &str, avatar: &str) {
        debug!(prefix, avatar, "registering porter prefix");
        if self.prefixes.contains_key(prefix) {
            warn!(prefix, "overwriting prefix");
        }
        self.prefixes.insert(prefix.to_string(), avatar.to_string());
    }

    pub fn deregister_prefix(&mut self, prefix: &str, avatar: &str) {
        match self.prefixes.get(prefix) {
            Some(owner) if owner == avatar => {
                debug!(prefix, "removing prefix destination");
                self.prefixes.remove(prefix);
            }
            Some(_) => warn!(prefix, "prefix not removed: expected avatar not found"),
            None => warn!(prefix, "prefix not removed: no mapping found"),
        }
    }

    fn find_prefix_match(&self, path: &str) -> Option<&AvatarId> {
        self.prefixes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, avatar)| avatar)
    }

    /// Destination avatar for a path, or None.
    #[must_use]
    pub fn find_destination(&self, path: &str) -> Option<&AvatarId> {
        self.mappings.get(path).or_else(|| self.find_prefix_match(path))
    }

    /// Drop every registration held by a departing avatar.
    pub fn remove_avatar(&mut self, avatar: &str) {
        self.mappings.retain(|_, owner| owner != avatar);
        self.prefixes.retain(|_, owner| owner != avatar);
    }
}
