//! Connect/action permission checks.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::identity::PeerId;

/// Wildcard action name.
pub const ANY_ACTION: &str = "*";

pub trait Permission: Send + Sync {
    fn allow_connect(&self, peer: &PeerId) -> bool;
    fn allow_action(&self, peer: &PeerId, action: &str) -> bool;
}

/// Rules file, e.g.
///
/// ```toml
/// allow_any_peer = false
///
/// [peers.0123456789abcdef0123456789abcdef]
/// actions = ["echo", "sync"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionRules {
    /// Accept connections from unknown peers (they still get no actions).
    #[serde(default)]
    pub allow_any_peer: bool,
    /// Keyed by hex peer ID.
    #[serde(default)]
    pub peers: HashMap<String, PeerRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerRule {
    #[serde(default)]
    pub actions: Vec<String>,
}

impl PermissionRules {
    /// Everything allowed. For tests and trusted local links.
    pub fn allow_all() -> Self {
        let mut peers = HashMap::new();
        peers.insert(
            ANY_ACTION.to_string(),
            PeerRule {
                actions: vec![ANY_ACTION.to_string()],
            },
        );
        Self {
            allow_any_peer: true,
            peers,
        }
    }

    pub fn load(path: &Path) -> Result<Self, PermissionError> {
        let s = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&s)?)
    }

    /// Allow `peer` to connect and run `actions`.
    pub fn grant(&mut self, peer: &PeerId, actions: &[&str]) {
        let rule = self.peers.entry(peer.to_string()).or_default();
        rule.actions
            .extend(actions.iter().map(|a| a.to_string()));
    }

    fn rule(&self, peer: &PeerId) -> Option<&PeerRule> {
        self.peers
            .get(&peer.to_string())
            .or_else(|| self.peers.get(ANY_ACTION))
    }
}

impl Permission for PermissionRules {
    fn allow_connect(&self, peer: &PeerId) -> bool {
        self.allow_any_peer || self.rule(peer).is_some()
    }

    fn allow_action(&self, peer: &PeerId, action: &str) -> bool {
        self.rule(peer).is_some_and(|rule| {
            rule.actions
                .iter()
                .any(|a| a == ANY_ACTION || a == action)
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid rules file: {0}")]
    Toml(#[from] toml::de::Error),
}
