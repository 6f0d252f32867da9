//! Multi-agent routing.
//!
//! An inbound message is matched against configured bindings in a fixed
//! seven-level priority cascade; the first match wins and ties within a
//! level resolve by declaration order. The chosen agent plus the peer
//! determine the session key.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::info;

/// A conversational peer: `kind` is `direct`, `group`, or `channel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub kind: String,
    pub id: String,
}

impl Peer {
    pub fn direct(id: &str) -> Self {
        Self {
            kind: "direct".to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.kind == "direct"
    }
}

/// One routing rule from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub agent: String,

    pub channel: String,

    /// `"*"` matches any account on the channel.
    #[serde(default = "wildcard")]
    pub account: String,

    #[serde(default)]
    pub peer_kind: Option<String>,

    #[serde(default)]
    pub peer_id: Option<String>,

    #[serde(default)]
    pub guild_id: Option<String>,

    #[serde(default)]
    pub team_id: Option<String>,
}

fn wildcard() -> String {
    "*".to_string()
}

impl Binding {
    fn has_peer(&self) -> bool {
        self.peer_kind.is_some() || self.peer_id.is_some()
    }

    fn peer_matches(&self, peer: &Peer) -> bool {
        self.peer_kind.as_deref() == Some(peer.kind.as_str())
            && self.peer_id.as_deref() == Some(peer.id.as_str())
    }

    /// Bindings with no peer/guild/team scope match at the account or
    /// channel level only.
    fn is_unscoped(&self) -> bool {
        !self.has_peer() && self.guild_id.is_none() && self.team_id.is_none()
    }
}

/// Which level of the cascade selected the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    BindingPeer,
    BindingPeerParent,
    BindingGuild,
    BindingTeam,
    BindingAccount,
    BindingChannel,
    Default,
}

impl fmt::Display for MatchedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchedBy::BindingPeer => "binding.peer",
            MatchedBy::BindingPeerParent => "binding.peer.parent",
            MatchedBy::BindingGuild => "binding.guild",
            MatchedBy::BindingTeam => "binding.team",
            MatchedBy::BindingAccount => "binding.account",
            MatchedBy::BindingChannel => "binding.channel",
            MatchedBy::Default => "default",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub agent_id: String,
    pub channel: String,
    pub account_id: String,
    pub session_key: String,
    pub main_session_key: String,
    pub matched_by: MatchedBy,
}

pub struct Router {
    bindings: Vec<Binding>,
    default_agent: String,
    known_agents: HashSet<String>,
    dm_scope: String,
    identity_links: HashMap<String, Vec<String>>,
}

impl Router {
    /// `agents` is the declared `(id, is_default)` list; the default agent is
    /// the first marked default, else the first declared, else `"main"`.
    pub fn new(
        bindings: Vec<Binding>,
        agents: &[(String, bool)],
        dm_scope: &str,
        identity_links: HashMap<String, Vec<String>>,
    ) -> Self {
        let default_agent = agents
            .iter()
            .find(|(_, is_default)| *is_default)
            .or_else(|| agents.first())
            .map(|(id, _)| id.to_lowercase())
            .unwrap_or_else(|| crate::agent::DEFAULT_AGENT_ID.to_string());

        let known_agents = agents.iter().map(|(id, _)| id.to_lowercase()).collect();

        Self {
            bindings,
            default_agent,
            known_agents,
            dm_scope: dm_scope.to_string(),
            identity_links,
        }
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    pub fn is_known(&self, agent_id: &str) -> bool {
        self.known_agents.contains(&agent_id.to_lowercase())
    }

    pub fn resolve(
        &self,
        channel: &str,
        account_id: &str,
        peer: &Peer,
        parent_peer: Option<&Peer>,
        guild_id: Option<&str>,
        team_id: Option<&str>,
    ) -> Route {
        let candidates: Vec<&Binding> = self
            .bindings
            .iter()
            .filter(|b| b.channel == channel && (b.account == "*" || b.account == account_id))
            .collect();

        let matched = self
            .match_level(&candidates, |b| b.peer_matches(peer), MatchedBy::BindingPeer)
            .or_else(|| {
                parent_peer.and_then(|parent| {
                    self.match_level(
                        &candidates,
                        |b| b.peer_matches(parent),
                        MatchedBy::BindingPeerParent,
                    )
                })
            })
            .or_else(|| {
                guild_id.and_then(|guild| {
                    self.match_level(
                        &candidates,
                        |b| b.guild_id.as_deref() == Some(guild),
                        MatchedBy::BindingGuild,
                    )
                })
            })
            .or_else(|| {
                team_id.and_then(|team| {
                    self.match_level(
                        &candidates,
                        |b| b.team_id.as_deref() == Some(team),
                        MatchedBy::BindingTeam,
                    )
                })
            })
            .or_else(|| {
                self.match_level(
                    &candidates,
                    |b| b.is_unscoped() && b.account != "*",
                    MatchedBy::BindingAccount,
                )
            })
            .or_else(|| {
                self.match_level(
                    &candidates,
                    |b| b.is_unscoped() && b.account == "*",
                    MatchedBy::BindingChannel,
                )
            });

        let (agent_id, matched_by) = match matched {
            Some((agent, matched_by)) => {
                let agent = agent.to_lowercase();
                if self.is_known(&agent) {
                    (agent, matched_by)
                } else {
                    info!(
                        "Binding names unknown agent '{}'; using default '{}'",
                        agent, self.default_agent
                    );
                    (self.default_agent.clone(), MatchedBy::Default)
                }
            }
            None => (self.default_agent.clone(), MatchedBy::Default),
        };

        Route {
            session_key: self.session_key(&agent_id, channel, peer),
            main_session_key: main_session_key(&agent_id),
            agent_id,
            channel: channel.to_string(),
            account_id: account_id.to_string(),
            matched_by,
        }
    }

    fn match_level<F>(
        &self,
        candidates: &[&Binding],
        predicate: F,
        matched_by: MatchedBy,
    ) -> Option<(String, MatchedBy)>
    where
        F: Fn(&Binding) -> bool,
    {
        candidates
            .iter()
            .find(|b| predicate(b))
            .map(|b| (b.agent.clone(), matched_by))
    }

    /// Derive the session key for a routed conversation. Keys are lowercase
    /// and always `agent:`-prefixed.
    pub fn session_key(&self, agent_id: &str, channel: &str, peer: &Peer) -> String {
        let key = if peer.is_direct() {
            if self.dm_scope == "main" {
                main_session_key(agent_id)
            } else if let Some(identity) = self.linked_identity(channel, peer) {
                // Linked identities drop the channel so the same person
                // converges on one session from anywhere.
                format!("agent:{}:dm:{}", agent_id, identity)
            } else {
                format!("agent:{}:{}:dm:{}", agent_id, channel, peer.id)
            }
        } else {
            format!("agent:{}:{}:{}:{}", agent_id, channel, peer.kind, peer.id)
        };
        key.to_ascii_lowercase()
    }

    /// Map a linked peer (`channel:kind:id` pattern) to its canonical name,
    /// collapsing several identities into one DM session.
    fn linked_identity(&self, channel: &str, peer: &Peer) -> Option<String> {
        let pattern = format!("{}:{}:{}", channel, peer.kind, peer.id);
        self.identity_links
            .iter()
            .find(|(_, patterns)| {
                patterns.iter().any(|p| p.eq_ignore_ascii_case(&pattern))
            })
            .map(|(name, _)| name.clone())
    }
}

pub fn main_session_key(agent_id: &str) -> String {
    format!("agent:{}:main", agent_id).to_ascii_lowercase()
}
