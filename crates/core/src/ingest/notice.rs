//! Domain events accepted by the engine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{InfinityError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bout {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    /// Identity URNs of everyone taking part.
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub number: u64,
    pub bout: Bout,
    /// Identity URN of the author.
    pub author: String,
    #[serde(default)]
    pub alias: Option<String>,
    pub text: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Notice {
    MessagePosted { message: Message },
    MessageSeen { message: u64, identity: String },
    BoutRenamed { bout: Bout },
    Joined { bout: Bout, identity: String },
    KickedOff { bout: Bout, identity: String },
    AliasAdded { identity: String, alias: String },
}

impl Notice {
    /// Identities whose view of the index this notice changes. Callers
    /// poll `eta` with these keys.
    pub fn deps(&self) -> BTreeSet<String> {
        let mut deps = BTreeSet::new();
        match self {
            Notice::MessagePosted { message } => {
                deps.extend(message.bout.participants.iter().cloned());
                deps.insert(message.author.clone());
            }
            Notice::MessageSeen { identity, .. } | Notice::AliasAdded { identity, .. } => {
                deps.insert(identity.clone());
            }
            Notice::BoutRenamed { bout } => deps.extend(bout.participants.iter().cloned()),
            Notice::Joined { bout, identity } | Notice::KickedOff { bout, identity } => {
                deps.extend(bout.participants.iter().cloned());
                deps.insert(identity.clone());
            }
        }
        deps.retain(|dep| !dep.is_empty());
        deps
    }

    /// Short name of the notice kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::MessagePosted { .. } => "message-posted",
            Notice::MessageSeen { .. } => "message-seen",
            Notice::BoutRenamed { .. } => "bout-renamed",
            Notice::Joined { .. } => "joined",
            Notice::KickedOff { .. } => "kicked-off",
            Notice::AliasAdded { .. } => "alias-added",
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| InfinityError::Corrupted(format!("notice: {e}")))
    }

    /// Content hash: equal notices share a key.
    pub fn key(&self) -> Result<String> {
        let digest = Sha256::digest(self.to_json()?);
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

#[cfg(test)]
pub(crate) mod samples {
    use super::*;

    pub(crate) fn bout(number: u64, participants: &[&str]) -> Bout {
        Bout {
            number,
            title: format!("bout number {number}"),
            participants: participants.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub(crate) fn posted(number: u64, bout: Bout, author: &str, text: &str) -> Notice {
        Notice::MessagePosted {
            message: Message {
                number,
                bout,
                author: author.to_string(),
                alias: None,
                text: text.to_string(),
                date: DateTime::from_timestamp(1_700_000_000 + number as i64, 0).unwrap_or_default(),
            },
        }
    }
}
