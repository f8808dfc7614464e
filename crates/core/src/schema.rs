//! Attribute names and how each one is indexed.

/// Every indexed message, under the single value [`ALL`].
pub const MESSAGES: &str = "messages";
pub const ALL: &str = "all";

pub const TEXT: &str = "text";
pub const DATE: &str = "date";
pub const NS: &str = "ns";
pub const SEEN_BY: &str = "seen-by";
pub const AUTHOR: &str = "author.name";
pub const AUTHOR_ALIAS: &str = "author.alias";
pub const BOUT: &str = "bout.number";
pub const BOUT_TITLE: &str = "bout.title";

/// Participants of a bout, keyed by bout number rather than message.
pub const PARTICIPANT: &str = "participant";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Kept in the triples store only.
    Stored,
    /// One value per message, indexed with a reverse map.
    Single,
    /// Any number of values per message, indexed.
    Multi,
}

pub fn kind(attribute: &str) -> Kind {
    match attribute {
        BOUT | AUTHOR | DATE | NS => Kind::Single,
        SEEN_BY | MESSAGES => Kind::Multi,
        name if name.ends_with(".words") => Kind::Multi,
        _ => Kind::Stored,
    }
}

/// Attribute holding the words of a text attribute.
pub fn words_of(attribute: &str) -> String {
    format!("{attribute}.words")
}
