//! The predicate query language.
//!
//! A query is an s-expression over message attributes:
//!
//! ```text
//! (and (matches 'lunch' $text) (talks-with 'urn:test:jeff') (limit 10))
//! ```
//!
//! Variables are `$`-prefixed attribute names, strings are single- or
//! double-quoted, numbers are bare. A query that does not start with `(`
//! is a full-text search over the message text, bout title and author
//! alias. Parsing happens once; the resulting [`Query`] can be evaluated
//! any number of times.

mod eval;
mod parser;
pub mod scorer;

use std::fmt;
use std::str::FromStr;

use crate::{InfinityError, Result};

pub use eval::{Evaluator, Messages};
pub use scorer::{FuzzyScorer, Scorer};

/// One node of a parsed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Messages matching every child. `(and)` matches every message.
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Equal { attribute: String, value: String },
    GreaterThan { attribute: String, value: String },
    LessThan { attribute: String, value: String },
    /// Fuzzy word match of `text` against the words of `attribute`.
    Matches { text: String, attribute: String },
    /// Messages of every bout the identity takes part in.
    TalksWith(String),
    SeenBy(String),
    Ns(String),
    /// At most this many results.
    Limit(u64),
    /// Skips this many results.
    From(u64),
    /// Only the result at this zero-based position.
    Pos(u64),
    /// Only the first result for each value of the attribute.
    Unique(String),
}

impl Predicate {
    /// Modifiers reshape the results of their `and` siblings rather than
    /// filter messages on their own.
    pub fn is_modifier(&self) -> bool {
        matches!(
            self,
            Predicate::Limit(_) | Predicate::From(_) | Predicate::Pos(_) | Predicate::Unique(_)
        )
    }
}

fn write_text(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return f.write_str(text);
    }
    f.write_str("'")?;
    for c in text.chars() {
        if c == '\'' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("'")
}

fn write_list(f: &mut fmt::Formatter<'_>, name: &str, items: &[Predicate]) -> fmt::Result {
    write!(f, "({name}")?;
    for item in items {
        write!(f, " {item}")?;
    }
    f.write_str(")")
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::And(items) => write_list(f, "and", items),
            Predicate::Or(items) => write_list(f, "or", items),
            Predicate::Not(inner) => write!(f, "(not {inner})"),
            Predicate::Equal { attribute, value } => {
                write!(f, "(equal ${attribute} ")?;
                write_text(f, value)?;
                f.write_str(")")
            }
            Predicate::GreaterThan { attribute, value } => {
                write!(f, "(greater-than ${attribute} ")?;
                write_text(f, value)?;
                f.write_str(")")
            }
            Predicate::LessThan { attribute, value } => {
                write!(f, "(less-than ${attribute} ")?;
                write_text(f, value)?;
                f.write_str(")")
            }
            Predicate::Matches { text, attribute } => {
                f.write_str("(matches ")?;
                write_text(f, text)?;
                write!(f, " ${attribute})")
            }
            Predicate::TalksWith(urn) => {
                f.write_str("(talks-with ")?;
                write_text(f, urn)?;
                f.write_str(")")
            }
            Predicate::SeenBy(urn) => {
                f.write_str("(seen-by ")?;
                write_text(f, urn)?;
                f.write_str(")")
            }
            Predicate::Ns(namespace) => {
                f.write_str("(ns ")?;
                write_text(f, namespace)?;
                f.write_str(")")
            }
            Predicate::Limit(n) => write!(f, "(limit {n})"),
            Predicate::From(n) => write!(f, "(from {n})"),
            Predicate::Pos(n) => write!(f, "(pos {n})"),
            Predicate::Unique(attribute) => write!(f, "(unique ${attribute})"),
        }
    }
}

/// A parsed query together with the text it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    text: String,
    predicate: Predicate,
}

impl Query {
    /// Parses `text`. Errors are [`InfinityError::Syntax`] and carry the
    /// query verbatim.
    pub fn parse(text: &str) -> Result<Self> {
        let predicate = parser::parse(text).map_err(|reason| InfinityError::Syntax {
            query: text.to_string(),
            reason,
        })?;
        Ok(Self {
            text: text.to_string(),
            predicate,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }
}

impl FromStr for Query {
    type Err = InfinityError;

    fn from_str(text: &str) -> Result<Self> {
        Self::parse(text)
    }
}

/// Prints the canonical form, which parses back to the same predicate.
impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.predicate.fmt(f)
    }
}
