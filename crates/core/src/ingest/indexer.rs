//! Turns notices into triples and index updates.
//!
//! Every write replaces the full value set of one `(id, attribute)` pair,
//! so applying a notice twice leaves the same state as applying it once.
//! Triples are written before the index; a replay after a crash between
//! the two finds the triples current and brings the index up to date,
//! taking the values to unindex from what the index itself holds.

use std::collections::BTreeSet;
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use super::notice::{Message, Notice};
use crate::index::Index;
use crate::numbers::MAX;
use crate::query::scorer::words;
use crate::schema::{self, Kind};
use crate::triples::Triples;
use crate::{InfinityError, Result};

/// Applies one notice. Implementations must be idempotent.
pub trait Apply: Send + Sync {
    fn apply(&self, notice: &Notice) -> Result<()>;
}

pub struct Indexer {
    index: Arc<Index>,
    triples: Arc<dyn Triples>,
}

impl Indexer {
    pub fn new(index: Arc<Index>, triples: Arc<dyn Triples>) -> Self {
        Self { index, triples }
    }

    fn current(&self, id: u64, attribute: &str) -> Result<BTreeSet<String>> {
        self.triples.all(id, attribute)?.collect()
    }

    /// Replaces every value of `attribute` for `id` with `values`.
    fn write(&self, id: u64, attribute: &str, values: BTreeSet<String>) -> Result<()> {
        let old = self.current(id, attribute)?;
        if old != values {
            if !old.is_empty() {
                match self.triples.clear(id, attribute) {
                    // Another worker rewriting the same bout got there first.
                    Ok(()) | Err(InfinityError::Fatal(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            for value in &values {
                self.triples.put(id, attribute, value)?;
            }
        }
        match schema::kind(attribute) {
            Kind::Single => {
                self.index
                    .bind(attribute, id, values.iter().next().map(String::as_str))?
            }
            Kind::Multi => self.index.rebind(attribute, id, &values)?,
            Kind::Stored => {}
        }
        Ok(())
    }

    /// Writes a text attribute together with its words.
    fn write_text(&self, id: u64, attribute: &str, text: Option<&str>) -> Result<()> {
        let values = text.map(|t| BTreeSet::from([t.to_string()])).unwrap_or_default();
        self.write(id, attribute, values)?;
        self.write(
            id,
            &schema::words_of(attribute),
            text.map(words).unwrap_or_default(),
        )
    }

    fn one(value: impl ToString) -> BTreeSet<String> {
        BTreeSet::from([value.to_string()])
    }

    fn posted(&self, message: &Message) -> Result<()> {
        let id = message.number;
        if id == 0 || id == MAX {
            return Err(InfinityError::InvalidArgument(format!(
                "message number {id} is reserved"
            )));
        }
        self.write_text(id, schema::TEXT, Some(&message.text))?;
        self.write(id, schema::BOUT, Self::one(message.bout.number))?;
        self.write_text(id, schema::BOUT_TITLE, Some(&message.bout.title))?;
        self.write(id, schema::AUTHOR, Self::one(&message.author))?;
        self.write_text(id, schema::AUTHOR_ALIAS, message.alias.as_deref())?;
        self.write(id, schema::DATE, Self::one(message.date.timestamp_millis()))?;
        self.write(
            id,
            schema::NS,
            namespace(&message.text).into_iter().collect(),
        )?;
        self.write(
            message.bout.number,
            schema::PARTICIPANT,
            message.bout.participants.iter().cloned().collect(),
        )?;
        self.index.add(schema::MESSAGES, id, schema::ALL)
    }

    /// Ids holding `value` under `attribute`, collected before anything is
    /// rewritten.
    fn messages_in(&self, attribute: &str, value: &str) -> Result<Vec<u64>> {
        self.triples.reverse(attribute, value)?.collect()
    }
}

impl Apply for Indexer {
    fn apply(&self, notice: &Notice) -> Result<()> {
        match notice {
            Notice::MessagePosted { message } => self.posted(message)?,
            Notice::MessageSeen { message, identity } => {
                self.triples.put(*message, schema::SEEN_BY, identity)?;
                self.index.add(schema::SEEN_BY, *message, identity)?;
            }
            Notice::BoutRenamed { bout } => {
                for id in self.messages_in(schema::BOUT, &bout.number.to_string())? {
                    self.write_text(id, schema::BOUT_TITLE, Some(&bout.title))?;
                }
            }
            Notice::Joined { bout, identity } => {
                self.triples.put(bout.number, schema::PARTICIPANT, identity)?;
            }
            Notice::KickedOff { bout, identity } => {
                let mut remaining = self.current(bout.number, schema::PARTICIPANT)?;
                remaining.remove(identity);
                self.write(bout.number, schema::PARTICIPANT, remaining)?;
            }
            Notice::AliasAdded { identity, alias } => {
                for id in self.messages_in(schema::AUTHOR, identity)? {
                    self.write_text(id, schema::AUTHOR_ALIAS, Some(alias))?;
                }
            }
        }
        debug!(kind = notice.kind(), "notice applied");
        Ok(())
    }
}

/// Namespace of the root element when `text` is an XML document.
pub fn namespace(text: &str) -> Option<String> {
    let text = text.trim_start();
    if !text.starts_with('<') {
        return None;
    }
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                return e
                    .attributes()
                    .flatten()
                    .find(|attr| attr.key.0 == b"xmlns")
                    .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
                    .filter(|ns| !ns.is_empty());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::notice::samples::{bout, posted};
    use crate::ingest::notice::Bout;
    use crate::triples::RedbTriples;
    use std::time::Duration;

    fn indexer() -> (Indexer, Arc<Index>, Arc<dyn Triples>) {
        let index = Arc::new(Index::new());
        let triples: Arc<dyn Triples> =
            Arc::new(RedbTriples::open_in_memory(Duration::from_secs(10)).unwrap());
        (
            Indexer::new(Arc::clone(&index), Arc::clone(&triples)),
            index,
            triples,
        )
    }

    fn ids(index: &Index, attribute: &str, value: &str) -> Vec<u64> {
        index
            .numbers(attribute, value)
            .map(|numbers| numbers.iter().collect())
            .unwrap_or_default()
    }

    #[test]
    fn posting_indexes_every_attribute() {
        let (indexer, index, triples) = indexer();
        let notice = posted(
            1,
            bout(55, &["urn:test:jeff", "urn:test:walter"]),
            "urn:test:jeff",
            "Hello, world",
        );
        indexer.apply(&notice).unwrap();
        indexer.apply(&notice).unwrap();

        assert_eq!(ids(&index, schema::MESSAGES, schema::ALL), vec![1]);
        assert_eq!(ids(&index, schema::BOUT, "55"), vec![1]);
        assert_eq!(ids(&index, "text.words", "hello"), vec![1]);
        assert_eq!(ids(&index, "bout.title.words", "bout"), vec![1]);
        assert_eq!(triples.get(1, schema::TEXT).unwrap(), "Hello, world");
        let participants: Vec<String> = triples
            .all(55, schema::PARTICIPANT)
            .unwrap()
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(participants, vec!["urn:test:jeff", "urn:test:walter"]);
    }

    #[test]
    fn reposting_moves_the_message() {
        let (indexer, index, _triples) = indexer();
        indexer
            .apply(&posted(7, bout(55, &["urn:test:jeff"]), "urn:test:jeff", "first draft"))
            .unwrap();
        indexer
            .apply(&posted(7, bout(56, &["urn:test:jeff"]), "urn:test:jeff", "second take"))
            .unwrap();
        assert!(ids(&index, schema::BOUT, "55").is_empty());
        assert_eq!(ids(&index, schema::BOUT, "56"), vec![7]);
        assert!(ids(&index, "text.words", "first").is_empty());
        assert_eq!(ids(&index, "text.words", "take"), vec![7]);
    }

    #[test]
    fn replay_after_triples_were_written_drops_stale_words() {
        let (indexer, index, triples) = indexer();
        let lanes = bout(55, &["urn:test:jeff"]);
        indexer
            .apply(&posted(7, lanes.clone(), "urn:test:jeff", "first draft"))
            .unwrap();
        // A crash after the triples took the edit but before the index did.
        triples.clear(7, schema::TEXT).unwrap();
        triples.put(7, schema::TEXT, "second take").unwrap();
        triples.clear(7, "text.words").unwrap();
        for word in ["second", "take"] {
            triples.put(7, "text.words", word).unwrap();
        }

        indexer
            .apply(&posted(7, lanes, "urn:test:jeff", "second take"))
            .unwrap();
        assert!(ids(&index, "text.words", "first").is_empty());
        assert!(ids(&index, "text.words", "draft").is_empty());
        assert_eq!(ids(&index, "text.words", "take"), vec![7]);
        assert_eq!(
            index.held("text.words", 7),
            BTreeSet::from(["second".to_string(), "take".to_string()])
        );
    }

    #[test]
    fn renames_kicks_and_aliases_rewrite_existing_messages() {
        let (indexer, index, triples) = indexer();
        let lanes = bout(55, &["urn:test:jeff", "urn:test:walter"]);
        indexer
            .apply(&posted(1, lanes.clone(), "urn:test:jeff", "strike"))
            .unwrap();
        indexer
            .apply(&Notice::BoutRenamed {
                bout: Bout {
                    title: "league night".into(),
                    ..lanes.clone()
                },
            })
            .unwrap();
        assert_eq!(ids(&index, "bout.title.words", "league"), vec![1]);
        assert!(ids(&index, "bout.title.words", "number").is_empty());

        indexer
            .apply(&Notice::KickedOff {
                bout: lanes.clone(),
                identity: "urn:test:walter".into(),
            })
            .unwrap();
        assert!(!triples.has(55, schema::PARTICIPANT, "urn:test:walter").unwrap());
        indexer
            .apply(&Notice::Joined {
                bout: lanes,
                identity: "urn:test:donny".into(),
            })
            .unwrap();
        assert!(triples.has(55, schema::PARTICIPANT, "urn:test:donny").unwrap());

        indexer
            .apply(&Notice::AliasAdded {
                identity: "urn:test:jeff".into(),
                alias: "The Dude".into(),
            })
            .unwrap();
        assert_eq!(ids(&index, "author.alias.words", "dude"), vec![1]);

        indexer
            .apply(&Notice::MessageSeen {
                message: 1,
                identity: "urn:test:walter".into(),
            })
            .unwrap();
        assert_eq!(ids(&index, schema::SEEN_BY, "urn:test:walter"), vec![1]);
    }

    #[test]
    fn xml_messages_carry_their_namespace() {
        assert_eq!(
            namespace("<?xml version='1.0'?><doc xmlns='urn:test:ns'><a/></doc>").as_deref(),
            Some("urn:test:ns")
        );
        assert_eq!(namespace("<doc/>"), None);
        assert_eq!(namespace("plain text"), None);

        let (indexer, index, _triples) = indexer();
        indexer
            .apply(&posted(
                3,
                bout(9, &["urn:test:jeff"]),
                "urn:test:jeff",
                "<order xmlns=\"urn:test:orders\"/>",
            ))
            .unwrap();
        assert_eq!(ids(&index, schema::NS, "urn:test:orders"), vec![3]);
    }

    #[test]
    fn reserved_message_numbers_are_rejected() {
        let (indexer, _index, triples) = indexer();
        let err = indexer
            .apply(&posted(0, bout(1, &["urn:test:jeff"]), "urn:test:jeff", "zero"))
            .unwrap_err();
        assert!(matches!(err, InfinityError::InvalidArgument(_)), "got {err:?}");
        assert!(triples.names().is_empty(), "nothing written");
    }
}
