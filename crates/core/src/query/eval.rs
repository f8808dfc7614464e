//! Lazy evaluation of predicates.
//!
//! Every predicate compiles into a [`Source`]: something that answers "the
//! greatest matching message strictly below this ceiling". Results are
//! produced in descending order by feeding each answer back as the next
//! ceiling. Intersections leapfrog between their children and use the
//! children's lattices to jump over windows that can't match.
//!
//! Within one evaluation ceilings never increase, which lets stream-backed
//! and counting sources keep state between calls.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::iter::Peekable;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::scorer::{words, Scorer};
use super::{Predicate, Query};
use crate::index::Index;
use crate::lattice::Lattice;
use crate::numbers::{Numbers, MAX};
use crate::schema::{self, Kind};
use crate::triples::{Ids, Triples};
use crate::{InfinityError, Result};

trait Source {
    /// Greatest match strictly below `ceiling`.
    fn below(&mut self, ceiling: u64) -> Result<Option<u64>>;

    /// Digest of where matches may be. Must never rule out a real match.
    fn lattice(&self) -> Lattice;
}

type Boxed = Box<dyn Source>;

struct NumbersSource {
    numbers: Arc<Numbers>,
    lattice: Lattice,
}

impl NumbersSource {
    fn boxed(numbers: Arc<Numbers>) -> Boxed {
        let lattice = numbers.lattice();
        Box::new(Self { numbers, lattice })
    }
}

impl Source for NumbersSource {
    fn below(&mut self, ceiling: u64) -> Result<Option<u64>> {
        Ok(self.numbers.next(ceiling))
    }

    fn lattice(&self) -> Lattice {
        self.lattice.clone()
    }
}

struct Never;

impl Source for Never {
    fn below(&mut self, _ceiling: u64) -> Result<Option<u64>> {
        Ok(None)
    }

    fn lattice(&self) -> Lattice {
        Lattice::never()
    }
}

/// Descending id stream from the triples store.
struct StreamSource {
    ids: Peekable<Ids>,
}

impl Source for StreamSource {
    fn below(&mut self, ceiling: u64) -> Result<Option<u64>> {
        loop {
            match self.ids.peek() {
                None => return Ok(None),
                Some(Ok(id)) if *id < ceiling => return Ok(Some(*id)),
                Some(Ok(_)) => {
                    self.ids.next();
                }
                Some(Err(_)) => {
                    return match self.ids.next() {
                        Some(Err(e)) => Err(e),
                        _ => Ok(None),
                    }
                }
            }
        }
    }

    fn lattice(&self) -> Lattice {
        Lattice::always()
    }
}

struct AndSource {
    children: Vec<Boxed>,
    lattice: Lattice,
}

impl Source for AndSource {
    fn below(&mut self, ceiling: u64) -> Result<Option<u64>> {
        let count = self.children.len();
        if count == 0 {
            return Ok(None);
        }
        let mut ceiling = self.lattice.correct(ceiling, |cursor, skip| cursor - skip);
        // children in a row that confirmed `ceiling - 1`
        let mut agreed = 0;
        let mut turn = 0;
        while agreed < count {
            if ceiling <= 1 {
                return Ok(None);
            }
            let child = &mut self.children[turn % count];
            turn += 1;
            match child.below(ceiling)? {
                None => return Ok(None),
                Some(id) if id + 1 == ceiling => agreed += 1,
                Some(id) => {
                    ceiling = self.lattice.correct(id + 1, |cursor, skip| cursor - skip);
                    agreed = usize::from(ceiling == id + 1);
                }
            }
        }
        Ok(Some(ceiling - 1))
    }

    fn lattice(&self) -> Lattice {
        self.lattice.clone()
    }
}

/// Union: the highest head among the children.
struct OrSource {
    children: Vec<Boxed>,
    /// Last answer of each child; `Some(None)` means exhausted.
    heads: Vec<Option<Option<u64>>>,
    lattice: Lattice,
}

impl Source for OrSource {
    fn below(&mut self, ceiling: u64) -> Result<Option<u64>> {
        let mut best = None;
        for (child, head) in self.children.iter_mut().zip(self.heads.iter_mut()) {
            let fresh = match head {
                Some(None) => None,
                Some(Some(id)) if *id < ceiling => Some(*id),
                _ => {
                    let answer = child.below(ceiling)?;
                    *head = Some(answer);
                    answer
                }
            };
            best = best.max(fresh);
        }
        Ok(best)
    }

    fn lattice(&self) -> Lattice {
        self.lattice.clone()
    }
}

struct NotSource {
    inner: Boxed,
}

impl Source for NotSource {
    fn below(&mut self, ceiling: u64) -> Result<Option<u64>> {
        let mut candidate = ceiling.saturating_sub(1);
        while candidate > 0 {
            match self.inner.below(candidate + 1)? {
                Some(id) if id == candidate => candidate -= 1,
                _ => return Ok(Some(candidate)),
            }
        }
        Ok(None)
    }

    fn lattice(&self) -> Lattice {
        Lattice::always()
    }
}

/// Passes at most `limit` distinct results of `inner`.
struct LimitSource {
    inner: Boxed,
    limit: u64,
    passed: u64,
    recent: Option<u64>,
}

impl Source for LimitSource {
    fn below(&mut self, ceiling: u64) -> Result<Option<u64>> {
        if self.passed >= self.limit && self.recent.map_or(true, |recent| recent >= ceiling) {
            return Ok(None);
        }
        match self.inner.below(ceiling)? {
            Some(id) if Some(id) == self.recent => Ok(Some(id)),
            Some(id) if self.passed < self.limit => {
                self.passed += 1;
                self.recent = Some(id);
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }

    fn lattice(&self) -> Lattice {
        self.inner.lattice()
    }
}

/// Drops the first `skip` distinct results of `inner`.
struct FromSource {
    inner: Boxed,
    skip: u64,
    skipped: u64,
    recent: Option<u64>,
}

impl Source for FromSource {
    fn below(&mut self, ceiling: u64) -> Result<Option<u64>> {
        let mut ceiling = ceiling;
        loop {
            let Some(id) = self.inner.below(ceiling)? else {
                return Ok(None);
            };
            if Some(id) == self.recent || self.skipped >= self.skip {
                self.recent = Some(id);
                return Ok(Some(id));
            }
            self.skipped += 1;
            ceiling = id;
        }
    }

    fn lattice(&self) -> Lattice {
        self.inner.lattice()
    }
}

/// Passes the first result for every value of an attribute.
struct UniqueSource {
    inner: Boxed,
    attribute: String,
    index: Arc<Index>,
    triples: Arc<dyn Triples>,
    seen: HashSet<String>,
    recent: Option<u64>,
}

impl UniqueSource {
    fn value(&self, id: u64) -> Result<Option<String>> {
        if schema::kind(&self.attribute) == Kind::Single {
            return Ok(self.index.value_of(&self.attribute, id));
        }
        match self.triples.get(id, &self.attribute) {
            Ok(value) => Ok(Some(value)),
            Err(InfinityError::Missing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Source for UniqueSource {
    fn below(&mut self, ceiling: u64) -> Result<Option<u64>> {
        let mut ceiling = ceiling;
        loop {
            let Some(id) = self.inner.below(ceiling)? else {
                return Ok(None);
            };
            if Some(id) == self.recent {
                return Ok(Some(id));
            }
            let fresh = match self.value(id)? {
                Some(value) => self.seen.insert(value),
                None => true,
            };
            if fresh {
                self.recent = Some(id);
                return Ok(Some(id));
            }
            ceiling = id;
        }
    }

    fn lattice(&self) -> Lattice {
        self.inner.lattice()
    }
}

/// Compares attribute values as integers when both are all digits,
/// otherwise as strings.
fn compare(stored: &str, given: &str) -> Ordering {
    match (canonical_number(stored), canonical_number(given)) {
        (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
        _ => stored.cmp(given),
    }
}

/// Digits without leading zeros, if `text` is all digits.
fn canonical_number(text: &str) -> Option<&str> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let trimmed = text.trim_start_matches('0');
    Some(if trimmed.is_empty() { "0" } else { trimmed })
}

/// Compiles predicates against an index and a triples store.
#[derive(Clone)]
pub struct Evaluator {
    index: Arc<Index>,
    triples: Arc<dyn Triples>,
    scorer: Arc<dyn Scorer>,
}

impl Evaluator {
    pub fn new(index: Arc<Index>, triples: Arc<dyn Triples>, scorer: Arc<dyn Scorer>) -> Self {
        Self {
            index,
            triples,
            scorer,
        }
    }

    /// Lazy, descending sequence of the messages matching `query`.
    pub fn messages(&self, query: &Query) -> Result<Messages> {
        let source = self.and(std::slice::from_ref(query.predicate()))?;
        debug!(query = %query, lattice = %source.lattice(), "query compiled");
        Ok(Messages {
            source,
            ceiling: MAX,
            done: false,
        })
    }

    fn all(&self) -> Boxed {
        match self.index.all() {
            Some(numbers) => NumbersSource::boxed(numbers),
            None => Box::new(Never),
        }
    }

    fn numbers(&self, attribute: &str, value: &str) -> Boxed {
        match self.index.numbers(attribute, value) {
            Some(numbers) => NumbersSource::boxed(numbers),
            None => Box::new(Never),
        }
    }

    fn stream(&self, ids: Ids) -> Boxed {
        Box::new(StreamSource {
            ids: ids.peekable(),
        })
    }

    /// Intersection of all messages with the filters in `items`, reshaped
    /// by the modifiers among them in order of appearance.
    fn and(&self, items: &[Predicate]) -> Result<Boxed> {
        let mut children = vec![self.all()];
        for item in items.iter().filter(|item| !item.is_modifier()) {
            children.push(self.source(item)?);
        }
        let mut lattice = Lattice::always();
        for child in &children {
            lattice.and(&child.lattice());
        }
        let mut source: Boxed = Box::new(AndSource { children, lattice });
        for modifier in items.iter().filter(|item| item.is_modifier()) {
            source = self.modify(source, modifier);
        }
        Ok(source)
    }

    fn modify(&self, inner: Boxed, modifier: &Predicate) -> Boxed {
        match modifier {
            Predicate::Limit(limit) => Box::new(LimitSource {
                inner,
                limit: *limit,
                passed: 0,
                recent: None,
            }),
            Predicate::From(skip) => Box::new(FromSource {
                inner,
                skip: *skip,
                skipped: 0,
                recent: None,
            }),
            Predicate::Pos(pos) => {
                let from = self.modify(inner, &Predicate::From(*pos));
                self.modify(from, &Predicate::Limit(1))
            }
            Predicate::Unique(attribute) => Box::new(UniqueSource {
                inner,
                attribute: attribute.clone(),
                index: Arc::clone(&self.index),
                triples: Arc::clone(&self.triples),
                seen: HashSet::new(),
                recent: None,
            }),
            _ => inner,
        }
    }

    fn union(&self, children: Vec<Boxed>) -> Boxed {
        match children.len() {
            0 => Box::new(Never),
            1 => children.into_iter().next().unwrap_or_else(|| Box::new(Never)),
            count => {
                let mut lattice = Lattice::never();
                for child in &children {
                    lattice.or(&child.lattice());
                }
                Box::new(OrSource {
                    children,
                    heads: vec![None; count],
                    lattice,
                })
            }
        }
    }

    fn source(&self, predicate: &Predicate) -> Result<Boxed> {
        let source = match predicate {
            Predicate::And(items) => self.and(items)?,
            Predicate::Or(items) => {
                let mut children = Vec::with_capacity(items.len());
                for item in items {
                    children.push(if item.is_modifier() {
                        self.and(std::slice::from_ref(item))?
                    } else {
                        self.source(item)?
                    });
                }
                self.union(children)
            }
            Predicate::Not(inner) => Box::new(NotSource {
                inner: self.source(inner)?,
            }),
            Predicate::Equal { attribute, value } => {
                if schema::kind(attribute) == Kind::Stored {
                    self.stream(self.triples.reverse(attribute, value)?)
                } else {
                    let value = canonical_number(value).unwrap_or(value.as_str());
                    self.numbers(attribute, value)
                }
            }
            Predicate::GreaterThan { attribute, value } => {
                self.range(attribute, |stored| compare(stored, value) == Ordering::Greater)
            }
            Predicate::LessThan { attribute, value } => {
                self.range(attribute, |stored| compare(stored, value) == Ordering::Less)
            }
            Predicate::Matches { text, attribute } => self.matches(text, attribute),
            Predicate::TalksWith(urn) => self.stream(self.triples.reverse_join(
                schema::BOUT,
                schema::PARTICIPANT,
                urn,
            )?),
            Predicate::SeenBy(urn) => self.numbers(schema::SEEN_BY, urn),
            Predicate::Ns(namespace) => self.numbers(schema::NS, namespace),
            modifier => self.and(std::slice::from_ref(modifier))?,
        };
        Ok(source)
    }

    fn range(&self, attribute: &str, accept: impl Fn(&str) -> bool) -> Boxed {
        if schema::kind(attribute) == Kind::Stored {
            warn!(attribute, "range comparison on an unindexed attribute matches nothing");
            return Box::new(Never);
        }
        let children = self
            .index
            .values(attribute)
            .into_iter()
            .filter(|(value, _)| accept(value))
            .map(|(_, numbers)| NumbersSource::boxed(numbers))
            .collect();
        self.union(children)
    }

    /// Every word of `text` must match some indexed word of `attribute`.
    fn matches(&self, text: &str, attribute: &str) -> Boxed {
        let wanted = words(text);
        if wanted.is_empty() {
            return self.all();
        }
        let indexed = self.index.values(&schema::words_of(attribute));
        let mut children = Vec::with_capacity(wanted.len());
        for word in &wanted {
            let hits: Vec<Boxed> = indexed
                .iter()
                .filter(|(candidate, _)| self.scorer.accepts(word, candidate))
                .map(|(_, numbers)| NumbersSource::boxed(Arc::clone(numbers)))
                .collect();
            children.push(self.union(hits));
        }
        if children.len() == 1 {
            return self.union(children);
        }
        let mut lattice = Lattice::always();
        for child in &children {
            lattice.and(&child.lattice());
        }
        Box::new(AndSource { children, lattice })
    }
}

/// Message numbers matching a query, highest first.
///
/// Storage errors met halfway are logged and end the sequence.
pub struct Messages {
    source: Boxed,
    ceiling: u64,
    done: bool,
}

impl Iterator for Messages {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.done {
            return None;
        }
        match self.source.below(self.ceiling) {
            Ok(Some(id)) => {
                self.ceiling = id;
                Some(id)
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                error!(error = %e, "query evaluation failed, ending results");
                self.done = true;
                None
            }
        }
    }
}
