//! In-memory attribute index.
//!
//! For every attribute the index maps each value to the [`Numbers`] of the
//! messages holding it. Single-valued attributes also keep a [`Reverse`]
//! map from message to value, so rebinding a message can unindex its old
//! value without asking the triples store. Multi-valued attributes keep the
//! same per-message view in memory, rebuilt from the numbers on load, so a
//! rewrite always unindexes exactly what the index holds. The index is
//! loaded from the current baselines of a [`Directory`] and written back
//! to its drafts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::directory::{Directory, Reverse};
use crate::numbers::Numbers;
use crate::schema::{self, Kind};
use crate::Result;

#[derive(Debug, Default)]
struct Attribute {
    values: RwLock<BTreeMap<String, Arc<Numbers>>>,
    reverse: Reverse,
    /// Values held by each message, for multi-valued attributes.
    held: RwLock<HashMap<u64, BTreeSet<String>>>,
    /// Values changed since the last save.
    dirty: Mutex<BTreeSet<String>>,
    reverse_dirty: AtomicBool,
    /// Serializes rebinding of a message within the attribute.
    writer: Mutex<()>,
}

impl Attribute {
    fn numbers(&self, value: &str) -> Arc<Numbers> {
        if let Some(numbers) = self.values.read().get(value) {
            return Arc::clone(numbers);
        }
        Arc::clone(
            self.values
                .write()
                .entry(value.to_string())
                .or_insert_with(|| Arc::new(Numbers::new())),
        )
    }

    fn add(&self, id: u64, value: &str) -> Result<()> {
        if self.numbers(value).add(id)? {
            self.dirty.lock().insert(value.to_string());
        }
        Ok(())
    }

    fn remove(&self, id: u64, value: &str) -> Result<()> {
        let numbers = self.values.read().get(value).cloned();
        if let Some(numbers) = numbers {
            if numbers.remove(id)? {
                self.dirty.lock().insert(value.to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Index {
    attributes: RwLock<HashMap<String, Arc<Attribute>>>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every attribute from the current baselines of `directory`.
    /// Values whose numbers can't be read are skipped with a warning.
    pub fn load(directory: &Directory) -> Result<Self> {
        let index = Self::new();
        let mut values = 0usize;
        for name in directory.attributes()? {
            let attribute = index.attribute(&name);
            for value in directory.values(&name)? {
                let numbers = Numbers::new();
                match directory.load_numbers(&name, &value, &numbers) {
                    Ok(()) => {
                        attribute.values.write().insert(value, Arc::new(numbers));
                        values += 1;
                    }
                    Err(e) => warn!(attribute = %name, value = %value, error = %e, "skipping unreadable numbers"),
                }
            }
            if schema::kind(&name) == Kind::Single {
                if let Err(e) = directory.load_reverse(&name, &attribute.reverse) {
                    warn!(attribute = %name, error = %e, "skipping unreadable reverse map");
                }
            } else {
                attribute.rebuild_held();
            }
        }
        info!(
            attributes = index.attributes.read().len(),
            values, "index loaded"
        );
        Ok(index)
    }

    fn attribute(&self, name: &str) -> Arc<Attribute> {
        if let Some(attribute) = self.attributes.read().get(name) {
            return Arc::clone(attribute);
        }
        Arc::clone(
            self.attributes
                .write()
                .entry(name.to_string())
                .or_default(),
        )
    }

    fn existing(&self, name: &str) -> Option<Arc<Attribute>> {
        self.attributes.read().get(name).cloned()
    }

    /// Numbers of the messages holding `value` under `attribute`.
    pub fn numbers(&self, attribute: &str, value: &str) -> Option<Arc<Numbers>> {
        self.existing(attribute)?.values.read().get(value).cloned()
    }

    /// Every indexed message.
    pub fn all(&self) -> Option<Arc<Numbers>> {
        self.numbers(schema::MESSAGES, schema::ALL)
    }

    /// Snapshot of the values of `attribute` with their numbers.
    pub fn values(&self, attribute: &str) -> Vec<(String, Arc<Numbers>)> {
        match self.existing(attribute) {
            Some(attribute) => attribute
                .values
                .read()
                .iter()
                .map(|(value, numbers)| (value.clone(), Arc::clone(numbers)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Value of a single-valued attribute for `id`.
    pub fn value_of(&self, attribute: &str, id: u64) -> Option<String> {
        self.existing(attribute)?.reverse.get(id)
    }

    /// Adds `id` under `value` of a multi-valued attribute.
    pub fn add(&self, attribute: &str, id: u64, value: &str) -> Result<()> {
        let attr = self.attribute(attribute);
        let _writer = attr.writer.lock();
        attr.add(id, value)?;
        attr.held
            .write()
            .entry(id)
            .or_default()
            .insert(value.to_string());
        Ok(())
    }

    /// Values of a multi-valued attribute the index holds for `id`.
    pub fn held(&self, attribute: &str, id: u64) -> BTreeSet<String> {
        self.existing(attribute)
            .and_then(|attr| attr.held.read().get(&id).cloned())
            .unwrap_or_default()
    }

    /// Binds `id` to `value` in a single-valued attribute, moving it out of
    /// the numbers of the value it held before. `None` unbinds it.
    pub fn bind(&self, attribute: &str, id: u64, value: Option<&str>) -> Result<()> {
        let attr = self.attribute(attribute);
        let _writer = attr.writer.lock();
        let previous = match value {
            Some(value) => attr.reverse.put(id, value)?,
            None => attr.reverse.remove(id),
        };
        if previous.as_deref() != value {
            attr.reverse_dirty.store(true, Ordering::Release);
            if let Some(previous) = previous {
                attr.remove(id, &previous)?;
            }
        }
        if let Some(value) = value {
            attr.add(id, value)?;
        }
        debug!(attribute, id, value = ?value, "bound");
        Ok(())
    }

    /// Makes `new` the values of `id` in a multi-valued attribute,
    /// unindexing whatever else the index held for it.
    pub fn rebind(&self, attribute: &str, id: u64, new: &BTreeSet<String>) -> Result<()> {
        let attr = self.attribute(attribute);
        let _writer = attr.writer.lock();
        let old = attr.held.read().get(&id).cloned().unwrap_or_default();
        for value in old.difference(new) {
            attr.remove(id, value)?;
        }
        for value in new.difference(&old) {
            attr.add(id, value)?;
        }
        let mut held = attr.held.write();
        if new.is_empty() {
            held.remove(&id);
        } else {
            held.insert(id, new.clone());
        }
        Ok(())
    }

    /// Writes every changed value, and changed reverse maps, to the drafts
    /// of `directory`. Returns how many fragments were written.
    ///
    /// Each attribute is captured under its writer lock, so its numbers and
    /// its reverse map land in the draft as one consistent state even while
    /// other threads keep binding.
    pub fn save(&self, directory: &Directory) -> Result<usize> {
        let attributes: Vec<(String, Arc<Attribute>)> = self
            .attributes
            .read()
            .iter()
            .map(|(name, attr)| (name.clone(), Arc::clone(attr)))
            .collect();
        let mut written = 0;
        for (name, attr) in attributes {
            let snapshot = attr.snapshot();
            if let Err(e) = snapshot.write(&name, directory, &mut written) {
                attr.restore(snapshot);
                return Err(e);
            }
        }
        if written > 0 {
            info!(written, "index saved to drafts");
        }
        Ok(written)
    }
}

/// Changed state of one attribute, copied out for saving.
struct Snapshot {
    values: Vec<(String, Numbers)>,
    reverse: Option<Reverse>,
}

impl Attribute {
    fn rebuild_held(&self) {
        let mut held: HashMap<u64, BTreeSet<String>> = HashMap::new();
        for (value, numbers) in self.values.read().iter() {
            for id in numbers.iter() {
                held.entry(id).or_default().insert(value.clone());
            }
        }
        *self.held.write() = held;
    }

    fn snapshot(&self) -> Snapshot {
        let _writer = self.writer.lock();
        let dirty = std::mem::take(&mut *self.dirty.lock());
        let values = {
            let current = self.values.read();
            dirty
                .into_iter()
                .map(|value| {
                    let numbers = current
                        .get(&value)
                        .map(|numbers| numbers.as_ref().clone())
                        .unwrap_or_default();
                    (value, numbers)
                })
                .collect()
        };
        let reverse = self
            .reverse_dirty
            .swap(false, Ordering::AcqRel)
            .then(|| self.reverse.clone());
        Snapshot { values, reverse }
    }

    /// Marks everything in an unsaved snapshot dirty again.
    fn restore(&self, snapshot: Snapshot) {
        self.dirty
            .lock()
            .extend(snapshot.values.into_iter().map(|(value, _)| value));
        if snapshot.reverse.is_some() {
            self.reverse_dirty.store(true, Ordering::Release);
        }
    }
}

impl Snapshot {
    fn write(&self, name: &str, directory: &Directory, written: &mut usize) -> Result<()> {
        for (value, numbers) in &self.values {
            directory.save_numbers(name, value, numbers)?;
            *written += 1;
        }
        if let Some(reverse) = &self.reverse {
            directory.save_reverse(name, reverse)?;
            *written += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn bind_moves_a_message_between_values() {
        let index = Index::new();
        index.bind("bout.number", 7, Some("55")).unwrap();
        index.bind("bout.number", 7, Some("56")).unwrap();
        assert!(!index.numbers("bout.number", "55").unwrap().contains(7));
        assert!(index.numbers("bout.number", "56").unwrap().contains(7));
        assert_eq!(index.value_of("bout.number", 7).as_deref(), Some("56"));

        index.bind("bout.number", 7, None).unwrap();
        assert!(index.numbers("bout.number", "56").unwrap().is_empty());
        assert_eq!(index.value_of("bout.number", 7), None);
    }

    #[test]
    fn rebind_keeps_shared_values() {
        let index = Index::new();
        index
            .rebind("text.words", 3, &set(&["hello", "world"]))
            .unwrap();
        index.rebind("text.words", 4, &set(&["hello"])).unwrap();
        index.rebind("text.words", 3, &set(&["hello"])).unwrap();
        assert!(index.numbers("text.words", "hello").unwrap().contains(3));
        assert!(index.numbers("text.words", "hello").unwrap().contains(4));
        assert!(!index.numbers("text.words", "world").unwrap().contains(3));
        assert_eq!(index.held("text.words", 3), set(&["hello"]));
    }

    #[test]
    fn loaded_index_knows_what_each_message_holds() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Directory::open(tmp.path()).unwrap();
        let index = Index::new();
        index
            .rebind("text.words", 9, &set(&["old", "words"]))
            .unwrap();
        index.save(&directory).unwrap();
        directory.baseline().unwrap();

        let restored = Index::load(&directory).unwrap();
        assert_eq!(restored.held("text.words", 9), set(&["old", "words"]));
        restored.rebind("text.words", 9, &set(&["new"])).unwrap();
        assert!(!restored.numbers("text.words", "old").unwrap().contains(9));
        assert!(restored.numbers("text.words", "new").unwrap().contains(9));
    }

    #[test]
    fn save_during_binding_keeps_drafts_consistent() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Directory::open(tmp.path()).unwrap();
        let index = Arc::new(Index::new());
        let binder = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for id in 1..=3_000u64 {
                    let bout = (id % 7).to_string();
                    index.bind(schema::BOUT, id, Some(&bout)).unwrap();
                    index.bind(schema::BOUT, id, Some("moved")).unwrap();
                }
            })
        };
        for _ in 0..20 {
            index.save(&directory).unwrap();
            directory.baseline().unwrap();
        }
        binder.join().unwrap();
        index.save(&directory).unwrap();
        directory.baseline().unwrap();
        assert!(directory.audit().is_clean());
        let restored = Index::load(&directory).unwrap();
        assert_eq!(restored.numbers(schema::BOUT, "moved").unwrap().len(), 3_000);
    }

    #[test]
    fn saved_index_loads_back_after_baseline() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Directory::open(tmp.path()).unwrap();
        let index = Index::new();
        index.add(schema::MESSAGES, 1, schema::ALL).unwrap();
        index.add(schema::MESSAGES, 2, schema::ALL).unwrap();
        index.bind("author.name", 1, Some("urn:test:jeff")).unwrap();
        index.bind("author.name", 2, Some("urn:test:walter")).unwrap();
        assert_eq!(index.save(&directory).unwrap(), 4);
        assert_eq!(index.save(&directory).unwrap(), 0, "nothing changed since");
        directory.baseline().unwrap();

        let restored = Index::load(&directory).unwrap();
        let all: Vec<u64> = restored.all().unwrap().iter().collect();
        assert_eq!(all, vec![2, 1]);
        assert_eq!(
            restored.value_of("author.name", 2).as_deref(),
            Some("urn:test:walter")
        );
        assert!(directory.audit().is_clean());
    }
}
