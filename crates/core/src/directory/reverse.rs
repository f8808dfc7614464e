//! Reverse map of a single-valued attribute: message number to value.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use parking_lot::RwLock;

use crate::codec::{expect_magic, read_str, require_varint, write_str, write_varint};
use crate::{InfinityError, Result};

const MAGIC: &[u8; 4] = b"REV1";

#[derive(Debug, Default)]
pub struct Reverse {
    map: RwLock<BTreeMap<u64, String>>,
}

impl Clone for Reverse {
    fn clone(&self) -> Self {
        Self {
            map: RwLock::new(self.map.read().clone()),
        }
    }
}

impl Reverse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `id` to `value`, returning the value it was bound to before.
    pub fn put(&self, id: u64, value: &str) -> Result<Option<String>> {
        if id == 0 {
            return Err(InfinityError::InvalidArgument(
                "number 0 can't be reversed".into(),
            ));
        }
        Ok(self.map.write().insert(id, value.to_string()))
    }

    pub fn get(&self, id: u64) -> Option<String> {
        self.map.read().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<String> {
        self.map.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Snapshot of all bindings in ascending id order.
    pub fn entries(&self) -> Vec<(u64, String)> {
        self.map
            .read()
            .iter()
            .map(|(id, value)| (*id, value.clone()))
            .collect()
    }

    /// Writes `(id, value)` pairs in ascending id order, then a zero id.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(MAGIC)?;
        for (id, value) in self.map.read().iter() {
            write_varint(out, *id)?;
            write_str(out, value)?;
        }
        write_varint(out, 0)?;
        Ok(())
    }

    /// Replaces the contents with a map written by [`Reverse::save`].
    pub fn load<R: Read>(&self, input: &mut R) -> Result<()> {
        expect_magic(input, MAGIC)?;
        let mut loaded = BTreeMap::new();
        let mut previous = 0u64;
        loop {
            let id = require_varint(input)?;
            if id == 0 {
                break;
            }
            if id <= previous {
                return Err(InfinityError::Corrupted(format!(
                    "reverse entries out of order: {id} after {previous}"
                )));
            }
            loaded.insert(id, read_str(input)?);
            previous = id;
        }
        *self.map.write() = loaded;
        Ok(())
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn put_reports_the_replaced_value() {
        let reverse = Reverse::new();
        assert_eq!(reverse.put(1, "55").unwrap(), None);
        assert_eq!(reverse.put(1, "55").unwrap(), Some("55".into()));
        assert_eq!(reverse.put(1, "56").unwrap(), Some("55".into()));
        assert_eq!(reverse.get(1).as_deref(), Some("56"));
        assert!(reverse.put(0, "x").is_err());
    }

    #[test]
    fn saves_and_restores() {
        let reverse = Reverse::new();
        reverse.put(3, "urn:test:john").unwrap();
        reverse.put(1, "urn:test:mary").unwrap();
        let mut buf = Vec::new();
        reverse.save(&mut buf).unwrap();

        let back = Reverse::new();
        back.put(99, "stale").unwrap();
        back.load(&mut Cursor::new(buf)).unwrap();
        assert_eq!(
            back.entries(),
            vec![(1, "urn:test:mary".into()), (3, "urn:test:john".into())]
        );
    }

    #[test]
    fn missing_terminator_is_corruption() {
        let reverse = Reverse::new();
        reverse.put(3, "x").unwrap();
        let mut buf = Vec::new();
        reverse.save(&mut buf).unwrap();
        buf.pop();
        let err = Reverse::new().load(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, InfinityError::Corrupted(_)), "got {err:?}");
    }
}
