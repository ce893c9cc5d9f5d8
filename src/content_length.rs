//! Component B — Content-Length Cache.
//!
//! Persists `basename(URI) -> byte-count` across restarts. Once an entry is
//! present it is treated as authoritative (never re-validated, never
//! deleted) — see spec section 4.B.

use crate::store::{Store, TREE_CONTENT_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Found(u64),
    NotFound,
}

#[derive(Clone)]
pub struct ContentLengthCache {
    tree: sled::Tree,
}

impl ContentLengthCache {
    pub fn open(store: &Store) -> anyhow::Result<Self> {
        Ok(Self {
            tree: store.tree(TREE_CONTENT_LENGTH)?,
        })
    }

    pub fn get(&self, basename: &str) -> LookupResult {
        match self.tree.get(basename) {
            Ok(Some(bytes)) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                LookupResult::Found(u64::from_be_bytes(buf))
            }
            _ => LookupResult::NotFound,
        }
    }

    pub fn add(&self, basename: &str, content_length: u64) -> anyhow::Result<()> {
        self.tree.insert(basename, &content_length.to_be_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips() {
        let store = Store::temporary().unwrap();
        let cache = ContentLengthCache::open(&store).unwrap();

        assert_eq!(cache.get("A.pkg"), LookupResult::NotFound);
        cache.add("A.pkg", 1000).unwrap();
        assert_eq!(cache.get("A.pkg"), LookupResult::Found(1000));
    }

    #[test]
    fn never_overwritten_by_get() {
        let store = Store::temporary().unwrap();
        let cache = ContentLengthCache::open(&store).unwrap();
        cache.add("A.pkg", 1000).unwrap();
        cache.add("A.pkg", 1000).unwrap();
        assert_eq!(cache.get("A.pkg"), LookupResult::Found(1000));
    }
}
