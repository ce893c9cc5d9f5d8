//! The embedded key/value table mentioned in spec section 1 as an external
//! collaborator ("the embedded key/value table used to persist
//! content-lengths and mirror-scoring results"). A single `sled::Db` is
//! opened once at startup and handed to the Content-Length Cache and the
//! Mirror Selector, each of which keeps to its own named tree.

use std::path::Path;

use sled::Db;

pub const TREE_CONTENT_LENGTH: &str = "content_length";
pub const TREE_IPV4_SUPPORT: &str = "ipv4_support";
pub const TREE_IPV6_SUPPORT: &str = "ipv6_support";
pub const TREE_MIRRORS_STATUS: &str = "mirrors_status";

#[derive(Clone)]
pub struct Store {
    db: Db,
}

impl Store {
    pub fn open(cache_directory: &Path) -> anyhow::Result<Self> {
        let path = cache_directory.join("state.sled");
        let db = sled::open(&path)?;
        Ok(Self { db })
    }

    #[cfg(test)]
    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn tree(&self, name: &str) -> anyhow::Result<sled::Tree> {
        Ok(self.db.open_tree(name)?)
    }
}
