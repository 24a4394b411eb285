//! Persistent inverted string index.
//!
//! One KV store per indexed field holds a posting list per term under the
//! key `term:<value>`: a comma-joined ascending sequence of internal ids.
//! `equals` resolves a single posting list; `starts_with`, `ends_with` and
//! `contains` enumerate all terms and union the matching lists. Writers
//! append without de-duplication; readers tolerate duplicates and may see a
//! stale list, but never a torn one.

use std::path::PathBuf;

use crate::error::Result;
use crate::query::bitmap::DocIdSet;
use crate::storage::kv::{KvConfig, KvStore};

const TERM_PREFIX: &str = "term:";

/// String operators supported by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringMatch {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
}

impl StringMatch {
    fn matches(&self, term: &str, value: &str) -> bool {
        match self {
            StringMatch::Equals => term == value,
            StringMatch::StartsWith => term.starts_with(value),
            StringMatch::EndsWith => term.ends_with(value),
            StringMatch::Contains => term.contains(value),
        }
    }
}

/// Term -> posting-list index over one string field.
#[derive(Debug)]
pub struct InvertedIndex {
    field: String,
    kv: KvStore,
}

impl InvertedIndex {
    /// Open or create the index for `field` under `dir`.
    pub fn open(dir: impl Into<PathBuf>, field: impl Into<String>, config: KvConfig) -> Result<Self> {
        Ok(Self {
            field: field.into(),
            kv: KvStore::open(dir, config)?,
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Append `internal_id` to the posting list of `term`.
    ///
    /// The underlying KV writes are atomic, so no per-term lock is taken;
    /// concurrent appends to one term may drop an id from the merged list,
    /// and readers tolerate duplicates.
    pub fn insert(&self, internal_id: u64, term: &str) -> Result<()> {
        let key = format!("{TERM_PREFIX}{term}");
        let posting = match self.kv.get_string(&key)? {
            Some(existing) => format!("{existing},{internal_id}"),
            None => internal_id.to_string(),
        };
        self.kv.put_string(&key, &posting)
    }

    /// Evaluate `op(value)` into a set of internal ids.
    pub fn search(&self, op: StringMatch, value: &str) -> Result<DocIdSet> {
        let mut result = DocIdSet::new();
        if op == StringMatch::Equals {
            let key = format!("{TERM_PREFIX}{value}");
            if let Some(posting) = self.kv.get_string(&key)? {
                add_posting(&mut result, &posting);
            }
            return Ok(result);
        }

        for (key, offset) in self.kv.scan()? {
            let Some(term) = key.strip_prefix(TERM_PREFIX) else {
                continue;
            };
            if op.matches(term, value) {
                let posting = self.kv.read_string_at(offset)?;
                add_posting(&mut result, &posting);
            }
        }
        Ok(result)
    }

    pub fn sync(&self) -> Result<()> {
        self.kv.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.kv.close()
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.kv.mapped_bytes()
    }
}

/// Parse a comma- or newline-joined posting list into the set.
fn add_posting(set: &mut DocIdSet, posting: &str) {
    for token in posting.split([',', '\n']) {
        if token.is_empty() {
            continue;
        }
        if let Ok(id) = token.parse::<u64>() {
            set.insert(id);
        }
    }
}
