//! Catalog Store: the nameable resources the engine can deliver.
//!
//! Lookup is normalization-based and two-phase: exact normalized equality
//! against the key or any alias first, then bidirectional substring
//! containment as a fallback so partial typing still matches. Insertion order
//! is preserved and significant for the fallback (first inserted wins).
//!
//! Mutations persist synchronously through [`CatalogPersistence`] before
//! returning success, so a crash after a reported success never loses the
//! change.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CatalogError;

/// Sentinel meaning "link not yet configured by an administrator".
pub const PLACEHOLDER_LINK: &str = "REPLACE_WITH_YOUR_LINK";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Human-readable unique identifier, shown to requesters.
    pub key: String,
    /// Advisory match shortcuts. Not separate entries.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Delivery link, possibly [`PLACEHOLDER_LINK`].
    pub link: String,
}

impl CatalogEntry {
    pub fn new(key: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            aliases: Vec::new(),
            link: link.into(),
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = aliases;
        self
    }

    /// Whether a real delivery link has been configured.
    pub fn is_configured(&self) -> bool {
        self.link != PLACEHOLDER_LINK && !self.link.is_empty()
    }
}

/// Case-folds, strips decorative symbols and punctuation, treats hyphens and
/// underscores as word separators, and collapses whitespace runs, so
/// "SPOTIFY PREMIUM", "spotify premium" and " spotify-premium " all normalize
/// to the same string.
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for c in input.chars().flat_map(char::to_lowercase) {
        if c.is_whitespace() || c == '-' || c == '_' {
            pending_space = !out.is_empty();
        } else if c.is_alphanumeric() {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
        // everything else (emoji, punctuation) is decorative and dropped
    }
    out
}

/// Durability collaborator: a crash-tolerant, atomic store for the full
/// catalog snapshot.
pub trait CatalogPersistence: Send + Sync {
    /// Returns the persisted entries, or `None` if nothing was ever stored.
    fn load(&self) -> Result<Option<Vec<CatalogEntry>>, CatalogError>;
    fn store(&self, entries: &[CatalogEntry]) -> Result<(), CatalogError>;
}

/// File-backed persistence: one JSON document, replaced atomically via a
/// temp-file-then-rename so readers never observe a partial write.
pub struct FileCatalogPersistence {
    path: PathBuf,
}

impl FileCatalogPersistence {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl CatalogPersistence for FileCatalogPersistence {
    fn load(&self) -> Result<Option<Vec<CatalogEntry>>, CatalogError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&content)?;
        Ok(Some(entries))
    }

    fn store(&self, entries: &[CatalogEntry]) -> Result<(), CatalogError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content.as_bytes())?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory persistence for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryCatalogPersistence {
    entries: Mutex<Option<Vec<CatalogEntry>>>,
}

impl InMemoryCatalogPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CatalogPersistence for InMemoryCatalogPersistence {
    fn load(&self) -> Result<Option<Vec<CatalogEntry>>, CatalogError> {
        Ok(self.entries.lock().expect("catalog persistence lock").clone())
    }

    fn store(&self, entries: &[CatalogEntry]) -> Result<(), CatalogError> {
        *self.entries.lock().expect("catalog persistence lock") = Some(entries.to_vec());
        Ok(())
    }
}

/// The catalog store. Capability-agnostic: `upsert`/`remove` trust that the
/// caller already verified administrator capability.
pub struct CatalogStore {
    entries: RwLock<IndexMap<String, CatalogEntry>>,
    persistence: Box<dyn CatalogPersistence>,
}

impl CatalogStore {
    /// Loads the catalog from persistence, seeding placeholder defaults on
    /// first run so administrators have something to replace.
    pub fn open(persistence: Box<dyn CatalogPersistence>) -> Result<Self, CatalogError> {
        let loaded = persistence.load()?;
        let seeded = loaded.is_none();
        let entries = loaded.unwrap_or_else(default_entries);
        if seeded {
            persistence.store(&entries)?;
            info!("seeded catalog with {} placeholder entries", entries.len());
        }
        let map = entries
            .into_iter()
            .map(|e| (normalize(&e.key), e))
            .collect();
        Ok(Self {
            entries: RwLock::new(map),
            persistence,
        })
    }

    /// Resolves free-form requester input to a catalog entry.
    ///
    /// Phase 1: exact normalized equality against the key or any alias.
    /// Phase 2: substring containment in either direction between the
    /// normalized input and the normalized key; first-inserted entry wins.
    pub fn resolve(&self, input: &str) -> Option<CatalogEntry> {
        let needle = normalize(input);
        if needle.is_empty() {
            return None;
        }
        let entries = self.entries.read().expect("catalog lock");
        for (norm_key, entry) in entries.iter() {
            if *norm_key == needle
                || entry.aliases.iter().any(|a| normalize(a) == needle)
            {
                return Some(entry.clone());
            }
        }
        for (norm_key, entry) in entries.iter() {
            if norm_key.contains(&needle) || needle.contains(norm_key.as_str()) {
                return Some(entry.clone());
            }
        }
        None
    }

    /// Adds or updates an entry. An update keeps existing aliases. Persisted
    /// before returning.
    pub fn upsert(&self, key: &str, link: &str) -> Result<(), CatalogError> {
        let snapshot = {
            let mut entries = self.entries.write().expect("catalog lock");
            let norm = normalize(key);
            match entries.get_mut(&norm) {
                Some(existing) => {
                    existing.key = key.to_string();
                    existing.link = link.to_string();
                }
                None => {
                    entries.insert(norm, CatalogEntry::new(key, link));
                }
            }
            entries.values().cloned().collect::<Vec<_>>()
        };
        self.persistence.store(&snapshot)
    }

    /// Removes an entry by key. Returns whether anything was removed.
    /// Persisted before returning.
    pub fn remove(&self, key: &str) -> Result<bool, CatalogError> {
        let (removed, snapshot) = {
            let mut entries = self.entries.write().expect("catalog lock");
            // shift_remove keeps insertion order for the remaining entries
            let removed = entries.shift_remove(&normalize(key)).is_some();
            (removed, entries.values().cloned().collect::<Vec<_>>())
        };
        if removed {
            self.persistence.store(&snapshot)?;
        }
        Ok(removed)
    }

    /// All entries in insertion order.
    pub fn list(&self) -> Vec<CatalogEntry> {
        self.entries
            .read()
            .expect("catalog lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("catalog lock").is_empty()
    }
}

fn default_entries() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry::new("KineMaster", PLACEHOLDER_LINK)
            .with_aliases(vec!["kine master".to_string()]),
        CatalogEntry::new("Spotify Premium", PLACEHOLDER_LINK)
            .with_aliases(vec!["spotify".to_string()]),
        CatalogEntry::new("Truecaller", PLACEHOLDER_LINK),
        CatalogEntry::new("CineTV", PLACEHOLDER_LINK)
            .with_aliases(vec!["cine tv".to_string()]),
    ]
}
