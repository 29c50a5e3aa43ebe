//! Desired-State Store.
//!
//! Holds at most one [`ServiceSpec`] per name together with its compiled
//! node selector, the `Changed`/`Outdated` reconciliation flags and the
//! quarantine of definition files with unknown extensions.  Specs only
//! enter or change through [`Store::merge`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use log::info;
use regex::Regex;

use crate::error::{LoadError, StoreError};
use crate::types::{Fingerprint, ServiceSpec};

/// Writes accepted specs back to their backing definition file.
pub trait DefinitionWriter: Send + Sync {
    fn persist(&self, spec: &ServiceSpec) -> Result<(), LoadError>;
}

/// Where an incoming spec came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// Read from the local definition directory; already on disk.
    Definition,
    /// Pushed by a peer or a client; persisted on acceptance.
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Flag {
    /// Running container's fingerprint label differs from the spec.
    Changed,
    /// A newer image exists than the one the container was started from.
    Outdated,
}

struct StoredSpec {
    spec: ServiceSpec,
    selector: Regex,
}

pub struct Store {
    specs: DashMap<String, StoredSpec>,
    changed: DashSet<String>,
    outdated: DashSet<String>,
    bad_files: DashSet<String>,
    last_pulled: DashMap<String, Instant>,
    writer: Option<Arc<dyn DefinitionWriter>>,
}

impl Store {
    pub fn new(writer: Option<Arc<dyn DefinitionWriter>>) -> Self {
        Self {
            specs: DashMap::new(),
            changed: DashSet::new(),
            outdated: DashSet::new(),
            bad_files: DashSet::new(),
            last_pulled: DashMap::new(),
            writer,
        }
    }

    /// Last-writer-wins merge gated by content hash.
    ///
    /// `incoming` replaces the current entry iff there is none, or its
    /// fingerprint differs and its `last_updated` is strictly later.  The
    /// comparison and the write happen under the entry's shard lock, so two
    /// merges for the same name cannot interleave.
    pub fn merge(&self, incoming: ServiceSpec, source: MergeSource) -> Result<bool, StoreError> {
        let selector = incoming.validate()?;
        match self.specs.entry(incoming.name.clone()) {
            Entry::Occupied(mut current) => {
                let stored = &current.get().spec;
                let fresher = incoming.last_updated > stored.last_updated;
                if incoming.fingerprint() == stored.fingerprint() || !fresher {
                    return Ok(false);
                }
                self.persist(&incoming, source)?;
                info!(
                    "Accepted update for {} ({} -> {})",
                    incoming.name,
                    stored.fingerprint(),
                    incoming.fingerprint()
                );
                current.insert(StoredSpec {
                    spec: incoming,
                    selector,
                });
            }
            Entry::Vacant(vacant) => {
                self.persist(&incoming, source)?;
                info!("Accepted new service {}", incoming.name);
                vacant.insert(StoredSpec {
                    spec: incoming,
                    selector,
                });
            }
        }
        Ok(true)
    }

    fn persist(&self, spec: &ServiceSpec, source: MergeSource) -> Result<(), StoreError> {
        match (&self.writer, source) {
            (Some(writer), MergeSource::Peer) => Ok(writer.persist(spec)?),
            _ => Ok(()),
        }
    }

    pub fn get(&self, name: &str) -> Option<ServiceSpec> {
        self.specs.get(name).map(|e| e.spec.clone())
    }

    pub fn fingerprint(&self, name: &str) -> Option<Fingerprint> {
        self.specs.get(name).map(|e| e.spec.fingerprint())
    }

    /// All specs, sorted by name.
    pub fn list(&self) -> Vec<ServiceSpec> {
        let mut specs: Vec<ServiceSpec> = self.specs.iter().map(|e| e.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Drops a spec along with its flags and pull stamp.  Nothing calls this
    /// when a definition file disappears; decommissioning is explicit.
    pub fn remove(&self, name: &str) -> Option<ServiceSpec> {
        let (_, stored) = self.specs.remove(name)?;
        self.changed.remove(name);
        self.outdated.remove(name);
        self.last_pulled.remove(name);
        info!("Removed service {}", name);
        Some(stored.spec)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Whether `spec`'s selector matches `node`, reusing the cached regex
    /// when the stored entry has the same selector text.
    pub fn selects(&self, spec: &ServiceSpec, node: &str) -> bool {
        if node.is_empty() {
            return false;
        }
        if let Some(stored) = self.specs.get(&spec.name) {
            if stored.spec.node_selector == spec.node_selector {
                return stored.selector.is_match(node);
            }
        }
        Regex::new(&spec.node_selector)
            .map(|re| re.is_match(node))
            .unwrap_or(false)
    }

    pub fn flag(&self, name: &str, flag: Flag) {
        if !self.specs.contains_key(name) {
            return;
        }
        self.flag_set(flag).insert(name.to_string());
    }

    pub fn clear_flag(&self, name: &str, flag: Flag) {
        self.flag_set(flag).remove(name);
    }

    pub fn is_flagged(&self, name: &str, flag: Flag) -> bool {
        self.flag_set(flag).contains(name)
    }

    /// Flagged names, sorted so remediation order is deterministic.
    pub fn flagged(&self, flag: Flag) -> Vec<String> {
        let mut names: Vec<String> = self
            .flag_set(flag)
            .iter()
            .map(|n| n.key().clone())
            .collect();
        names.sort();
        names
    }

    fn flag_set(&self, flag: Flag) -> &DashSet<String> {
        match flag {
            Flag::Changed => &self.changed,
            Flag::Outdated => &self.outdated,
        }
    }

    /// Records a file with an unknown extension; true the first time only.
    pub fn quarantine(&self, file_name: &str) -> bool {
        self.bad_files.insert(file_name.to_string())
    }

    pub fn is_quarantined(&self, file_name: &str) -> bool {
        self.bad_files.contains(file_name)
    }

    /// Whether the spec's own pull interval has elapsed since its last pull.
    pub fn pull_due(&self, spec: &ServiceSpec, now: Instant) -> bool {
        if spec.pull_interval == 0 {
            return true;
        }
        match self.last_pulled.get(&spec.name) {
            Some(at) => now.duration_since(*at) >= Duration::from_secs(spec.pull_interval),
            None => true,
        }
    }

    pub fn mark_pulled(&self, name: &str, at: Instant) {
        self.last_pulled.insert(name.to_string(), at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::spec;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWriter {
        writes: Mutex<Vec<String>>,
    }

    impl DefinitionWriter for RecordingWriter {
        fn persist(&self, spec: &ServiceSpec) -> Result<(), LoadError> {
            self.writes.lock().unwrap().push(spec.name.clone());
            Ok(())
        }
    }

    fn store_with_writer() -> (Store, Arc<RecordingWriter>) {
        let writer = Arc::new(RecordingWriter::default());
        (Store::new(Some(writer.clone())), writer)
    }

    #[test]
    fn merge_is_idempotent_for_unchanged_content() {
        let (store, writer) = store_with_writer();
        let s = spec("app", "myrepo/app", "v1");
        assert!(store.merge(s.clone(), MergeSource::Peer).unwrap());

        let mut again = s.clone();
        again.last_updated = s.last_updated + ChronoDuration::seconds(60);
        assert!(!store.merge(again, MergeSource::Peer).unwrap());
        assert!(!store.merge(s.clone(), MergeSource::Peer).unwrap());

        assert_eq!(store.fingerprint("app"), Some(s.fingerprint()));
        assert_eq!(writer.writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn last_writer_wins() {
        let (store, _) = store_with_writer();
        let current = spec("app", "myrepo/app", "v1");
        store.merge(current.clone(), MergeSource::Peer).unwrap();

        let mut older = spec("app", "myrepo/app", "v0");
        older.last_updated = current.last_updated - ChronoDuration::seconds(1);
        assert!(!store.merge(older, MergeSource::Peer).unwrap());
        assert_eq!(store.get("app").unwrap().tag, "v1");

        let mut same_instant = spec("app", "myrepo/app", "v9");
        same_instant.last_updated = current.last_updated;
        assert!(!store.merge(same_instant, MergeSource::Peer).unwrap());

        let mut newer = spec("app", "myrepo/app", "v2");
        newer.last_updated = current.last_updated + ChronoDuration::seconds(1);
        assert!(store.merge(newer, MergeSource::Peer).unwrap());
        assert_eq!(store.get("app").unwrap().tag, "v2");
    }

    #[test]
    fn definitions_from_disk_are_not_written_back() {
        let (store, writer) = store_with_writer();
        assert!(store
            .merge(spec("app", "myrepo/app", "v1"), MergeSource::Definition)
            .unwrap());
        assert!(writer.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn invalid_specs_never_enter_the_store() {
        let store = Store::new(None);
        let mut bad = spec("app", "myrepo/app", "v1");
        bad.bash_template = "docker run something/else".into();
        assert!(store.merge(bad, MergeSource::Peer).is_err());
        assert!(store.get("app").is_none());
    }

    #[test]
    fn concurrent_merges_keep_the_freshest() {
        let store = Arc::new(Store::new(None));
        let base = spec("app", "myrepo/app", "v0");
        let handles: Vec<_> = (1..=16)
            .map(|i| {
                let store = store.clone();
                let mut s = base.clone();
                s.tag = format!("v{}", i);
                s.last_updated = base.last_updated + ChronoDuration::seconds(i);
                std::thread::spawn(move || store.merge(s, MergeSource::Peer).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get("app").unwrap().tag, "v16");
    }

    #[test]
    fn selector_cache_follows_replacement() {
        let store = Store::new(None);
        let mut s = spec("db", "corp/db", "1");
        s.node_selector = "^database-box-".into();
        store.merge(s.clone(), MergeSource::Definition).unwrap();
        assert!(store.selects(&s, "database-box-lvje"));
        assert!(!store.selects(&s, "api-box-ooek"));
        assert!(!store.selects(&s, ""));

        let mut moved = s.clone();
        moved.node_selector = "^api-box-".into();
        moved.last_updated = s.last_updated + ChronoDuration::seconds(5);
        assert!(store.selects(&moved, "api-box-ooek"));
        store.merge(moved.clone(), MergeSource::Definition).unwrap();
        assert!(store.selects(&moved, "api-box-ooek"));
        assert!(!store.selects(&moved, "database-box-lvje"));
    }

    #[test]
    fn flags_only_reference_known_services() {
        let store = Store::new(None);
        store.flag("ghost", Flag::Changed);
        assert!(store.flagged(Flag::Changed).is_empty());

        store
            .merge(spec("app", "myrepo/app", "v1"), MergeSource::Definition)
            .unwrap();
        store.flag("app", Flag::Outdated);
        assert_eq!(store.flagged(Flag::Outdated), vec!["app".to_string()]);
        store.clear_flag("app", Flag::Outdated);
        assert!(!store.is_flagged("app", Flag::Outdated));
    }

    #[test]
    fn remove_drops_flags_with_the_spec() {
        let store = Store::new(None);
        store
            .merge(spec("app", "myrepo/app", "v1"), MergeSource::Definition)
            .unwrap();
        store.flag("app", Flag::Changed);
        store.mark_pulled("app", Instant::now());

        assert_eq!(store.remove("app").map(|s| s.tag), Some("v1".to_string()));
        assert!(store.is_empty());
        assert!(store.flagged(Flag::Changed).is_empty());
        assert!(store.remove("app").is_none());

        // A removed name can be merged again from scratch.
        assert!(store
            .merge(spec("app", "myrepo/app", "v0"), MergeSource::Definition)
            .unwrap());
    }

    #[test]
    fn quarantine_reports_first_sighting_only() {
        let store = Store::new(None);
        assert!(store.quarantine("notes.txt"));
        assert!(!store.quarantine("notes.txt"));
        assert!(store.is_quarantined("notes.txt"));
    }

    #[test]
    fn pull_interval_gates_repeated_pulls() {
        let store = Store::new(None);
        let mut s = spec("app", "myrepo/app", "v1");
        s.pull_interval = 60;
        let t0 = Instant::now();
        assert!(store.pull_due(&s, t0));
        store.mark_pulled("app", t0);
        assert!(!store.pull_due(&s, t0 + Duration::from_secs(30)));
        assert!(store.pull_due(&s, t0 + Duration::from_secs(60)));
    }
}
