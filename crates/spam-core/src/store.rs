//! Durable resource-state store backed by redb.
//!
//! # Table design
//!
//! A single `RECORDS` table maps a string key to an encoded record:
//! ```text
//! key:   "{collection}/{kind}/{id}"
//! value: [ format_version: u8 | JSON-encoded Record ]
//! ```
//!
//! Collections and kinds never contain `/` (enforced by `Namespace::new`),
//! so the key splits unambiguously even when an id does.
//!
//! Every record is mirrored in an in-memory index guarded by one mutex.
//! Mutations commit to redb first and touch the index only after the commit
//! succeeds, while still holding the lock, so the index never promises an
//! entry the file does not have.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpamError};
use crate::types::{Credential, Namespace};

// ---------------------------------------------------------------------------
// Table definition
// ---------------------------------------------------------------------------

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Leading byte of every stored value.
const FORMAT_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// State held for one id within a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    /// A remote resource known to exist, with its in-use marker.
    Tracked { used: bool },
    /// Session secrets for a principal.
    Credential(Credential),
    /// A scalar bootstrap setting.
    Setting { value: String },
}

impl Record {
    pub fn unused() -> Self {
        Record::Tracked { used: false }
    }

    pub fn used(&self) -> Option<bool> {
        match self {
            Record::Tracked { used } => Some(*used),
            _ => None,
        }
    }

    pub fn as_credential(&self) -> Option<&Credential> {
        match self {
            Record::Credential(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_setting(&self) -> Option<&str> {
        match self {
            Record::Setting { value } => Some(value),
            _ => None,
        }
    }
}

fn encode(record: &Record) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.push(FORMAT_VERSION);
    serde_json::to_writer(&mut buf, record)?;
    Ok(buf)
}

fn decode(bytes: &[u8]) -> std::result::Result<Record, String> {
    match bytes.split_first() {
        Some((&FORMAT_VERSION, body)) => serde_json::from_slice(body).map_err(|e| e.to_string()),
        Some((v, _)) => Err(format!("unsupported format version {v}")),
        None => Err("empty value".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn record_key(ns: &Namespace, id: &str) -> String {
    format!("{}/{}/{}", ns.collection, ns.kind, id)
}

fn split_key(key: &str) -> Option<(Namespace, String)> {
    let mut parts = key.splitn(3, '/');
    let collection = parts.next()?;
    let kind = parts.next()?;
    let id = parts.next()?;
    let ns = Namespace::new(collection, kind).ok()?;
    Some((ns, id.to_string()))
}

// ---------------------------------------------------------------------------
// Seed
// ---------------------------------------------------------------------------

/// Records written once into an empty store.
#[derive(Debug, Clone, Default)]
pub struct Seed {
    pub records: Vec<(Namespace, String, Record)>,
}

impl Seed {
    pub fn push(&mut self, ns: Namespace, id: impl Into<String>, record: Record) {
        self.records.push((ns, id.into(), record));
    }
}

// ---------------------------------------------------------------------------
// ResourceStore
// ---------------------------------------------------------------------------

type Index = BTreeMap<Namespace, BTreeMap<String, Record>>;

/// Persistent `(collection, kind, id) -> Record` map.
pub struct ResourceStore {
    db: Database,
    index: Mutex<Index>,
}

impl ResourceStore {
    /// Open or create the store at `path` without seeding.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, || Ok(Seed::default()))
    }

    /// Open or create the store at `path`. `seed` is only invoked when the
    /// file holds no records at all.
    pub fn open_with(path: &Path, seed: impl FnOnce() -> Result<Seed>) -> Result<Self> {
        let db = Database::create(path).map_err(SpamError::storage)?;
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(SpamError::storage)?;
        wt.open_table(RECORDS).map_err(SpamError::storage)?;
        wt.commit().map_err(SpamError::storage)?;

        let store = Self {
            db,
            index: Mutex::new(Index::new()),
        };
        let raw_count = store.reload()?;
        if raw_count == 0 {
            let seed = seed()?;
            if !seed.records.is_empty() {
                tracing::info!(records = seed.records.len(), "seeding empty resource store");
                store.put_many(seed.records)?;
            }
        }
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Index>> {
        self.index
            .lock()
            .map_err(|_| SpamError::Storage("resource index lock poisoned".into()))
    }

    /// Commit a batch of inserts (`Some`) and removals (`None`) in one
    /// write transaction.
    fn commit(&self, ops: &[(String, Option<Vec<u8>>)]) -> Result<()> {
        let wt = self.db.begin_write().map_err(SpamError::storage)?;
        {
            let mut table = wt.open_table(RECORDS).map_err(SpamError::storage)?;
            for (key, value) in ops {
                match value {
                    Some(bytes) => {
                        table
                            .insert(key.as_str(), bytes.as_slice())
                            .map_err(SpamError::storage)?;
                    }
                    None => {
                        table.remove(key.as_str()).map_err(SpamError::storage)?;
                    }
                }
            }
        }
        wt.commit().map_err(SpamError::storage)?;
        Ok(())
    }

    /// Rebuild the in-memory index from disk. Records that cannot be
    /// decoded are dropped with a warning. Returns the number of raw
    /// records found, decodable or not.
    pub fn reload(&self) -> Result<usize> {
        let rt = self.db.begin_read().map_err(SpamError::storage)?;
        let table = rt.open_table(RECORDS).map_err(SpamError::storage)?;

        let mut fresh = Index::new();
        let mut raw = 0usize;
        for entry in table.iter().map_err(SpamError::storage)? {
            let (k, v) = entry.map_err(SpamError::storage)?;
            raw += 1;
            let key = k.value();
            let Some((ns, id)) = split_key(key) else {
                tracing::warn!(key, "dropping record with malformed key");
                continue;
            };
            match decode(v.value()) {
                Ok(record) => {
                    fresh.entry(ns).or_default().insert(id, record);
                }
                Err(reason) => {
                    tracing::warn!(key, %reason, "dropping undecodable record");
                }
            }
        }

        *self.lock()? = fresh;
        Ok(raw)
    }

    pub fn get(&self, ns: &Namespace, id: &str) -> Result<Record> {
        self.lock()?
            .get(ns)
            .and_then(|m| m.get(id))
            .cloned()
            .ok_or_else(|| not_found(ns, id))
    }

    pub fn contains(&self, ns: &Namespace, id: &str) -> Result<bool> {
        Ok(self.lock()?.get(ns).is_some_and(|m| m.contains_key(id)))
    }

    /// Upsert. Durable before the index changes.
    pub fn put(&self, ns: &Namespace, id: &str, record: Record) -> Result<()> {
        let bytes = encode(&record)?;
        let mut index = self.lock()?;
        self.commit(&[(record_key(ns, id), Some(bytes))])?;
        index.entry(ns.clone()).or_default().insert(id.to_string(), record);
        Ok(())
    }

    /// Insert `record` only if `id` is absent. Returns `true` if inserted.
    pub fn put_if_absent(&self, ns: &Namespace, id: &str, record: Record) -> Result<bool> {
        let bytes = encode(&record)?;
        let mut index = self.lock()?;
        if index.get(ns).is_some_and(|m| m.contains_key(id)) {
            return Ok(false);
        }
        self.commit(&[(record_key(ns, id), Some(bytes))])?;
        index.entry(ns.clone()).or_default().insert(id.to_string(), record);
        Ok(true)
    }

    pub fn put_many(&self, records: Vec<(Namespace, String, Record)>) -> Result<()> {
        let mut ops = Vec::with_capacity(records.len());
        for (ns, id, record) in &records {
            ops.push((record_key(ns, id), Some(encode(record)?)));
        }
        let mut index = self.lock()?;
        self.commit(&ops)?;
        for (ns, id, record) in records {
            index.entry(ns).or_default().insert(id, record);
        }
        Ok(())
    }

    pub fn delete(&self, ns: &Namespace, id: &str) -> Result<()> {
        let mut index = self.lock()?;
        if !index.get(ns).is_some_and(|m| m.contains_key(id)) {
            return Err(not_found(ns, id));
        }
        self.commit(&[(record_key(ns, id), None)])?;
        if let Some(m) = index.get_mut(ns) {
            m.remove(id);
            if m.is_empty() {
                index.remove(ns);
            }
        }
        Ok(())
    }

    /// Move the record at `old` to `new` within one namespace.
    pub fn rename(&self, ns: &Namespace, old: &str, new: &str) -> Result<()> {
        let mut index = self.lock()?;
        let record = index
            .get(ns)
            .and_then(|m| m.get(old))
            .cloned()
            .ok_or_else(|| not_found(ns, old))?;
        self.commit(&[
            (record_key(ns, old), None),
            (record_key(ns, new), Some(encode(&record)?)),
        ])?;
        let m = index.entry(ns.clone()).or_default();
        m.remove(old);
        m.insert(new.to_string(), record);
        Ok(())
    }

    /// Set the in-use marker of an existing tracked record.
    pub fn set_used(&self, ns: &Namespace, id: &str, used: bool) -> Result<()> {
        let mut index = self.lock()?;
        match index.get(ns).and_then(|m| m.get(id)) {
            Some(Record::Tracked { .. }) => {}
            Some(_) => {
                return Err(SpamError::Deserialize {
                    key: record_key(ns, id),
                    reason: "not a tracked record".into(),
                })
            }
            None => return Err(not_found(ns, id)),
        }
        let record = Record::Tracked { used };
        self.commit(&[(record_key(ns, id), Some(encode(&record)?))])?;
        index.entry(ns.clone()).or_default().insert(id.to_string(), record);
        Ok(())
    }

    /// Atomically find the first tracked record whose marker equals `from`,
    /// flip it to `!from`, and return its id.
    ///
    /// The scan, the durable write and the index update happen under one
    /// lock, so two callers can never claim the same id.
    pub fn claim_first(
        &self,
        ns: &Namespace,
        from: bool,
        eligible: impl Fn(&str) -> bool,
    ) -> Result<Option<String>> {
        let mut index = self.lock()?;
        let Some(id) = index.get(ns).and_then(|m| {
            m.iter()
                .find(|(id, r)| r.used() == Some(from) && eligible(id))
                .map(|(id, _)| id.clone())
        }) else {
            return Ok(None);
        };
        let record = Record::Tracked { used: !from };
        self.commit(&[(record_key(ns, &id), Some(encode(&record)?))])?;
        index.entry(ns.clone()).or_default().insert(id.clone(), record);
        Ok(Some(id))
    }

    /// Snapshot of the ids in `ns`.
    pub fn keys(&self, ns: &Namespace) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .get(ns)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Snapshot of the `(id, record)` pairs in `ns`.
    pub fn entries(&self, ns: &Namespace) -> Result<Vec<(String, Record)>> {
        Ok(self
            .lock()?
            .get(ns)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    pub fn len(&self, ns: &Namespace) -> Result<usize> {
        Ok(self.lock()?.get(ns).map(|m| m.len()).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.values().all(|m| m.is_empty()))
    }

    pub fn namespaces(&self) -> Result<Vec<Namespace>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    /// Remove every record in `ns` except the ids for which `keep` is true.
    /// Returns the number removed.
    pub fn clear(&self, ns: &Namespace, keep: impl Fn(&str) -> bool) -> Result<usize> {
        let mut index = self.lock()?;
        let doomed: Vec<String> = index
            .get(ns)
            .map(|m| m.keys().filter(|id| !keep(id)).cloned().collect())
            .unwrap_or_default();
        if doomed.is_empty() {
            return Ok(0);
        }
        let ops: Vec<_> = doomed.iter().map(|id| (record_key(ns, id), None)).collect();
        self.commit(&ops)?;
        if let Some(m) = index.get_mut(ns) {
            for id in &doomed {
                m.remove(id);
            }
        }
        Ok(doomed.len())
    }
}

fn not_found(ns: &Namespace, id: &str) -> SpamError {
    SpamError::NotFound {
        namespace: ns.to_string(),
        id: id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
