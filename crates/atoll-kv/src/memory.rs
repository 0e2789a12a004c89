//! In-memory key-value backend for testing.
//!
//! Implements the full sub-document contract in-process: per-document CAS,
//! tombstones whose xattrs survive deletion, dotted-path addressing, macro
//! expansion, and monotonic per-document sequence numbers. Thread-safe via
//! `RwLock`. Not suitable for production.
//!
//! The semantics intentionally mirror the real store closely enough that
//! the transaction protocol's guards (CAS conflicts, tombstone staging,
//! checksum staleness) are exercised for real rather than mocked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use atoll_core::Keyspace;

use crate::collection::{GetResult, KvCluster, KvCollection};
use crate::error::{KvError, Result};
use crate::spec::{
    Cas, InsertOptions, LookupInOptions, LookupInResult, LookupInSpec, MutateInOptions,
    MutateInResult, MutateInSpec, MutateValue, MutationMacro, MutationResult, MutationToken,
    RemoveOptions, StoreSemantics, SubdocOp,
};
use crate::DOCUMENT_METADATA_XATTR;

#[derive(Debug, Clone)]
struct StoredDoc {
    /// `None` marks a tombstone: the body is gone but xattrs remain
    /// readable through `access_deleted`.
    body: Option<Value>,
    xattrs: Value,
    cas: Cas,
    seqno: u64,
}

impl StoredDoc {
    fn is_tombstone(&self) -> bool {
        self.body.is_none()
    }
}

#[derive(Debug, Default)]
struct ClusterInner {
    documents: RwLock<HashMap<Keyspace, HashMap<String, StoredDoc>>>,
    cas_counter: AtomicU64,
}

impl ClusterInner {
    fn next_cas(&self) -> Cas {
        self.cas_counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// In-memory cluster for testing.
///
/// # Example
///
/// ```rust
/// use atoll_core::Keyspace;
/// use atoll_kv::{KvCluster, MemoryCluster};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cluster = MemoryCluster::new();
/// let collection = cluster
///     .collection(&Keyspace::default_collection("main"))
///     .await
///     .unwrap();
/// # }
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    /// Creates a new empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test introspection: the raw xattr tree of a document (tombstones
    /// included), or `None` if the document has never existed.
    #[must_use]
    pub fn xattrs(&self, keyspace: &Keyspace, id: &str) -> Option<Value> {
        let documents = self.inner.documents.read().ok()?;
        documents
            .get(keyspace)
            .and_then(|docs| docs.get(id))
            .map(|doc| doc.xattrs.clone())
    }

    /// Test introspection: whether the document is currently a tombstone.
    /// `None` if the document has never existed.
    #[must_use]
    pub fn is_tombstone(&self, keyspace: &Keyspace, id: &str) -> Option<bool> {
        let documents = self.inner.documents.read().ok()?;
        documents
            .get(keyspace)
            .and_then(|docs| docs.get(id))
            .map(StoredDoc::is_tombstone)
    }
}

#[async_trait]
impl KvCluster for MemoryCluster {
    async fn collection(&self, keyspace: &Keyspace) -> Result<Arc<dyn KvCollection>> {
        Ok(Arc::new(MemoryCollection {
            keyspace: keyspace.clone(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// One collection inside a [`MemoryCluster`].
#[derive(Debug)]
pub struct MemoryCollection {
    keyspace: Keyspace,
    inner: Arc<ClusterInner>,
}

impl MemoryCollection {
    fn poisoned() -> KvError {
        KvError::internal("lock poisoned")
    }

    fn metadata_value(doc: &StoredDoc) -> Value {
        json!({
            "CAS": format_cas(doc.cas),
            "seqno": doc.seqno,
            "exptime": 0,
            "value_crc32c": value_crc32c(doc.body.as_ref()),
            "deleted": doc.is_tombstone(),
        })
    }

    fn lookup_field(doc: &StoredDoc, spec: &LookupInSpec) -> Option<Value> {
        match spec {
            LookupInSpec::GetFull => doc.body.clone(),
            LookupInSpec::Get { path, xattr: true } => {
                if let Some(rest) = path.strip_prefix(DOCUMENT_METADATA_XATTR) {
                    let meta = Self::metadata_value(doc);
                    match rest.strip_prefix('.') {
                        None if rest.is_empty() => Some(meta),
                        Some(sub) => path_get(&meta, sub).cloned(),
                        _ => None,
                    }
                } else {
                    path_get(&doc.xattrs, path).cloned()
                }
            }
            LookupInSpec::Get { path, xattr: false } => {
                doc.body.as_ref().and_then(|body| path_get(body, path).cloned())
            }
        }
    }
}

#[async_trait]
impl KvCollection for MemoryCollection {
    fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    async fn lookup_in(
        &self,
        id: &str,
        specs: &[LookupInSpec],
        options: LookupInOptions,
    ) -> Result<LookupInResult> {
        let documents = self.inner.documents.read().map_err(|_| Self::poisoned())?;
        let doc = documents
            .get(&self.keyspace)
            .and_then(|docs| docs.get(id))
            .ok_or_else(|| KvError::doc_not_found(id))?;

        if doc.is_tombstone() && !options.access_deleted {
            return Err(KvError::doc_not_found(id));
        }

        let fields = specs.iter().map(|spec| Self::lookup_field(doc, spec)).collect();
        Ok(LookupInResult::new(doc.cas, doc.is_tombstone(), fields))
    }

    async fn mutate_in(
        &self,
        id: &str,
        specs: &[MutateInSpec],
        options: MutateInOptions,
    ) -> Result<MutateInResult> {
        let mut documents = self.inner.documents.write().map_err(|_| Self::poisoned())?;
        let docs = documents.entry(self.keyspace.clone()).or_default();

        let existing = docs.get(id);
        let mut doc = match (options.store_semantics, existing) {
            // Tombstones count as existing for Insert semantics; staging
            // over one goes through the explicit CAS + Replace path.
            (StoreSemantics::Insert, Some(_)) => {
                return Err(KvError::doc_exists(id));
            }
            (StoreSemantics::Replace, Some(existing)) => {
                if existing.is_tombstone() && !options.access_deleted {
                    return Err(KvError::doc_not_found(id));
                }
                existing.clone()
            }
            (StoreSemantics::Upsert, Some(existing)) => existing.clone(),
            (StoreSemantics::Replace, None) => return Err(KvError::doc_not_found(id)),
            (StoreSemantics::Insert | StoreSemantics::Upsert, None) => StoredDoc {
                body: if options.create_as_deleted {
                    None
                } else {
                    Some(Value::Object(Map::new()))
                },
                xattrs: Value::Object(Map::new()),
                cas: 0,
                seqno: 0,
            },
        };

        if let Some(expected) = options.cas {
            if expected != 0 && doc.cas != expected {
                return Err(KvError::cas_mismatch(id));
            }
        }

        let new_cas = self.inner.next_cas();
        for spec in specs {
            apply_spec(&mut doc, spec, new_cas, id)?;
        }

        doc.cas = new_cas;
        doc.seqno += 1;
        let seqno = doc.seqno;
        docs.insert(id.to_string(), doc);

        Ok(MutateInResult {
            cas: new_cas,
            token: MutationToken {
                sequence_number: seqno,
            },
        })
    }

    async fn insert(
        &self,
        id: &str,
        content: Value,
        _options: InsertOptions,
    ) -> Result<MutationResult> {
        let mut documents = self.inner.documents.write().map_err(|_| Self::poisoned())?;
        let docs = documents.entry(self.keyspace.clone()).or_default();

        let seqno = match docs.get(id) {
            Some(existing) if !existing.is_tombstone() => {
                return Err(KvError::doc_exists(id));
            }
            // Inserting over a tombstone revives the document; the
            // tombstone's xattrs do not carry over.
            Some(existing) => existing.seqno + 1,
            None => 1,
        };

        let cas = self.inner.next_cas();
        docs.insert(
            id.to_string(),
            StoredDoc {
                body: Some(content),
                xattrs: Value::Object(Map::new()),
                cas,
                seqno,
            },
        );
        Ok(MutationResult { cas })
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<MutationResult> {
        let mut documents = self.inner.documents.write().map_err(|_| Self::poisoned())?;
        let docs = documents.entry(self.keyspace.clone()).or_default();

        let doc = docs.get_mut(id).ok_or_else(|| KvError::doc_not_found(id))?;
        if doc.is_tombstone() {
            return Err(KvError::doc_not_found(id));
        }
        if let Some(expected) = options.cas {
            if expected != 0 && doc.cas != expected {
                return Err(KvError::cas_mismatch(id));
            }
        }

        // Deletion purges non-system xattrs along with the body.
        doc.body = None;
        doc.xattrs = Value::Object(Map::new());
        doc.cas = self.inner.next_cas();
        doc.seqno += 1;
        Ok(MutationResult { cas: doc.cas })
    }

    async fn get(&self, id: &str) -> Result<GetResult> {
        let documents = self.inner.documents.read().map_err(|_| Self::poisoned())?;
        let doc = documents
            .get(&self.keyspace)
            .and_then(|docs| docs.get(id))
            .ok_or_else(|| KvError::doc_not_found(id))?;
        match &doc.body {
            Some(body) => Ok(GetResult {
                cas: doc.cas,
                content: body.clone(),
            }),
            None => Err(KvError::doc_not_found(id)),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let documents = self.inner.documents.read().map_err(|_| Self::poisoned())?;
        Ok(documents
            .get(&self.keyspace)
            .and_then(|docs| docs.get(id))
            .is_some_and(|doc| !doc.is_tombstone()))
    }
}

fn format_cas(cas: Cas) -> String {
    format!("0x{cas:016x}")
}

fn value_crc32c(body: Option<&Value>) -> String {
    let bytes = body
        .map(|value| serde_json::to_vec(value).unwrap_or_default())
        .unwrap_or_default();
    format!("0x{:08x}", crc32c::crc32c(&bytes))
}

fn apply_spec(doc: &mut StoredDoc, spec: &MutateInSpec, new_cas: Cas, id: &str) -> Result<()> {
    let value = spec.value.as_ref().map(|value| match value {
        MutateValue::Value(v) => v.clone(),
        MutateValue::Macro(MutationMacro::Cas) => Value::String(format_cas(new_cas)),
        MutateValue::Macro(MutationMacro::ValueCrc32c) => {
            Value::String(value_crc32c(doc.body.as_ref()))
        }
    });

    match spec.op {
        SubdocOp::SetDoc => {
            doc.body = Some(value.ok_or_else(|| KvError::invalid_argument("set_doc without value"))?);
            Ok(())
        }
        op => {
            let root = if spec.xattr {
                &mut doc.xattrs
            } else {
                doc.body
                    .as_mut()
                    .ok_or_else(|| KvError::doc_not_found(id))?
            };
            match op {
                SubdocOp::Insert => path_set(root, &spec.path, value.unwrap_or(Value::Null), spec.create_path, false),
                SubdocOp::Upsert => path_set(root, &spec.path, value.unwrap_or(Value::Null), spec.create_path, true),
                SubdocOp::Remove => path_remove(root, &spec.path),
                SubdocOp::SetDoc => unreachable!(),
            }
        }
    }
}

fn path_get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn path_set(
    root: &mut Value,
    path: &str,
    value: Value,
    create_path: bool,
    overwrite: bool,
) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| KvError::invalid_argument("empty sub-document path"))?;

    let mut current = root;
    for segment in parents {
        let map = current
            .as_object_mut()
            .ok_or_else(|| KvError::path_not_found(path))?;
        if !map.contains_key(*segment) {
            if !create_path {
                return Err(KvError::path_not_found(path));
            }
            map.insert((*segment).to_string(), Value::Object(Map::new()));
        }
        current = map
            .get_mut(*segment)
            .ok_or_else(|| KvError::path_not_found(path))?;
    }

    let map = current
        .as_object_mut()
        .ok_or_else(|| KvError::path_not_found(path))?;
    if !overwrite && map.contains_key(*last) {
        return Err(KvError::path_exists(path));
    }
    map.insert((*last).to_string(), value);
    Ok(())
}

fn path_remove(root: &mut Value, path: &str) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| KvError::invalid_argument("empty sub-document path"))?;

    let mut current = root;
    for segment in parents {
        current = current
            .as_object_mut()
            .and_then(|map| map.get_mut(*segment))
            .ok_or_else(|| KvError::path_not_found(path))?;
    }

    let map = current
        .as_object_mut()
        .ok_or_else(|| KvError::path_not_found(path))?;
    map.remove(*last)
        .map(|_| ())
        .ok_or_else(|| KvError::path_not_found(path))
}
