//! An in-memory [`Backend`] used by the test suite, so unit tests never need
//! a live MongoDB instance (mirrors the teacher corpus's
//! `router::namespace_cache::memory::MemoryNamespaceCache` and `iox_tests`
//! mem-backed repos).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use parking_lot::RwLock;
use snafu::Snafu;

use crate::backend::{Backend, Collection, Filter, IndexSpec, SortField, SortSpec};
use crate::error::{Error, Result};
use crate::schema::RecordEnvelope;

/// Raised by [`MemCollection::insert_one`]/[`insert_many`] on an `id`
/// collision, standing in for the backend driver's own duplicate-key error
/// (spec's "BackendError — propagated from the backend port unchanged").
#[derive(Debug, Snafu)]
#[snafu(display("duplicate id in collection {collection}"))]
pub struct DuplicateIdError {
    pub collection: String,
}

#[derive(Debug, Default)]
struct CollectionState {
    docs: Vec<Document>,
    indexes: Vec<String>,
}

/// An in-memory stand-in for a single collection.
#[derive(Debug)]
pub struct MemCollection {
    name: String,
    state: RwLock<CollectionState>,
}

impl MemCollection {
    fn new(name: String) -> Self {
        Self {
            name,
            state: RwLock::new(CollectionState::default()),
        }
    }

    fn doc_id(doc: &Document) -> Option<&Bson> {
        doc.get("id")
    }
}

fn matches(doc: &Document, filter: &Filter) -> bool {
    match filter {
        Filter::IdEquals(id) => MemCollection::doc_id(doc) == Some(id),
        Filter::KeyEquals(key) => doc.get_str("key").ok() == Some(key.as_str()),
        Filter::KeyEqualsAndDataSetIn {
            key,
            data_sets,
            cutoff,
        } => {
            let key_matches = doc.get_str("key").ok() == Some(key.as_str());
            let in_data_sets = doc
                .get("dataSet")
                .map(|ds| data_sets.contains(ds))
                .unwrap_or(false);
            let under_cutoff = match cutoff {
                Some(bound) => MemCollection::doc_id(doc)
                    .map(|id| bson_lt(id, bound))
                    .unwrap_or(false),
                None => true,
            };
            key_matches && in_data_sets && under_cutoff
        }
        Filter::IdLessThan(bound) => MemCollection::doc_id(doc)
            .map(|id| bson_lt(id, bound))
            .unwrap_or(false),
        Filter::DataSetInWithOptionalCutoff { data_sets, cutoff } => {
            let in_data_sets = doc
                .get("dataSet")
                .map(|ds| data_sets.contains(ds))
                .unwrap_or(false);
            let under_cutoff = match cutoff {
                Some(bound) => MemCollection::doc_id(doc)
                    .map(|id| bson_lt(id, bound))
                    .unwrap_or(false),
                None => true,
            };
            in_data_sets && under_cutoff
        }
    }
}

/// Compares two BSON values that are known (by construction — the core only
/// ever compares `id`/`dataSet` TIDs) to be binary-encoded TIDs.
fn bson_lt(a: &Bson, b: &Bson) -> bool {
    match (a.as_binary_generic(), b.as_binary_generic()) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

fn sort_key<'a>(doc: &'a Document, field: &SortField) -> Option<&'a Bson> {
    doc.get(field.field)
}

fn apply_sort(docs: &mut [Document], sort: &SortSpec) {
    docs.sort_by(|a, b| {
        for field in &sort.0 {
            let (av, bv) = (sort_key(a, field), sort_key(b, field));
            let ordering = match (av, bv) {
                (Some(av), Some(bv)) => compare_bson(av, bv),
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
            };
            let ordering = if field.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn compare_bson(a: &Bson, b: &Bson) -> std::cmp::Ordering {
    match (a.as_binary_generic(), b.as_binary_generic()) {
        (Some(a), Some(b)) => a.cmp(b),
        _ => std::cmp::Ordering::Equal,
    }
}

#[async_trait]
impl Collection for MemCollection {
    async fn insert_one(&self, doc: Document) -> Result<()> {
        let mut state = self.state.write();
        let id = Self::doc_id(&doc).cloned();
        if let Some(id) = &id {
            if state.docs.iter().any(|d| Self::doc_id(d) == Some(id)) {
                return Err(Error::backend(DuplicateIdError {
                    collection: self.name.clone(),
                }));
            }
        }
        state.docs.push(doc);
        Ok(())
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<()> {
        let mut state = self.state.write();
        for doc in &docs {
            if let Some(id) = Self::doc_id(doc) {
                if state.docs.iter().any(|d| Self::doc_id(d) == Some(id)) {
                    return Err(Error::backend(DuplicateIdError {
                        collection: self.name.clone(),
                    }));
                }
            }
        }
        state.docs.extend(docs);
        Ok(())
    }

    async fn find(
        &self,
        filter: &Filter,
        sort: &SortSpec,
        limit: Option<i64>,
    ) -> Result<Vec<Document>> {
        let state = self.state.read();
        let mut matched: Vec<Document> = state
            .docs
            .iter()
            .filter(|doc| matches(doc, filter))
            .cloned()
            .collect();
        apply_sort(&mut matched, sort);
        if let Some(limit) = limit {
            matched.truncate(limit.max(0) as usize);
        }
        Ok(matched)
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        let mut state = self.state.write();
        if !state.indexes.iter().any(|name| name == spec.name) {
            state.indexes.push(spec.name.to_owned());
        }
        Ok(())
    }
}

/// An in-memory [`Backend`]: a process-local map of named collections.
#[derive(Debug, Default)]
pub struct MemBackend {
    collections: RwLock<HashMap<String, Arc<MemCollection>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn get_collection(&self, name: &str) -> Result<Box<dyn Collection>> {
        if let Some(existing) = self.collections.read().get(name) {
            return Ok(Box::new(MemCollectionHandle(Arc::clone(existing))));
        }
        let mut collections = self.collections.write();
        let entry = collections
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(MemCollection::new(name.to_owned())));
        Ok(Box::new(MemCollectionHandle(Arc::clone(entry))))
    }

    async fn drop_database(&self) -> Result<()> {
        self.collections.write().clear();
        Ok(())
    }
}

/// A cheap, cloneable handle returned from [`MemBackend::get_collection`];
/// forwards every call to the shared, reference-counted collection state.
#[derive(Debug)]
struct MemCollectionHandle(Arc<MemCollection>);

#[async_trait]
impl Collection for MemCollectionHandle {
    async fn insert_one(&self, doc: Document) -> Result<()> {
        self.0.insert_one(doc).await
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<()> {
        self.0.insert_many(docs).await
    }

    async fn find(
        &self,
        filter: &Filter,
        sort: &SortSpec,
        limit: Option<i64>,
    ) -> Result<Vec<Document>> {
        self.0.find(filter, sort, limit).await
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        self.0.create_index(spec).await
    }
}

/// Converts an envelope to its stored document form for insertion into a
/// [`MemBackend`] (or any backend) collection.
pub fn envelope_to_doc(env: &RecordEnvelope) -> Document {
    env.to_document()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Key, RecordKind};
    use crate::time::Tid;

    fn env(id: u32, key: &str, data_set: u32) -> RecordEnvelope {
        RecordEnvelope {
            id: Tid::new(id, [0; 8]),
            key: Key::from_fields([key]),
            data_set: Tid::new(data_set, [0; 8]),
            kind: RecordKind::Payload {
                root_name: "Widget".to_owned(),
                fields: bson::doc! {},
            },
        }
    }

    #[tokio::test]
    async fn insert_and_find_by_key() {
        let backend = MemBackend::new();
        let coll = backend.get_collection("Widget").await.unwrap();
        coll.insert_one(envelope_to_doc(&env(10, "K", 1))).await.unwrap();

        let found = coll
            .find(
                &Filter::KeyEquals("K".to_owned()),
                &SortSpec::data_set_then_id_desc(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let backend = MemBackend::new();
        let coll = backend.get_collection("Widget").await.unwrap();
        coll.insert_one(envelope_to_doc(&env(10, "K", 1))).await.unwrap();
        let err = coll.insert_one(envelope_to_doc(&env(10, "K2", 1))).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn drop_database_clears_all_collections() {
        let backend = MemBackend::new();
        let coll = backend.get_collection("Widget").await.unwrap();
        coll.insert_one(envelope_to_doc(&env(10, "K", 1))).await.unwrap();
        backend.drop_database().await.unwrap();
        let coll = backend.get_collection("Widget").await.unwrap();
        let found = coll
            .find(&Filter::KeyEquals("K".to_owned()), &SortSpec::default(), None)
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
