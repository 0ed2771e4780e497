//! Dataset lookup-list expansion, cutoff propagation, and the four caches
//! that back them (spec §4.3). This is the only component that reads from
//! the dataset-detail cache; every other dataset/import lookup in the crate
//! routes through here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::{Backend, Filter, SortSpec};
use crate::backend::mongo::tid_to_bson;
use crate::collection_cache::CollectionCache;
use crate::error::{self, DataSetNotInRootSnafu, Result};
use crate::schema::{DataSetDetailRecord, DataSetRecord, Record, RecordEnvelope, RecordKind};
use crate::time::{Tid, TidAllocator};

/// Resolves dataset names to ids, expands import lookup lists, and answers
/// cutoff questions, with caches owned exclusively by this type (spec §3,
/// "Ownership").
#[derive(Debug)]
pub struct DataSetResolver {
    backend: Arc<dyn Backend>,
    collections: Arc<CollectionCache>,
    allocator: Arc<TidAllocator>,
    global_cutoff: RwLock<Option<Tid>>,

    name_to_id: RwLock<HashMap<(Tid, String), Tid>>,
    id_to_parent: RwLock<HashMap<Tid, Tid>>,
    id_to_detail: RwLock<HashMap<Tid, Option<DataSetDetailRecord>>>,
    lookup_lists: RwLock<HashMap<Tid, Arc<Vec<Tid>>>>,
}

impl DataSetResolver {
    pub fn new(
        backend: Arc<dyn Backend>,
        collections: Arc<CollectionCache>,
        allocator: Arc<TidAllocator>,
        global_cutoff: Option<Tid>,
    ) -> Self {
        Self {
            backend,
            collections,
            allocator,
            global_cutoff: RwLock::new(global_cutoff),
            name_to_id: RwLock::new(HashMap::new()),
            id_to_parent: RwLock::new(HashMap::new()),
            id_to_detail: RwLock::new(HashMap::new()),
            lookup_lists: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the data-source-wide cutoff currently in effect.
    pub fn global_cutoff(&self) -> Option<Tid> {
        *self.global_cutoff.read()
    }

    /// Sets the data-source-wide cutoff. Does not invalidate any cache: a
    /// narrower cutoff only ever hides more, and every consumer re-reads
    /// `global_cutoff()` per call rather than caching its effect.
    pub fn set_global_cutoff(&self, cutoff: Option<Tid>) {
        *self.global_cutoff.write() = cutoff;
    }

    /// Drops every cached dataset id, parent, detail, and lookup list —
    /// the only supported invalidation path (spec's `clearDataSetCache()`).
    pub fn clear_cache(&self) {
        self.name_to_id.write().clear();
        self.id_to_parent.write().clear();
        self.id_to_detail.write().clear();
        self.lookup_lists.write().clear();
    }

    /// Records that `id`'s dataset record was materialized with parent
    /// `parent`, seeding the parent cache. Called by the writer right after
    /// `createDataSet` persists a brand new dataset record, so later calls
    /// to [`Self::get_data_set_detail_or_null`] find the entry the spec
    /// requires ("callers are required to obtain a dataset via
    /// `getDataSetOrNull` first").
    pub fn remember_parent(&self, id: Tid, parent: Tid) {
        self.id_to_parent.write().insert(id, parent);
    }

    /// Seeds the name cache directly, used by `createDataSet` once it has
    /// minted and stored a new dataset so a subsequent `getDataSetOrNull`
    /// call doesn't round-trip to the backend.
    pub fn remember_name(&self, parent: Tid, name: &str, id: Tid) {
        self.name_to_id
            .write()
            .insert((parent, name.to_owned()), id);
    }

    /// Resolves a dataset named `name`, searched within `parent`'s lookup
    /// list. Materializes a dataset-detail record for it if one is not
    /// already present (spec §4.3 item 1).
    pub async fn get_data_set_or_null(&self, name: &str, parent: Tid) -> Result<Option<Tid>> {
        let cache_key = (parent, name.to_owned());
        if let Some(id) = self.name_to_id.read().get(&cache_key).copied() {
            return Ok(Some(id));
        }

        let lookup = self.get_lookup_list(parent).await?;
        let candidates = lookup.iter().map(tid_to_bson).collect();
        let cutoff = self.cutoff_for(parent).await?.map(|c| tid_to_bson(&c));
        let handle = self
            .collections
            .get_or_create::<DataSetRecord>(self.backend.as_ref())
            .await?;
        let docs = handle
            .collection
            .find(
                &Filter::KeyEqualsAndDataSetIn {
                    key: name.to_owned(),
                    data_sets: candidates,
                    cutoff,
                },
                &SortSpec::data_set_then_id_desc(),
                None,
            )
            .await?;

        let envelope = match first_non_tombstone(&docs)? {
            Some(env) => env,
            None => return Ok(None),
        };
        if !envelope.data_set.is_empty() {
            return Err(error::Error::integrity(
                DataSetNotInRootSnafu {
                    dataset: envelope.id,
                    parent: envelope.data_set,
                }
                .build(),
            ));
        }

        let id = envelope.id;
        self.name_to_id.write().insert(cache_key, id);
        self.id_to_parent.write().insert(id, parent);

        self.ensure_detail_exists(id, parent).await?;

        Ok(Some(id))
    }

    async fn load_dataset_by_id(&self, id: Tid) -> Result<(RecordEnvelope, DataSetRecord)> {
        let handle = self
            .collections
            .get_or_create::<DataSetRecord>(self.backend.as_ref())
            .await?;
        let docs = handle
            .collection
            .find(
                &Filter::IdEquals(tid_to_bson(&id)),
                &SortSpec::default(),
                Some(1),
            )
            .await?;
        let envelope = docs
            .first()
            .map(RecordEnvelope::from_document)
            .transpose()?
            .ok_or_else(|| {
                error::Error::integrity(error::IntegrityViolation::MissingImport {
                    dataset: id,
                    import: id,
                })
            })?;
        let record = match &envelope.kind {
            RecordKind::Payload { fields, .. } => DataSetRecord::from_document(fields)?,
            RecordKind::Tombstone => {
                return Err(error::Error::integrity(
                    error::IntegrityViolation::MissingImport {
                        dataset: id,
                        import: id,
                    },
                ))
            }
        };
        Ok((envelope, record))
    }

    /// Materializes a default dataset-detail record for `data_set` (stored
    /// in `parent`) unless one already exists. Exposed so `createDataSet`
    /// can seed the same invariant `getDataSetOrNull` maintains for
    /// datasets discovered by name.
    pub async fn ensure_detail_exists(&self, data_set: Tid, parent: Tid) -> Result<()> {
        if self.get_data_set_detail_or_null(data_set).await?.is_some() {
            return Ok(());
        }

        let detail_id = self.allocator.new_id();
        let detail = DataSetDetailRecord::new(data_set);
        let envelope = RecordEnvelope {
            id: detail_id,
            key: detail.key(),
            data_set: parent,
            kind: RecordKind::Payload {
                root_name: DataSetDetailRecord::ROOT_NAME.to_owned(),
                fields: detail.to_document(),
            },
        };
        let handle = self
            .collections
            .get_or_create::<DataSetDetailRecord>(self.backend.as_ref())
            .await?;
        match handle.collection.insert_one(envelope.to_document()).await {
            Ok(()) => {}
            Err(err) if err.is_duplicate_key() => {
                debug!(?data_set, "lost the race to auto-create dataset-detail; treating as success");
            }
            Err(err) => return Err(err),
        }
        self.id_to_detail.write().insert(data_set, Some(detail));
        Ok(())
    }

    /// Returns `dataSet`'s detail record, or `None` if it has none (always
    /// `None` for the root dataset). Caches the absence too.
    pub async fn get_data_set_detail_or_null(
        &self,
        data_set: Tid,
    ) -> Result<Option<DataSetDetailRecord>> {
        if data_set.is_empty() {
            return Ok(None);
        }
        if let Some(cached) = self.id_to_detail.read().get(&data_set).cloned() {
            return Ok(cached);
        }

        let parent = self.id_to_parent.read().get(&data_set).copied().ok_or_else(|| {
            error::Error::BadInput {
                message: format!(
                    "dataset {data_set:?} must be resolved via get_data_set_or_null before its detail is requested"
                ),
            }
        })?;

        let handle = self
            .collections
            .get_or_create::<DataSetDetailRecord>(self.backend.as_ref())
            .await?;
        let docs = handle
            .collection
            .find(
                &Filter::KeyEqualsAndDataSetIn {
                    key: data_set.to_string(),
                    data_sets: vec![tid_to_bson(&parent)],
                    cutoff: None,
                },
                &SortSpec::data_set_then_id_desc(),
                None,
            )
            .await?;
        let detail = match first_non_tombstone(&docs)? {
            Some(envelope) => match envelope.kind {
                RecordKind::Payload { fields, .. } => Some(DataSetDetailRecord::from_document(&fields)?),
                RecordKind::Tombstone => None,
            },
            None => None,
        };
        self.id_to_detail.write().insert(data_set, detail.clone());
        Ok(detail)
    }

    /// The effective cutoff for `dataSet`: the minimum of the data-source
    /// wide cutoff and the dataset's own detail cutoff.
    pub async fn cutoff_for(&self, data_set: Tid) -> Result<Option<Tid>> {
        let detail_cutoff = self
            .get_data_set_detail_or_null(data_set)
            .await?
            .and_then(|d| d.cutoff_time);
        Ok(Tid::min_tid(self.global_cutoff(), detail_cutoff))
    }

    /// The cutoff `dataSet` imposes specifically on records reached through
    /// its imports; no data-source-wide counterpart.
    pub async fn imports_cutoff_for(&self, data_set: Tid) -> Result<Option<Tid>> {
        Ok(self
            .get_data_set_detail_or_null(data_set)
            .await?
            .and_then(|d| d.imports_cutoff_time))
    }

    /// Whether `dataSet` (or the data source as a whole — checked by the
    /// caller) currently refuses writes.
    pub async fn is_read_only(&self, data_set: Tid) -> Result<bool> {
        Ok(self
            .get_data_set_detail_or_null(data_set)
            .await?
            .map(|d| d.is_read_only())
            .unwrap_or(false))
    }

    /// The ordered set of dataset TIDs to consult when resolving within
    /// `data_set` — most specific first, root last (spec §4.3 item 2).
    pub async fn get_lookup_list(&self, data_set: Tid) -> Result<Arc<Vec<Tid>>> {
        if data_set.is_empty() {
            return Ok(Arc::new(vec![Tid::EMPTY]));
        }
        if let Some(cached) = self.lookup_lists.read().get(&data_set).cloned() {
            return Ok(cached);
        }

        let mut visited = HashSet::new();
        let mut ordered = Vec::new();
        self.expand_lookup_list(data_set, None, &mut visited, &mut ordered)
            .await?;
        if !ordered.contains(&Tid::EMPTY) {
            ordered.push(Tid::EMPTY);
        }

        let ordered = Arc::new(ordered);
        self.lookup_lists
            .write()
            .insert(data_set, Arc::clone(&ordered));
        Ok(ordered)
    }

    /// DFS with a visited set (spec §9, "cyclic dataset graphs"). `importer`
    /// is the dataset whose `importsCutoffTime` gates this node — `None` at
    /// the root of the expansion, since a dataset always includes itself
    /// regardless of any cutoff (spec §8 invariant: `D ∈ getLookupList(D)`).
    fn expand_lookup_list<'a>(
        &'a self,
        current: Tid,
        importer: Option<Tid>,
        visited: &'a mut HashSet<Tid>,
        ordered: &'a mut Vec<Tid>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if visited.contains(&current) {
                return Ok(());
            }

            if let Some(importer) = importer {
                if let Some(cutoff) = self.imports_cutoff_for(importer).await? {
                    if current >= cutoff {
                        debug!(?current, ?importer, "import pruned by importsCutoffTime");
                        return Ok(());
                    }
                }
            }

            visited.insert(current);
            ordered.push(current);

            let (envelope, record) = self.load_dataset_by_id(current).await?;
            if !envelope.data_set.is_empty() {
                return Err(error::Error::integrity(
                    DataSetNotInRootSnafu {
                        dataset: current,
                        parent: envelope.data_set,
                    }
                    .build(),
                ));
            }
            self.id_to_parent.write().insert(current, envelope.data_set);

            for import in &record.imports {
                if *import == current {
                    return Err(error::Error::integrity(error::IntegrityViolation::SelfImport {
                        dataset: current,
                    }));
                }
                self.expand_lookup_list(*import, Some(current), visited, ordered)
                    .await?;
            }
            Ok(())
        })
    }
}

fn first_non_tombstone(docs: &[bson::Document]) -> Result<Option<RecordEnvelope>> {
    for doc in docs {
        let envelope = RecordEnvelope::from_document(doc)?;
        if !envelope.is_tombstone() {
            return Ok(Some(envelope));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mem::MemBackend;
    use crate::time::{MockClock, TidAllocator};

    fn resolver() -> DataSetResolver {
        DataSetResolver::new(
            Arc::new(MemBackend::new()),
            Arc::new(CollectionCache::new()),
            Arc::new(TidAllocator::new(MockClock::new(1_000))),
            None,
        )
    }

    #[tokio::test]
    async fn root_lookup_list_is_just_empty() {
        let resolver = resolver();
        let list = resolver.get_lookup_list(Tid::EMPTY).await.unwrap();
        assert_eq!(list.as_ref(), &vec![Tid::EMPTY]);
    }

    #[tokio::test]
    async fn missing_dataset_by_name_returns_none() {
        let resolver = resolver();
        let found = resolver.get_data_set_or_null("NoSuchDataset", Tid::EMPTY).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn cutoff_for_root_is_absent_without_global_cutoff() {
        let resolver = resolver();
        assert_eq!(resolver.cutoff_for(Tid::EMPTY).await.unwrap(), None);
    }
}
