//! Load-by-id and load-by-key across a dataset's lookup list, with tombstone
//! handling and the type-tag downcast at the store's edge (spec §4.4).

use std::sync::Arc;

use tracing::debug;

use crate::backend::mongo::tid_to_bson;
use crate::backend::{Backend, Filter, SortSpec};
use crate::collection_cache::CollectionCache;
use crate::dataset_resolver::DataSetResolver;
use crate::error::{Result, TypeMismatchSnafu};
use crate::schema::{Key, Record, RecordEnvelope, RecordKind};
use crate::time::Tid;
use snafu::ensure;

/// Resolves records by id or by key, applying temporal and dataset-import
/// rules via a shared [`DataSetResolver`].
#[derive(Debug)]
pub struct RecordResolver {
    backend: Arc<dyn Backend>,
    collections: Arc<CollectionCache>,
    dataset_resolver: Arc<DataSetResolver>,
}

impl RecordResolver {
    pub fn new(
        backend: Arc<dyn Backend>,
        collections: Arc<CollectionCache>,
        dataset_resolver: Arc<DataSetResolver>,
    ) -> Self {
        Self {
            backend,
            collections,
            dataset_resolver,
        }
    }

    /// Loads the record stored under `id`, downcast to `R`.
    ///
    /// Returns `Ok(None)` if absent, a tombstone, or hidden by a cutoff.
    /// A stored record whose discriminator doesn't match `R` is a fatal
    /// `TypeMismatch` — the caller asked for a specific type and something
    /// else lives under that identity.
    pub async fn load_by_id<R: Record>(&self, id: Tid) -> Result<Option<R>> {
        if let Some(global_cutoff) = self.dataset_resolver.global_cutoff() {
            if id >= global_cutoff {
                debug!(?id, "short-circuited by global cutoff before backend round-trip");
                return Ok(None);
            }
        }

        let handle = self.collections.get_or_create::<R>(self.backend.as_ref()).await?;
        let docs = handle
            .collection
            .find(&Filter::IdEquals(tid_to_bson(&id)), &SortSpec::default(), Some(1))
            .await?;
        let envelope = match docs.first() {
            Some(doc) => RecordEnvelope::from_document(doc)?,
            None => return Ok(None),
        };
        if envelope.is_tombstone() {
            return Ok(None);
        }

        let cutoff = self.dataset_resolver.cutoff_for(envelope.data_set).await?;
        if let Some(cutoff) = cutoff {
            if envelope.id >= cutoff {
                return Ok(None);
            }
        }

        self.downcast::<R>(envelope)
    }

    /// Loads the latest record visible for `key` from within `from`'s
    /// lookup list, downcast to `R`.
    pub async fn load_by_key<R: Record>(&self, key: &Key, from: Tid) -> Result<Option<R>> {
        let lookup_list = self.dataset_resolver.get_lookup_list(from).await?;
        let cutoff = self.dataset_resolver.cutoff_for(from).await?;
        let data_sets = lookup_list.iter().map(tid_to_bson).collect();

        let handle = self.collections.get_or_create::<R>(self.backend.as_ref()).await?;
        let docs = handle
            .collection
            .find(
                &Filter::KeyEqualsAndDataSetIn {
                    key: key.as_str().to_owned(),
                    data_sets,
                    cutoff: cutoff.map(|c| tid_to_bson(&c)),
                },
                &SortSpec::data_set_then_id_desc(),
                Some(1),
            )
            .await?;

        let envelope = match docs.first() {
            Some(doc) => RecordEnvelope::from_document(doc)?,
            None => return Ok(None),
        };
        if envelope.is_tombstone() {
            return Ok(None);
        }
        self.downcast::<R>(envelope)
    }

    fn downcast<R: Record>(&self, envelope: RecordEnvelope) -> Result<Option<R>> {
        match envelope.kind {
            RecordKind::Tombstone => Ok(None),
            RecordKind::Payload { root_name, fields } => {
                ensure!(
                    root_name == R::ROOT_NAME,
                    TypeMismatchSnafu {
                        id: envelope.id,
                        expected: R::ROOT_NAME,
                    }
                );
                Ok(Some(R::from_document(&fields)?))
            }
        }
    }
}
