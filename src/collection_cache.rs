//! Per-record-root lazy collection handles (spec §4.2).
//!
//! On first access for a given `R: Record`, the cache asks the backend for
//! the collection named `R::ROOT_NAME`, creates the mandatory
//! `Key-DataSet-Id` index plus any indexes `R` declares, and remembers the
//! handle. Subsequent accesses are a read-lock hash lookup — the same
//! read-mostly, get-or-compute shape the teacher corpus uses for its
//! namespace/schema caches (`router::namespace_cache::memory`).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::{Backend, Collection, IndexSpec};
use crate::error::Result;
use crate::schema::Record;

/// A collection handle bundling the base-typed collection (for iteration
/// and tombstone insertion) with its root name, for a specific `R`.
///
/// The spec describes this as bundling "the base record envelope" and "`R`"
/// typed collections; since this store represents every stored shape as a
/// `bson::Document` envelope (see [`crate::schema::RecordEnvelope`]), both
/// views are realized by the same untyped collection handle — the typed
/// view is recovered by the resolver via `Record::from_document` at the
/// edge, not by a second backend-level handle.
pub struct CollectionHandle {
    pub root_name: &'static str,
    pub collection: Box<dyn Collection>,
}

impl std::fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("root_name", &self.root_name)
            .finish()
    }
}

/// Lazily materializes and caches one [`CollectionHandle`] per record root
/// name.
#[derive(Debug, Default)]
pub struct CollectionCache {
    handles: RwLock<HashMap<&'static str, Arc<CollectionHandle>>>,
}

impl CollectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached handle for `R`, creating and indexing its
    /// collection on first access.
    pub async fn get_or_create<R: Record>(
        &self,
        backend: &dyn Backend,
    ) -> Result<Arc<CollectionHandle>> {
        if let Some(handle) = self.handles.read().get(R::ROOT_NAME) {
            return Ok(Arc::clone(handle));
        }

        debug!(root = R::ROOT_NAME, "materializing collection handle");
        let collection = backend.get_collection(R::ROOT_NAME).await?;
        collection.create_index(&IndexSpec::key_data_set_id()).await?;
        for (name, fields) in R::declared_indexes() {
            collection
                .create_index(&IndexSpec { name, fields })
                .await?;
        }

        let handle = Arc::new(CollectionHandle {
            root_name: R::ROOT_NAME,
            collection,
        });
        // Tolerates duplicate computation on a concurrent miss (spec §5):
        // whichever insert wins, both callers hold an equivalent handle.
        self.handles.write().insert(R::ROOT_NAME, Arc::clone(&handle));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mem::MemBackend;
    use crate::schema::{DataSetRecord, Record};

    #[tokio::test]
    async fn caches_the_same_handle_across_calls() {
        let backend = MemBackend::new();
        let cache = CollectionCache::new();
        let first = cache.get_or_create::<DataSetRecord>(&backend).await.unwrap();
        let second = cache.get_or_create::<DataSetRecord>(&backend).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn collection_name_matches_root_name() {
        let backend = MemBackend::new();
        let cache = CollectionCache::new();
        let handle = cache.get_or_create::<DataSetRecord>(&backend).await.unwrap();
        assert_eq!(handle.root_name, DataSetRecord::ROOT_NAME);
    }
}
