//! TID minting, insertion, and tombstone writes (spec §4.5).

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::{Backend, Collection};
use crate::collection_cache::CollectionCache;
use crate::dataset_resolver::DataSetResolver;
use crate::error::{Error, IdNotAfterDataSetSnafu, Result};
use crate::schema::{Key, Record, RecordEnvelope, RecordKind};
use crate::time::{Tid, TidAllocator};

/// Mints TIDs and appends records, enforcing the read-only/cutoff rejection
/// rules every write path shares.
#[derive(Debug)]
pub struct Writer {
    backend: Arc<dyn Backend>,
    collections: Arc<CollectionCache>,
    dataset_resolver: Arc<DataSetResolver>,
    allocator: Arc<TidAllocator>,
    read_only: Arc<RwLock<bool>>,
}

impl Writer {
    pub fn new(
        backend: Arc<dyn Backend>,
        collections: Arc<CollectionCache>,
        dataset_resolver: Arc<DataSetResolver>,
        allocator: Arc<TidAllocator>,
        read_only: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            backend,
            collections,
            dataset_resolver,
            allocator,
            read_only,
        }
    }

    /// Saves a single record into `into`, minting a fresh TID for it.
    /// Returns the minted id.
    pub async fn save_one<R: Record>(&self, rec: &mut R, into: Tid) -> Result<Tid> {
        self.check_writable(into).await?;

        let id = self.allocator.new_id();
        if id <= into {
            return Err(Error::integrity(
                IdNotAfterDataSetSnafu { id, dataset: into }.build(),
            ));
        }

        rec.init();
        let envelope = RecordEnvelope {
            id,
            key: rec.key(),
            data_set: into,
            kind: RecordKind::Payload {
                root_name: R::ROOT_NAME.to_owned(),
                fields: rec.to_document(),
            },
        };
        let handle = self.collections.get_or_create::<R>(self.backend.as_ref()).await?;
        handle.collection.insert_one(envelope.to_document()).await?;
        debug!(?id, ?into, root = R::ROOT_NAME, "saved record");
        Ok(id)
    }

    /// Saves many records into `into` in a single backend call. Every mint
    /// calls the allocator in sequence, so ordering across the batch
    /// follows allocator order.
    pub async fn save_many<R: Record>(&self, recs: &mut [R], into: Tid) -> Result<Vec<Tid>> {
        self.check_writable(into).await?;

        let mut ids = Vec::with_capacity(recs.len());
        let mut docs = Vec::with_capacity(recs.len());
        for rec in recs.iter_mut() {
            let id = self.allocator.new_id();
            if id <= into {
                return Err(Error::integrity(
                    IdNotAfterDataSetSnafu { id, dataset: into }.build(),
                ));
            }
            rec.init();
            let envelope = RecordEnvelope {
                id,
                key: rec.key(),
                data_set: into,
                kind: RecordKind::Payload {
                    root_name: R::ROOT_NAME.to_owned(),
                    fields: rec.to_document(),
                },
            };
            docs.push(envelope.to_document());
            ids.push(id);
        }

        if docs.is_empty() {
            return Ok(ids);
        }

        let handle = self.collections.get_or_create::<R>(self.backend.as_ref()).await?;
        handle.collection.insert_many(docs).await?;
        debug!(count = ids.len(), ?into, root = R::ROOT_NAME, "saved records");
        Ok(ids)
    }

    /// Writes a tombstone for `key` into `into`. No read is performed.
    pub async fn delete<R: Record>(&self, key: &Key, into: Tid) -> Result<Tid> {
        self.check_writable(into).await?;

        let id = self.allocator.new_id();
        if id <= into {
            return Err(Error::integrity(
                IdNotAfterDataSetSnafu { id, dataset: into }.build(),
            ));
        }

        let envelope = RecordEnvelope {
            id,
            key: key.clone(),
            data_set: into,
            kind: RecordKind::Tombstone,
        };
        let handle = self.collections.get_or_create::<R>(self.backend.as_ref()).await?;
        handle.collection.insert_one(envelope.to_document()).await?;
        debug!(?id, ?into, root = R::ROOT_NAME, "deleted record");
        Ok(id)
    }

    /// Drops the entire backing database. Irrecoverable; refuses when
    /// read-only.
    pub async fn delete_db(&self) -> Result<()> {
        if *self.read_only.read() {
            return Err(Error::ReadOnly { dataset: Tid::EMPTY });
        }
        self.backend.drop_database().await
    }

    /// Rejects the write if the data source as a whole is read-only, if
    /// `into` has a cutoff in effect (its historical view is immutable), or
    /// if `into`'s own detail record marks it read-only (spec §4.5). The two
    /// read-only reasons surface as `ReadOnly`; a cutoff in effect surfaces
    /// as `IntegrityViolation::CutoffActive`, matching spec §7's error
    /// taxonomy, which lists "cutoff set but write attempted" under
    /// `IntegrityViolation` rather than `ReadOnly`.
    async fn check_writable(&self, into: Tid) -> Result<()> {
        if *self.read_only.read() {
            return Err(Error::ReadOnly { dataset: into });
        }
        if self.dataset_resolver.cutoff_for(into).await?.is_some() {
            return Err(Error::integrity(crate::error::IntegrityViolation::CutoffActive {
                dataset: into,
            }));
        }
        if self.dataset_resolver.is_read_only(into).await? {
            return Err(Error::ReadOnly { dataset: into });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mem::MemBackend;
    use crate::time::MockClock;
    use assert_matches::assert_matches;
    use bson::doc;

    #[derive(Debug, Clone, PartialEq)]
    struct Widget {
        key: String,
        color: String,
    }

    impl Record for Widget {
        const ROOT_NAME: &'static str = "Widget";

        fn key(&self) -> Key {
            Key::from_fields([self.key.as_str()])
        }

        fn to_document(&self) -> bson::Document {
            doc! { "color": &self.color }
        }

        fn from_document(doc: &bson::Document) -> Result<Self> {
            Ok(Self {
                key: String::new(),
                color: doc.get_str("color").unwrap_or_default().to_owned(),
            })
        }
    }

    fn harness() -> (Writer, Arc<DataSetResolver>) {
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::new());
        let collections = Arc::new(CollectionCache::new());
        let allocator = Arc::new(TidAllocator::new(MockClock::new(1_000)));
        let dataset_resolver = Arc::new(DataSetResolver::new(
            Arc::clone(&backend),
            Arc::clone(&collections),
            Arc::clone(&allocator),
            None,
        ));
        let writer = Writer::new(
            backend,
            collections,
            Arc::clone(&dataset_resolver),
            allocator,
            Arc::new(RwLock::new(false)),
        );
        (writer, dataset_resolver)
    }

    #[tokio::test]
    async fn save_one_mints_an_id_after_the_dataset() {
        let (writer, _ds) = harness();
        let mut rec = Widget { key: "K".into(), color: "red".into() };
        let id = writer.save_one(&mut rec, Tid::EMPTY).await.unwrap();
        assert!(id > Tid::EMPTY);
    }

    #[tokio::test]
    async fn read_only_flag_rejects_writes() {
        let (writer, _ds) = harness();
        *writer.read_only.write() = true;
        let mut rec = Widget { key: "K".into(), color: "red".into() };
        let err = writer.save_one(&mut rec, Tid::EMPTY).await;
        assert_matches!(err, Err(Error::ReadOnly { .. }));
    }

    #[tokio::test]
    async fn cutoff_on_dataset_rejects_writes() {
        let (writer, ds) = harness();
        ds.set_global_cutoff(Some(Tid::new(1, [0; 8])));
        let mut rec = Widget { key: "K".into(), color: "red".into() };
        let err = writer.save_one(&mut rec, Tid::EMPTY).await;
        assert_matches!(err, Err(Error::Integrity { .. }));
    }

    #[tokio::test]
    async fn save_many_mints_strictly_increasing_ids() {
        let (writer, _ds) = harness();
        let mut recs = vec![
            Widget { key: "A".into(), color: "red".into() },
            Widget { key: "B".into(), color: "blue".into() },
        ];
        let ids = writer.save_many(&mut recs, Tid::EMPTY).await.unwrap();
        assert!(ids[0] < ids[1]);
    }
}
