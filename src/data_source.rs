//! The facade that binds the resolver, writer, and query surface to a host
//! [`Context`], and owns every cache in the store (spec §4.7).

use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::Backend;
use crate::collection_cache::CollectionCache;
use crate::context::Context;
use crate::dataset_resolver::DataSetResolver;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::record_resolver::RecordResolver;
use crate::schema::{DataSetRecord, Key, Record};
use crate::time::{SystemClock, Tid, TidAllocator};
use crate::writer::Writer;

/// The well-known name `getCommon()` resolves in root.
pub const COMMON_DATA_SET_NAME: &str = "Common";

/// Configuration fixed at facade construction (spec §9, "global mutable
/// state... set once at facade construction and never mutated thereafter" —
/// applied here to the knobs that are genuinely static; `read_only` and the
/// global cutoff remain runtime-adjustable per spec §8's S6/S3 scenarios).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Starts the data source in read-only mode.
    pub read_only: bool,
    /// The data-source-wide cutoff, if any.
    pub global_cutoff: Option<Tid>,
    /// The backing document database's name.
    pub database_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            global_cutoff: None,
            database_name: "tempstore".to_owned(),
        }
    }
}

/// Binds the collection cache, dataset resolver, record resolver, writer,
/// and query surface to a host [`Context`]. The only public entry point
/// most callers need.
#[derive(Debug)]
pub struct DataSource<C: Context> {
    context: C,
    backend: Arc<dyn Backend>,
    collections: Arc<CollectionCache>,
    dataset_resolver: Arc<DataSetResolver>,
    record_resolver: RecordResolver,
    writer: Writer,
    allocator: Arc<TidAllocator>,
    read_only: Arc<RwLock<bool>>,
}

impl<C: Context> DataSource<C> {
    /// Builds a facade over `backend`, using the real system clock for TID
    /// minting.
    pub fn new(backend: Arc<dyn Backend>, context: C, config: StoreConfig) -> Self {
        Self::with_allocator(backend, context, config, TidAllocator::new(SystemClock))
    }

    /// Builds a facade with an explicit allocator — used by tests that need
    /// a [`crate::time::MockClock`] for deterministic TIDs.
    pub fn with_allocator(
        backend: Arc<dyn Backend>,
        context: C,
        config: StoreConfig,
        allocator: TidAllocator,
    ) -> Self {
        let collections = Arc::new(CollectionCache::new());
        let allocator = Arc::new(allocator);
        let dataset_resolver = Arc::new(DataSetResolver::new(
            Arc::clone(&backend),
            Arc::clone(&collections),
            Arc::clone(&allocator),
            config.global_cutoff,
        ));
        let record_resolver = RecordResolver::new(
            Arc::clone(&backend),
            Arc::clone(&collections),
            Arc::clone(&dataset_resolver),
        );
        let read_only = Arc::new(RwLock::new(config.read_only));
        let writer = Writer::new(
            Arc::clone(&backend),
            Arc::clone(&collections),
            Arc::clone(&dataset_resolver),
            Arc::clone(&allocator),
            Arc::clone(&read_only),
        );

        Self {
            context,
            backend,
            collections,
            dataset_resolver,
            record_resolver,
            writer,
            allocator,
            read_only,
        }
    }

    /// The host-supplied context this facade was built with.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// The dataset the host wants operations to default to, absent an
    /// explicit override.
    pub fn default_data_set(&self) -> Tid {
        self.context.default_data_set()
    }

    /// Drops every cached dataset id, parent, detail, and lookup list.
    /// Needed when a different process has written datasets this facade
    /// hasn't observed yet; a correctness no-op otherwise (spec §8).
    pub fn clear_data_set_cache(&self) {
        self.dataset_resolver.clear_cache();
    }

    /// Whether the data source as a whole currently refuses writes.
    pub fn is_read_only(&self) -> bool {
        *self.read_only.read()
    }

    /// Sets whether the data source as a whole refuses writes.
    pub fn set_read_only(&self, read_only: bool) {
        *self.read_only.write() = read_only;
    }

    /// The data-source-wide cutoff currently in effect.
    pub fn global_cutoff(&self) -> Option<Tid> {
        self.dataset_resolver.global_cutoff()
    }

    /// Sets the data-source-wide cutoff.
    pub fn set_global_cutoff(&self, cutoff: Option<Tid>) {
        self.dataset_resolver.set_global_cutoff(cutoff);
    }

    /// Resolves a dataset by name within `parent`'s lookup list.
    pub async fn get_data_set_or_null(&self, name: &str, parent: Tid) -> Result<Option<Tid>> {
        self.dataset_resolver.get_data_set_or_null(name, parent).await
    }

    /// The ordered set of datasets consulted when resolving within
    /// `data_set`.
    pub async fn get_lookup_list(&self, data_set: Tid) -> Result<Arc<Vec<Tid>>> {
        self.dataset_resolver.get_lookup_list(data_set).await
    }

    /// The well-known `"Common"` dataset in root, if one has been created.
    pub async fn get_common(&self) -> Result<Option<Tid>> {
        self.dataset_resolver
            .get_data_set_or_null(COMMON_DATA_SET_NAME, Tid::EMPTY)
            .await
    }

    /// Builds a dataset record named `name` with the given imports, saves
    /// it into `parent`, and seeds the caches `getDataSetOrNull` would
    /// otherwise have to populate lazily.
    ///
    /// Validates every import before returning: a dataset cannot import
    /// itself (spec §4.3's "the sole self-import is reported as an error"),
    /// and every import must already resolve in storage (spec §4.3: "A
    /// dataset referenced as an import but absent from storage is fatal").
    /// The new dataset's own id isn't known until after `save_one` mints
    /// it, so this check necessarily runs post-write rather than before —
    /// mirroring the general write rule that also rejects writes into a
    /// cut-off or read-only parent (spec §9, Open Question (c)).
    pub async fn create_data_set(
        &self,
        name: &str,
        imports: Vec<Tid>,
        non_temporal: bool,
        parent: Tid,
    ) -> Result<Tid> {
        let mut record = DataSetRecord::new(name)
            .with_imports(imports)
            .with_non_temporal(non_temporal);
        let id = self.writer.save_one(&mut record, parent).await?;

        for &import in &record.imports {
            if import == id {
                return Err(Error::integrity(crate::error::IntegrityViolation::SelfImport {
                    dataset: id,
                }));
            }
            self.dataset_resolver.get_lookup_list(import).await.map_err(|_| {
                Error::integrity(crate::error::IntegrityViolation::MissingImport { dataset: id, import })
            })?;
        }

        self.dataset_resolver.remember_parent(id, parent);
        self.dataset_resolver.remember_name(parent, name, id);
        self.dataset_resolver.ensure_detail_exists(id, parent).await?;
        Ok(id)
    }

    /// Saves a single record into `into`, minting a fresh TID for it.
    pub async fn save_one<R: Record>(&self, rec: &mut R, into: Tid) -> Result<Tid> {
        self.writer.save_one(rec, into).await
    }

    /// Saves many records into `into` in one backend call.
    pub async fn save_many<R: Record>(&self, recs: &mut [R], into: Tid) -> Result<Vec<Tid>> {
        self.writer.save_many(recs, into).await
    }

    /// Writes a tombstone for `key` into `into`.
    pub async fn delete<R: Record>(&self, key: &Key, into: Tid) -> Result<Tid> {
        self.writer.delete::<R>(key, into).await
    }

    /// Drops the entire backing database. Irrecoverable.
    pub async fn delete_db(&self) -> Result<()> {
        self.writer.delete_db().await
    }

    /// Loads the record stored under `id`, downcast to `R`.
    pub async fn load_by_id<R: Record>(&self, id: Tid) -> Result<Option<R>> {
        self.record_resolver.load_by_id::<R>(id).await
    }

    /// Loads the latest record visible for `key` from within `from`'s
    /// lookup list.
    pub async fn load_by_key<R: Record>(&self, key: &Key, from: Tid) -> Result<Option<R>> {
        self.record_resolver.load_by_key::<R>(key, from).await
    }

    /// Starts a composable query over `R`, bound to `from`.
    pub fn query<R: Record>(&self, from: Tid) -> Query<R> {
        Query::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.collections),
            Arc::clone(&self.dataset_resolver),
            from,
        )
    }

    /// The TID allocator backing this facade's writes, exposed for hosts
    /// that need to mint ids outside the normal save path (e.g. to
    /// pre-compute a self-import for a negative test).
    pub fn allocator(&self) -> &Arc<TidAllocator> {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mem::MemBackend;
    use crate::context::TracingContext;
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

    fn data_source() -> DataSource<TracingContext> {
        DataSource::with_allocator(
            Arc::new(MemBackend::new()),
            TracingContext::new(Tid::EMPTY),
            StoreConfig::default(),
            TidAllocator::new(MockClock::new(1_000)),
        )
    }

    // S1 — dataset import precedence.
    #[tokio::test]
    async fn dataset_import_precedence() {
        let ds = data_source();
        let common = ds.create_data_set("Common", vec![], false, Tid::EMPTY).await.unwrap();
        ds.save_one(&mut Widget { key: "K".into(), color: "base".into() }, common)
            .await
            .unwrap();

        let a = ds.create_data_set("A", vec![common], false, Tid::EMPTY).await.unwrap();
        ds.save_one(&mut Widget { key: "K".into(), color: "override".into() }, a)
            .await
            .unwrap();

        let from_a: Option<Widget> = ds.load_by_key(&Key::from_fields(["K"]), a).await.unwrap();
        assert_eq!(from_a.unwrap().color, "override");

        let from_common: Option<Widget> = ds.load_by_key(&Key::from_fields(["K"]), common).await.unwrap();
        assert_eq!(from_common.unwrap().color, "base");

        let from_root: Option<Widget> = ds.load_by_key(&Key::from_fields(["K"]), Tid::EMPTY).await.unwrap();
        assert!(from_root.is_none());
    }

    // S2 — tombstone shadowing.
    #[tokio::test]
    async fn tombstone_shadowing() {
        let ds = data_source();
        let common = ds.create_data_set("Common", vec![], false, Tid::EMPTY).await.unwrap();
        ds.save_one(&mut Widget { key: "K".into(), color: "base".into() }, common)
            .await
            .unwrap();
        let a = ds.create_data_set("A", vec![common], false, Tid::EMPTY).await.unwrap();
        ds.save_one(&mut Widget { key: "K".into(), color: "override".into() }, a)
            .await
            .unwrap();

        ds.delete::<Widget>(&Key::from_fields(["K"]), a).await.unwrap();

        let from_a: Option<Widget> = ds.load_by_key(&Key::from_fields(["K"]), a).await.unwrap();
        assert!(from_a.is_none());
        let from_common: Option<Widget> = ds.load_by_key(&Key::from_fields(["K"]), common).await.unwrap();
        assert!(from_common.is_some());
    }

    // S3 — global cutoff.
    #[tokio::test]
    async fn global_cutoff_hides_records_at_or_after_it() {
        let ds = data_source();
        let a = ds.create_data_set("A", vec![], false, Tid::EMPTY).await.unwrap();
        ds.save_one(&mut Widget { key: "K".into(), color: "old".into() }, a)
            .await
            .unwrap();
        let cutoff_marker = ds.allocator().new_id();
        let id = ds
            .save_one(&mut Widget { key: "K".into(), color: "new".into() }, a)
            .await
            .unwrap();
        assert!(id > cutoff_marker);

        ds.set_global_cutoff(Some(id));
        let by_id: Option<Widget> = ds.load_by_id(id).await.unwrap();
        assert!(by_id.is_none());

        let by_key: Option<Widget> = ds.load_by_key(&Key::from_fields(["K"]), a).await.unwrap();
        assert_eq!(by_key.unwrap().color, "old");
    }

    // S6 — read-only refuses writes.
    #[tokio::test]
    async fn read_only_data_source_refuses_writes_but_allows_reads() {
        let ds = data_source();
        let a = ds.create_data_set("A", vec![], false, Tid::EMPTY).await.unwrap();
        ds.save_one(&mut Widget { key: "K".into(), color: "x".into() }, a)
            .await
            .unwrap();

        ds.set_read_only(true);
        let err = ds
            .save_one(&mut Widget { key: "K2".into(), color: "y".into() }, a)
            .await;
        assert_matches!(err, Err(Error::ReadOnly { .. }));

        let del_err = ds.delete::<Widget>(&Key::from_fields(["K"]), a).await;
        assert_matches!(del_err, Err(Error::ReadOnly { .. }));

        let still_readable: Option<Widget> = ds.load_by_key(&Key::from_fields(["K"]), a).await.unwrap();
        assert!(still_readable.is_some());
    }

    #[tokio::test]
    async fn get_common_is_none_until_created() {
        let ds = data_source();
        assert!(ds.get_common().await.unwrap().is_none());
        let common = ds.create_data_set("Common", vec![], false, Tid::EMPTY).await.unwrap();
        assert_eq!(ds.get_common().await.unwrap(), Some(common));
    }
}
