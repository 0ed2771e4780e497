//! The lazy, composable query surface over a record root, reusing the
//! resolver's "final constraints" step (spec §4.6).

use std::marker::PhantomData;
use std::sync::Arc;

use crate::backend::mongo::tid_to_bson;
use crate::backend::{Backend, Filter, SortSpec};
use crate::collection_cache::CollectionCache;
use crate::dataset_resolver::DataSetResolver;
use crate::error::{Result, TypeMismatchSnafu};
use crate::schema::{Record, RecordEnvelope, RecordKind};
use crate::time::Tid;
use snafu::ensure;

/// A predicate applied in memory after the backend round-trip, since the
/// backend port exposes no general-purpose expression filter (spec's
/// "query planner beyond index-hint-level ordering" Non-goal).
type Predicate<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// A query over record root `R`, bound to an initial dataset `from`.
///
/// No backend call happens until a terminal operation (`to_sequence`,
/// `first_or_none`, `count`) runs.
pub struct Query<R: Record> {
    backend: Arc<dyn Backend>,
    collections: Arc<CollectionCache>,
    dataset_resolver: Arc<DataSetResolver>,
    from: Tid,
    order: Option<SortSpec>,
    skip: usize,
    take: Option<usize>,
    predicate: Option<Predicate<R>>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Record> Query<R> {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        collections: Arc<CollectionCache>,
        dataset_resolver: Arc<DataSetResolver>,
        from: Tid,
    ) -> Self {
        Self {
            backend,
            collections,
            dataset_resolver,
            from,
            order: None,
            skip: 0,
            take: None,
            predicate: None,
            _marker: PhantomData,
        }
    }

    /// Adds an in-memory predicate; multiple calls conjoin.
    #[must_use]
    pub fn where_(mut self, predicate: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = match self.predicate.take() {
            Some(existing) => Some(Arc::new(move |r: &R| existing(r) && predicate(r))),
            None => Some(Arc::new(predicate)),
        };
        self
    }

    /// Requests ordering by `field`, overriding the default
    /// `(dataSet DESC, id DESC)`.
    #[must_use]
    pub fn order_by(mut self, field: &'static str, ascending: bool) -> Self {
        let spec = self.order.get_or_insert_with(|| SortSpec(Vec::new()));
        spec.0.push(crate::backend::SortField { field, ascending });
        self
    }

    #[must_use]
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    #[must_use]
    pub fn take(mut self, n: usize) -> Self {
        self.take = Some(n);
        self
    }

    async fn resolve(&self) -> Result<Vec<R>> {
        let lookup_list = self.dataset_resolver.get_lookup_list(self.from).await?;
        let cutoff = self.dataset_resolver.cutoff_for(self.from).await?;
        let data_sets = lookup_list.iter().map(tid_to_bson).collect();
        let sort = self
            .order
            .clone()
            .unwrap_or_else(SortSpec::data_set_then_id_desc);

        let handle = self
            .collections
            .get_or_create::<R>(self.backend.as_ref())
            .await?;
        let docs = handle
            .collection
            .find(
                &Filter::DataSetInWithOptionalCutoff {
                    data_sets,
                    cutoff: cutoff.map(|c| tid_to_bson(&c)),
                },
                &sort,
                None,
            )
            .await?;

        let mut out = Vec::new();
        for doc in &docs {
            let envelope = RecordEnvelope::from_document(doc)?;
            if envelope.is_tombstone() {
                continue;
            }
            let rec = match envelope.kind {
                RecordKind::Payload { root_name, fields } => {
                    ensure!(
                        root_name == R::ROOT_NAME,
                        TypeMismatchSnafu {
                            id: envelope.id,
                            expected: R::ROOT_NAME,
                        }
                    );
                    R::from_document(&fields)?
                }
                RecordKind::Tombstone => unreachable!("tombstones are skipped above"),
            };
            if let Some(predicate) = &self.predicate {
                if !predicate(&rec) {
                    continue;
                }
            }
            out.push(rec);
        }

        let skipped = out.into_iter().skip(self.skip);
        Ok(match self.take {
            Some(n) => skipped.take(n).collect(),
            None => skipped.collect(),
        })
    }

    /// Runs the query and returns every matching record.
    pub async fn to_sequence(self) -> Result<Vec<R>> {
        self.resolve().await
    }

    /// Runs the query and returns the first matching record, if any.
    pub async fn first_or_none(self) -> Result<Option<R>> {
        Ok(self.resolve().await?.into_iter().next())
    }

    /// Runs the query and returns how many records matched.
    pub async fn count(self) -> Result<usize> {
        Ok(self.resolve().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mem::MemBackend;
    use crate::schema::Key;
    use crate::time::{MockClock, TidAllocator};
    use crate::writer::Writer;
    use bson::doc;
    use parking_lot::RwLock;

    #[derive(Debug, Clone, PartialEq)]
    struct Widget {
        key: String,
        price: i64,
    }

    impl Record for Widget {
        const ROOT_NAME: &'static str = "Widget";

        fn key(&self) -> Key {
            Key::from_fields([self.key.as_str()])
        }

        fn to_document(&self) -> bson::Document {
            doc! { "price": self.price }
        }

        fn from_document(doc: &bson::Document) -> Result<Self> {
            Ok(Self {
                key: String::new(),
                price: doc.get_i64("price").unwrap_or_default(),
            })
        }
    }

    async fn harness() -> (
        Query<Widget>,
        Writer,
    ) {
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
            Arc::clone(&backend),
            Arc::clone(&collections),
            Arc::clone(&dataset_resolver),
            allocator,
            Arc::new(RwLock::new(false)),
        );
        let query = Query::new(backend, collections, dataset_resolver, Tid::EMPTY);
        (query, writer)
    }

    #[tokio::test]
    async fn empty_collection_yields_no_results() {
        let (query, _writer) = harness().await;
        let results = query.to_sequence().await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn where_predicate_filters_results() {
        let (query, writer) = harness().await;
        writer
            .save_one(&mut Widget { key: "a".into(), price: 5 }, Tid::EMPTY)
            .await
            .unwrap();
        writer
            .save_one(&mut Widget { key: "b".into(), price: 50 }, Tid::EMPTY)
            .await
            .unwrap();

        let expensive = query.where_(|w: &Widget| w.price > 10).to_sequence().await.unwrap();
        assert_eq!(expensive.len(), 1);
        assert_eq!(expensive[0].price, 50);
    }

    #[tokio::test]
    async fn count_reflects_number_of_saved_records() {
        let (query, writer) = harness().await;
        writer
            .save_one(&mut Widget { key: "a".into(), price: 1 }, Tid::EMPTY)
            .await
            .unwrap();
        writer
            .save_one(&mut Widget { key: "b".into(), price: 2 }, Tid::EMPTY)
            .await
            .unwrap();

        assert_eq!(query.count().await.unwrap(), 2);
    }
}
