//! The narrow port this store consumes from a document database.
//!
//! Concretizes spec's "Backend port (consumed)" interface: `getCollection`,
//! `insertOne`/`insertMany`, `find(filter).sort(spec).limit(n)`,
//! `createIndex`, `dropDatabase`. Two implementations ship: [`mongo`] over a
//! live `mongodb` driver, and [`mem`] for tests (mirrors the teacher
//! corpus's `router::namespace_cache::memory` / `iox_tests` pattern of an
//! in-memory stand-in so unit tests don't need a live backend).

pub mod mem;
pub mod mongo;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::error::Result;

/// A filter restricted to the shapes the core ever issues (spec §6):
/// equality on `id`, equality on `key`, membership on `dataSet`, and a
/// strict `<` bound on `id`. Kept as an explicit enum rather than a raw
/// `Document` so every backend implementation handles exactly the same,
/// closed set of query shapes.
#[derive(Debug, Clone)]
pub enum Filter {
    /// `id == value`.
    IdEquals(Bson),
    /// `key == value`.
    KeyEquals(String),
    /// `key == value AND dataSet IN values`, with an optional strict upper
    /// bound on `id` — the load-by-key path's "final constraints" step
    /// (spec §4.4, §4.6), reused by dataset-name resolution.
    KeyEqualsAndDataSetIn {
        key: String,
        data_sets: Vec<Bson>,
        cutoff: Option<Bson>,
    },
    /// `id < value` (used by the global-cutoff short circuit and queries).
    IdLessThan(Bson),
    /// The conjunction of a dataset-membership filter with an optional
    /// strict upper bound on `id` — the query surface's "final constraints"
    /// step (spec §4.6).
    DataSetInWithOptionalCutoff {
        data_sets: Vec<Bson>,
        cutoff: Option<Bson>,
    },
}

/// One field of a sort specification, ascending or descending.
#[derive(Debug, Clone, Copy)]
pub struct SortField {
    pub field: &'static str,
    pub ascending: bool,
}

/// An ordered sort specification, applied to a `find` in order.
#[derive(Debug, Clone, Default)]
pub struct SortSpec(pub Vec<SortField>);

impl SortSpec {
    pub fn new(fields: impl IntoIterator<Item = (&'static str, bool)>) -> Self {
        Self(
            fields
                .into_iter()
                .map(|(field, ascending)| SortField { field, ascending })
                .collect(),
        )
    }

    /// The resolver's canonical ordering: `(dataSet DESC, id DESC)`.
    pub fn data_set_then_id_desc() -> Self {
        Self::new([("dataSet", false), ("id", false)])
    }
}

/// An index declaration: an ordered list of `(field, ascending)` pairs plus
/// a name. `createIndex` is idempotent — calling it twice with the same
/// shape is a no-op.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: &'static str,
    pub fields: Vec<(&'static str, bool)>,
}

impl IndexSpec {
    /// The one index every record collection must carry (spec §4.2, §6).
    pub fn key_data_set_id() -> Self {
        Self {
            name: "Key-DataSet-Id",
            fields: vec![("key", true), ("dataSet", false), ("id", false)],
        }
    }
}

/// A handle to a single backend collection, typed loosely over `Document` —
/// the resolver and writer apply their own serialization at the edge.
///
/// This is the async port consumed by the rest of the core; `mongo::Collection`
/// and `mem::Collection` are its two concrete shapes.
#[async_trait]
pub trait Collection: Send + Sync + std::fmt::Debug {
    /// Inserts a single document; fails if its `id` collides with an
    /// existing document in the collection.
    async fn insert_one(&self, doc: Document) -> Result<()>;

    /// Inserts many documents in one backend call; fails (entirely) if any
    /// `id` collides.
    async fn insert_many(&self, docs: Vec<Document>) -> Result<()>;

    /// Runs a filtered, sorted, limited find. `limit = None` means
    /// unbounded.
    async fn find(
        &self,
        filter: &Filter,
        sort: &SortSpec,
        limit: Option<i64>,
    ) -> Result<Vec<Document>>;

    /// Idempotently ensures an index with this shape exists.
    async fn create_index(&self, spec: &IndexSpec) -> Result<()>;
}

/// The database-level port: obtaining named collections and dropping the
/// whole database (spec's "dropDatabase").
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Returns a handle to the named collection, creating it on first use
    /// if the backend requires that.
    async fn get_collection(&self, name: &str) -> Result<Box<dyn Collection>>;

    /// Drops the backing database. Irrecoverable.
    async fn drop_database(&self) -> Result<()>;
}
