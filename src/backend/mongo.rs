//! A thin [`Backend`] adapter over the `mongodb`/`bson` crates — the natural
//! concretization of "document database" in this store's vocabulary.
//! `getCollection`, `insertOne`, `find().sort().limit()` map directly onto
//! the `mongodb` crate's own collection API, so this module is mostly glue.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::stream::TryStreamExt;
use mongodb::options::{CreateIndexOptions, FindOptions, IndexOptions};
use mongodb::{Client, Database, IndexModel};
use tracing::debug;

use crate::backend::{Backend, Collection, Filter, IndexSpec, SortSpec};
use crate::error::{Error, Result};

/// Owns a `mongodb::Database` handle; `getCollection` on this type is what
/// the rest of the store calls the "backend port".
#[derive(Debug, Clone)]
pub struct MongoBackend {
    database: Database,
}

impl MongoBackend {
    /// Wraps an already-connected client, scoped to `database_name`.
    ///
    /// Connection management itself — URI parsing, TLS, pooling — is out of
    /// scope for this store; the host application owns the `Client`.
    pub fn new(client: &Client, database_name: &str) -> Self {
        Self {
            database: client.database(database_name),
        }
    }

    /// Wraps an already-obtained database handle directly.
    pub fn from_database(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl Backend for MongoBackend {
    async fn get_collection(&self, name: &str) -> Result<Box<dyn Collection>> {
        debug!(collection = name, "resolving mongo collection handle");
        Ok(Box::new(MongoCollection {
            inner: self.database.collection::<Document>(name),
        }))
    }

    async fn drop_database(&self) -> Result<()> {
        debug!(database = self.database.name(), "dropping database");
        self.database.drop(None).await.map_err(Error::backend)
    }
}

/// A single mongo collection, typed loosely over `bson::Document`.
#[derive(Debug)]
pub struct MongoCollection {
    inner: mongodb::Collection<Document>,
}

fn filter_to_document(filter: &Filter) -> Document {
    match filter {
        Filter::IdEquals(id) => doc! { "id": id.clone() },
        Filter::KeyEquals(key) => doc! { "key": key },
        Filter::KeyEqualsAndDataSetIn {
            key,
            data_sets,
            cutoff,
        } => {
            let mut d = doc! { "key": key, "dataSet": { "$in": data_sets.clone() } };
            if let Some(bound) = cutoff {
                d.insert("id", doc! { "$lt": bound.clone() });
            }
            d
        }
        Filter::IdLessThan(bound) => doc! { "id": { "$lt": bound.clone() } },
        Filter::DataSetInWithOptionalCutoff { data_sets, cutoff } => {
            let mut d = doc! { "dataSet": { "$in": data_sets.clone() } };
            if let Some(bound) = cutoff {
                d.insert("id", doc! { "$lt": bound.clone() });
            }
            d
        }
    }
}

fn sort_to_document(sort: &SortSpec) -> Document {
    let mut d = Document::new();
    for field in &sort.0 {
        d.insert(field.field, if field.ascending { 1 } else { -1 });
    }
    d
}

fn index_to_document(spec: &IndexSpec) -> Document {
    let mut d = Document::new();
    for (field, ascending) in &spec.fields {
        d.insert(*field, if *ascending { 1 } else { -1 });
    }
    d
}

/// Narrows a `mongodb::error::Error` to whether it reflects a duplicate-key
/// write — the one backend error the writer is allowed to swallow (spec
/// §7's dataset-detail auto-creation race).
pub fn is_duplicate_key_error(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    match err.kind.as_ref() {
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(we)) => we.code == 11000,
        ErrorKind::BulkWrite(failure) => failure
            .write_errors
            .iter()
            .flatten()
            .any(|we| we.code == 11000),
        _ => false,
    }
}

#[async_trait]
impl Collection for MongoCollection {
    async fn insert_one(&self, doc: Document) -> Result<()> {
        self.inner.insert_one(doc, None).await.map(|_| ()).map_err(Error::backend)
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        self.inner
            .insert_many(docs, None)
            .await
            .map(|_| ())
            .map_err(Error::backend)
    }

    async fn find(
        &self,
        filter: &Filter,
        sort: &SortSpec,
        limit: Option<i64>,
    ) -> Result<Vec<Document>> {
        let mut options = FindOptions::builder().sort(sort_to_document(sort)).build();
        options.limit = limit;
        let cursor = self
            .inner
            .find(filter_to_document(filter), options)
            .await
            .map_err(Error::backend)?;
        cursor.try_collect().await.map_err(Error::backend)
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        let model = IndexModel::builder()
            .keys(index_to_document(spec))
            .options(IndexOptions::builder().name(spec.name.to_owned()).build())
            .build();
        self.inner
            .create_index(model, CreateIndexOptions::builder().build())
            .await
            .map(|_| ())
            .map_err(Error::backend)
    }
}

/// Converts a [`crate::time::Tid`] to the BSON form stored on the wire, for
/// callers that build `Filter`s directly against this backend.
pub fn tid_to_bson(tid: &crate::time::Tid) -> Bson {
    Bson::Binary(bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes: tid.as_bytes().to_vec(),
    })
}
