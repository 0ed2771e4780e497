//! A temporal, hierarchical record store built on top of a document database.
//!
//! Three things set this apart from a plain document store:
//!
//! * **Temporal history** — writes are appends; any prior version of a
//!   logical record remains retrievable, and reads can be taken "as of" a
//!   cutoff.
//! * **Hierarchical namespacing via datasets** — records live inside
//!   [`schema::DataSetRecord`]s, which may import other datasets
//!   transitively. A lookup for a key in a dataset transparently searches
//!   the dataset and its imports.
//! * **Per-dataset overrides** — a [`schema::DataSetDetailRecord`] can mark
//!   a dataset read-only, impose a cutoff, or freeze the visible state of
//!   its imports.
//!
//! See [`dataset_resolver::DataSetResolver`] and
//! [`record_resolver::RecordResolver`] for the core resolution logic, and
//! [`data_source::DataSource`] for the facade that ties everything to a
//! host [`Context`](context::Context).
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_copy_implementations, clippy::use_self)]

pub mod backend;
pub mod collection_cache;
pub mod context;
pub mod data_source;
pub mod dataset_resolver;
pub mod error;
pub mod query;
pub mod record_resolver;
pub mod schema;
pub mod time;
pub mod writer;

pub use crate::data_source::{DataSource, StoreConfig};
pub use crate::error::{Error, Result};
pub use crate::schema::{DataSetDetailRecord, DataSetRecord, Key, Record, RecordEnvelope};
pub use crate::time::Tid;
