//! Crate-wide error types.
//!
//! `NotFound` from spec.md's error taxonomy is deliberately absent here: it
//! is never thrown. Load-by-id and load-by-key surface "not found" as
//! `Ok(None)`, not as an `Err`, matching "NotFound... only when the API
//! returns absent; never thrown".

use snafu::Snafu;

use crate::time::Tid;

/// Reasons a write or dataset operation violates the store's integrity
/// invariants (spec.md §7, `IntegrityViolation`).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IntegrityViolation {
    #[snafu(display("dataset {dataset:?} imports itself"))]
    SelfImport { dataset: Tid },

    #[snafu(display(
        "dataset {dataset:?} has dataSet={parent:?}; datasets must be rooted directly under Empty"
    ))]
    DataSetNotInRoot { dataset: Tid, parent: Tid },

    #[snafu(display("record id {id:?} must be strictly greater than its dataset id {dataset:?}"))]
    IdNotAfterDataSet { id: Tid, dataset: Tid },

    #[snafu(display("duplicate id {id:?} on insert"))]
    DuplicateId { id: Tid },

    #[snafu(display("a cutoff is in effect for dataset {dataset:?}; writes are rejected"))]
    CutoffActive { dataset: Tid },

    #[snafu(display("import {import:?} of dataset {dataset:?} does not exist"))]
    MissingImport { dataset: Tid, import: Tid },
}

/// The top-level error type returned by every fallible public operation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("record {id:?} exists but is not a {expected}"))]
    TypeMismatch { id: Tid, expected: &'static str },

    #[snafu(display("{source}"))]
    Integrity { source: IntegrityViolation },

    #[snafu(display("data source or dataset {dataset:?} is read-only"))]
    ReadOnly { dataset: Tid },

    #[snafu(display("bad input: {message}"))]
    BadInput { message: String },

    #[snafu(display("backend operation failed: {source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl Error {
    pub fn integrity(source: IntegrityViolation) -> Self {
        Self::Integrity { source }
    }

    pub fn backend(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend {
            source: Box::new(source),
        }
    }

    /// Whether this is a backend error reflecting a duplicate-key write —
    /// the one error the writer is allowed to treat as success, when it
    /// loses the race to auto-create a dataset-detail record (spec §7).
    pub fn is_duplicate_key(&self) -> bool {
        let Self::Backend { source } = self else {
            return false;
        };
        if let Some(mongo_err) = source.downcast_ref::<mongodb::error::Error>() {
            return crate::backend::mongo::is_duplicate_key_error(mongo_err);
        }
        source
            .downcast_ref::<crate::backend::mem::DuplicateIdError>()
            .is_some()
    }
}

/// A specialized `Result` for this crate's `Error`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
