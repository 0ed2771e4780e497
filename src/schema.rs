//! The record envelope and the built-in dataset/dataset-detail record types.

use bson::Document;

use crate::time::Tid;

/// A logical record key, encoded to a stable string for storage and lookup.
///
/// The wire form is each field rendered in the key type's declared order,
/// joined with `;` (spec §6). Construct with [`Key::from_fields`] to get
/// that canonical encoding; [`Key::raw`] wraps an already-encoded string
/// verbatim (used when round-tripping a key read back off a record).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    /// Encodes a record key from its fields, in the type's declared order.
    ///
    /// Panics (a [`crate::Error::BadInput`] is raised by callers that
    /// validate ahead of time) only in the sense that a field containing the
    /// `;` delimiter would corrupt the encoding; callers are expected not to
    /// feed delimiter-bearing fields. This mirrors spec's requirement that
    /// the encoding be "stable" and "order-independent" given a fixed
    /// field order.
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = fields
            .into_iter()
            .map(|f| f.as_ref().to_owned())
            .collect::<Vec<_>>()
            .join(";");
        Self(joined)
    }

    /// Wraps an already-encoded key string verbatim.
    pub fn raw(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// The canonical string encoding.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The payload of a stored record: either a tombstone or a live variant.
///
/// This is the type-tag-and-variant mapping that stands in for the open
/// class inheritance the original resolver used to distinguish record
/// roots: a collection stores a base envelope carrying this discriminator,
/// and downcasting at the store's edge (load / typed query) checks it,
/// raising `TypeMismatch` on conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    /// Hides any earlier non-tombstone version with the same key in
    /// datasets at or below this one in the lookup order.
    Tombstone,
    /// A live record of the named root type, serialized as a document.
    Payload {
        /// The record root's class name — the discriminator.
        root_name: String,
        fields: Document,
    },
}

/// The envelope every stored object carries (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEnvelope {
    pub id: Tid,
    pub key: Key,
    pub data_set: Tid,
    pub kind: RecordKind,
}

impl RecordEnvelope {
    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, RecordKind::Tombstone)
    }

    /// The discriminator of a live record, or `None` for a tombstone.
    pub fn root_name(&self) -> Option<&str> {
        match &self.kind {
            RecordKind::Tombstone => None,
            RecordKind::Payload { root_name, .. } => Some(root_name.as_str()),
        }
    }
}

const FIELD_ID: &str = "id";
const FIELD_KEY: &str = "key";
const FIELD_DATA_SET: &str = "dataSet";
const FIELD_KIND: &str = "_kind";
const FIELD_ROOT_NAME: &str = "_rootName";
const KIND_TOMBSTONE: &str = "Deleted";
const KIND_PAYLOAD: &str = "Payload";

impl RecordEnvelope {
    /// Serializes the envelope to the wire document stored in the backend:
    /// `id`, `key`, `dataSet`, a discriminator, and (for live records) the
    /// domain payload fields flattened alongside them. Tombstones carry
    /// only the envelope fields plus the discriminator (spec §6).
    pub fn to_document(&self) -> Document {
        let mut doc = bson::doc! {
            FIELD_ID: tid_to_binary(&self.id),
            FIELD_KEY: self.key.as_str(),
            FIELD_DATA_SET: tid_to_binary(&self.data_set),
        };
        match &self.kind {
            RecordKind::Tombstone => {
                doc.insert(FIELD_KIND, KIND_TOMBSTONE);
            }
            RecordKind::Payload { root_name, fields } => {
                doc.insert(FIELD_KIND, KIND_PAYLOAD);
                doc.insert(FIELD_ROOT_NAME, root_name.as_str());
                for (k, v) in fields.iter() {
                    doc.insert(k.clone(), v.clone());
                }
            }
        }
        doc
    }

    /// Reconstructs an envelope from a stored document. The domain payload
    /// (for live records) retains every field of `doc` except the envelope
    /// fields and discriminator, so a later `Record::from_document` can read
    /// it back.
    pub fn from_document(doc: &Document) -> crate::error::Result<Self> {
        use crate::error::BadInputSnafu;
        use snafu::OptionExt;

        let id = doc
            .get(FIELD_ID)
            .and_then(tid_from_bson)
            .context(BadInputSnafu {
                message: "stored record missing id",
            })?;
        let key = doc
            .get_str(FIELD_KEY)
            .ok()
            .context(BadInputSnafu {
                message: "stored record missing key",
            })?;
        let data_set = doc
            .get(FIELD_DATA_SET)
            .and_then(tid_from_bson)
            .context(BadInputSnafu {
                message: "stored record missing dataSet",
            })?;
        let kind_tag = doc.get_str(FIELD_KIND).unwrap_or(KIND_PAYLOAD);
        let kind = if kind_tag == KIND_TOMBSTONE {
            RecordKind::Tombstone
        } else {
            let root_name = doc
                .get_str(FIELD_ROOT_NAME)
                .ok()
                .context(BadInputSnafu {
                    message: "stored record missing discriminator",
                })?
                .to_owned();
            let mut fields = doc.clone();
            fields.remove(FIELD_ID);
            fields.remove(FIELD_KEY);
            fields.remove(FIELD_DATA_SET);
            fields.remove(FIELD_KIND);
            fields.remove(FIELD_ROOT_NAME);
            RecordKind::Payload { root_name, fields }
        };
        Ok(Self {
            id,
            key: Key::raw(key),
            data_set,
            kind,
        })
    }
}

/// A record root type that can be stored in and loaded from the collection
/// cache. Implemented by every concrete record type the host defines.
///
/// Generalizes the resolver and collection cache over `R: Record` in place
/// of the class-inheritance hierarchy the original store used to
/// distinguish record roots (see `RecordKind`).
pub trait Record: Sized + Clone + Send + Sync + 'static {
    /// The class name used as both the collection name and the stored
    /// discriminator.
    const ROOT_NAME: &'static str;

    /// The logical key of this record instance.
    fn key(&self) -> Key;

    /// Any additional indexes this root type declares, as ordered
    /// `(field, ascending)` pairs. Parsed once by the collection cache.
    fn declared_indexes() -> Vec<(&'static str, Vec<(&'static str, bool)>)> {
        Vec::new()
    }

    /// Serializes the domain fields (excluding `id`/`key`/`dataSet`, which
    /// the envelope carries separately) to a document.
    fn to_document(&self) -> Document;

    /// Deserializes domain fields back into a concrete record. Called only
    /// after the envelope's discriminator has already been checked against
    /// `Self::ROOT_NAME`.
    fn from_document(doc: &Document) -> crate::error::Result<Self>;

    /// Invoked by the writer immediately before a new version is appended;
    /// the default does nothing. Record types that need derived fields
    /// populated on save override this.
    fn init(&mut self) {}
}

/// A dataset: a named, immutable container that may import other datasets
/// transitively (spec §3, "Dataset record").
#[derive(Debug, Clone, PartialEq)]
pub struct DataSetRecord {
    pub name: String,
    pub imports: Vec<Tid>,
    pub non_temporal: bool,
}

impl DataSetRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: Vec::new(),
            non_temporal: false,
        }
    }

    pub fn with_imports(mut self, imports: Vec<Tid>) -> Self {
        self.imports = imports;
        self
    }

    pub fn with_non_temporal(mut self, non_temporal: bool) -> Self {
        self.non_temporal = non_temporal;
        self
    }
}

const FIELD_NAME: &str = "name";
const FIELD_IMPORTS: &str = "imports";
const FIELD_NON_TEMPORAL: &str = "nonTemporal";

impl Record for DataSetRecord {
    const ROOT_NAME: &'static str = "DataSet";

    fn key(&self) -> Key {
        Key::from_fields([self.name.as_str()])
    }

    fn to_document(&self) -> Document {
        let imports = self
            .imports
            .iter()
            .map(|t| bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: t.as_bytes().to_vec(),
            })
            .collect::<Vec<_>>();
        bson::doc! {
            FIELD_NAME: &self.name,
            FIELD_IMPORTS: imports,
            FIELD_NON_TEMPORAL: self.non_temporal,
        }
    }

    fn from_document(doc: &Document) -> crate::error::Result<Self> {
        use crate::error::BadInputSnafu;
        use snafu::OptionExt;

        let name = doc
            .get_str(FIELD_NAME)
            .ok()
            .context(BadInputSnafu {
                message: "dataset record missing name",
            })?
            .to_owned();
        let imports = doc
            .get_array(FIELD_IMPORTS)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_binary_generic())
                    .filter_map(|bytes| <[u8; 12]>::try_from(bytes).ok())
                    .map(Tid::from_bytes)
                    .collect()
            })
            .unwrap_or_default();
        let non_temporal = doc.get_bool(FIELD_NON_TEMPORAL).unwrap_or(false);
        Ok(Self {
            name,
            imports,
            non_temporal,
        })
    }
}

/// Per-dataset overrides, keyed by the dataset's own TID and stored in its
/// parent (spec §3, "Dataset-detail record").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataSetDetailRecord {
    pub data_set_id: Tid,
    pub read_only: Option<bool>,
    pub cutoff_time: Option<Tid>,
    pub imports_cutoff_time: Option<Tid>,
}

impl DataSetDetailRecord {
    pub fn new(data_set_id: Tid) -> Self {
        Self {
            data_set_id,
            ..Default::default()
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.unwrap_or(false)
    }
}

const FIELD_DATA_SET_ID: &str = "dataSetId";
const FIELD_READ_ONLY: &str = "readOnly";
const FIELD_CUTOFF_TIME: &str = "cutoffTime";
const FIELD_IMPORTS_CUTOFF_TIME: &str = "importsCutoffTime";

fn tid_to_binary(tid: &Tid) -> bson::Binary {
    bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes: tid.as_bytes().to_vec(),
    }
}

fn tid_from_bson(value: &bson::Bson) -> Option<Tid> {
    value
        .as_binary_generic()
        .and_then(|bytes| <[u8; 12]>::try_from(bytes).ok())
        .map(Tid::from_bytes)
}

impl Record for DataSetDetailRecord {
    const ROOT_NAME: &'static str = "DataSetDetail";

    fn key(&self) -> Key {
        Key::from_fields([self.data_set_id.to_string()])
    }

    fn to_document(&self) -> Document {
        let mut doc = bson::doc! {
            FIELD_DATA_SET_ID: tid_to_binary(&self.data_set_id),
        };
        if let Some(read_only) = self.read_only {
            doc.insert(FIELD_READ_ONLY, read_only);
        }
        if let Some(cutoff) = self.cutoff_time {
            doc.insert(FIELD_CUTOFF_TIME, tid_to_binary(&cutoff));
        }
        if let Some(cutoff) = self.imports_cutoff_time {
            doc.insert(FIELD_IMPORTS_CUTOFF_TIME, tid_to_binary(&cutoff));
        }
        doc
    }

    fn from_document(doc: &Document) -> crate::error::Result<Self> {
        use crate::error::BadInputSnafu;
        use snafu::OptionExt;

        let data_set_id = doc
            .get(FIELD_DATA_SET_ID)
            .and_then(tid_from_bson)
            .context(BadInputSnafu {
                message: "dataset-detail record missing dataSetId",
            })?;
        let read_only = doc.get_bool(FIELD_READ_ONLY).ok();
        let cutoff_time = doc.get(FIELD_CUTOFF_TIME).and_then(tid_from_bson);
        let imports_cutoff_time = doc.get(FIELD_IMPORTS_CUTOFF_TIME).and_then(tid_from_bson);
        Ok(Self {
            data_set_id,
            read_only,
            cutoff_time,
            imports_cutoff_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_joins_fields_with_semicolons() {
        let key = Key::from_fields(["a", "b", "c"]);
        assert_eq!(key.as_str(), "a;b;c");
    }

    #[test]
    fn dataset_record_round_trips_through_document() {
        let imports = vec![Tid::new(1, [1; 8]), Tid::new(2, [2; 8])];
        let rec = DataSetRecord::new("A").with_imports(imports.clone());
        let doc = rec.to_document();
        let back = DataSetRecord::from_document(&doc).unwrap();
        assert_eq!(back.name, "A");
        assert_eq!(back.imports, imports);
        assert!(!back.non_temporal);
    }

    #[test]
    fn dataset_detail_round_trips_optional_fields() {
        let detail = DataSetDetailRecord {
            data_set_id: Tid::new(5, [9; 8]),
            read_only: Some(true),
            cutoff_time: Some(Tid::new(6, [0; 8])),
            imports_cutoff_time: None,
        };
        let doc = detail.to_document();
        let back = DataSetDetailRecord::from_document(&doc).unwrap();
        assert_eq!(back, detail);
    }

    #[test]
    fn envelope_round_trips_a_live_payload() {
        let env = RecordEnvelope {
            id: Tid::new(10, [1; 8]),
            key: Key::from_fields(["K"]),
            data_set: Tid::new(5, [0; 8]),
            kind: RecordKind::Payload {
                root_name: "Widget".to_owned(),
                fields: bson::doc! { "color": "red" },
            },
        };
        let doc = env.to_document();
        let back = RecordEnvelope::from_document(&doc).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn envelope_round_trips_a_tombstone() {
        let env = RecordEnvelope {
            id: Tid::new(10, [1; 8]),
            key: Key::from_fields(["K"]),
            data_set: Tid::new(5, [0; 8]),
            kind: RecordKind::Tombstone,
        };
        let doc = env.to_document();
        let back = RecordEnvelope::from_document(&doc).unwrap();
        assert!(back.is_tombstone());
        assert_eq!(back.id, env.id);
    }
}
