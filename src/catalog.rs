//! The metadata catalog: a queryable document store holding granule,
//! transformation, aggregation and dataset documents.
//!
//! The pipeline only relies on two calls, [`Catalog::query`] with a
//! conjunction of equality/prefix filters and [`Catalog::update`] with a list
//! of (possibly partial) documents. [`ProvenanceStore`] layers the typed
//! requests used by the scheduler and assembler on top.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::TransformationVersion;
use crate::source::{Hemisphere, SourceRecord};

pub type Document = serde_json::Map<String, Value>;

pub const GRANULE_TYPE: &str = "granule";
pub const TRANSFORMATION_TYPE: &str = "transformation";
pub const AGGREGATION_TYPE: &str = "aggregation";
pub const DATASET_TYPE: &str = "dataset";
/// One per harvested granule date (and hemisphere); collects what was made from it.
pub const DESCENDANTS_TYPE: &str = "descendants";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog query failed: {0}")]
    QueryFailed(String),
    #[error("Catalog rejected the update: {0}")]
    Rejected(String),
    #[error("Catalog document could not be interpreted: {0}")]
    BadDocument(String),
    #[error("Could not access catalog file {}: {reason}", .path.display())]
    Storage { path: PathBuf, reason: String },
}

/// One condition in a query; a query matches documents satisfying all of its filters.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Equals(String, Value),
    Prefix(String, String),
}

impl Filter {
    pub fn eq<K: Into<String>, V: Into<Value>>(key: K, value: V) -> Self {
        Self::Equals(key.into(), value.into())
    }

    pub fn prefix<K: Into<String>, P: Into<String>>(key: K, prefix: P) -> Self {
        Self::Prefix(key.into(), prefix.into())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::Equals(k, v) => doc.get(k) == Some(v),
            Self::Prefix(k, p) => doc
                .get(k)
                .and_then(Value::as_str)
                .map(|s| s.starts_with(p.as_str()))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    Accepted,
    Rejected(String),
}

impl UpdateStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

pub trait Catalog: Send + Sync {
    fn query(&self, filters: &[Filter]) -> Result<Vec<Document>, CatalogError>;

    /// Insert or update documents. A document with an `id` that already exists
    /// is merged into the stored one (its keys overwrite); any other document
    /// is inserted and assigned an `id` if it lacks one.
    fn update(&self, docs: Vec<Document>) -> Result<UpdateStatus, CatalogError>;
}

/// An in-process catalog. Used directly in tests and as the backing store of
/// [`JsonFileCatalog`].
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    inner: Mutex<CatalogState>,
}

#[derive(Debug, Default)]
struct CatalogState {
    docs: Vec<Document>,
    by_id: HashMap<String, usize>,
    next_id: u64,
}

impl CatalogState {
    fn from_docs(docs: Vec<Document>) -> Self {
        let mut state = Self::default();
        for doc in docs {
            state.upsert(doc);
        }
        state
    }

    fn upsert(&mut self, mut doc: Document) {
        let existing = doc
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| self.by_id.get(id).copied());

        match existing {
            Some(i) => {
                for (k, v) in doc {
                    self.docs[i].insert(k, v);
                }
            }
            None => {
                let id = match doc.get("id").and_then(Value::as_str) {
                    Some(id) => id.to_string(),
                    None => {
                        // Documents loaded from disk may already use generated ids
                        let id = loop {
                            self.next_id += 1;
                            let id = format!("doc-{}", self.next_id);
                            if !self.by_id.contains_key(&id) {
                                break id;
                            }
                        };
                        doc.insert("id".into(), id.clone().into());
                        id
                    }
                };
                self.by_id.insert(id, self.docs.len());
                self.docs.push(doc);
            }
        }
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(docs: Vec<Document>) -> Self {
        Self {
            inner: Mutex::new(CatalogState::from_docs(docs)),
        }
    }

    pub fn snapshot(&self) -> Result<Vec<Document>, CatalogError> {
        self.inner
            .lock()
            .map(|s| s.docs.clone())
            .map_err(|e| CatalogError::QueryFailed(e.to_string()))
    }
}

impl Catalog for InMemoryCatalog {
    fn query(&self, filters: &[Filter]) -> Result<Vec<Document>, CatalogError> {
        let state = self
            .inner
            .lock()
            .map_err(|e| CatalogError::QueryFailed(e.to_string()))?;
        Ok(state
            .docs
            .iter()
            .filter(|d| filters.iter().all(|f| f.matches(d)))
            .cloned()
            .collect())
    }

    fn update(&self, docs: Vec<Document>) -> Result<UpdateStatus, CatalogError> {
        if let Some(bad) = docs.iter().find(|d| d.is_empty()) {
            return Ok(UpdateStatus::Rejected(format!("empty document {bad:?}")));
        }
        let mut state = self
            .inner
            .lock()
            .map_err(|e| CatalogError::Rejected(e.to_string()))?;
        for doc in docs {
            state.upsert(doc);
        }
        Ok(UpdateStatus::Accepted)
    }
}

/// A catalog persisted as a single JSON array of documents, rewritten after
/// every accepted update.
#[derive(Debug)]
pub struct JsonFileCatalog {
    path: PathBuf,
    memory: InMemoryCatalog,
    write_lock: Mutex<()>,
}

impl JsonFileCatalog {
    /// Open the catalog at `path`, starting empty if the file does not exist.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, CatalogError> {
        let path = path.into();
        let docs: Vec<Document> = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| CatalogError::Storage {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            serde_json::from_str(&text).map_err(|e| CatalogError::Storage {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            vec![]
        };
        debug!("Opened catalog {} with {} documents", path.display(), docs.len());

        Ok(Self {
            path,
            memory: InMemoryCatalog::with_documents(docs),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), CatalogError> {
        let storage_err = |e: &dyn std::fmt::Display| CatalogError::Storage {
            path: self.path.clone(),
            reason: e.to_string(),
        };

        let _guard = self.write_lock.lock().map_err(|e| storage_err(&e))?;
        let docs = self.memory.snapshot()?;
        let text = serde_json::to_string_pretty(&docs).map_err(|e| storage_err(&e))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| storage_err(&e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(|e| storage_err(&e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| storage_err(&e))?;
        Ok(())
    }
}

impl Catalog for JsonFileCatalog {
    fn query(&self, filters: &[Filter]) -> Result<Vec<Document>, CatalogError> {
        self.memory.query(filters)
    }

    fn update(&self, docs: Vec<Document>) -> Result<UpdateStatus, CatalogError> {
        let status = self.memory.update(docs)?;
        if status.is_accepted() {
            self.save()?;
        }
        Ok(status)
    }
}

/// Provenance of one (granule, grid, field) transformation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationProvenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub dataset: String,
    pub grid_name: String,
    pub field: String,
    pub pre_transformation_file_path: PathBuf,
    pub date: String,
    // Unset optional fields are written as nulls so that an update clears
    // whatever an earlier attempt stored there.
    #[serde(default)]
    pub hemisphere: Option<Hemisphere>,
    pub origin_checksum: String,
    #[serde(default)]
    pub transformation_version: Option<TransformationVersion>,
    pub success: bool,
    #[serde(default)]
    pub transformation_in_progress: bool,
    #[serde(default)]
    pub transformation_file_path: Option<PathBuf>,
    #[serde(default)]
    pub transformation_checksum: Option<String>,
    #[serde(default)]
    pub transformation_completed: Option<DateTime<Utc>>,
}

impl TransformationProvenance {
    /// Whether this attempt makes re-transforming unnecessary: it succeeded,
    /// with this code version, from a source with this checksum.
    pub fn is_current(&self, version: TransformationVersion, origin_checksum: &str) -> bool {
        self.success
            && !self.transformation_in_progress
            && self.transformation_version == Some(version)
            && self.origin_checksum == origin_checksum
    }

    pub fn to_document(&self) -> Result<Document, CatalogError> {
        let mut doc = to_document(self)?;
        doc.insert("type".into(), TRANSFORMATION_TYPE.into());
        Ok(doc)
    }

    pub fn from_document(doc: Document) -> Result<Self, CatalogError> {
        from_document(doc)
    }
}

/// Record of one (grid, field, year) aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationProvenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub dataset: String,
    pub grid_name: String,
    pub field: String,
    pub year: i32,
    pub success: bool,
    pub aggregation_time: DateTime<Utc>,
    #[serde(default)]
    pub output_paths: Vec<PathBuf>,
    #[serde(default)]
    pub notes: String,
}

fn to_document<T: Serialize>(value: &T) -> Result<Document, CatalogError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(CatalogError::BadDocument(format!("expected an object, got {other}"))),
        Err(e) => Err(CatalogError::BadDocument(e.to_string())),
    }
}

fn from_document<T: for<'de> Deserialize<'de>>(doc: Document) -> Result<T, CatalogError> {
    serde_json::from_value(Value::Object(doc)).map_err(|e| CatalogError::BadDocument(e.to_string()))
}

fn check_status(status: UpdateStatus) -> Result<(), CatalogError> {
    match status {
        UpdateStatus::Accepted => Ok(()),
        UpdateStatus::Rejected(reason) => Err(CatalogError::Rejected(reason)),
    }
}

/// Typed catalog requests for one dataset.
#[derive(Clone, Copy)]
pub struct ProvenanceStore<'a> {
    catalog: &'a dyn Catalog,
    dataset: &'a str,
}

impl<'a> ProvenanceStore<'a> {
    pub fn new(catalog: &'a dyn Catalog, dataset: &'a str) -> Self {
        Self { catalog, dataset }
    }

    pub fn dataset(&self) -> &str {
        self.dataset
    }

    fn typed_query<T: for<'de> Deserialize<'de>>(&self, doc_type: &str, mut filters: Vec<Filter>) -> Result<Vec<T>, CatalogError> {
        filters.push(Filter::eq("type", doc_type));
        filters.push(Filter::eq("dataset", self.dataset));
        let docs = self.catalog.query(&filters)?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            match from_document(doc) {
                Ok(v) => out.push(v),
                Err(e) => warn!("Skipping malformed {doc_type} document for {}: {e}", self.dataset),
            }
        }
        Ok(out)
    }

    /// Granules that were harvested successfully.
    pub fn harvested_granules(&self) -> Result<Vec<SourceRecord>, CatalogError> {
        self.typed_query(GRANULE_TYPE, vec![Filter::eq("harvest_success", true)])
    }

    /// Granule documents for the harvested file at `path`.
    pub fn granules_for_path(&self, path: &Path) -> Result<Vec<SourceRecord>, CatalogError> {
        self.typed_query(
            GRANULE_TYPE,
            vec![Filter::eq(
                "pre_transformation_file_path",
                path.to_string_lossy().to_string(),
            )],
        )
    }

    pub fn transformations_for_granule(&self, path: &Path) -> Result<Vec<TransformationProvenance>, CatalogError> {
        self.typed_query(
            TRANSFORMATION_TYPE,
            vec![Filter::eq(
                "pre_transformation_file_path",
                path.to_string_lossy().to_string(),
            )],
        )
    }

    /// Successful transformations of one field onto one grid whose date
    /// starts with `date_prefix` (e.g. "2010-07-03").
    pub fn successful_transformations(
        &self,
        grid: &str,
        field: &str,
        date_prefix: &str,
    ) -> Result<Vec<TransformationProvenance>, CatalogError> {
        self.typed_query(
            TRANSFORMATION_TYPE,
            vec![
                Filter::eq("grid_name", grid),
                Filter::eq("field", field),
                Filter::prefix("date", date_prefix),
                Filter::eq("success", true),
            ],
        )
    }

    /// All transformations onto `grid`, optionally restricted by success flag.
    pub fn transformations_for_grid(
        &self,
        grid: &str,
        success: Option<bool>,
    ) -> Result<Vec<TransformationProvenance>, CatalogError> {
        let mut filters = vec![Filter::eq("grid_name", grid)];
        if let Some(s) = success {
            filters.push(Filter::eq("success", s));
        }
        self.typed_query(TRANSFORMATION_TYPE, filters)
    }

    pub fn count_transformations(&self, success: bool) -> Result<usize, CatalogError> {
        Ok(self
            .typed_query::<TransformationProvenance>(TRANSFORMATION_TYPE, vec![Filter::eq("success", success)])?
            .len())
    }

    /// Insert or update the provenance of one transformation, matching any
    /// existing document by (granule path, grid, field).
    pub fn record_transformation(&self, prov: &TransformationProvenance) -> Result<(), CatalogError> {
        let mut prov = prov.clone();
        if prov.id.is_none() {
            prov.id = self
                .transformations_for_granule(&prov.pre_transformation_file_path)?
                .into_iter()
                .find(|p| p.grid_name == prov.grid_name && p.field == prov.field)
                .and_then(|p| p.id);
        }
        check_status(self.catalog.update(vec![prov.to_document()?])?)
    }

    pub fn aggregations(&self, grid: &str, year: i32) -> Result<Vec<AggregationProvenance>, CatalogError> {
        self.typed_query(
            AGGREGATION_TYPE,
            vec![Filter::eq("grid_name", grid), Filter::eq("year", year)],
        )
    }

    pub fn record_aggregation(&self, agg: &AggregationProvenance) -> Result<(), CatalogError> {
        let mut agg = agg.clone();
        if agg.id.is_none() {
            agg.id = self
                .aggregations(&agg.grid_name, agg.year)?
                .into_iter()
                .find(|a| a.field == agg.field)
                .and_then(|a| a.id);
        }
        let mut doc = to_document(&agg)?;
        doc.insert("type".into(), AGGREGATION_TYPE.into());
        check_status(self.catalog.update(vec![doc])?)
    }

    /// Descendants documents whose date starts with `date_prefix`.
    pub fn descendants(&self, date_prefix: &str) -> Result<Vec<Document>, CatalogError> {
        self.catalog.query(&[
            Filter::eq("type", DESCENDANTS_TYPE),
            Filter::eq("dataset", self.dataset),
            Filter::prefix("date", date_prefix),
        ])
    }

    /// Merge `fields` into the descendants document of one granule date and
    /// hemisphere, creating it if it does not exist yet.
    pub fn update_descendants(
        &self,
        date: &str,
        hemisphere: Option<Hemisphere>,
        fields: Document,
    ) -> Result<(), CatalogError> {
        let day = date.get(..10).unwrap_or(date);
        let hemi_name = hemisphere.map(|h| h.to_string());
        let existing_id = self
            .descendants(day)?
            .into_iter()
            .find(|d| d.get("hemisphere").and_then(Value::as_str) == hemi_name.as_deref())
            .and_then(|d| d.get("id").cloned());

        let mut doc = Document::new();
        match existing_id {
            Some(id) => {
                doc.insert("id".into(), id);
            }
            None => {
                doc.insert("type".into(), DESCENDANTS_TYPE.into());
                doc.insert("dataset".into(), self.dataset.into());
                doc.insert("date".into(), date.into());
                if let Some(h) = hemi_name {
                    doc.insert("hemisphere".into(), h.into());
                }
            }
        }
        doc.extend(fields);
        check_status(self.catalog.update(vec![doc])?)
    }

    pub fn dataset_document(&self) -> Result<Option<Document>, CatalogError> {
        let docs = self.catalog.query(&[
            Filter::eq("type", DATASET_TYPE),
            Filter::eq("ds_name", self.dataset),
        ])?;
        Ok(docs.into_iter().next())
    }

    /// Merge `fields` into the dataset document, creating it if needed.
    pub fn update_dataset(&self, fields: Document) -> Result<(), CatalogError> {
        let mut doc = match self.dataset_document()? {
            Some(existing) => {
                let mut d = Document::new();
                if let Some(id) = existing.get("id") {
                    d.insert("id".into(), id.clone());
                }
                d
            }
            None => {
                let mut d = Document::new();
                d.insert("type".into(), DATASET_TYPE.into());
                d.insert("ds_name".into(), self.dataset.into());
                d
            }
        };
        doc.extend(fields);
        check_status(self.catalog.update(vec![doc])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{granule_doc, provenance};

    #[test]
    fn test_filters() {
        let cat = InMemoryCatalog::with_documents(vec![
            granule_doc("TEST", "/a/g_20100101.json", "2010-01-01T00:00:00Z", "c1"),
            granule_doc("TEST", "/a/g_20100102.json", "2010-01-02T00:00:00Z", "c2"),
            granule_doc("OTHER", "/b/g_20100101.json", "2010-01-01T00:00:00Z", "c3"),
        ]);
        let found = cat
            .query(&[Filter::eq("dataset", "TEST"), Filter::prefix("date", "2010-01-01")])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["checksum"], "c1");
    }

    #[test]
    fn test_update_merges_by_id() {
        let cat = InMemoryCatalog::new();
        let store = ProvenanceStore::new(&cat, "TEST");
        let mut prov = provenance("TEST", "g", "sst", "/a/g_20100101.json", "2010-01-01T00:00:00Z");
        prov.success = false;
        prov.transformation_in_progress = true;
        store.record_transformation(&prov).unwrap();

        prov.success = true;
        prov.transformation_in_progress = false;
        store.record_transformation(&prov).unwrap();

        let all = store.transformations_for_grid("g", None).unwrap();
        assert_eq!(all.len(), 1, "second record should update the first");
        assert!(all[0].success);
        assert!(all[0].id.is_some());
    }

    #[test]
    fn test_rerun_clears_previous_outputs() {
        let cat = InMemoryCatalog::new();
        let store = ProvenanceStore::new(&cat, "TEST");
        let mut prov = provenance("TEST", "g", "sst", "/a/g_20100101.json", "2010-01-01T00:00:00Z");
        prov.transformation_file_path = Some(PathBuf::from("/out/g_sst_g_20100101.json"));
        prov.transformation_checksum = Some("beef".into());
        prov.transformation_completed = Some(Utc::now());
        store.record_transformation(&prov).unwrap();

        // A new attempt starts: in progress, with no outputs yet
        prov.success = false;
        prov.transformation_in_progress = true;
        prov.transformation_file_path = None;
        prov.transformation_checksum = None;
        prov.transformation_completed = None;
        store.record_transformation(&prov).unwrap();

        let all = store.transformations_for_grid("g", None).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].transformation_in_progress);
        assert_eq!(all[0].transformation_file_path, None);
        assert_eq!(all[0].transformation_checksum, None);
        assert_eq!(all[0].transformation_completed, None);
    }

    #[test]
    fn test_descendants_per_date_and_hemisphere() {
        let cat = InMemoryCatalog::new();
        let store = ProvenanceStore::new(&cat, "TEST");
        let mut fields = Document::new();
        fields.insert("all_transformations_success".into(), true.into());
        store
            .update_descendants("2010-01-01T00:00:00Z", Some(Hemisphere::North), fields.clone())
            .unwrap();
        store
            .update_descendants("2010-01-01T00:00:00Z", Some(Hemisphere::South), fields)
            .unwrap();

        let mut fields = Document::new();
        fields.insert("all_transformations_success".into(), false.into());
        store
            .update_descendants("2010-01-01T00:00:00Z", Some(Hemisphere::North), fields)
            .unwrap();

        let docs = store.descendants("2010-01-01").unwrap();
        assert_eq!(docs.len(), 2);
        let north = docs.iter().find(|d| d["hemisphere"] == "nh").unwrap();
        let south = docs.iter().find(|d| d["hemisphere"] == "sh").unwrap();
        assert_eq!(north["all_transformations_success"], false);
        assert_eq!(south["all_transformations_success"], true);
    }

    #[test]
    fn test_empty_update_rejected() {
        let cat = InMemoryCatalog::new();
        let status = cat.update(vec![Document::new()]).unwrap();
        assert!(!status.is_accepted());
    }

    #[test]
    fn test_is_current() {
        let prov = provenance("TEST", "g", "sst", "/a/x.json", "2010-01-01T00:00:00Z");
        let v = prov.transformation_version.unwrap();
        assert!(prov.is_current(v, &prov.origin_checksum));
        assert!(!prov.is_current(TransformationVersion(v.0 + 1.0), &prov.origin_checksum));
        assert!(!prov.is_current(v, "different"));
    }

    #[test]
    fn test_file_catalog_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        {
            let cat = JsonFileCatalog::open(&path).unwrap();
            let store = ProvenanceStore::new(&cat, "TEST");
            let mut fields = Document::new();
            fields.insert("transformation_status".into(), "All transformations successful".into());
            store.update_dataset(fields).unwrap();
        }
        let cat = JsonFileCatalog::open(&path).unwrap();
        let doc = ProvenanceStore::new(&cat, "TEST").dataset_document().unwrap().unwrap();
        assert_eq!(doc["transformation_status"], "All transformations successful");
    }
}
