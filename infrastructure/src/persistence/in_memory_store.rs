// ./infrastructure/src/persistence/in_memory_store.rs
use application::{DocumentStore, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use domain::{
    Document, DocumentKey, IndexDefinition, KeyRange, Revision, ViewRow, collate,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, trace};
use uuid::Uuid;

const DESIGN_PREFIX: &str = "_design/";

#[derive(Debug, Default)]
struct DatabaseState {
    created: AtomicBool,
    offline: AtomicBool,
    // Document Key -> latest revision of the document
    documents: DashMap<DocumentKey, Arc<Document>>,
    // View path ("design/view") -> definition
    views: DashMap<String, IndexDefinition>,
}

/// Single in-process database with revision checks and view queries.
/// Clones share the same database.
#[derive(Debug, Clone)]
pub struct InMemoryDocumentStore {
    database: String,
    state: Arc<DatabaseState>,
}

impl InMemoryDocumentStore {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            state: Arc::new(DatabaseState::default()),
        }
    }

    /// Makes every call fail with `StoreError::Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of stored documents, design documents included.
    pub fn document_count(&self) -> usize {
        self.state.documents.len()
    }

    fn ensure_reachable(&self) -> Result<(), StoreError> {
        if self.state.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(self.database.clone()));
        }
        Ok(())
    }

    fn ensure_database(&self) -> Result<(), StoreError> {
        self.ensure_reachable()?;
        if !self.state.created.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseMissing(self.database.clone()));
        }
        Ok(())
    }
}

/// `N-<random>` where N counts writes to the document.
fn next_revision(previous: Option<&Revision>) -> Revision {
    let generation = previous.and_then(Revision::generation).unwrap_or(0) + 1;
    Revision::new(format!("{generation}-{}", Uuid::new_v4().simple()))
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn database_name(&self) -> &str {
        &self.database
    }

    #[instrument(skip(self), fields(database = %self.database))]
    async fn exists(&self) -> Result<bool, StoreError> {
        self.ensure_reachable()?;
        Ok(self.state.created.load(Ordering::SeqCst))
    }

    #[instrument(skip(self), fields(database = %self.database))]
    async fn create(&self) -> Result<(), StoreError> {
        self.ensure_reachable()?;
        self.state
            .created
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| StoreError::DatabaseExists(self.database.clone()))?;
        info!("Database created in in-memory store");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &DocumentKey) -> Result<Option<Document>, StoreError> {
        self.ensure_database()?;
        debug!(key = %key, "Getting document from in-memory store");
        self.state
            .documents
            .get(key)
            .map(|doc_ref| Some((**doc_ref).clone()))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    #[instrument(skip(self, document))]
    async fn save(&self, key: &DocumentKey, document: &Document) -> Result<Revision, StoreError> {
        self.ensure_database()?;
        if key.as_str().starts_with(DESIGN_PREFIX) {
            return Err(StoreError::InvalidDocument(format!(
                "{key} is reserved for design documents"
            )));
        }
        debug!(key = %key, revision = ?document.revision(), "Saving document to in-memory store");

        // The entry holds the shard lock, so check-and-write is atomic per key.
        match self.state.documents.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().revision().cloned();
                if document.revision() != current.as_ref() {
                    return Err(StoreError::Conflict(key.to_string()));
                }
                let revision = next_revision(current.as_ref());
                occupied.insert(Arc::new(
                    document
                        .clone()
                        .with_key(key.clone())
                        .with_revision(revision.clone()),
                ));
                Ok(revision)
            }
            Entry::Vacant(vacant) => {
                if document.revision().is_some() {
                    return Err(StoreError::Conflict(key.to_string()));
                }
                let revision = next_revision(None);
                vacant.insert(Arc::new(
                    document
                        .clone()
                        .with_key(key.clone())
                        .with_revision(revision.clone()),
                ));
                Ok(revision)
            }
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, key: &DocumentKey, revision: &Revision) -> Result<(), StoreError> {
        self.ensure_database()?;
        debug!(key = %key, revision = %revision, "Removing document from in-memory store");
        match self.state.documents.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                if occupied.get().revision() != Some(revision) {
                    return Err(StoreError::Conflict(key.to_string()));
                }
                occupied.remove();
                Ok(())
            }
            Entry::Vacant(_) => Err(StoreError::NotFound(key.to_string())),
        }
    }

    #[instrument(skip(self, index), fields(view = %index.view_path()))]
    async fn install_index(&self, index: &IndexDefinition) -> Result<(), StoreError> {
        self.ensure_database()?;
        let design_key = index.design_key();
        match self.state.views.entry(index.view_path()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(design_key.to_string())),
            Entry::Vacant(vacant) => {
                let design = match index.design_document() {
                    Value::Object(fields) => Document::new(fields),
                    _ => Document::default(),
                };
                self.state.documents.insert(
                    design_key.clone(),
                    Arc::new(design.with_key(design_key).with_revision(next_revision(None))),
                );
                vacant.insert(index.clone());
                info!("View installed in in-memory store");
                Ok(())
            }
        }
    }

    #[instrument(skip(self, range))]
    async fn query(&self, view: &str, range: &KeyRange) -> Result<Vec<ViewRow>, StoreError> {
        self.ensure_database()?;
        let definition = self
            .state
            .views
            .get(view)
            .map(|def_ref| def_ref.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("missing view {view}")))?;

        let mut rows: Vec<ViewRow> = self
            .state
            .documents
            .iter()
            .filter(|entry| !entry.key().as_str().starts_with(DESIGN_PREFIX))
            .filter_map(|entry| {
                let key = definition.emit(entry.value())?;
                range.contains(&key).then(|| ViewRow {
                    id: entry.key().clone(),
                    key,
                    value: (**entry.value()).clone(),
                })
            })
            .collect();
        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        trace!(count = rows.len(), "View rows collected");
        Ok(rows)
    }
}
