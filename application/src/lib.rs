use async_trait::async_trait;
use domain::{Document, DocumentKey, Entity, IndexDefinition, KeyRange, Revision, ViewRow};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

// --- Store Errors ---

/// Failures reported by a document store implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Document update conflict: {0}")]
    Conflict(String),
    #[error("Database already exists: {0}")]
    DatabaseExists(String),
    #[error("Database does not exist: {0}")]
    DatabaseMissing(String),
    #[error("Document store unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

// --- Adapter Errors ---

/// Fixed, user-visible read failures. The store's own error is not kept.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("Error reading model file.")]
    Model,
    #[error("Error reading models.")]
    Collection,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Read(ReadError),
    /// Store write failures pass through unwrapped.
    #[error(transparent)]
    Write(StoreError),
    #[error("Error deleting model.")]
    Delete {
        #[source]
        source: StoreError,
    },
    #[error("Entity of type '{doc_type}' has no id")]
    MissingId { doc_type: String },
    #[error("Bootstrap of database '{database}' failed: {source}")]
    Bootstrap {
        database: String,
        #[source]
        source: StoreError,
    },
}

impl From<ReadError> for SyncError {
    fn from(err: ReadError) -> Self {
        SyncError::Read(err)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown sync method: {0}")]
pub struct UnknownMethod(pub String);

// --- Infrastructure Interface (Trait) ---

/// Client of a revision-checked document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Name of the database this client is bound to.
    fn database_name(&self) -> &str;
    /// Whether the database exists.
    async fn exists(&self) -> Result<bool, StoreError>;
    /// Creates the database. Fails with `DatabaseExists` if it is already there.
    async fn create(&self) -> Result<(), StoreError>;
    /// Fetches a document with its current revision. A missing document may be
    /// reported either as `Ok(None)` or as `NotFound`.
    async fn get(&self, key: &DocumentKey) -> Result<Option<Document>, StoreError>;
    /// Writes a document. Without a revision this is a create; with one it must
    /// match the stored revision or the store answers `Conflict`.
    async fn save(&self, key: &DocumentKey, document: &Document) -> Result<Revision, StoreError>;
    /// Removes a document at the given revision.
    async fn remove(&self, key: &DocumentKey, revision: &Revision) -> Result<(), StoreError>;
    /// Installs the design document backing a view. Fails with `Conflict` if
    /// it is already installed.
    async fn install_index(&self, index: &IndexDefinition) -> Result<(), StoreError>;
    /// Queries a view (`design/view`) over an inclusive key range.
    async fn query(&self, view: &str, range: &KeyRange) -> Result<Vec<ViewRow>, StoreError>;
}

// --- Dispatch Types ---

/// Logical persistence operation requested by the object-model layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
    /// Single document when the entity has an id, otherwise all of its type.
    Read,
    ReadAll,
    Create,
    Update,
    Delete,
}

impl FromStr for SyncMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(SyncMethod::Read),
            "read_all" => Ok(SyncMethod::ReadAll),
            "create" => Ok(SyncMethod::Create),
            "update" => Ok(SyncMethod::Update),
            "delete" => Ok(SyncMethod::Delete),
            other => Err(UnknownMethod(other.to_string())),
        }
    }
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncMethod::Read => "read",
            SyncMethod::ReadAll => "read_all",
            SyncMethod::Create => "create",
            SyncMethod::Update => "update",
            SyncMethod::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Successful result of a dispatched operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Document(Document),
    Documents(Vec<Document>),
    /// Create, update and delete hand back the caller's entity untouched.
    Entity(Entity),
}

impl SyncOutcome {
    pub fn into_document(self) -> Option<Document> {
        match self {
            SyncOutcome::Document(document) => Some(document),
            _ => None,
        }
    }

    pub fn into_documents(self) -> Option<Vec<Document>> {
        match self {
            SyncOutcome::Documents(documents) => Some(documents),
            _ => None,
        }
    }

    pub fn into_entity(self) -> Option<Entity> {
        match self {
            SyncOutcome::Entity(entity) => Some(entity),
            _ => None,
        }
    }
}

// --- Sync Adapter ---

/// Maps object-model persistence onto a document store.
///
/// Create and update are the same unconditional upsert: saving an id that
/// already exists overwrites it. Entities without an id are rejected with
/// `SyncError::MissingId`; no id is ever generated.
pub struct SyncAdapter {
    store: Arc<dyn DocumentStore>,
    type_index: IndexDefinition,
}

impl SyncAdapter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            type_index: IndexDefinition::type_index(),
        }
    }

    pub fn type_index(&self) -> &IndexDefinition {
        &self.type_index
    }

    /// Ensures the database and its type index exist. Safe to call again; an
    /// existing database is left alone. Losing a creation race to another
    /// process is not an error.
    #[instrument(skip(self), fields(database = %self.store.database_name()))]
    pub async fn bootstrap(&self) -> Result<(), SyncError> {
        let database = self.store.database_name();
        let fatal = |source: StoreError| SyncError::Bootstrap {
            database: database.to_string(),
            source,
        };

        if self.store.exists().await.map_err(fatal)? {
            debug!("Database already exists, nothing to bootstrap");
            return Ok(());
        }

        match self.store.create().await {
            Ok(()) => info!("Database created"),
            Err(StoreError::DatabaseExists(_)) => {
                warn!("Database was created concurrently by another process")
            }
            Err(e) => return Err(fatal(e)),
        }

        match self.store.install_index(&self.type_index).await {
            Ok(()) => info!(view = %self.type_index.view_path(), "Type index installed"),
            Err(StoreError::Conflict(_)) => {
                warn!(view = %self.type_index.view_path(), "Type index was installed concurrently")
            }
            Err(e) => return Err(fatal(e)),
        }
        Ok(())
    }

    /// Fetches the document stored for the entity's type and id.
    #[instrument(skip(self, entity), fields(doc_type = %entity.entity_type(), doc_id = ?entity.id()))]
    pub async fn load(&self, entity: &Entity) -> Result<Document, SyncError> {
        let key = require_key(entity)?;
        match self.store.get(&key).await {
            Ok(Some(document)) => {
                debug!(key = %key, revision = ?document.revision(), "Document loaded");
                Ok(document)
            }
            Ok(None) => {
                debug!(key = %key, "Store returned no document");
                Err(ReadError::Model.into())
            }
            Err(e) => {
                debug!(key = %key, cause = %e, "Store rejected document read");
                Err(ReadError::Model.into())
            }
        }
    }

    /// Fetches every document of the entity's type, in view key order.
    #[instrument(skip(self, entity), fields(doc_type = %entity.entity_type()))]
    pub async fn load_all(&self, entity: &Entity) -> Result<Vec<Document>, SyncError> {
        let range = KeyRange::exact(entity.entity_type());
        let rows = self
            .store
            .query(&self.type_index.view_path(), &range)
            .await
            .map_err(|e| {
                debug!(cause = %e, "Store rejected type index query");
                SyncError::Read(ReadError::Collection)
            })?;
        debug!(count = rows.len(), "Documents loaded from type index");
        Ok(rows.into_iter().map(|row| row.value).collect())
    }

    /// Writes the entity's attributes, carrying the stored revision forward
    /// when a document already exists. The entity is returned unchanged; the
    /// new revision is only visible through a fresh `load`.
    #[instrument(skip(self, entity), fields(doc_type = %entity.entity_type(), doc_id = ?entity.id()))]
    pub async fn save(&self, entity: Entity) -> Result<Entity, SyncError> {
        let key = require_key(&entity)?;
        let mut document = Document::from_entity(&entity);

        // A failed load only means there is no previous revision to carry.
        if let Ok(existing) = self.load(&entity).await {
            if let Some(revision) = existing.revision() {
                document = document.with_revision(revision.clone());
            }
        }

        let revision = self
            .store
            .save(&key, &document)
            .await
            .map_err(SyncError::Write)?;
        debug!(key = %key, revision = %revision, "Document saved");
        Ok(entity)
    }

    /// Removes the entity's document at its current revision.
    #[instrument(skip(self, entity), fields(doc_type = %entity.entity_type(), doc_id = ?entity.id()))]
    pub async fn destroy(&self, entity: Entity) -> Result<Entity, SyncError> {
        let key = require_key(&entity)?;
        let existing = self.load(&entity).await?;
        let revision = existing.revision().cloned().ok_or_else(|| SyncError::Delete {
            source: StoreError::InvalidDocument(format!("{key} has no revision")),
        })?;

        self.store
            .remove(&key, &revision)
            .await
            .map_err(|source| SyncError::Delete { source })?;
        debug!(key = %key, revision = %revision, "Document removed");
        Ok(entity)
    }

    /// Routes a logical method to the matching operation.
    pub async fn sync(&self, method: SyncMethod, entity: Entity) -> Result<SyncOutcome, SyncError> {
        match method {
            SyncMethod::Read if entity.id().is_some() => {
                self.load(&entity).await.map(SyncOutcome::Document)
            }
            SyncMethod::Read | SyncMethod::ReadAll => {
                self.load_all(&entity).await.map(SyncOutcome::Documents)
            }
            SyncMethod::Create | SyncMethod::Update => {
                self.save(entity).await.map(SyncOutcome::Entity)
            }
            SyncMethod::Delete => self.destroy(entity).await.map(SyncOutcome::Entity),
        }
    }

    /// Continuation form of [`SyncAdapter::sync`]: exactly one of the two
    /// callbacks runs, once.
    pub async fn sync_with<S, E>(&self, method: SyncMethod, entity: Entity, on_success: S, on_error: E)
    where
        S: FnOnce(SyncOutcome),
        E: FnOnce(SyncError),
    {
        match self.sync(method, entity).await {
            Ok(outcome) => on_success(outcome),
            Err(e) => on_error(e),
        }
    }
}

fn require_key(entity: &Entity) -> Result<DocumentKey, SyncError> {
    entity.key().ok_or_else(|| SyncError::MissingId {
        doc_type: entity.entity_type().to_string(),
    })
}
