// End-to-end adapter behaviour against the in-memory store.
use crate::InMemoryDocumentStore;
use application::{DocumentStore, ReadError, StoreError, SyncAdapter, SyncError, SyncMethod};
use async_trait::async_trait;
use domain::{Document, DocumentKey, Entity, IndexDefinition, KeyRange, Revision, ViewRow};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Barrier;

async fn bootstrapped() -> (Arc<SyncAdapter>, InMemoryDocumentStore) {
    let store = InMemoryDocumentStore::new("models");
    let adapter = SyncAdapter::new(Arc::new(store.clone()));
    adapter.bootstrap().await.expect("bootstrap should succeed");
    (Arc::new(adapter), store)
}

fn entity(doc_type: &str, id: &str, attributes: Value) -> Entity {
    let attributes = match attributes {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Entity::new(doc_type).with_id(id).with_attributes(attributes)
}

fn non_revision_fields(document: &Document) -> &Map<String, Value> {
    document.fields()
}

/// Delegates to an in-memory store but parks one kind of call at a two-party
/// barrier, `waits` times, so two operations line up at the same point.
struct GatedStore {
    inner: InMemoryDocumentStore,
    gated_call: &'static str,
    waits: usize,
    barrier: Arc<Barrier>,
    create_failures: AtomicUsize,
}

impl GatedStore {
    fn new(inner: InMemoryDocumentStore, gated_call: &'static str, waits: usize) -> Self {
        Self {
            inner,
            gated_call,
            waits,
            barrier: Arc::new(Barrier::new(2)),
            create_failures: AtomicUsize::new(0),
        }
    }

    async fn gate(&self, call: &str) {
        if call == self.gated_call {
            for _ in 0..self.waits {
                self.barrier.wait().await;
            }
        }
    }
}

#[async_trait]
impl DocumentStore for GatedStore {
    fn database_name(&self) -> &str {
        self.inner.database_name()
    }

    async fn exists(&self) -> Result<bool, StoreError> {
        let exists = self.inner.exists().await;
        self.gate("exists").await;
        exists
    }

    async fn create(&self) -> Result<(), StoreError> {
        let result = self.inner.create().await;
        if result.is_err() {
            self.create_failures.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn get(&self, key: &DocumentKey) -> Result<Option<Document>, StoreError> {
        self.inner.get(key).await
    }

    async fn save(&self, key: &DocumentKey, document: &Document) -> Result<Revision, StoreError> {
        self.gate("save").await;
        self.inner.save(key, document).await
    }

    async fn remove(&self, key: &DocumentKey, revision: &Revision) -> Result<(), StoreError> {
        self.gate("remove").await;
        self.inner.remove(key, revision).await
    }

    async fn install_index(&self, index: &IndexDefinition) -> Result<(), StoreError> {
        self.inner.install_index(index).await
    }

    async fn query(&self, view: &str, range: &KeyRange) -> Result<Vec<ViewRow>, StoreError> {
        self.inner.query(view, range).await
    }
}

async fn gated(gated_call: &'static str, waits: usize) -> (Arc<SyncAdapter>, Arc<GatedStore>) {
    let inner = InMemoryDocumentStore::new("models");
    SyncAdapter::new(Arc::new(inner.clone()))
        .bootstrap()
        .await
        .expect("bootstrap should succeed");
    let store = Arc::new(GatedStore::new(inner, gated_call, waits));
    let adapter = SyncAdapter::new(store.clone());
    (Arc::new(adapter), store)
}

#[tokio::test]
async fn project_lifecycle() {
    let (adapter, _) = bootstrapped().await;
    let mut project = entity("project", "42", json!({"name": "Foo"}));

    adapter.sync(SyncMethod::Create, project.clone()).await.unwrap();
    let first = adapter.load(&project).await.unwrap();
    assert_eq!(first.doc_type(), Some("project"));
    assert_eq!(first.get_field_value("name"), Some(&json!("Foo")));
    let r1 = first.revision().cloned().expect("stored document has a revision");

    project.set_attributes(match json!({"name": "Bar"}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    });
    adapter.sync(SyncMethod::Update, project.clone()).await.unwrap();
    let second = adapter.load(&project).await.unwrap();
    assert_eq!(second.get_field_value("name"), Some(&json!("Bar")));
    let r2 = second.revision().cloned().expect("stored document has a revision");
    assert_ne!(r1, r2);

    adapter.sync(SyncMethod::Delete, project.clone()).await.unwrap();
    let err = adapter.load(&project).await.unwrap_err();
    assert!(matches!(err, SyncError::Read(ReadError::Model)));
}

#[tokio::test]
async fn load_all_returns_only_the_requested_type() {
    let (adapter, _) = bootstrapped().await;
    adapter.save(entity("project", "1", json!({"name": "A"}))).await.unwrap();
    adapter.save(entity("project", "2", json!({"name": "B"}))).await.unwrap();
    adapter.save(entity("layer", "1", json!({"name": "L"}))).await.unwrap();

    let outcome = adapter
        .sync(SyncMethod::Read, Entity::new("project"))
        .await
        .unwrap();
    let docs = outcome.into_documents().expect("read without id lists documents");
    assert_eq!(docs.len(), 2);
    assert!(docs.iter().all(|doc| doc.doc_type() == Some("project")));
}

#[tokio::test]
async fn load_all_lists_each_document_exactly_once() {
    let (adapter, _) = bootstrapped().await;
    for id in ["e", "a", "c", "b", "d"] {
        adapter.save(entity("project", id, json!({"id": id}))).await.unwrap();
    }
    for id in ["a", "b", "z"] {
        adapter.save(entity("layer", id, json!({"id": id}))).await.unwrap();
    }
    // Re-saving must not duplicate rows
    adapter.save(entity("project", "c", json!({"id": "c", "v": 2}))).await.unwrap();

    let docs = adapter.load_all(&Entity::new("project")).await.unwrap();
    let keys: Vec<&str> = docs
        .iter()
        .filter_map(|doc| doc.key().map(DocumentKey::as_str))
        .collect();
    let unique: HashSet<&str> = keys.iter().copied().collect();
    assert_eq!(keys.len(), 5);
    assert_eq!(unique.len(), 5);
    assert!(unique.contains("project-a") && unique.contains("project-e"));
}

#[tokio::test]
async fn load_all_of_unknown_type_is_empty() {
    let (adapter, _) = bootstrapped().await;
    adapter.save(entity("project", "1", json!({}))).await.unwrap();
    let docs = adapter.load_all(&Entity::new("style")).await.unwrap();
    assert!(docs.is_empty());
}

#[tokio::test]
async fn save_then_load_round_trips_attributes() {
    let (adapter, _) = bootstrapped().await;
    let attributes = json!({"name": "Foo", "zoom": 4, "layers": ["a", "b"], "meta": {"x": null}});
    adapter
        .save(entity("project", "round", attributes.clone()))
        .await
        .unwrap();

    let loaded = adapter
        .load(&Entity::new("project").with_id("round"))
        .await
        .unwrap();
    let mut expected = match attributes {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    expected.insert("type".to_string(), json!("project"));
    assert_eq!(non_revision_fields(&loaded), &expected);
}

#[tokio::test]
async fn same_id_under_different_types_does_not_collide() {
    let (adapter, _) = bootstrapped().await;
    adapter.save(entity("project", "1", json!({"name": "P"}))).await.unwrap();
    adapter.save(entity("layer", "1", json!({"name": "L"}))).await.unwrap();

    let project = adapter.load(&Entity::new("project").with_id("1")).await.unwrap();
    let layer = adapter.load(&Entity::new("layer").with_id("1")).await.unwrap();
    assert_eq!(project.get_field_value("name"), Some(&json!("P")));
    assert_eq!(layer.get_field_value("name"), Some(&json!("L")));
}

#[tokio::test]
async fn stale_revision_is_rejected_by_the_store() {
    let (adapter, store) = bootstrapped().await;
    let project = entity("project", "42", json!({"name": "Foo"}));
    adapter.save(project.clone()).await.unwrap();
    let r1 = adapter.load(&project).await.unwrap().revision().cloned().unwrap();
    adapter.save(project.clone()).await.unwrap();

    let stale = Document::from_entity(&project).with_revision(r1);
    let result = store.save(&DocumentKey::compose("project", "42"), &stale).await;
    assert!(matches!(result, Err(StoreError::Conflict(_))));
}

#[tokio::test]
async fn create_on_existing_id_overwrites() {
    // Create is an upsert: no "must not exist" check.
    let (adapter, _) = bootstrapped().await;
    adapter
        .sync(SyncMethod::Create, entity("project", "dup", json!({"name": "first"})))
        .await
        .unwrap();
    adapter
        .sync(SyncMethod::Create, entity("project", "dup", json!({"name": "second"})))
        .await
        .unwrap();

    let loaded = adapter.load(&Entity::new("project").with_id("dup")).await.unwrap();
    assert_eq!(loaded.get_field_value("name"), Some(&json!("second")));
    assert_eq!(loaded.revision().and_then(|rev| rev.generation()), Some(2));
}

#[tokio::test]
async fn save_without_id_is_rejected() {
    let (adapter, store) = bootstrapped().await;
    let before = store.document_count();
    let err = adapter
        .sync(SyncMethod::Create, Entity::new("project"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::MissingId { .. }));
    assert_eq!(store.document_count(), before);
}

#[tokio::test]
async fn destroy_of_missing_document_fails_with_read_error() {
    let (adapter, _) = bootstrapped().await;
    let project = entity("project", "7", json!({}));
    adapter.save(project.clone()).await.unwrap();
    adapter.destroy(project.clone()).await.unwrap();

    let err = adapter.destroy(project).await.unwrap_err();
    assert!(matches!(err, SyncError::Read(ReadError::Model)));
}

#[tokio::test]
async fn destroyed_entity_can_be_saved_again() {
    let (adapter, _) = bootstrapped().await;
    let project = entity("project", "again", json!({"name": "Foo"}));
    adapter.save(project.clone()).await.unwrap();
    adapter.destroy(project.clone()).await.unwrap();
    adapter.save(project.clone()).await.unwrap();
    assert!(adapter.load(&project).await.is_ok());
}

#[tokio::test]
async fn concurrent_saves_of_one_key_never_overwrite_silently() {
    let (adapter, store) = gated("save", 1).await;
    let key = DocumentKey::compose("project", "hot");
    store
        .inner
        .save(&key, &Document::from_entity(&entity("project", "hot", json!({"n": 0}))))
        .await
        .unwrap();

    // Both saves load generation 1 before either reaches the store write
    let (a, b) = tokio::join!(
        adapter.save(entity("project", "hot", json!({"n": 1}))),
        adapter.save(entity("project", "hot", json!({"n": 2}))),
    );

    let mut successes = 0;
    let mut conflicts = 0;
    for result in [a, b] {
        match result {
            Ok(_) => successes += 1,
            Err(SyncError::Write(StoreError::Conflict(_))) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 1);

    let stored = store.inner.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.revision().and_then(|rev| rev.generation()), Some(2));
}

#[tokio::test]
async fn destroy_with_stale_revision_is_a_delete_error() {
    let (adapter, store) = gated("remove", 2).await;
    let project = entity("project", "busy", json!({"name": "Foo"}));
    store
        .inner
        .save(&DocumentKey::compose("project", "busy"), &Document::from_entity(&project))
        .await
        .unwrap();

    let destroying = {
        let adapter = Arc::clone(&adapter);
        let project = project.clone();
        tokio::spawn(async move { adapter.destroy(project).await })
    };

    // Destroy has loaded generation 1 and is parked in front of remove
    store.barrier.wait().await;
    adapter
        .save(entity("project", "busy", json!({"name": "Bar"})))
        .await
        .unwrap();
    store.barrier.wait().await;

    let err = destroying.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SyncError::Delete { source: StoreError::Conflict(_) }
    ));
    assert_eq!(err.to_string(), "Error deleting model.");

    let survivor = adapter.load(&project).await.unwrap();
    assert_eq!(survivor.get_field_value("name"), Some(&json!("Bar")));
    assert_eq!(survivor.revision().and_then(|rev| rev.generation()), Some(2));
}

#[tokio::test]
async fn load_all_before_bootstrap_is_a_read_error() {
    let store = InMemoryDocumentStore::new("models");
    store.create().await.unwrap();
    let adapter = SyncAdapter::new(Arc::new(store));
    let err = adapter.load_all(&Entity::new("project")).await.unwrap_err();
    assert!(matches!(err, SyncError::Read(ReadError::Collection)));
}

#[tokio::test]
async fn bootstrap_is_idempotent() {
    let (adapter, store) = bootstrapped().await;
    let count = store.document_count();
    adapter.bootstrap().await.unwrap();
    assert_eq!(store.document_count(), count);
}

#[tokio::test]
async fn racing_bootstraps_both_succeed() {
    let store = Arc::new(GatedStore::new(InMemoryDocumentStore::new("models"), "exists", 1));
    let first = SyncAdapter::new(store.clone());
    let second = SyncAdapter::new(store.clone());

    // Both callers see "missing" before either creates the database
    let (a, b) = tokio::join!(first.bootstrap(), second.bootstrap());
    a.unwrap();
    b.unwrap();
    assert_eq!(store.create_failures.load(Ordering::SeqCst), 1);

    let design = store
        .inner
        .get(&first.type_index().design_key())
        .await
        .unwrap()
        .unwrap();
    assert!(design.get_field_value("views").is_some());
    // The type index answers queries afterwards
    first.save(entity("project", "1", json!({}))).await.unwrap();
    assert_eq!(second.load_all(&Entity::new("project")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn bootstrap_against_unreachable_store_is_fatal() {
    let store = InMemoryDocumentStore::new("models");
    store.set_offline(true);
    let adapter = SyncAdapter::new(Arc::new(store));
    let err = adapter.bootstrap().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Bootstrap { source: StoreError::Unavailable(_), .. }
    ));
}
