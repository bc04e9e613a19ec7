use serde::{Deserialize, Serialize}; // For document (de)serialization
use serde_json::{Map, Value, json}; // To represent arbitrary entity attributes
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error; // For domain-specific errors

/// Field injected into every stored document to tag its kind.
pub const TYPE_FIELD: &str = "type";
/// Store-owned field carrying the document key.
pub const ID_FIELD: &str = "_id";
/// Store-owned field carrying the revision token.
pub const REVISION_FIELD: &str = "_rev";
/// Separator between type and id in a composed document key.
pub const KEY_SEPARATOR: char = '-';

// --- Domain Errors ---
#[derive(Error, Debug, PartialEq)]
pub enum DomainError {
    #[error("Expected a JSON object for entity attributes, got {0}")]
    NotAnObject(String),
    #[error("Invalid entity id: {0}")]
    InvalidId(String),
}

// --- Document Key ---

/// Composite identifier under which a document is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn new(key: String) -> Self {
        Self(key)
    }

    /// Builds `type + "-" + id`. Entities of different types may share an id.
    ///
    /// The separator is not escaped: `("a", "b-c")` and `("a-b", "c")` both
    /// map to `a-b-c`.
    pub fn compose(doc_type: &str, id: &str) -> Self {
        Self(format!("{doc_type}{KEY_SEPARATOR}{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Revision ---

/// Opaque version token assigned by the store on every write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(token: String) -> Self {
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading write counter of a `N-suffix` token, if the token has one.
    pub fn generation(&self) -> Option<u64> {
        self.0
            .split_once('-')
            .and_then(|(generation, _)| generation.parse().ok())
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Entity ---

/// In-memory record of the object-model layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    entity_type: String,
    id: Option<String>,
    attributes: Map<String, Value>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: None,
            attributes: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Builds an entity from a JSON object body. The body becomes the
    /// attributes; its `id` field (string or number) becomes the entity id.
    pub fn from_json(entity_type: impl Into<String>, body: Value) -> Result<Self, DomainError> {
        let attributes = match body {
            Value::Object(map) => map,
            other => return Err(DomainError::NotAnObject(json_kind(&other).to_string())),
        };
        let id = match attributes.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(other) => return Err(DomainError::InvalidId(other.to_string())),
        };
        Ok(Self {
            entity_type: entity_type.into(),
            id,
            attributes,
        })
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn set_attributes(&mut self, attributes: Map<String, Value>) {
        self.attributes = attributes;
    }

    /// Storage key, available once the entity has an id.
    pub fn key(&self) -> Option<DocumentKey> {
        self.id
            .as_deref()
            .map(|id| DocumentKey::compose(&self.entity_type, id))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// --- Document ---

/// On-disk representation of an entity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Document {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    key: Option<DocumentKey>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    revision: Option<Revision>,
    /// Every field other than `_id` and `_rev`, `type` included.
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Document {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            key: None,
            revision: None,
            fields,
        }
    }

    /// `{type: entity.type}` merged with the entity attributes, attributes
    /// winning. Store-owned `_id`/`_rev` attributes are not carried over.
    pub fn from_entity(entity: &Entity) -> Self {
        let mut fields = Map::new();
        fields.insert(TYPE_FIELD.to_string(), json!(entity.entity_type()));
        for (name, value) in entity.attributes() {
            if name == ID_FIELD || name == REVISION_FIELD {
                continue;
            }
            fields.insert(name.clone(), value.clone());
        }
        Self::new(fields)
    }

    pub fn with_key(mut self, key: DocumentKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn key(&self) -> Option<&DocumentKey> {
        self.key.as_ref()
    }

    pub fn revision(&self) -> Option<&Revision> {
        self.revision.as_ref()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get_field_value(&self, field_name: &str) -> Option<&Value> {
        self.fields.get(field_name)
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.fields.get(TYPE_FIELD).and_then(Value::as_str)
    }
}

// --- Type Index ---

/// Server-side view emitting `(doc[key_field], doc)` for every document
/// whose key field is truthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    design: String,
    view: String,
    key_field: String,
}

impl IndexDefinition {
    /// The `types/types` view keyed by each document's `type`.
    pub fn type_index() -> Self {
        Self {
            design: "types".to_string(),
            view: "types".to_string(),
            key_field: TYPE_FIELD.to_string(),
        }
    }

    pub fn design_key(&self) -> DocumentKey {
        DocumentKey::new(format!("_design/{}", self.design))
    }

    /// Name the view is queried by, `<design>/<view>`.
    pub fn view_path(&self) -> String {
        format!("{}/{}", self.design, self.view)
    }

    pub fn map_source(&self) -> String {
        format!(
            "function(doc) {{\n  if (doc.{field}) {{\n    emit(doc.{field}, doc);\n  }}\n}}",
            field = self.key_field
        )
    }

    /// Body of the design document installed in the store.
    pub fn design_document(&self) -> Value {
        json!({
            "views": {
                self.view.as_str(): { "map": self.map_source() }
            }
        })
    }

    /// Key this view emits for `document`, if any.
    pub fn emit(&self, document: &Document) -> Option<Value> {
        document
            .get_field_value(&self.key_field)
            .filter(|value| is_truthy(value))
            .cloned()
    }
}

/// JavaScript truthiness, as seen by a map function's `if (doc.field)`.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// --- View Query ---

/// Inclusive key range of a view query.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeyRange {
    #[serde(rename = "startkey")]
    pub start_key: Value,
    #[serde(rename = "endkey")]
    pub end_key: Value,
}

impl KeyRange {
    /// Range matching exactly one key (start key == end key).
    pub fn exact(key: impl Into<Value>) -> Self {
        let key = key.into();
        Self {
            start_key: key.clone(),
            end_key: key,
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        collate(&self.start_key, key) != Ordering::Greater
            && collate(key, &self.end_key) != Ordering::Greater
    }
}

/// One row of a view result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ViewRow {
    pub id: DocumentKey,
    pub key: Value,
    pub value: Document,
}

/// View key collation: null < booleans < numbers < strings < arrays < objects.
pub fn collate(a: &Value, b: &Value) -> Ordering {
    let rank = |value: &Value| match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    };
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ordering = collate(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((left_key, left), (right_key, right)) in x.iter().zip(y.iter()) {
                let ordering = left_key
                    .cmp(right_key)
                    .then_with(|| collate(left, right));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}
