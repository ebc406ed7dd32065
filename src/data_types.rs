use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

pub type CollectionId = String;
pub type FieldId = String;
pub type RecordId = String;
/// RFC 3339 UTC timestamp with microsecond precision, e.g. `2024-05-01T10:00:00.000000Z`
pub type Timestamp = String;

/// A dynamic row: system fields plus whatever the owning collection defines
pub type Record = serde_json::Map<String, Value>;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub const ID: &str = "id";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const EMAIL: &str = "email";
pub const PASSWORD_HASH: &str = "password_hash";
pub const VERIFIED: &str = "verified";

const BASE_SYSTEM_FIELDS: &[&str] = &[ID, CREATED_AT, UPDATED_AT];
const AUTH_SYSTEM_FIELDS: &[&str] = &[ID, CREATED_AT, UPDATED_AT, EMAIL, PASSWORD_HASH, VERIFIED];

pub fn timestamp_now() -> Timestamp {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CollectionType {
    #[default]
    Base,
    Auth,
}

impl CollectionType {
    pub fn system_fields(&self) -> &'static [&'static str] {
        match self {
            CollectionType::Base => BASE_SYSTEM_FIELDS,
            CollectionType::Auth => AUTH_SYSTEM_FIELDS,
        }
    }

    pub fn is_system_field(&self, name: &str) -> bool {
        self.system_fields()
            .iter()
            .any(|system| system.eq_ignore_ascii_case(name))
    }
}

/// Access rule expressions for the five record operations. They are stored
/// verbatim and only ever handed to an external `AccessChecker`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRules {
    pub list: Option<String>,
    pub view: Option<String>,
    pub create: Option<String>,
    pub update: Option<String>,
    pub delete: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    #[serde(rename = "type")]
    pub collection_type: CollectionType,
    pub rules: CollectionRules,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    Datetime,
    Json,
    Relation,
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumberOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Reject values with a fractional part
    pub integer: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatetimeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationOptions {
    /// Target collection. Accepts a collection name when defining a field; the
    /// catalog always stores the resolved collection id.
    pub collection_id: CollectionId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mime_types: Vec<String>,
}

/// Field type together with its type-specific options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldKind {
    Text(TextOptions),
    Number(NumberOptions),
    Boolean,
    Datetime(DatetimeOptions),
    Json,
    Relation(RelationOptions),
    File(FileOptions),
}

impl FieldKind {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldKind::Text(_) => FieldType::Text,
            FieldKind::Number(_) => FieldType::Number,
            FieldKind::Boolean => FieldType::Boolean,
            FieldKind::Datetime(_) => FieldType::Datetime,
            FieldKind::Json => FieldType::Json,
            FieldKind::Relation(_) => FieldType::Relation,
            FieldKind::File(_) => FieldType::File,
        }
    }

    pub fn relation_target(&self) -> Option<&str> {
        match self {
            FieldKind::Relation(RelationOptions { collection_id }) => {
                Some(collection_id.as_str())
            }
            _ => None,
        }
    }

    /// Options without the type tag, as persisted in the catalog
    pub fn options_json(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = value {
            map.remove("type");
        }
        serde_json::to_string(&value)
    }

    pub fn from_parts(field_type: FieldType, options: &str) -> serde_json::Result<Self> {
        let mut value: Value = serde_json::from_str(options)?;
        match value {
            Value::Object(ref mut map) => {
                map.insert("type".to_string(), Value::String(field_type.to_string()));
            }
            _ => {
                value = serde_json::json!({ "type": field_type.to_string() });
            }
        }
        serde_json::from_value(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: FieldId,
    pub collection_id: CollectionId,
    pub name: String,
    pub required: bool,
    #[serde(flatten)]
    pub kind: FieldKind,
    pub position: i64,
    pub created_at: Timestamp,
}

/// User-supplied definition of a field, before it gets an id and a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl FieldDefinition {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            required: false,
            kind,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, FieldKind::Text(TextOptions::default()))
    }

    pub fn number(name: &str) -> Self {
        Self::new(name, FieldKind::Number(NumberOptions::default()))
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn datetime(name: &str) -> Self {
        Self::new(name, FieldKind::Datetime(DatetimeOptions::default()))
    }

    pub fn json(name: &str) -> Self {
        Self::new(name, FieldKind::Json)
    }

    pub fn relation(name: &str, target: &str) -> Self {
        Self::new(
            name,
            FieldKind::Relation(RelationOptions {
                collection_id: target.to_string(),
            }),
        )
    }

    pub fn file(name: &str) -> Self {
        Self::new(name, FieldKind::File(FileOptions::default()))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

impl From<&Field> for FieldDefinition {
    fn from(field: &Field) -> Self {
        Self {
            name: field.name.clone(),
            required: field.required,
            kind: field.kind.clone(),
        }
    }
}

/// A collection together with its fields, in column order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    #[serde(flatten)]
    pub collection: Collection,
    pub fields: Vec<Field>,
}

impl CollectionSchema {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}
