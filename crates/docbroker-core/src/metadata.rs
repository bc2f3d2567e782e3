//! Typed document metadata.
//!
//! Repository list items expose their fields as loosely typed JSON keyed by internal column
//! names. A [`FieldMapping`] built once from configuration maps each logical field name to its
//! column and kind, and [`DocumentMetadata`] holds the coerced values.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrokerError;

/// Logical fields the engine itself reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownField {
    Title,
    PublicationDate,
    Classification,
    Author,
    MetadataComplete,
    ExportStatus,
    ExportMessage,
}

impl WellKnownField {
    pub fn name(&self) -> &'static str {
        match self {
            WellKnownField::Title => "Title",
            WellKnownField::PublicationDate => "PublicationDate",
            WellKnownField::Classification => "Classification",
            WellKnownField::Author => "Author",
            WellKnownField::MetadataComplete => "MetadataComplete",
            WellKnownField::ExportStatus => "ExportStatus",
            WellKnownField::ExportMessage => "ExportMessage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Boolean,
    DateTime,
    /// A person column; coerced to the person's e-mail address.
    Person,
    /// A lookup or managed-metadata column; coerced to its label.
    Lookup,
}

/// Mapping of one logical field to its repository column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub name: String,
    pub column: String,
    pub kind: FieldKind,
    /// Required fields must be populated before a document is exported.
    #[serde(default)]
    pub required: bool,
    /// Public fields are included in the callback view.
    #[serde(default)]
    pub public: bool,
}

/// A coerced field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Empty,
    Boolean(bool),
    Number(f64),
    DateTime(DateTime<Utc>),
    Text(String),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Empty => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    fn coerce(kind: FieldKind, raw: &Value) -> FieldValue {
        match (kind, raw) {
            (_, Value::Null) => FieldValue::Empty,
            (FieldKind::Text, Value::String(s)) => FieldValue::Text(s.clone()),
            (FieldKind::Text, Value::Number(n)) => FieldValue::Text(n.to_string()),
            (FieldKind::Text | FieldKind::Lookup, Value::Object(o)) => o
                .get("Label")
                .or_else(|| o.get("LookupValue"))
                .and_then(Value::as_str)
                .map(|s| FieldValue::Text(s.to_string()))
                .unwrap_or(FieldValue::Empty),
            (FieldKind::Lookup, Value::String(s)) => FieldValue::Text(s.clone()),
            (FieldKind::Number, Value::Number(n)) => {
                n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Empty)
            }
            (FieldKind::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(FieldValue::Number)
                .unwrap_or(FieldValue::Empty),
            (FieldKind::Boolean, Value::Bool(b)) => FieldValue::Boolean(*b),
            (FieldKind::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => FieldValue::Boolean(true),
                "false" | "no" | "0" => FieldValue::Boolean(false),
                _ => FieldValue::Empty,
            },
            (FieldKind::Boolean, Value::Number(n)) => FieldValue::Boolean(n.as_i64() == Some(1)),
            (FieldKind::DateTime, Value::String(s)) => parse_datetime(s)
                .map(FieldValue::DateTime)
                .unwrap_or(FieldValue::Empty),
            (FieldKind::Person, Value::String(s)) => FieldValue::Text(s.clone()),
            (FieldKind::Person, Value::Object(o)) => o
                .get("Email")
                .or_else(|| o.get("email"))
                .and_then(Value::as_str)
                .map(|s| FieldValue::Text(s.to_string()))
                .unwrap_or(FieldValue::Empty),
            _ => FieldValue::Empty,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            FieldValue::Empty => Value::Null,
            FieldValue::Boolean(b) => Value::Bool(*b),
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::DateTime(dt) => Value::String(dt.to_rfc3339()),
            FieldValue::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (midnight UTC).
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Logical-name to column mapping, validated once at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FieldDescriptor>", into = "Vec<FieldDescriptor>")]
pub struct FieldMapping {
    fields: Vec<FieldDescriptor>,
    by_name: BTreeMap<String, usize>,
}

impl FieldMapping {
    pub fn new(fields: Vec<FieldDescriptor>) -> Result<Self, BrokerError> {
        let mut by_name = BTreeMap::new();
        for (index, field) in fields.iter().enumerate() {
            if field.name.is_empty() || field.column.is_empty() {
                return Err(BrokerError::Config(format!(
                    "field mapping entry {} has an empty name or column",
                    index
                )));
            }
            if by_name.insert(field.name.clone(), index).is_some() {
                return Err(BrokerError::Config(format!(
                    "field {} is mapped more than once",
                    field.name
                )));
            }
        }
        Ok(Self { fields, by_name })
    }

    pub fn descriptor(&self, name: &str) -> Option<&FieldDescriptor> {
        self.by_name.get(name).map(|&index| &self.fields[index])
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Coerce raw repository fields into typed metadata. Unmapped columns are ignored.
    pub fn read(&self, raw: &Map<String, Value>) -> DocumentMetadata {
        let values = self
            .fields
            .iter()
            .map(|field| {
                let value = raw
                    .get(&field.column)
                    .map(|v| FieldValue::coerce(field.kind, v))
                    .unwrap_or(FieldValue::Empty);
                (field.name.clone(), value)
            })
            .collect();
        DocumentMetadata { values }
    }

    /// Build a repository field patch from logical values. Unmapped names are rejected.
    pub fn write(
        &self,
        values: &[(WellKnownField, FieldValue)],
    ) -> Result<Map<String, Value>, BrokerError> {
        let mut patch = Map::new();
        for (field, value) in values {
            let descriptor = self.descriptor(field.name()).ok_or_else(|| {
                BrokerError::Config(format!("field {} is not mapped", field.name()))
            })?;
            patch.insert(descriptor.column.clone(), value.to_json());
        }
        Ok(patch)
    }
}

impl TryFrom<Vec<FieldDescriptor>> for FieldMapping {
    type Error = BrokerError;

    fn try_from(fields: Vec<FieldDescriptor>) -> Result<Self, Self::Error> {
        FieldMapping::new(fields)
    }
}

impl From<FieldMapping> for Vec<FieldDescriptor> {
    fn from(mapping: FieldMapping) -> Self {
        mapping.fields
    }
}

/// Typed metadata of one document, keyed by logical field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentMetadata {
    values: BTreeMap<String, FieldValue>,
}

impl DocumentMetadata {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name).filter(|v| !v.is_empty())
    }

    pub fn text(&self, field: WellKnownField) -> Option<&str> {
        match self.get(field.name()) {
            Some(FieldValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn flag(&self, field: WellKnownField) -> bool {
        matches!(self.get(field.name()), Some(FieldValue::Boolean(true)))
    }

    pub fn publication_date(&self) -> Option<DateTime<Utc>> {
        match self.get(WellKnownField::PublicationDate.name()) {
            Some(FieldValue::DateTime(dt)) => Some(*dt),
            _ => None,
        }
    }

    /// Whether the document carries real metadata: at least one value, and every required field.
    ///
    /// Freshly uploaded files have default (empty) metadata until the author fills the form.
    pub fn is_populated(&self, mapping: &FieldMapping) -> bool {
        let any_value = self.values.values().any(|v| !v.is_empty());
        let required_present = mapping
            .fields()
            .iter()
            .filter(|f| f.required)
            .all(|f| self.get(&f.name).is_some());
        any_value && required_present
    }

    /// All values as a JSON object (side-car form).
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }

    /// Only the fields marked public, for the callback body.
    pub fn public_view(&self, mapping: &FieldMapping) -> Map<String, Value> {
        mapping
            .fields()
            .iter()
            .filter(|f| f.public)
            .map(|f| {
                let value = self
                    .values
                    .get(&f.name)
                    .map(FieldValue::to_json)
                    .unwrap_or(Value::Null);
                (f.name.clone(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping() -> FieldMapping {
        serde_json::from_value(json!([
            {"name": "Title", "column": "Title", "kind": "text", "required": true, "public": true},
            {"name": "PublicationDate", "column": "PubDate", "kind": "date_time", "public": true},
            {"name": "Classification", "column": "Klass", "kind": "lookup"},
            {"name": "Author", "column": "Owner", "kind": "person"},
            {"name": "MetadataComplete", "column": "Complete", "kind": "boolean"},
            {"name": "ExportStatus", "column": "Status", "kind": "text"}
        ]))
        .unwrap()
    }

    #[test]
    fn test_read_coerces_kinds() {
        let raw = json!({
            "Title": "Annual report",
            "PubDate": "2024-03-01",
            "Klass": {"Label": "Public", "TermGuid": "x"},
            "Owner": {"Email": "author@example.com"},
            "Complete": "Yes",
            "Unmapped": 42
        });
        let metadata = mapping().read(raw.as_object().unwrap());

        assert_eq!(metadata.text(WellKnownField::Title), Some("Annual report"));
        assert_eq!(metadata.text(WellKnownField::Classification), Some("Public"));
        assert_eq!(metadata.text(WellKnownField::Author), Some("author@example.com"));
        assert!(metadata.flag(WellKnownField::MetadataComplete));
        assert_eq!(
            metadata.publication_date().unwrap().to_rfc3339(),
            "2024-03-01T00:00:00+00:00"
        );
        assert!(metadata.get("Unmapped").is_none());
    }

    #[test]
    fn test_is_populated_requires_required_fields() {
        let mapping = mapping();
        let empty = mapping.read(&Map::new());
        assert!(!empty.is_populated(&mapping));

        let no_title = mapping.read(json!({"Klass": "Internal"}).as_object().unwrap());
        assert!(!no_title.is_populated(&mapping));

        let ok = mapping.read(json!({"Title": "Doc"}).as_object().unwrap());
        assert!(ok.is_populated(&mapping));
    }

    #[test]
    fn test_public_view_and_write() {
        let mapping = mapping();
        let metadata = mapping.read(json!({"Title": "Doc", "Klass": "Secret"}).as_object().unwrap());
        let view = metadata.public_view(&mapping);
        assert_eq!(view.len(), 2);
        assert_eq!(view["Title"], "Doc");
        assert!(view["PublicationDate"].is_null());

        let patch = mapping
            .write(&[(WellKnownField::ExportStatus, FieldValue::Text("processed".into()))])
            .unwrap();
        assert_eq!(patch["Status"], "processed");
        assert!(mapping
            .write(&[(WellKnownField::ExportMessage, FieldValue::Empty)])
            .is_err());
    }

    #[test]
    fn test_duplicate_mapping_rejected() {
        let result: Result<FieldMapping, _> = serde_json::from_value(json!([
            {"name": "Title", "column": "A", "kind": "text"},
            {"name": "Title", "column": "B", "kind": "text"}
        ]));
        assert!(result.is_err());
    }
}
