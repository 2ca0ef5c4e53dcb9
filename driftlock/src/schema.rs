use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{SchemaIssue, SchemaViolation};

/// Semantic type of a document field, enforced on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    /// Opaque identifier; stored as a string.
    Identifier,
    String,
    /// RFC 3339 timestamp string.
    Date,
    Number,
    Bool,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::Identifier | FieldType::String => value.is_string(),
            FieldType::Date => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
            FieldType::Number => value.is_number(),
            FieldType::Bool => value.is_boolean(),
        }
    }

    fn expectation(&self) -> &'static str {
        match self {
            FieldType::Identifier => "an identifier string",
            FieldType::String => "a string",
            FieldType::Date => "an RFC 3339 date string",
            FieldType::Number => "a number",
            FieldType::Bool => "a boolean",
        }
    }
}

/// A named field with its semantic type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// A secondary index on one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub field: String,
    #[serde(default)]
    pub unique: bool,
    /// A sparse index skips documents where the field is absent or null.
    #[serde(default)]
    pub sparse: bool,
}

impl IndexSpec {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            unique: false,
            sparse: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }
}

/// Declarative structural contract for a collection: required fields with
/// semantic types, a designated unique key, and secondary indexes.
///
/// The contract is the enforcement point for document validation: backends
/// validate every insert against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    pub required: Vec<FieldSpec>,
    #[serde(default)]
    pub optional: Vec<FieldSpec>,
    /// The primary unique key field (always unique, never sparse).
    pub unique_key: String,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl SchemaContract {
    /// Validate a document against the contract.
    ///
    /// Checks that every required field is present and non-null, and that
    /// every present field (required or optional) matches its declared type.
    pub fn validate_document(&self, document: &Value) -> Result<(), SchemaViolation> {
        let Some(object) = document.as_object() else {
            return Err(SchemaViolation::single(
                "$",
                "not_an_object",
                "document must be a JSON object",
            ));
        };

        let mut issues = Vec::new();

        for field in &self.required {
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    issues.push(SchemaIssue::new(
                        &field.name,
                        "required",
                        format!("field '{}' is required", field.name),
                    ));
                }
                Some(value) => {
                    if !field.field_type.matches(value) {
                        issues.push(type_issue(field, value));
                    }
                }
            }
        }

        for field in &self.optional {
            if let Some(value) = object.get(&field.name)
                && !value.is_null()
                && !field.field_type.matches(value)
            {
                issues.push(type_issue(field, value));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(SchemaViolation::new(issues))
        }
    }

    /// Field spec for a name, searching required then optional fields.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .find(|f| f.name == name)
    }
}

fn type_issue(field: &FieldSpec, value: &Value) -> SchemaIssue {
    SchemaIssue::new(
        &field.name,
        "type",
        format!(
            "field '{}' must be {}, got {value}",
            field.name,
            field.field_type.expectation()
        ),
    )
}
