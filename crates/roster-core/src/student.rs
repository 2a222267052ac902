//! Student identifiers and records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validation::{Validate, ValidationError, ValidationErrors};

/// Schema-less attribute map of a student record.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Opaque, unique student identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StudentId(String);

impl StudentId {
    /// Longest accepted identifier, in characters.
    pub const MAX_LEN: usize = 128;

    /// Generates a fresh, time-ordered identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Parses a caller-supplied identifier.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the identifier is empty, too long, or
    /// contains `/` or control characters.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ValidationError::required("studentId"));
        }
        if raw.chars().count() > Self::MAX_LEN {
            return Err(ValidationError::range(
                "studentId",
                format!("must be at most {} characters", Self::MAX_LEN),
            ));
        }
        if raw.chars().any(|c| c == '/' || c.is_control()) {
            return Err(ValidationError::format(
                "studentId",
                "must not contain '/' or control characters",
            ));
        }
        Ok(Self(raw))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StudentId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<StudentId> for String {
    fn from(id: StudentId) -> Self {
        id.0
    }
}

/// Size limits applied to attribute maps.
///
/// Defaults follow the item constraints of the key-value table the service is
/// deployed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttributeLimits {
    /// Maximum number of attributes per record.
    pub max_attributes: usize,
    /// Maximum attribute name length in bytes.
    pub max_key_bytes: usize,
    /// Maximum serialized size of the attribute map in bytes.
    pub max_item_bytes: usize,
}

impl Default for AttributeLimits {
    fn default() -> Self {
        Self {
            max_attributes: 100,
            max_key_bytes: 255,
            max_item_bytes: 400 * 1024,
        }
    }
}

impl AttributeLimits {
    /// Attribute name that may never be used; the identifier lives outside the map.
    pub const RESERVED_KEY: &'static str = "studentId";

    /// Checks an attribute map against these limits, collecting every failure.
    ///
    /// # Errors
    ///
    /// Returns all violated limits.
    pub fn check(&self, attributes: &Attributes) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if attributes.len() > self.max_attributes {
            errors.add(ValidationError::range(
                "attributes",
                format!(
                    "{} attributes given, at most {} allowed",
                    attributes.len(),
                    self.max_attributes
                ),
            ));
        }

        for key in attributes.keys() {
            if key.is_empty() {
                errors.add(ValidationError::format(
                    "attributes",
                    "attribute names must not be empty",
                ));
            } else if key.len() > self.max_key_bytes {
                errors.add(ValidationError::range(
                    format!("attributes.{key}"),
                    format!("attribute name exceeds {} bytes", self.max_key_bytes),
                ));
            } else if key == Self::RESERVED_KEY {
                errors.add(ValidationError::constraint(
                    format!("attributes.{key}"),
                    "the student identifier cannot be set as an attribute",
                ));
            }
        }

        // serde_json cannot fail to serialize a Map of Values.
        let size = serde_json::to_vec(attributes).map_or(0, |bytes| bytes.len());
        if size > self.max_item_bytes {
            errors.add(ValidationError::range(
                "attributes",
                format!("serialized size {size} exceeds {} bytes", self.max_item_bytes),
            ));
        }

        errors.into_result()
    }
}

/// A stored student record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    /// Primary key.
    pub student_id: StudentId,

    /// Caller-defined fields.
    pub attributes: Attributes,

    /// Write counter used for conditional writes; starts at 1.
    pub version: u64,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl StudentRecord {
    /// Creates a first-version record.
    #[must_use]
    pub fn new(student_id: StudentId, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            student_id,
            attributes,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the next version of this record carrying `attributes`.
    #[must_use]
    pub fn next_version(&self, attributes: Attributes) -> Self {
        Self {
            student_id: self.student_id.clone(),
            attributes,
            version: self.version + 1,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

impl Validate for StudentRecord {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if let Err(e) = StudentId::parse(self.student_id.as_str()) {
            errors.add(e);
        }
        if let Err(e) = AttributeLimits::default().check(&self.attributes) {
            errors.merge(e);
        }
        if self.version == 0 {
            errors.add(ValidationError::range("version", "must be at least 1"));
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: serde_json::Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_generated_ids_are_unique_and_valid() {
        let a = StudentId::generate();
        let b = StudentId::generate();
        assert_ne!(a, b);
        assert!(StudentId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert!(StudentId::parse("").is_err());
        assert!(StudentId::parse("a/b").is_err());
        assert!(StudentId::parse("tab\there").is_err());
        assert!(StudentId::parse("x".repeat(129)).is_err());
        assert!(StudentId::parse("x".repeat(128)).is_ok());
    }

    #[test]
    fn test_student_id_serde_validates() {
        let id: StudentId = serde_json::from_str("\"S1\"").unwrap();
        assert_eq!(id.as_str(), "S1");
        assert!(serde_json::from_str::<StudentId>("\"\"").is_err());
    }

    #[test]
    fn test_limits_accept_plain_attributes() {
        let limits = AttributeLimits::default();
        assert!(limits.check(&attrs(json!({ "name": "Asha", "year": 2 }))).is_ok());
        assert!(limits.check(&Attributes::new()).is_ok());
    }

    #[test]
    fn test_limits_reject_reserved_and_empty_keys() {
        let limits = AttributeLimits::default();
        let errors = limits
            .check(&attrs(json!({ "studentId": "x", "": 1 })))
            .unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_limits_reject_oversized_maps() {
        let limits = AttributeLimits {
            max_attributes: 2,
            max_key_bytes: 4,
            max_item_bytes: 32,
        };
        let errors = limits
            .check(&attrs(json!({
                "a": 1,
                "b": 2,
                "long-key": "0123456789012345678901234567890123456789"
            })))
            .unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.clone()).collect();
        assert!(fields.contains(&"attributes".to_string()));
        assert!(fields.contains(&"attributes.long-key".to_string()));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_next_version_increments() {
        let record = StudentRecord::new(StudentId::generate(), attrs(json!({ "name": "Asha" })));
        let next = record.next_version(attrs(json!({ "name": "Asha K" })));
        assert_eq!(next.version, 2);
        assert_eq!(next.created_at, record.created_at);
        assert!(next.updated_at >= record.updated_at);
        assert_eq!(next.attributes["name"], "Asha K");
    }

    #[test]
    fn test_record_wire_format_is_camel_case() {
        let record = StudentRecord::new(
            StudentId::parse("S1").unwrap(),
            attrs(json!({ "name": "Asha" })),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["studentId"], "S1");
        assert_eq!(json["attributes"]["name"], "Asha");
        assert!(json.get("createdAt").is_some());
        assert!(record.is_valid());
    }
}
