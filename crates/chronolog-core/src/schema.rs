//! Device type descriptor
//!
//! The schema tells the archive which properties a device has, their value type and
//! whether changes are archived at all. A copy is appended to the schema archive
//! every time it changes so that past configurations can be reconstructed with the
//! structure that was valid back then.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::ValueType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivePolicy {
    #[default]
    EveryEvent,
    NoArchiving,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub value_type: ValueType,
    #[serde(default)]
    pub archive_policy: ArchivePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PropertyDescriptor {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            archive_policy: ArchivePolicy::EveryEvent,
            description: None,
        }
    }

    pub fn not_archived(value_type: ValueType) -> Self {
        Self {
            archive_policy: ArchivePolicy::NoArchiving,
            ..Self::new(value_type)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSchema {
    pub class_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDescriptor>,
}

impl DeviceSchema {
    pub fn new(class_id: impl Into<String>) -> Self {
        Self {
            class_id: class_id.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, path: impl Into<String>, descriptor: PropertyDescriptor) -> Self {
        self.properties.insert(path.into(), descriptor);
        self
    }

    pub fn has(&self, path: &str) -> bool {
        self.properties.contains_key(path)
    }

    /// True when the property exists and its changes are written to the archive.
    pub fn is_archived(&self, path: &str) -> bool {
        self.properties
            .get(path)
            .is_some_and(|p| p.archive_policy != ArchivePolicy::NoArchiving)
    }

    /// Single-line serialized form stored in the schema archive.
    pub fn to_archive_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_archive_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text.trim())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motor_schema() -> DeviceSchema {
        DeviceSchema::new("Motor")
            .with_property("position", PropertyDescriptor::new(ValueType::Double))
            .with_property("state", PropertyDescriptor::new(ValueType::String))
            .with_property("debugBuffer", PropertyDescriptor::not_archived(ValueType::VectorUInt8))
    }

    #[test]
    fn test_archive_policy() {
        let schema = motor_schema();
        assert!(schema.is_archived("position"));
        assert!(schema.has("debugBuffer"));
        assert!(!schema.is_archived("debugBuffer"));
        assert!(!schema.is_archived("missing"));
    }

    #[test]
    fn test_archive_string_is_single_line() {
        let mut schema = motor_schema();
        schema.properties.get_mut("state").unwrap().description = Some("multi\nline".to_string());
        let text = schema.to_archive_string().unwrap();
        assert!(!text.contains('\n'));
        assert_eq!(DeviceSchema::from_archive_str(&text).unwrap(), schema);
    }

    #[test]
    fn test_policy_defaults_when_absent() {
        let schema = DeviceSchema::from_archive_str(
            r#"{"class_id":"Cam","properties":{"gain":{"value_type":"FLOAT"}}}"#,
        )
        .unwrap();
        assert!(schema.is_archived("gain"));
        assert_eq!(schema.properties["gain"].value_type, ValueType::Float);
    }
}
