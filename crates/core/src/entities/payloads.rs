//! Schema'd payloads for the entity types the checker app works with.
//!
//! Records keep their payload as JSON so unknown server fields survive a round trip;
//! these types are the typed view over it.

use serde::{Deserialize, Serialize};

use super::{EntityType, Record};
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

/// A property inspection assigned to a checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mission {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub status: MissionStatus,
    #[serde(default)]
    pub scheduled_for: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One line of an inspection checklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistEntry {
    pub id: String,
    pub mission_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Partial update for a checklist entry; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistEntryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Typed payload union, tagged by entity type.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityPayload {
    Mission(Mission),
    ChecklistEntry(ChecklistEntry),
}

impl EntityPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPayload::Mission(_) => EntityType::Mission,
            EntityPayload::ChecklistEntry(_) => EntityType::ChecklistEntry,
        }
    }

    /// Decodes a record payload. The record id fills in a payload without `id`.
    pub fn decode(record: &Record) -> Result<Self> {
        let mut value = record.payload.clone();
        if let Some(obj) = value.as_object_mut() {
            obj.entry("id")
                .or_insert_with(|| serde_json::Value::String(record.id.clone()));
        }
        let decoded = match record.entity_type {
            EntityType::Mission => EntityPayload::Mission(serde_json::from_value(value)?),
            EntityType::ChecklistEntry => {
                EntityPayload::ChecklistEntry(serde_json::from_value(value)?)
            }
        };
        Ok(decoded)
    }

    pub fn into_mission(self) -> Result<Mission> {
        match self {
            EntityPayload::Mission(mission) => Ok(mission),
            other => Err(Error::invalid_payload(format!(
                "Expected mission payload, got {}",
                other.entity_type()
            ))),
        }
    }

    pub fn into_checklist_entry(self) -> Result<ChecklistEntry> {
        match self {
            EntityPayload::ChecklistEntry(entry) => Ok(entry),
            other => Err(Error::invalid_payload(format!(
                "Expected checklist-entry payload, got {}",
                other.entity_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_mission_keeps_unknown_fields() {
        let record = Record::from_remote(
            EntityType::Mission,
            "m1",
            json!({ "status": "in_progress", "title": "Flat 3B", "floor": 3 }),
            "7",
        );

        let mission = EntityPayload::decode(&record)
            .unwrap()
            .into_mission()
            .unwrap();

        assert_eq!(mission.id, "m1");
        assert_eq!(mission.status, MissionStatus::InProgress);
        assert_eq!(mission.extra.get("floor"), Some(&json!(3)));
    }

    #[test]
    fn decode_rejects_wrong_variant() {
        let record = Record::new_local(
            EntityType::ChecklistEntry,
            "c1",
            json!({ "missionId": "m1", "checked": true }),
        );
        let payload = EntityPayload::decode(&record).unwrap();
        assert_eq!(payload.entity_type(), EntityType::ChecklistEntry);
        assert!(payload.into_mission().is_err());
    }

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = ChecklistEntryPatch {
            checked: Some(true),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({ "checked": true }));
    }
}
