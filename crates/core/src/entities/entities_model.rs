//! Locally cached entity snapshots.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Entity kinds the engine caches and synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    Mission,
    ChecklistEntry,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::Mission, EntityType::ChecklistEntry];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Mission => "mission",
            EntityType::ChecklistEntry => "checklist-entry",
        }
    }

    /// Local store partition holding records of this type.
    pub fn partition(&self) -> &'static str {
        match self {
            EntityType::Mission => "missions",
            EntityType::ChecklistEntry => "checklist-entries",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "mission" => Ok(EntityType::Mission),
            "checklist-entry" => Ok(EntityType::ChecklistEntry),
            other => Err(Error::invalid_payload(format!(
                "Unknown entity type '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronization state of a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(Error::storage(format!("Unknown sync status '{}'", other))),
        }
    }
}

/// An application entity snapshot cached locally.
///
/// A `synced` record always carries the `server_version` it was cached at. Local edits flip
/// the status to `pending` in the same transaction that makes them visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub entity_type: EntityType,
    pub payload: serde_json::Value,
    pub sync_status: SyncStatus,
    pub local_updated_at: DateTime<Utc>,
    pub server_version: Option<String>,
    pub cached_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Snapshot of a remote entity as it was just read from the server.
    pub fn from_remote(
        entity_type: EntityType,
        id: impl Into<String>,
        payload: serde_json::Value,
        server_version: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            entity_type,
            payload,
            sync_status: SyncStatus::Synced,
            local_updated_at: now,
            server_version: Some(server_version.into()),
            cached_at: Some(now),
        }
    }

    /// Record created locally, not yet known to the server.
    pub fn new_local(entity_type: EntityType, id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            entity_type,
            payload,
            sync_status: SyncStatus::Pending,
            local_updated_at: Utc::now(),
            server_version: None,
            cached_at: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.id.clone())
    }

    pub fn is_synced(&self) -> bool {
        self.sync_status == SyncStatus::Synced
    }

    /// Applies a partial payload over the current one and marks the record pending.
    ///
    /// `local_updated_at` strictly increases even when the wall clock does not.
    pub fn apply_local_patch(&mut self, patch: &serde_json::Value) -> Result<()> {
        let patch_obj = patch
            .as_object()
            .ok_or_else(|| Error::invalid_payload("Partial payload must be a JSON object"))?;
        if !self.payload.is_object() {
            self.payload = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(target) = self.payload.as_object_mut() {
            for (key, value) in patch_obj {
                target.insert(key.clone(), value.clone());
            }
        }
        self.sync_status = SyncStatus::Pending;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.local_updated_at = next_local_timestamp(self.local_updated_at);
    }
}

/// Next monotonic local timestamp after `previous`.
pub fn next_local_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

/// `(entity_type, id)` pair identifying one entity across local and remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

/// Equality filter over a partition.
///
/// `sync_status` is served by the secondary index; `fields` match top-level payload fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub sync_status: Option<SyncStatus>,
    pub fields: Vec<(String, serde_json::Value)>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: SyncStatus) -> Self {
        Self {
            sync_status: Some(status),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        if let Some(status) = self.sync_status {
            if record.sync_status != status {
                return false;
            }
        }
        self.matches_fields(&record.payload)
    }

    pub fn matches_fields(&self, payload: &serde_json::Value) -> bool {
        self.fields
            .iter()
            .all(|(name, expected)| payload.get(name) == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_type_serialization_matches_partition_contract() {
        assert_eq!(
            serde_json::to_string(&EntityType::ChecklistEntry).unwrap(),
            "\"checklist-entry\""
        );
        assert_eq!(EntityType::Mission.partition(), "missions");
        assert_eq!(EntityType::ChecklistEntry.partition(), "checklist-entries");
        assert_eq!(
            EntityType::parse("checklist-entry").unwrap(),
            EntityType::ChecklistEntry
        );
        assert!(EntityType::parse("report").is_err());
    }

    #[test]
    fn local_patch_overlays_fields_and_marks_pending() {
        let mut record = Record::from_remote(
            EntityType::Mission,
            "1",
            json!({ "status": "planned", "title": "Flat 3B" }),
            "4",
        );
        let before = record.local_updated_at;

        record
            .apply_local_patch(&json!({ "status": "in_progress" }))
            .unwrap();

        assert_eq!(
            record.payload,
            json!({ "status": "in_progress", "title": "Flat 3B" })
        );
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.server_version.as_deref(), Some("4"));
        assert!(record.local_updated_at > before);
    }

    #[test]
    fn local_patch_rejects_non_object() {
        let mut record = Record::new_local(EntityType::Mission, "1", json!({}));
        assert!(record.apply_local_patch(&json!("status")).is_err());
    }

    #[test]
    fn local_timestamps_are_strictly_monotonic() {
        let future = Utc::now() + Duration::seconds(60);
        let next = next_local_timestamp(future);
        assert_eq!(next, future + Duration::milliseconds(1));
    }

    #[test]
    fn filter_matches_status_and_payload_fields() {
        let record = Record::new_local(
            EntityType::ChecklistEntry,
            "c1",
            json!({ "missionId": "m1", "checked": true }),
        );
        assert!(RecordFilter::all().matches(&record));
        assert!(RecordFilter::with_status(SyncStatus::Pending)
            .field("missionId", json!("m1"))
            .matches(&record));
        assert!(!RecordFilter::with_status(SyncStatus::Synced).matches(&record));
        assert!(!RecordFilter::all()
            .field("missionId", json!("m2"))
            .matches(&record));
    }
}
