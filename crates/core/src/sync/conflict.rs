//! Conflict resolution policies for diverging local and remote versions.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PendingMutation, RemoteEntity};
use crate::entities::{EntityType, Record};

/// Key under which merge provenance is stamped into a merged payload.
pub const MERGE_PROVENANCE_FIELD: &str = "_merge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Local edit is authoritative: re-submit it over the server version.
    KeepLocal,
    /// Server wins: drop the local mutations and adopt the server payload.
    KeepServer,
    /// Server payload overlaid with the fields changed locally.
    Merge,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::KeepLocal => "keep-local",
            ConflictPolicy::KeepServer => "keep-server",
            ConflictPolicy::Merge => "merge",
        }
    }
}

/// Policy table. Every entity type the app syncs is listed explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPolicies {
    pub default_policy: ConflictPolicy,
    pub per_entity: HashMap<EntityType, ConflictPolicy>,
}

impl Default for ConflictPolicies {
    fn default() -> Self {
        let mut per_entity = HashMap::new();
        // Mission status is owned by the back office.
        per_entity.insert(EntityType::Mission, ConflictPolicy::KeepServer);
        // A checker's own unsynced checklist entry is authoritative.
        per_entity.insert(EntityType::ChecklistEntry, ConflictPolicy::KeepLocal);
        Self {
            default_policy: ConflictPolicy::KeepServer,
            per_entity,
        }
    }
}

impl ConflictPolicies {
    pub fn for_entity(&self, entity_type: EntityType) -> ConflictPolicy {
        self.per_entity
            .get(&entity_type)
            .copied()
            .unwrap_or(self.default_policy)
    }

    pub fn with_policy(mut self, entity_type: EntityType, policy: ConflictPolicy) -> Self {
        self.per_entity.insert(entity_type, policy);
        self
    }
}

/// Outcome of applying a policy to one conflicting entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Overwrite the local record with the server copy; drop the queued mutations.
    AcceptServer { payload: serde_json::Value },
    /// Replace the queued mutations with one update carrying `payload`.
    Resubmit { payload: serde_json::Value },
    /// The entity was deleted locally and the local side wins: delete it again.
    ResubmitDelete,
}

/// Top-level payload fields touched by the queued local mutations.
pub fn changed_fields(mutations: &[PendingMutation]) -> BTreeSet<String> {
    mutations
        .iter()
        .filter_map(|m| m.payload.as_object())
        .flat_map(|obj| obj.keys().cloned())
        .filter(|key| key != MERGE_PROVENANCE_FIELD)
        .collect()
}

/// Field-level merge: start from the server payload and overlay only the locally changed fields.
pub fn merge_payloads(
    server: &serde_json::Value,
    local: &serde_json::Value,
    changed: &BTreeSet<String>,
) -> serde_json::Value {
    let mut merged = match server.as_object() {
        Some(obj) => obj.clone(),
        None => serde_json::Map::new(),
    };
    if let Some(local_obj) = local.as_object() {
        for field in changed {
            match local_obj.get(field) {
                Some(value) => {
                    merged.insert(field.clone(), value.clone());
                }
                None => {
                    merged.remove(field);
                }
            }
        }
    }
    merged.remove(MERGE_PROVENANCE_FIELD);
    serde_json::Value::Object(merged)
}

/// Apply `policy` to a conflicting entity.
///
/// `local` is the cached record (absent when the entity was deleted locally) and `queued`
/// the entity's outbox tail in creation order.
pub fn resolve(
    policy: ConflictPolicy,
    local: Option<&Record>,
    server: &RemoteEntity,
    queued: &[PendingMutation],
    now: DateTime<Utc>,
) -> Resolution {
    let local_payload = local.map(|record| &record.payload);
    match (policy, local_payload) {
        (ConflictPolicy::KeepServer, _) => Resolution::AcceptServer {
            payload: server.payload.clone(),
        },
        (_, None) => Resolution::ResubmitDelete,
        (ConflictPolicy::KeepLocal, Some(payload)) => {
            let mut payload = payload.clone();
            if let Some(obj) = payload.as_object_mut() {
                obj.remove(MERGE_PROVENANCE_FIELD);
            }
            Resolution::Resubmit { payload }
        }
        (ConflictPolicy::Merge, Some(payload)) => {
            let changed = changed_fields(queued);
            let mut merged = merge_payloads(&server.payload, payload, &changed);
            if let Some(obj) = merged.as_object_mut() {
                obj.insert(
                    MERGE_PROVENANCE_FIELD.to_string(),
                    serde_json::json!({
                        "mergedAt": now.to_rfc3339(),
                        "serverVersion": server.server_version,
                        "localVersion": local.map(|r| r.local_updated_at.to_rfc3339()),
                    }),
                );
            }
            Resolution::Resubmit { payload: merged }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{MutationOperation, OutboxStatus};
    use serde_json::json;

    fn queued(payload: serde_json::Value) -> PendingMutation {
        PendingMutation {
            id: "m1".to_string(),
            seq: 1,
            entity_type: EntityType::ChecklistEntry,
            entity_id: "c1".to_string(),
            operation: MutationOperation::Update,
            payload,
            base_version: Some("1".to_string()),
            status: OutboxStatus::Conflict,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
            next_retry_at: None,
        }
    }

    fn server() -> RemoteEntity {
        RemoteEntity {
            id: "c1".to_string(),
            payload: json!({ "checked": false, "comment": "server note", "label": "Boiler" }),
            server_version: "5".to_string(),
        }
    }

    fn local() -> Record {
        let mut record = Record::from_remote(
            EntityType::ChecklistEntry,
            "c1",
            json!({ "checked": false, "comment": "old note", "label": "Boiler" }),
            "1",
        );
        record
            .apply_local_patch(&json!({ "checked": true }))
            .unwrap();
        record
    }

    #[test]
    fn default_policies_are_explicit_per_entity() {
        let policies = ConflictPolicies::default();
        assert_eq!(policies.for_entity(EntityType::Mission), ConflictPolicy::KeepServer);
        assert_eq!(
            policies.for_entity(EntityType::ChecklistEntry),
            ConflictPolicy::KeepLocal
        );
        let overridden = policies.with_policy(EntityType::Mission, ConflictPolicy::Merge);
        assert_eq!(overridden.for_entity(EntityType::Mission), ConflictPolicy::Merge);
    }

    #[test]
    fn merge_overlays_only_changed_fields() {
        let changed = changed_fields(&[queued(json!({ "checked": true }))]);
        let merged = merge_payloads(&server().payload, &local().payload, &changed);

        // the stale local comment must not clobber the server's newer one
        assert_eq!(
            merged,
            json!({ "checked": true, "comment": "server note", "label": "Boiler" })
        );
    }

    #[test]
    fn merge_stamps_provenance() {
        let now = Utc::now();
        let record = local();
        let resolution = resolve(
            ConflictPolicy::Merge,
            Some(&record),
            &server(),
            &[queued(json!({ "checked": true }))],
            now,
        );
        let Resolution::Resubmit { payload } = resolution else {
            panic!("merge must resubmit");
        };
        assert_eq!(payload["checked"], json!(true));
        assert_eq!(payload["_merge"]["serverVersion"], json!("5"));
        assert_eq!(payload["_merge"]["mergedAt"], json!(now.to_rfc3339()));
        assert_eq!(
            payload["_merge"]["localVersion"],
            json!(record.local_updated_at.to_rfc3339())
        );
    }

    #[test]
    fn keep_local_resubmits_local_payload() {
        let resolution = resolve(
            ConflictPolicy::KeepLocal,
            Some(&local()),
            &server(),
            &[queued(json!({ "checked": true }))],
            Utc::now(),
        );
        assert_eq!(
            resolution,
            Resolution::Resubmit {
                payload: json!({ "checked": true, "comment": "old note", "label": "Boiler" })
            }
        );
    }

    #[test]
    fn keep_server_accepts_server_payload() {
        assert_eq!(
            resolve(ConflictPolicy::KeepServer, Some(&local()), &server(), &[], Utc::now()),
            Resolution::AcceptServer {
                payload: server().payload,
            }
        );
        assert_eq!(
            resolve(ConflictPolicy::KeepServer, None, &server(), &[], Utc::now()),
            Resolution::AcceptServer {
                payload: server().payload,
            }
        );
    }

    #[test]
    fn local_delete_wins_under_keep_local() {
        assert_eq!(
            resolve(ConflictPolicy::KeepLocal, None, &server(), &[], Utc::now()),
            Resolution::ResubmitDelete
        );
    }

    #[test]
    fn changed_fields_unions_the_tail() {
        let fields = changed_fields(&[
            queued(json!({ "checked": true })),
            queued(json!({ "comment": "x", "_merge": {} })),
        ]);
        assert_eq!(
            fields.into_iter().collect::<Vec<_>>(),
            vec!["checked".to_string(), "comment".to_string()]
        );
    }
}
