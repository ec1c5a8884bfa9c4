//! Database model for cached records.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use fieldsync_core::entities::{EntityType, Record, SyncStatus};
use fieldsync_core::errors::Result;

use crate::errors::StorageError;

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(primary_key(entity_type, id))]
#[diesel(table_name = crate::schema::records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct RecordDB {
    pub entity_type: String,
    pub id: String,
    pub payload: String,
    pub sync_status: String,
    pub local_updated_at: String,
    pub server_version: Option<String>,
    pub cached_at: Option<String>,
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", value, e)).into())
}

pub(crate) fn parse_timestamp_opt(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_timestamp).transpose()
}

pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn format_timestamp_opt(value: Option<&DateTime<Utc>>) -> Option<String> {
    value.map(format_timestamp)
}

impl RecordDB {
    pub fn from_domain(record: &Record) -> Result<Self> {
        Ok(Self {
            entity_type: record.entity_type.as_str().to_string(),
            id: record.id.clone(),
            payload: serde_json::to_string(&record.payload)?,
            sync_status: record.sync_status.as_str().to_string(),
            local_updated_at: format_timestamp(&record.local_updated_at),
            server_version: record.server_version.clone(),
            cached_at: format_timestamp_opt(record.cached_at.as_ref()),
        })
    }

    pub fn into_domain(self) -> Result<Record> {
        Ok(Record {
            id: self.id,
            entity_type: EntityType::parse(&self.entity_type)?,
            payload: serde_json::from_str(&self.payload)?,
            sync_status: SyncStatus::parse(&self.sync_status)?,
            local_updated_at: parse_timestamp(&self.local_updated_at)?,
            server_version: self.server_version,
            cached_at: parse_timestamp_opt(self.cached_at.as_deref())?,
        })
    }
}
