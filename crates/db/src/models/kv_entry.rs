use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KvEntryRow {
    pub key: String,
    pub value: String,
    pub expires_at: Option<i64>,
    pub updated_at: i64,
}

impl KvEntryRow {
    pub fn new(key: &str, value: &Value, expires_at: Option<DateTime<Utc>>) -> Result<Self, DbError> {
        Ok(Self {
            key: key.to_string(),
            value: serde_json::to_string(value)?,
            expires_at: expires_at.map(datetime_to_millis),
            updated_at: datetime_to_millis(Utc::now()),
        })
    }

    pub fn into_value(self) -> Result<Value, DbError> {
        Ok(serde_json::from_str(&self.value)?)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at.and_then(millis_to_datetime)
    }
}

pub(crate) fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
