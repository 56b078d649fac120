//! Small helpers shared by the stores: enum <-> SQLite string via serde,
//! RFC 3339 timestamp columns.

use chrono::{DateTime, Utc};

pub(crate) fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

pub(crate) fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

pub(crate) fn ts_to_sql(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

pub(crate) fn opt_ts_from_sql(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| ts_from_sql(&s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::types::TaskStatus;

    #[test]
    fn enum_roundtrip() {
        assert_eq!(enum_to_sql(&TaskStatus::Running), "running");
        let back: TaskStatus = enum_from_sql("running");
        assert_eq!(back, TaskStatus::Running);
    }

    #[test]
    fn timestamp_roundtrip() {
        let now = Utc::now();
        let raw = ts_to_sql(&now);
        assert_eq!(ts_from_sql(&raw), now);
    }
}
