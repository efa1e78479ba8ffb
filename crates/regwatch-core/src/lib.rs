//! Core domain model for the vehicle registry tracker.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "regwatch-core";

/// One vehicle registration as delivered by the upstream registry: a unique
/// key plus a flat bag of attribute fields whose names the upstream may
/// extend at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub registration: String,
    pub fields: BTreeMap<String, String>,
}

impl SourceRecord {
    pub fn new(registration: impl Into<String>) -> Self {
        Self {
            registration: normalize_registration(&registration.into()),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Attribute names that pass the identifier gate, in sorted order.
    pub fn safe_field_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .keys()
            .map(String::as_str)
            .filter(|name| is_safe_field_name(name))
    }
}

/// Gate for attribute names that may become SQL column identifiers: ASCII
/// lowercase letters, digits and underscores only, never empty.
pub fn is_safe_field_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Canonical form of a registration key: trimmed, uppercased.
pub fn normalize_registration(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Calendar-day stamp used as the natural key for counters, changelog and
/// statistics rows.
pub fn day_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Calendar-month stamp (`YYYY-MM`) for the monthly counter.
pub fn month_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Result of one keyed upsert pass over a fetched batch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Keys of newly inserted records, in first-sighting batch order.
    pub inserted_keys: Vec<String>,
}

/// Added/removed keys between the previous persisted snapshot and the
/// current fetched batch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn total_changes(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Aggregate statistics derived from the persisted registry after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub date: String,
    pub total_vehicles: i64,
    pub insured_count: i64,
    pub imported_count: i64,
    pub color_counts: BTreeMap<String, i64>,
}

/// One persisted changelog row: the diff recorded for a calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogEntry {
    pub date: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub total_changes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted vehicle row as served by the read API: the key, the write
/// timestamp, and whatever attribute columns currently exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub registration: String,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyCount {
    pub month: String,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn safe_field_names_are_lowercase_snake() {
        assert!(is_safe_field_name("kenteken"));
        assert!(is_safe_field_name("aantal_cilinders"));
        assert!(is_safe_field_name("co2_uitstoot_gecombineerd"));
        assert!(is_safe_field_name("2e_kleur"));
    }

    #[test]
    fn unsafe_field_names_are_rejected() {
        assert!(!is_safe_field_name(""));
        assert!(!is_safe_field_name("Kleur"));
        assert!(!is_safe_field_name("kleur;drop table vehicles"));
        assert!(!is_safe_field_name("kleur kleur"));
        assert!(!is_safe_field_name("kleur-2"));
        assert!(!is_safe_field_name("kléur"));
    }

    #[test]
    fn registration_is_trimmed_and_uppercased() {
        assert_eq!(normalize_registration(" ab-12-cd "), "AB-12-CD");
        assert_eq!(normalize_registration("xx99yy"), "XX99YY");
    }

    #[test]
    fn stamps_follow_calendar_formats() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 23, 59, 59).unwrap();
        assert_eq!(day_stamp(at), "2024-03-07");
        assert_eq!(month_stamp(at), "2024-03");
    }

    #[test]
    fn safe_field_names_skip_rejected_entries() {
        let record = SourceRecord::new("AA11BB")
            .with_field("merk", "BMW")
            .with_field("Merk", "BMW")
            .with_field("eerste_kleur", "GRIJS");
        let names: Vec<&str> = record.safe_field_names().collect();
        assert_eq!(names, vec!["eerste_kleur", "merk"]);
    }

    #[test]
    fn diff_totals_count_both_sides() {
        let diff = SnapshotDiff {
            added: vec!["AA11BB".into()],
            removed: vec!["CC22DD".into(), "EE33FF".into()],
        };
        assert_eq!(diff.total_changes(), 3);
        assert!(!diff.is_empty());
        assert!(SnapshotDiff::default().is_empty());
    }
}
