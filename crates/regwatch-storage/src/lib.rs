//! Postgres persistence for the vehicle registry: schema evolution, keyed
//! batch writes, pruning and run bookkeeping ledgers.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regwatch_core::{
    is_safe_field_name, ChangelogEntry, DailyCount, MonthlyCount, RegistryStats, SnapshotDiff,
    SourceRecord, VehicleRecord,
};
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "regwatch-storage";

pub const VEHICLES_TABLE: &str = "vehicles";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("schema evolution failed adding column {column}: {source}")]
    SchemaEvolution {
        column: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("refusing to prune with an empty current key set")]
    EmptyPruneSet,
}

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    Ok(PgPool::connect(database_url).await?)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Write side of the registry table. One bounded batch per call; batch
/// sizing and classification live with the caller.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Every persisted registration key, read before a run mutates anything.
    async fn known_registrations(&self) -> Result<HashSet<String>, StoreError>;

    /// Makes sure an attribute column exists for every safe name. Unsafe
    /// names are dropped with a warning and never reach SQL. Must complete
    /// before any batch referencing those names is written. Backends whose
    /// schema needs no DDL may treat this as a no-op.
    async fn ensure_fields(&self, names: &BTreeSet<String>) -> Result<(), StoreError>;

    /// Writes one batch of new records in a single multi-row statement,
    /// ignoring key conflicts. Returns the number of rows inserted.
    async fn insert_records(
        &self,
        records: &[SourceRecord],
        columns: &BTreeSet<String>,
    ) -> Result<u64, StoreError>;

    /// Rewrites one batch of existing records inside a single transaction.
    /// On error the transaction rolls back and nothing from the batch lands.
    async fn update_records(&self, records: &[SourceRecord]) -> Result<(), StoreError>;

    /// Deletes every row whose key is absent from `current`. Refuses an
    /// empty key set rather than emptying the table.
    async fn delete_absent(&self, current: &[String]) -> Result<u64, StoreError>;

    /// Aggregates the persisted registry into statistics for `date`.
    async fn registry_stats(&self, date: &str) -> Result<RegistryStats, StoreError>;
}

/// Run bookkeeping: counters, changelog and statistics, all upserted by
/// their calendar key.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn record_daily_count(&self, date: &str, count: i64) -> Result<(), StoreError>;

    async fn record_monthly_count(&self, month: &str, count: i64) -> Result<(), StoreError>;

    /// Persists the day's diff. Called on every run, including no-change
    /// runs, so a read of the changelog proves the run happened.
    async fn record_changelog(&self, date: &str, diff: &SnapshotDiff) -> Result<(), StoreError>;

    async fn record_daily_stats(&self, stats: &RegistryStats) -> Result<(), StoreError>;
}

pub fn quote_ident(name: &str) -> String {
    debug_assert!(is_safe_field_name(name) || name == "registration");
    format!("\"{name}\"")
}

fn build_insert_sql(columns: &[&str], rows: usize) -> String {
    let mut column_list = String::from(quote_ident("registration"));
    for column in columns {
        column_list.push_str(", ");
        column_list.push_str(&quote_ident(column));
    }

    let width = columns.len() + 1;
    let mut values = String::new();
    for row in 0..rows {
        if row > 0 {
            values.push_str(", ");
        }
        values.push('(');
        for slot in 0..width {
            if slot > 0 {
                values.push_str(", ");
            }
            values.push_str(&format!("${}", row * width + slot + 1));
        }
        values.push(')');
    }

    format!(
        "INSERT INTO vehicles ({column_list}) VALUES {values} \
         ON CONFLICT (registration) DO NOTHING"
    )
}

fn build_update_sql(columns: &[&str]) -> String {
    let mut assignments = String::new();
    for (index, column) in columns.iter().enumerate() {
        assignments.push_str(&quote_ident(column));
        assignments.push_str(&format!(" = ${}, ", index + 1));
    }

    format!(
        "UPDATE vehicles SET {assignments}last_updated = NOW(), updated_at = NOW() \
         WHERE registration = ${}",
        columns.len() + 1
    )
}

/// Postgres-backed [`RegistryStore`]. Keeps a process-local cache of the
/// vehicles column set so repeat runs skip the information_schema lookup.
pub struct PgRegistryStore {
    pool: PgPool,
    columns: RwLock<Option<HashSet<String>>>,
}

impl PgRegistryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            columns: RwLock::new(None),
        }
    }

    async fn load_columns(&self) -> Result<HashSet<String>, StoreError> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text
              FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = $1
            "#,
        )
        .bind(VEHICLES_TABLE)
        .fetch_all(&self.pool)
        .await?;
        Ok(names.into_iter().collect())
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    async fn known_registrations(&self) -> Result<HashSet<String>, StoreError> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT registration FROM vehicles")
            .fetch_all(&self.pool)
            .await?;
        Ok(keys.into_iter().collect())
    }

    async fn ensure_fields(&self, names: &BTreeSet<String>) -> Result<(), StoreError> {
        let mut wanted: BTreeSet<&str> = BTreeSet::new();
        for name in names {
            if is_safe_field_name(name) {
                wanted.insert(name.as_str());
            } else {
                warn!(field = %name, "rejected unsafe attribute name; field will not be persisted");
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        {
            let cache = self.columns.read().await;
            if let Some(known) = cache.as_ref() {
                if wanted.iter().all(|name| known.contains(*name)) {
                    return Ok(());
                }
            }
        }

        let mut cache = self.columns.write().await;
        if cache.is_none() {
            *cache = Some(self.load_columns().await?);
        }
        if let Some(known) = cache.as_mut() {
            for name in wanted {
                if known.contains(name) {
                    continue;
                }
                let sql = format!(
                    "ALTER TABLE {VEHICLES_TABLE} ADD COLUMN IF NOT EXISTS {} TEXT",
                    quote_ident(name)
                );
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|source| StoreError::SchemaEvolution {
                        column: name.to_string(),
                        source,
                    })?;
                info!(column = name, "added attribute column to vehicles");
                known.insert(name.to_string());
            }
        }
        Ok(())
    }

    async fn insert_records(
        &self,
        records: &[SourceRecord],
        columns: &BTreeSet<String>,
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let columns: Vec<&str> = columns
            .iter()
            .map(String::as_str)
            .filter(|name| is_safe_field_name(name))
            .collect();
        let sql = build_insert_sql(&columns, records.len());

        let mut query = sqlx::query(&sql);
        for record in records {
            query = query.bind(&record.registration);
            for column in &columns {
                query = query.bind(record.fields.get(*column).map(String::as_str));
            }
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn update_records(&self, records: &[SourceRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            let columns: Vec<&str> = record.safe_field_names().collect();
            let sql = build_update_sql(&columns);
            let mut query = sqlx::query(&sql);
            for column in &columns {
                query = query.bind(record.fields.get(*column).map(String::as_str));
            }
            query = query.bind(&record.registration);
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_absent(&self, current: &[String]) -> Result<u64, StoreError> {
        if current.is_empty() {
            return Err(StoreError::EmptyPruneSet);
        }
        let result = sqlx::query("DELETE FROM vehicles WHERE NOT (registration = ANY($1))")
            .bind(current)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn registry_stats(&self, date: &str) -> Result<RegistryStats, StoreError> {
        let total_vehicles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vehicles")
            .fetch_one(&self.pool)
            .await?;
        let insured_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vehicles WHERE wam_verzekerd = 'Ja'")
                .fetch_one(&self.pool)
                .await?;
        let imported_count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM vehicles
             WHERE datum_eerste_toelating IS NOT NULL
               AND datum_eerste_tenaamstelling_in_nederland IS NOT NULL
               AND datum_eerste_toelating <> datum_eerste_tenaamstelling_in_nederland
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let colors: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT eerste_kleur, COUNT(*)
              FROM vehicles
             WHERE eerste_kleur IS NOT NULL
             GROUP BY eerste_kleur
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(RegistryStats {
            date: date.to_string(),
            total_vehicles,
            insured_count,
            imported_count,
            color_counts: colors.into_iter().collect(),
        })
    }
}

/// Postgres-backed [`RunLedger`].
pub struct PgRunLedger {
    pool: PgPool,
}

impl PgRunLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLedger for PgRunLedger {
    async fn record_daily_count(&self, date: &str, count: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO daily_counts (date, count) VALUES ($1, $2)
            ON CONFLICT (date) DO UPDATE SET count = EXCLUDED.count, updated_at = NOW()
            "#,
        )
        .bind(date)
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_monthly_count(&self, month: &str, count: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO monthly_counts (month, count) VALUES ($1, $2)
            ON CONFLICT (month) DO UPDATE SET count = EXCLUDED.count, updated_at = NOW()
            "#,
        )
        .bind(month)
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_changelog(&self, date: &str, diff: &SnapshotDiff) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO daily_differences (date, added, removed, total_changes)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (date) DO UPDATE
              SET added = EXCLUDED.added,
                  removed = EXCLUDED.removed,
                  total_changes = EXCLUDED.total_changes,
                  updated_at = NOW()
            "#,
        )
        .bind(date)
        .bind(&diff.added)
        .bind(&diff.removed)
        .bind(diff.total_changes() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_daily_stats(&self, stats: &RegistryStats) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO daily_stats (date, total_vehicles, insured_count, imported_count, color_counts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (date) DO UPDATE
              SET total_vehicles = EXCLUDED.total_vehicles,
                  insured_count = EXCLUDED.insured_count,
                  imported_count = EXCLUDED.imported_count,
                  color_counts = EXCLUDED.color_counts,
                  updated_at = NOW()
            "#,
        )
        .bind(&stats.date)
        .bind(stats.total_vehicles)
        .bind(stats.insured_count)
        .bind(stats.imported_count)
        .bind(sqlx::types::Json(&stats.color_counts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const SORT_COLUMNS: &[&str] = &[
    "registration",
    "merk",
    "handelsbenaming",
    "eerste_kleur",
    "inrichting",
    "datum_eerste_toelating",
    "last_updated",
];

/// Maps a requested sort field onto the whitelist; anything else falls back
/// to the registration key.
pub fn sort_column(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|name| SORT_COLUMNS.iter().copied().find(|column| *column == name))
        .unwrap_or("registration")
}

/// Builds a [`VehicleRecord`] from a `SELECT *` row. Attribute columns are
/// discovered from the row itself, so rows gain fields as the schema grows.
fn vehicle_from_row(row: &PgRow) -> Result<VehicleRecord, StoreError> {
    let mut record = VehicleRecord {
        registration: String::new(),
        last_updated: None,
        attributes: BTreeMap::new(),
    };

    for column in row.columns() {
        let name = column.name();
        match name {
            "id" | "created_at" | "updated_at" => {}
            "registration" => record.registration = row.try_get(name)?,
            "last_updated" => record.last_updated = row.try_get(name)?,
            _ => {
                if let Some(value) = row.try_get::<Option<String>, _>(name)? {
                    record.attributes.insert(name.to_string(), value);
                }
            }
        }
    }

    Ok(record)
}

pub async fn search_vehicles(
    pool: &PgPool,
    search: Option<&str>,
    sort_by: Option<&str>,
    descending: bool,
    limit: i64,
) -> Result<Vec<VehicleRecord>, StoreError> {
    let sort = sort_column(sort_by);
    let direction = if descending { "DESC" } else { "ASC" };
    let sql = format!(
        r#"
        SELECT * FROM vehicles
         WHERE $1::text IS NULL
            OR registration ILIKE $1
            OR merk ILIKE $1
            OR handelsbenaming ILIKE $1
            OR eerste_kleur ILIKE $1
            OR inrichting ILIKE $1
         ORDER BY {sort} {direction} NULLS LAST
         LIMIT $2
        "#
    );

    let pattern = search
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(|term| format!("%{term}%"));
    let rows = sqlx::query(&sql)
        .bind(pattern)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(vehicle_from_row).collect()
}

pub async fn fetch_vehicle(
    pool: &PgPool,
    registration: &str,
) -> Result<Option<VehicleRecord>, StoreError> {
    let row = sqlx::query("SELECT * FROM vehicles WHERE registration = $1")
        .bind(registration)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(vehicle_from_row).transpose()
}

pub async fn count_vehicles(pool: &PgPool) -> Result<i64, StoreError> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM vehicles")
        .fetch_one(pool)
        .await?)
}

pub async fn latest_update(pool: &PgPool) -> Result<Option<DateTime<Utc>>, StoreError> {
    Ok(
        sqlx::query_scalar("SELECT MAX(last_updated) FROM vehicles")
            .fetch_one(pool)
            .await?,
    )
}

pub async fn fetch_daily_stats(
    pool: &PgPool,
    date: &str,
) -> Result<Option<RegistryStats>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT date, total_vehicles, insured_count, imported_count, color_counts
          FROM daily_stats
         WHERE date = $1
        "#,
    )
    .bind(date)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let color_counts: sqlx::types::Json<BTreeMap<String, i64>> = row.try_get("color_counts")?;
    Ok(Some(RegistryStats {
        date: row.try_get("date")?,
        total_vehicles: row.try_get("total_vehicles")?,
        insured_count: row.try_get("insured_count")?,
        imported_count: row.try_get("imported_count")?,
        color_counts: color_counts.0,
    }))
}

pub async fn list_daily_counts(pool: &PgPool) -> Result<Vec<DailyCount>, StoreError> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT date, count FROM daily_counts ORDER BY date ASC")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(date, count)| DailyCount { date, count })
        .collect())
}

pub async fn list_monthly_counts(pool: &PgPool) -> Result<Vec<MonthlyCount>, StoreError> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT month, count FROM monthly_counts ORDER BY month ASC")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(month, count)| MonthlyCount { month, count })
        .collect())
}

pub async fn list_changelog(
    pool: &PgPool,
    date: Option<&str>,
    limit: i64,
) -> Result<Vec<ChangelogEntry>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT date, added, removed, total_changes, created_at, updated_at
          FROM daily_differences
         WHERE $1::text IS NULL OR date = $1
         ORDER BY date DESC
         LIMIT $2
        "#,
    )
    .bind(date)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(ChangelogEntry {
                date: row.try_get("date")?,
                added: row.try_get("added")?,
                removed: row.try_get("removed")?,
                total_changes: row.try_get("total_changes")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .collect()
}

pub async fn color_distribution(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<(String, i64)>, StoreError> {
    Ok(sqlx::query_as(
        r#"
        SELECT eerste_kleur, COUNT(*)
          FROM vehicles
         WHERE eerste_kleur IS NOT NULL
         GROUP BY eerste_kleur
         ORDER BY COUNT(*) DESC
         LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?)
}

pub async fn year_distribution(pool: &PgPool) -> Result<Vec<(String, i64)>, StoreError> {
    Ok(sqlx::query_as(
        r#"
        SELECT SUBSTRING(datum_eerste_toelating, 1, 4), COUNT(*)
          FROM vehicles
         WHERE datum_eerste_toelating IS NOT NULL
         GROUP BY 1
         ORDER BY 1 ASC
        "#,
    )
    .fetch_all(pool)
    .await?)
}

pub async fn body_type_distribution(pool: &PgPool) -> Result<Vec<(String, i64)>, StoreError> {
    Ok(sqlx::query_as(
        r#"
        SELECT inrichting, COUNT(*)
          FROM vehicles
         WHERE inrichting IS NOT NULL
         GROUP BY inrichting
         ORDER BY COUNT(*) DESC
        "#,
    )
    .fetch_all(pool)
    .await?)
}
