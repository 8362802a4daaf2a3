//! SQLite-backed [`RecordStore`].
//!
//! The schema is applied inline via `include_str!` every time the database
//! is opened; the migration is idempotent.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, SqlitePool};

use super::{CharacterRecord, FieldValue, RecordStore, StoreError};

/// Character records in a local SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
    insert_sql: String,
    update_sql: String,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created or
    /// the migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open record store at {}", path.display()))?;

        let migration_sql = include_str!("../../migrations/001_characters.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply characters schema migration")?;

        let columns: Vec<&'static str> = CharacterRecord::default()
            .field_values()
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        let insert_sql = format!(
            "INSERT INTO characters (id, {}) VALUES (?{})",
            columns.join(", "),
            ", ?".repeat(columns.len())
        );
        let assignments = columns
            .iter()
            .map(|c| format!("{c} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let update_sql = format!(
            "UPDATE characters SET {assignments}, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?"
        );

        Ok(Self {
            pool,
            insert_sql,
            update_sql,
        })
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn list_all(&self) -> Result<Vec<CharacterRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM characters ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn insert(&self, record: &CharacterRecord) -> Result<(), StoreError> {
        let query = record
            .field_values()
            .into_iter()
            .fold(sqlx::query(&self.insert_sql).bind(record.id.clone()), |q, (_, v)| {
                bind_value(q, v)
            });

        match query.execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict {
                    id: record.id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, record: &CharacterRecord) -> Result<(), StoreError> {
        let query = record
            .field_values()
            .into_iter()
            .fold(sqlx::query(&self.update_sql), |q, (_, v)| bind_value(q, v))
            .bind(record.id.clone());

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                id: record.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM characters WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id: id.to_owned() });
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM characters")
            .fetch_one(&self.pool)
            .await?;
        u64::try_from(count).map_err(|e| StoreError::Other(e.to_string()))
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: FieldValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        FieldValue::Text(text) => query.bind(text),
        FieldValue::Integer(n) => query.bind(n),
        FieldValue::Float(n) => query.bind(n),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<CharacterRecord, sqlx::Error> {
    Ok(CharacterRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        realm: row.try_get("realm")?,
        realm_name: row.try_get("realm_name")?,
        realm_id: row.try_get("realm_id")?,
        gender_type: row.try_get("gender_type")?,
        gender_name: row.try_get("gender_name")?,
        faction_type: row.try_get("faction_type")?,
        faction_name: row.try_get("faction_name")?,
        race_id: row.try_get("race_id")?,
        race_name: row.try_get("race_name")?,
        character_class_id: row.try_get("character_class_id")?,
        character_class_name: row.try_get("character_class_name")?,
        active_spec_id: row.try_get("active_spec_id")?,
        active_spec_name: row.try_get("active_spec_name")?,
        guild_name: row.try_get("guild_name")?,
        guild_id: row.try_get("guild_id")?,
        guild_realm_name: row.try_get("guild_realm_name")?,
        guild_realm_id: row.try_get("guild_realm_id")?,
        guild_realm_slug: row.try_get("guild_realm_slug")?,
        level: row.try_get("level")?,
        experience: row.try_get("experience")?,
        achievement_points: row.try_get("achievement_points")?,
        last_login_timestamp: row.try_get("last_login_timestamp")?,
        average_item_level: row.try_get("average_item_level")?,
        equipped_item_level: row.try_get("equipped_item_level")?,
        active_title_id: row.try_get("active_title_id")?,
        active_title_name: row.try_get("active_title_name")?,
        active_title_display_string: row.try_get("active_title_display_string")?,
    })
}
