/*!
 * Persistent Event Index
 *
 * A single SQLite file holding normalized events, the query-fingerprint to
 * result-id cache, and a schema version marker. This is the durable tier
 * behind the in-memory hot tier; every event the memory tier ever serves
 * was written here first.
 */

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::calendar::error::{CalendarError, CalendarResult};
use crate::calendar::types::{EventLocation, EventOrganizer, NormalizedEvent, QueryDescriptor};

const SCHEMA_VERSION: i64 = 1;

pub struct PersistentEventIndex {
    pool: SqlitePool,
}

impl PersistentEventIndex {
    pub async fn connect(database_url: &str) -> CalendarResult<Self> {
        let pool = SqlitePoolOptions::new().max_connections(8).connect(database_url).await?;
        let index = Self { pool };
        index.init_schema().await?;
        index.check_schema_version().await?;
        Ok(index)
    }

    async fn init_schema(&self) -> CalendarResult<()> {
        info!("initializing persistent event index schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                source_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                location_name TEXT,
                location_address TEXT,
                organizer_name TEXT,
                organizer_email TEXT,
                url TEXT,
                last_modified TEXT NOT NULL,
                recurrence_json TEXT,
                PRIMARY KEY (source_id, event_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_date_range ON events(start_date, end_date)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_categories (
                source_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                category TEXT NOT NULL,
                PRIMARY KEY (source_id, event_id, category),
                FOREIGN KEY (source_id, event_id) REFERENCES events(source_id, event_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_categories_category ON event_categories(category)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS query_cache (
                fingerprint TEXT PRIMARY KEY,
                inserted_at TEXT NOT NULL,
                ttl_seconds INTEGER NOT NULL,
                result_ids TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&self.pool)
            .await?;

        sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?)")
            .bind(SCHEMA_VERSION.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn check_schema_version(&self) -> CalendarResult<()> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = 'schema_version'").fetch_optional(&self.pool).await?;

        let found: i64 = match row {
            Some(row) => row.get::<String, _>("value").parse().unwrap_or(0),
            None => 0,
        };

        if found != SCHEMA_VERSION {
            return Err(CalendarError::SchemaMismatch { found, expected: SCHEMA_VERSION });
        }
        Ok(())
    }

    /// Atomic batch upsert. An incoming event overwrites the stored one only
    /// when its `last_modified` is greater than or equal to what is already
    /// there; an older write is silently retained as-is (no downgrade).
    pub async fn upsert_events(&self, events: &[NormalizedEvent]) -> CalendarResult<()> {
        let mut tx = self.pool.begin().await?;

        for event in events {
            let existing = sqlx::query("SELECT last_modified FROM events WHERE source_id = ? AND event_id = ?")
                .bind(&event.source_id)
                .bind(&event.id)
                .fetch_optional(&mut *tx)
                .await?;

            if let Some(row) = existing {
                let existing_last_modified: String = row.get("last_modified");
                if let Ok(existing_dt) = DateTime::parse_from_rfc3339(&existing_last_modified) {
                    if event.last_modified < existing_dt.with_timezone(&Utc) {
                        debug!(source_id = %event.source_id, event_id = %event.id, "skipping stale upsert");
                        continue;
                    }
                }
            }

            sqlx::query(
                r#"
                INSERT INTO events (
                    source_id, event_id, title, description, start_date, end_date,
                    location_name, location_address, organizer_name, organizer_email,
                    url, last_modified, recurrence_json
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(source_id, event_id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    start_date = excluded.start_date,
                    end_date = excluded.end_date,
                    location_name = excluded.location_name,
                    location_address = excluded.location_address,
                    organizer_name = excluded.organizer_name,
                    organizer_email = excluded.organizer_email,
                    url = excluded.url,
                    last_modified = excluded.last_modified,
                    recurrence_json = excluded.recurrence_json
                "#,
            )
            .bind(&event.source_id)
            .bind(&event.id)
            .bind(&event.title)
            .bind(&event.description)
            .bind(event.start_date.to_rfc3339())
            .bind(event.end_date.to_rfc3339())
            .bind(event.location.as_ref().map(|l| l.name.clone()))
            .bind(event.location.as_ref().and_then(|l| l.address.clone()))
            .bind(event.organizer.as_ref().and_then(|o| o.name.clone()))
            .bind(event.organizer.as_ref().and_then(|o| o.email.clone()))
            .bind(&event.url)
            .bind(event.last_modified.to_rfc3339())
            .bind(event.recurrence.as_ref().map(|v| v.to_string()))
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM event_categories WHERE source_id = ? AND event_id = ?")
                .bind(&event.source_id)
                .bind(&event.id)
                .execute(&mut *tx)
                .await?;

            for category in &event.categories {
                sqlx::query("INSERT OR IGNORE INTO event_categories (source_id, event_id, category) VALUES (?, ?, ?)")
                    .bind(&event.source_id)
                    .bind(&event.id)
                    .bind(category)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Finds events matching `query`, applying keyword/category filters at
    /// the SQL layer where cheap and the rest in-process.
    pub async fn find_by_query(&self, query: &QueryDescriptor) -> CalendarResult<Vec<NormalizedEvent>> {
        let mut sql = String::from(
            "SELECT source_id, event_id, title, description, start_date, end_date, \
             location_name, location_address, organizer_name, organizer_email, url, \
             last_modified, recurrence_json FROM events WHERE 1=1",
        );
        let mut binds: Vec<String> = Vec::new();

        if let Some(range) = &query.date_range {
            sql.push_str(" AND end_date >= ? AND start_date <= ?");
            binds.push(range.start.to_rfc3339());
            binds.push(range.end.to_rfc3339());
        }

        if let Some(keywords) = &query.keywords {
            for keyword in keywords {
                sql.push_str(" AND (title LIKE ? OR description LIKE ?)");
                let pattern = format!("%{}%", keyword);
                binds.push(pattern.clone());
                binds.push(pattern);
            }
        }

        let mut q = sqlx::query(&sql);
        for bind in &binds {
            q = q.bind(bind);
        }

        let rows = q.fetch_all(&self.pool).await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let source_id: String = row.get("source_id");

            if let Some(ids) = &query.source_ids {
                if !ids.contains(&source_id) {
                    continue;
                }
            }

            let event_id: String = row.get("event_id");
            let categories = self.categories_for(&source_id, &event_id).await?;

            if let Some(wanted) = &query.categories {
                if !wanted.iter().all(|c| categories.iter().any(|ec| ec.eq_ignore_ascii_case(c))) {
                    continue;
                }
            }

            events.push(row_to_event(&row, categories)?);
        }

        Ok(events)
    }

    async fn categories_for(&self, source_id: &str, event_id: &str) -> CalendarResult<Vec<String>> {
        let rows = sqlx::query("SELECT category FROM event_categories WHERE source_id = ? AND event_id = ?")
            .bind(source_id)
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("category")).collect())
    }

    pub async fn find_by_id(&self, source_id: &str, event_id: &str) -> CalendarResult<Option<NormalizedEvent>> {
        let row = sqlx::query(
            "SELECT source_id, event_id, title, description, start_date, end_date, \
             location_name, location_address, organizer_name, organizer_email, url, \
             last_modified, recurrence_json FROM events WHERE source_id = ? AND event_id = ?",
        )
        .bind(source_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let categories = self.categories_for(source_id, event_id).await?;
                Ok(Some(row_to_event(&row, categories)?))
            }
            None => Ok(None),
        }
    }

    /// Removes every event from `source_id` and invalidates any cached
    /// query results that included it.
    pub async fn delete_by_source(&self, source_id: &str) -> CalendarResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM events WHERE source_id = ?").bind(source_id).execute(&mut *tx).await?;

        let rows = sqlx::query("SELECT fingerprint, result_ids FROM query_cache").fetch_all(&mut *tx).await?;
        for row in rows {
            let result_ids: String = row.get("result_ids");
            if result_ids.split(',').any(|id| id.starts_with(&format!("{}:", source_id))) {
                let fingerprint: String = row.get("fingerprint");
                sqlx::query("DELETE FROM query_cache WHERE fingerprint = ?").bind(&fingerprint).execute(&mut *tx).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fast path for a fingerprinted query: reads the result-id list
    /// `record_query_result` stored for `fingerprint` and fetches those
    /// events directly, skipping the full scan `find_by_query` would run.
    /// Returns `Ok(None)` on an unknown or TTL-expired fingerprint so the
    /// caller falls back to `find_by_query`.
    pub async fn find_by_fingerprint(&self, fingerprint: &str) -> CalendarResult<Option<Vec<NormalizedEvent>>> {
        let row = sqlx::query("SELECT inserted_at, ttl_seconds, result_ids FROM query_cache WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let inserted_at: String = row.get("inserted_at");
        let ttl_seconds: i64 = row.get("ttl_seconds");
        let result_ids: String = row.get("result_ids");

        let expired = match DateTime::parse_from_rfc3339(&inserted_at) {
            Ok(inserted) => Utc::now().signed_duration_since(inserted.with_timezone(&Utc)).num_seconds() > ttl_seconds,
            Err(_) => true,
        };
        if expired {
            return Ok(None);
        }

        if result_ids.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let mut events = Vec::new();
        for event_id in result_ids.split(',') {
            let rows = sqlx::query(
                "SELECT source_id, event_id, title, description, start_date, end_date, \
                 location_name, location_address, organizer_name, organizer_email, url, \
                 last_modified, recurrence_json FROM events WHERE event_id = ?",
            )
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                let source_id: String = row.get("source_id");
                let categories = self.categories_for(&source_id, event_id).await?;
                events.push(row_to_event(&row, categories)?);
            }
        }

        Ok(Some(events))
    }

    /// Records which event ids answered a fingerprinted query, for the
    /// memory tier's source-keyed invalidation to cross-check against.
    pub async fn record_query_result(&self, fingerprint: &str, ttl_seconds: u64, event_ids: &[String]) -> CalendarResult<()> {
        sqlx::query(
            "INSERT INTO query_cache (fingerprint, inserted_at, ttl_seconds, result_ids) VALUES (?, ?, ?, ?) \
             ON CONFLICT(fingerprint) DO UPDATE SET inserted_at = excluded.inserted_at, ttl_seconds = excluded.ttl_seconds, result_ids = excluded.result_ids",
        )
        .bind(fingerprint)
        .bind(Utc::now().to_rfc3339())
        .bind(ttl_seconds as i64)
        .bind(event_ids.join(","))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes query-cache rows whose TTL has elapsed. Does not touch
    /// `events`; expiry there is governed by source lifecycle, not time.
    pub async fn cleanup_expired(&self) -> CalendarResult<u64> {
        let now = Utc::now();
        let rows = sqlx::query("SELECT fingerprint, inserted_at, ttl_seconds FROM query_cache").fetch_all(&self.pool).await?;

        let mut expired = Vec::new();
        for row in rows {
            let inserted_at: String = row.get("inserted_at");
            let ttl_seconds: i64 = row.get("ttl_seconds");
            if let Ok(inserted) = DateTime::parse_from_rfc3339(&inserted_at) {
                if now.signed_duration_since(inserted.with_timezone(&Utc)).num_seconds() > ttl_seconds {
                    expired.push(row.get::<String, _>("fingerprint"));
                }
            }
        }

        for fingerprint in &expired {
            sqlx::query("DELETE FROM query_cache WHERE fingerprint = ?").bind(fingerprint).execute(&self.pool).await?;
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "cleaned up expired query cache entries");
        }
        Ok(expired.len() as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow, categories: Vec<String>) -> CalendarResult<NormalizedEvent> {
    let start_date: String = row.get("start_date");
    let end_date: String = row.get("end_date");
    let last_modified: String = row.get("last_modified");
    let recurrence_json: Option<String> = row.get("recurrence_json");
    let location_name: Option<String> = row.get("location_name");
    let organizer_name: Option<String> = row.get("organizer_name");
    let organizer_email: Option<String> = row.get("organizer_email");

    Ok(NormalizedEvent {
        id: row.get("event_id"),
        source_id: row.get("source_id"),
        title: row.get("title"),
        description: row.get("description"),
        start_date: parse_stored_datetime(&start_date)?,
        end_date: parse_stored_datetime(&end_date)?,
        location: location_name.map(|name| EventLocation { name, address: row.get("location_address") }),
        organizer: if organizer_name.is_some() || organizer_email.is_some() {
            Some(EventOrganizer { name: organizer_name, email: organizer_email })
        } else {
            None
        },
        categories,
        url: row.get("url"),
        last_modified: parse_stored_datetime(&last_modified)?,
        recurrence: recurrence_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn parse_stored_datetime(value: &str) -> CalendarResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CalendarError::InternalError { message: format!("corrupt stored datetime {:?}: {}", value, e) })
}

/// Convenience alias used by callers that want a shared handle.
pub type SharedPersistentEventIndex = Arc<PersistentEventIndex>;
