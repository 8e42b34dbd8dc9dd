use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::alerts::Direction;
use crate::store::{Alert, Entity, LogEntry, NewAlert, NewEntity, NewLog, TelemetryStore};
use crate::telemetry::SignalKind;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Filter for paginated history reads. Pages walk backwards by log id.
#[derive(Debug, Clone, Copy)]
pub struct LogQuery {
    pub entity_id: Option<i64>,
    pub before: Option<i64>,
    pub limit: i64,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

const ENTITY_COLUMNS: &str =
    "id, name, kind, value, unit, last_log_ts, created_at, updated_at";

#[derive(FromRow)]
struct EntityRow {
    id: i64,
    name: String,
    kind: String,
    value: String,
    unit: String,
    last_log_ts: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl From<EntityRow> for Entity {
    fn from(r: EntityRow) -> Self {
        Entity {
            id: r.id,
            name: r.name,
            kind: SignalKind::from_db(&r.kind),
            value: decode_value(r.value),
            unit: r.unit,
            last_log_ts: r.last_log_ts,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(FromRow)]
struct LogRow {
    id: i64,
    entity_id: i64,
    name: String,
    value: String,
    kind: String,
    unit: String,
    ts: i64,
}

impl From<LogRow> for LogEntry {
    fn from(r: LogRow) -> Self {
        LogEntry {
            id: r.id,
            entity_id: r.entity_id,
            name: r.name,
            value: decode_value(r.value),
            kind: SignalKind::from_db(&r.kind),
            unit: r.unit,
            ts: r.ts,
        }
    }
}

#[derive(FromRow)]
struct AlertRow {
    id: i64,
    entity_id: i64,
    name: String,
    value: f64,
    threshold: f64,
    direction: String,
    message: String,
    ts: i64,
}

impl From<AlertRow> for Alert {
    fn from(r: AlertRow) -> Self {
        Alert {
            id: r.id,
            entity_id: r.entity_id,
            name: r.name,
            value: r.value,
            threshold: r.threshold,
            direction: Direction::from_db(&r.direction),
            message: r.message,
            ts: r.ts,
        }
    }
}

/// Values are stored as JSON text; anything unparseable is returned as the
/// raw string rather than failing the read.
fn decode_value(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn encode_value(v: &Value) -> String {
    v.to_string()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/agri-hub/telemetry.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub fn now_ms() -> i64 {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
    }

    // ----------------------------
    // Entities (read side)
    // ----------------------------

    pub async fn list_entities(&self) -> Result<Vec<Entity>> {
        let rows: Vec<EntityRow> = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities ORDER BY kind, name"
        ))
        .fetch_all(&self.pool)
        .await
        .context("list_entities failed")?;

        Ok(rows.into_iter().map(Entity::from).collect())
    }

    pub async fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
        let row: Option<EntityRow> = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_entity failed")?;

        Ok(row.map(Entity::from))
    }

    // ----------------------------
    // Logs (read side)
    // ----------------------------

    /// Newest first.
    pub async fn list_logs(&self, q: LogQuery) -> Result<Vec<LogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(
            r#"
            SELECT id, entity_id, name, value, kind, unit, ts
            FROM logs
            WHERE (? IS NULL OR entity_id = ?)
              AND (? IS NULL OR id < ?)
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(q.entity_id)
        .bind(q.entity_id)
        .bind(q.before)
        .bind(q.before)
        .bind(q.limit)
        .fetch_all(&self.pool)
        .await
        .context("list_logs failed")?;

        Ok(rows.into_iter().map(LogEntry::from).collect())
    }

    // ----------------------------
    // Alerts (read side)
    // ----------------------------

    pub async fn list_alerts(&self, limit: i64) -> Result<Vec<Alert>> {
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, entity_id, name, value, threshold, direction, message, ts
            FROM alerts
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_alerts failed")?;

        Ok(rows.into_iter().map(Alert::from).collect())
    }
}

// ---------------------------------------------------------------------------
// Ingest-side contract
// ---------------------------------------------------------------------------

#[async_trait]
impl TelemetryStore for Db {
    async fn find_entity_by_name(&self, name: &str) -> Result<Option<Entity>> {
        let row: Option<EntityRow> = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("find_entity_by_name failed")?;

        Ok(row.map(Entity::from))
    }

    async fn create_entity_if_absent(&self, e: &NewEntity<'_>) -> Result<(Entity, bool)> {
        let mut tx = self.pool.begin().await.context("create_entity: begin failed")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO entities (name, kind, value, unit, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(e.name)
        .bind(e.kind.as_str())
        .bind(encode_value(e.value))
        .bind(e.unit)
        .bind(e.now)
        .bind(e.now)
        .execute(&mut *tx)
        .await
        .context("create_entity: insert failed")?
        .rows_affected()
            == 1;

        let row: EntityRow = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE name = ?"
        ))
        .bind(e.name)
        .fetch_one(&mut *tx)
        .await
        .context("create_entity: reload failed")?;

        tx.commit().await.context("create_entity: commit failed")?;
        Ok((row.into(), inserted))
    }

    async fn update_entity_value(&self, id: i64, value: &Value, unit: &str, now: i64) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE entities
            SET value = ?, unit = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(encode_value(value))
        .bind(unit)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("update_entity_value failed")?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn try_append_log(&self, log: &NewLog<'_>, window_start: i64, max_logs: u32) -> Result<bool> {
        // The first statement writes, so SQLite takes the write lock before
        // the window is counted and concurrent admissions serialize here.
        let mut tx = self.pool.begin().await.context("try_append_log: begin failed")?;

        let admitted = sqlx::query(
            r#"
            INSERT INTO logs (entity_id, name, value, kind, unit, ts)
            SELECT ?, ?, ?, ?, ?, ?
            WHERE (SELECT COUNT(*) FROM logs WHERE entity_id = ? AND ts > ?) < ?
            "#,
        )
        .bind(log.entity_id)
        .bind(log.name)
        .bind(encode_value(log.value))
        .bind(log.kind.as_str())
        .bind(log.unit)
        .bind(log.ts)
        .bind(log.entity_id)
        .bind(window_start)
        .bind(i64::from(max_logs))
        .execute(&mut *tx)
        .await
        .context("try_append_log: insert failed")?
        .rows_affected()
            == 1;

        if admitted {
            sqlx::query("UPDATE entities SET last_log_ts = ? WHERE id = ?")
                .bind(log.ts)
                .bind(log.entity_id)
                .execute(&mut *tx)
                .await
                .context("try_append_log: last_log_ts update failed")?;
        }

        tx.commit().await.context("try_append_log: commit failed")?;
        Ok(admitted)
    }

    #[cfg(test)]
    async fn count_recent_logs(&self, entity_id: i64, since: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM logs WHERE entity_id = ? AND ts > ?")
                .bind(entity_id)
                .bind(since)
                .fetch_one(&self.pool)
                .await
                .context("count_recent_logs failed")?;
        Ok(count)
    }

    async fn insert_alert(&self, a: &NewAlert<'_>) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO alerts (entity_id, name, value, threshold, direction, message, ts)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(a.entity_id)
        .bind(a.name)
        .bind(a.value)
        .bind(a.threshold)
        .bind(a.direction.as_str())
        .bind(a.message)
        .bind(a.ts)
        .execute(&self.pool)
        .await
        .context("insert_alert failed")?
        .last_insert_rowid();
        Ok(id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    async fn seed_entity(db: &Db, name: &str, value: &Value) -> Entity {
        let (e, created) = db
            .create_entity_if_absent(&NewEntity {
                name,
                kind: SignalKind::Sensor,
                value,
                unit: "°C",
                now: 1_000,
            })
            .await
            .unwrap();
        assert!(created);
        e
    }

    fn log_at<'a>(e: &'a Entity, value: &'a Value, ts: i64) -> NewLog<'a> {
        NewLog {
            entity_id: e.id,
            name: &e.name,
            value,
            kind: e.kind,
            unit: &e.unit,
            ts,
        }
    }

    // -- entities -----------------------------------------------------------

    #[tokio::test]
    async fn create_entity_is_idempotent_per_name() {
        let db = test_db().await;
        let first = seed_entity(&db, "Température", &json!(22)).await;

        let (again, created) = db
            .create_entity_if_absent(&NewEntity {
                name: "Température",
                kind: SignalKind::Sensor,
                value: &json!(99),
                unit: "°C",
                now: 2_000,
            })
            .await
            .unwrap();

        assert!(!created);
        assert_eq!(again.id, first.id);
        // The existing row is not overwritten by a losing create.
        assert_eq!(again.value, json!(22));
        assert_eq!(db.list_entities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn find_entity_by_name_missing() {
        let db = test_db().await;
        assert!(db.find_entity_by_name("Gaz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_entity_value_changes_value_and_timestamp() {
        let db = test_db().await;
        let e = seed_entity(&db, "Température", &json!(22)).await;

        assert!(db.update_entity_value(e.id, &json!(23.5), "°C", 5_000).await.unwrap());

        let got = db.get_entity(e.id).await.unwrap().unwrap();
        assert_eq!(got.value, json!(23.5));
        assert_eq!(got.updated_at, 5_000);
        assert_eq!(got.created_at, 1_000);
    }

    #[tokio::test]
    async fn update_missing_entity_reports_false() {
        let db = test_db().await;
        assert!(!db.update_entity_value(42, &json!(1), "", 0).await.unwrap());
    }

    #[tokio::test]
    async fn boolean_value_round_trips() {
        let db = test_db().await;
        let (e, _) = db
            .create_entity_if_absent(&NewEntity {
                name: "Pompe",
                kind: SignalKind::Actuator,
                value: &json!(true),
                unit: "",
                now: 0,
            })
            .await
            .unwrap();
        let got = db.find_entity_by_name("Pompe").await.unwrap().unwrap();
        assert_eq!(got.id, e.id);
        assert_eq!(got.kind, SignalKind::Actuator);
        assert_eq!(got.value, json!(true));
    }

    // -- log admission ------------------------------------------------------

    #[tokio::test]
    async fn first_log_is_admitted_and_marks_entity() {
        let db = test_db().await;
        let e = seed_entity(&db, "Température", &json!(22)).await;
        let v = json!(22);

        assert!(db.try_append_log(&log_at(&e, &v, 10_000), 10_000 - 300_000, 1).await.unwrap());

        let got = db.get_entity(e.id).await.unwrap().unwrap();
        assert_eq!(got.last_log_ts, Some(10_000));
    }

    #[tokio::test]
    async fn second_log_in_window_is_rejected() {
        let db = test_db().await;
        let e = seed_entity(&db, "Température", &json!(22)).await;
        let v = json!(22);
        let interval = 300_000;

        assert!(db.try_append_log(&log_at(&e, &v, 10_000), 10_000 - interval, 1).await.unwrap());
        assert!(!db.try_append_log(&log_at(&e, &v, 11_000), 11_000 - interval, 1).await.unwrap());
        // Exactly one interval later the first log has left the window.
        let later = 10_000 + interval;
        assert!(db.try_append_log(&log_at(&e, &v, later), later - interval, 1).await.unwrap());

        assert_eq!(db.count_recent_logs(e.id, 0).await.unwrap(), 2);
        let got = db.get_entity(e.id).await.unwrap().unwrap();
        assert_eq!(got.last_log_ts, Some(later));
    }

    #[tokio::test]
    async fn window_admits_up_to_max_logs() {
        let db = test_db().await;
        let e = seed_entity(&db, "Gaz", &json!(400)).await;
        let v = json!(400);

        let mut admitted = 0;
        for i in 0..10 {
            let ts = 1_000 + i * 1_000;
            if db.try_append_log(&log_at(&e, &v, ts), ts - 300_000, 3).await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn windows_are_per_entity() {
        let db = test_db().await;
        let a = seed_entity(&db, "Température", &json!(22)).await;
        let b = seed_entity(&db, "Gaz", &json!(400)).await;
        let v = json!(1);

        assert!(db.try_append_log(&log_at(&a, &v, 1_000), -299_000, 1).await.unwrap());
        assert!(db.try_append_log(&log_at(&b, &v, 1_000), -299_000, 1).await.unwrap());
    }

    #[tokio::test]
    async fn log_value_and_unit_round_trip() {
        let db = test_db().await;
        let e = seed_entity(&db, "Température", &json!(22)).await;
        let v = json!(21.75);

        db.try_append_log(&log_at(&e, &v, 1_000), 0, 1).await.unwrap();

        let logs = db
            .list_logs(LogQuery { entity_id: Some(e.id), before: None, limit: 10 })
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].value, json!(21.75));
        assert_eq!(logs[0].unit, "°C");
        assert_eq!(logs[0].name, "Température");
        assert_eq!(logs[0].ts, 1_000);
    }

    // -- pagination ---------------------------------------------------------

    #[tokio::test]
    async fn list_logs_pages_backwards() {
        let db = test_db().await;
        let e = seed_entity(&db, "Gaz", &json!(400)).await;
        for i in 0..5 {
            let v = json!(i);
            db.try_append_log(&log_at(&e, &v, i), i64::MIN, 100).await.unwrap();
        }

        let page1 = db
            .list_logs(LogQuery { entity_id: None, before: None, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].value, json!(4));
        assert_eq!(page1[1].value, json!(3));

        let page2 = db
            .list_logs(LogQuery { entity_id: None, before: Some(page1[1].id), limit: 2 })
            .await
            .unwrap();
        assert_eq!(page2[0].value, json!(2));
        assert_eq!(page2[1].value, json!(1));
    }

    #[tokio::test]
    async fn list_logs_filters_by_entity() {
        let db = test_db().await;
        let a = seed_entity(&db, "Température", &json!(22)).await;
        let b = seed_entity(&db, "Gaz", &json!(400)).await;
        let v = json!(1);
        db.try_append_log(&log_at(&a, &v, 1), i64::MIN, 10).await.unwrap();
        db.try_append_log(&log_at(&b, &v, 2), i64::MIN, 10).await.unwrap();

        let logs = db
            .list_logs(LogQuery { entity_id: Some(b.id), before: None, limit: 10 })
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].entity_id, b.id);
    }

    // -- alerts -------------------------------------------------------------

    #[tokio::test]
    async fn alerts_are_listed_newest_first() {
        let db = test_db().await;
        let e = seed_entity(&db, "Température", &json!(36)).await;
        for (i, v) in [36.0, 37.0].into_iter().enumerate() {
            db.insert_alert(&NewAlert {
                entity_id: e.id,
                name: "Température",
                value: v,
                threshold: 35.0,
                direction: Direction::Above,
                message: "hot",
                ts: i as i64,
            })
            .await
            .unwrap();
        }

        let alerts = db.list_alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].value, 37.0);
        assert_eq!(alerts[0].direction, Direction::Above);
    }

    #[test]
    fn corrupt_value_decodes_as_string() {
        assert_eq!(decode_value("{oops".into()), json!("{oops"));
        assert_eq!(decode_value("12".into()), json!(12));
    }
}
