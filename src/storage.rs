//! Camera directory and alert persistence.
//!
//! Both live in one SQLite database with the product schema:
//! `camera_streams` (registered cameras) and `alerts`. Every camera worker
//! opens its own connection; WAL mode and a busy timeout let several workers
//! write to the same file.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::alert::{AlertRecord, AlertStatus, NewAlert};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot of one camera's configuration, loaded once per pipeline run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: i64,
    pub name: String,
    pub stream_url: String,
    pub location: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Camera to register.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewCamera {
    pub name: String,
    pub stream_url: String,
    pub location: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub description: Option<String>,
    pub active: bool,
}

/// Read-only lookup of active cameras.
pub trait CameraDirectory {
    /// Active cameras ordered by id.
    fn active_cameras(&mut self) -> Result<Vec<CameraConfig>>;

    /// Active camera by id. Inactive or missing cameras are an error.
    fn camera(&mut self, id: i64) -> Result<CameraConfig>;

    /// Active camera with the lowest id.
    fn first_active(&mut self) -> Result<CameraConfig> {
        self.active_cameras()?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no active cameras found in database"))
    }
}

/// Alert persistence. `create` is one atomic insert; on failure nothing is
/// written and the error is returned to the caller.
pub trait AlertRepository: Send {
    fn create(&mut self, alert: &NewAlert) -> Result<i64>;

    /// Most recent alerts first.
    fn recent(&mut self, limit: usize) -> Result<Vec<AlertRecord>>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`. `file:` URIs are
    /// passed through with URI parsing enabled.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )
        } else {
            Connection::open(db_path)
        }
        .with_context(|| format!("open database {}", db_path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS camera_streams (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              stream_url TEXT NOT NULL,
              location TEXT NOT NULL,
              active INTEGER NOT NULL DEFAULT 1,
              latitude REAL,
              longitude REAL,
              description TEXT,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              title TEXT NOT NULL,
              description TEXT NOT NULL,
              location TEXT NOT NULL,
              timestamp INTEGER NOT NULL,
              status TEXT NOT NULL DEFAULT 'new'
                CHECK (status IN ('new', 'in_progress', 'resolved', 'dismissed')),
              priority TEXT NOT NULL DEFAULT 'medium'
                CHECK (priority IN ('low', 'medium', 'high')),
              law_reference TEXT,
              source TEXT,
              image_url TEXT,
              camera_id INTEGER REFERENCES camera_streams(id)
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_camera_time ON alerts(camera_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Register a camera and return its id.
    pub fn register_camera(&mut self, camera: &NewCamera) -> Result<i64> {
        let now = epoch_ms(SystemTime::now())?;
        self.conn.execute(
            r#"
            INSERT INTO camera_streams(name, stream_url, location, active, latitude, longitude,
                                       description, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
            params![
                camera.name,
                camera.stream_url,
                camera.location,
                camera.active,
                camera.latitude,
                camera.longitude,
                camera.description,
                now
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_camera_active(&mut self, id: i64, active: bool) -> Result<()> {
        let now = epoch_ms(SystemTime::now())?;
        let changed = self.conn.execute(
            "UPDATE camera_streams SET active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, now, id],
        )?;
        if changed == 0 {
            return Err(anyhow!("camera {} not found", id));
        }
        Ok(())
    }
}

impl CameraDirectory for SqliteStore {
    fn active_cameras(&mut self) -> Result<Vec<CameraConfig>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, stream_url, location, latitude, longitude
             FROM camera_streams WHERE active = 1 ORDER BY id",
        )?;
        let cameras = stmt
            .query_map([], camera_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cameras)
    }

    fn camera(&mut self, id: i64) -> Result<CameraConfig> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, stream_url, location, latitude, longitude, active
                 FROM camera_streams WHERE id = ?1",
                params![id],
                |row| Ok((camera_from_row(row)?, row.get::<_, bool>(6)?)),
            )
            .optional()?;
        match row {
            Some((camera, true)) => Ok(camera),
            Some((_, false)) => Err(anyhow!("camera {} is not active", id)),
            None => Err(anyhow!("camera with id {} not found in database", id)),
        }
    }
}

impl AlertRepository for SqliteStore {
    fn create(&mut self, alert: &NewAlert) -> Result<i64> {
        let created_at = epoch_ms(alert.created_at)?;
        // Dropping the transaction without commit rolls it back.
        let tx = self.conn.transaction()?;
        let id: i64 = tx
            .query_row(
                r#"
                INSERT INTO alerts(title, description, location, timestamp, status, priority,
                                   law_reference, source, image_url, camera_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                RETURNING id
                "#,
                params![
                    alert.title,
                    alert.description,
                    alert.location,
                    created_at,
                    alert.status.as_str(),
                    alert.priority.as_str(),
                    alert.law_reference,
                    alert.source,
                    alert.image_url,
                    alert.camera_id
                ],
                |row| row.get(0),
            )
            .context("insert alert")?;
        tx.commit().context("commit alert")?;
        Ok(id)
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<AlertRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, location, timestamp, status, priority,
                    law_reference, source, image_url, camera_id
             FROM alerts ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(5)?;
            let priority: String = row.get(6)?;
            let created_at: i64 = row.get(4)?;
            out.push(AlertRecord {
                id: row.get(0)?,
                alert: NewAlert {
                    title: row.get(1)?,
                    description: row.get(2)?,
                    location: row.get(3)?,
                    created_at: from_epoch_ms(created_at),
                    status: status.parse()?,
                    priority: priority.parse()?,
                    law_reference: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                    source: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                    image_url: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                    camera_id: row.get(10)?,
                },
            });
        }
        Ok(out)
    }
}

fn camera_from_row(row: &Row<'_>) -> rusqlite::Result<CameraConfig> {
    Ok(CameraConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        stream_url: row.get(2)?,
        location: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
    })
}

fn epoch_ms(at: SystemTime) -> Result<i64> {
    let ms = at
        .duration_since(UNIX_EPOCH)
        .map_err(|_| anyhow!("timestamp before unix epoch"))?
        .as_millis();
    i64::try_from(ms).map_err(|_| anyhow!("timestamp exceeds i64 range"))
}

fn from_epoch_ms(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

/// In-memory alert repository. Clones share the same alerts.
#[derive(Clone, Default)]
pub struct InMemoryAlertRepository {
    inner: Arc<Mutex<InMemoryAlerts>>,
}

#[derive(Default)]
struct InMemoryAlerts {
    alerts: Vec<AlertRecord>,
    fail_next: u32,
}

impl InMemoryAlertRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` inserts fail.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next = count;
        }
    }

    /// All alerts in insertion order.
    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.inner
            .lock()
            .map(|inner| inner.alerts.clone())
            .unwrap_or_default()
    }
}

impl AlertRepository for InMemoryAlertRepository {
    fn create(&mut self, alert: &NewAlert) -> Result<i64> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("alert store lock poisoned"))?;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(anyhow!("alert insert failed"));
        }
        let id = inner.alerts.len() as i64 + 1;
        inner.alerts.push(AlertRecord {
            id,
            alert: alert.clone(),
        });
        Ok(id)
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<AlertRecord>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("alert store lock poisoned"))?;
        Ok(inner.alerts.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ALERT_SOURCE_CAMERA;
    use crate::violation::Priority;

    fn camera(name: &str, active: bool) -> NewCamera {
        NewCamera {
            name: name.to_string(),
            stream_url: format!("stub://{}", name),
            location: format!("{} street", name),
            latitude: Some(55.75),
            longitude: Some(37.61),
            description: None,
            active,
        }
    }

    fn alert(camera_id: i64, secs: u64) -> NewAlert {
        NewAlert {
            title: "Неправильная парковка".to_string(),
            description: "Обнаружено: car с вероятностью 90%".to_string(),
            location: "main street".to_string(),
            status: AlertStatus::New,
            priority: Priority::Low,
            law_reference: "КоАП РФ Статья 12.19".to_string(),
            source: ALERT_SOURCE_CAMERA.to_string(),
            image_url: "/violations/camera_1.jpg".to_string(),
            camera_id,
            created_at: UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs),
        }
    }

    fn open_temp() -> Result<(tempfile::TempDir, SqliteStore)> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("citywatch.db");
        let store = SqliteStore::open(path.to_str().ok_or_else(|| anyhow!("path"))?)?;
        Ok((dir, store))
    }

    #[test]
    fn first_active_skips_inactive_cameras() -> Result<()> {
        let (_dir, mut store) = open_temp()?;
        let parked = store.register_camera(&camera("parked", false))?;
        let main = store.register_camera(&camera("main", true))?;
        store.register_camera(&camera("side", true))?;

        let first = store.first_active()?;
        assert_eq!(first.id, main);
        assert_eq!(first.name, "main");
        assert_eq!(first.stream_url, "stub://main");
        assert_eq!(first.latitude, Some(55.75));
        assert_eq!(store.active_cameras()?.len(), 2);

        assert!(store.camera(parked).is_err());
        assert_eq!(store.camera(main)?.location, "main street");
        assert!(store.camera(999).is_err());
        Ok(())
    }

    #[test]
    fn no_active_camera_is_an_error() -> Result<()> {
        let (_dir, mut store) = open_temp()?;
        assert!(store.first_active().is_err());
        let id = store.register_camera(&camera("main", true))?;
        store.set_camera_active(id, false)?;
        assert!(store.first_active().is_err());
        assert!(store.set_camera_active(42, true).is_err());
        Ok(())
    }

    #[test]
    fn create_returns_id_and_round_trips() -> Result<()> {
        let (_dir, mut store) = open_temp()?;
        let cam = store.register_camera(&camera("main", true))?;

        let first = store.create(&alert(cam, 0))?;
        let second = store.create(&alert(cam, 20))?;
        assert!(second > first);

        let recent = store.recent(10)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, second);
        assert_eq!(recent[1].alert, alert(cam, 0));
        Ok(())
    }

    #[test]
    fn failed_insert_writes_nothing() -> Result<()> {
        let (_dir, mut store) = open_temp()?;
        // Foreign key to a camera that does not exist.
        assert!(store.create(&alert(77, 0)).is_err());
        assert!(store.recent(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn in_memory_repository_injects_failures() -> Result<()> {
        let repo = InMemoryAlertRepository::new();
        let mut writer = repo.clone();
        repo.fail_next(1);
        assert!(writer.create(&alert(1, 0)).is_err());
        assert_eq!(writer.create(&alert(1, 1))?, 1);
        assert_eq!(repo.alerts().len(), 1);
        assert_eq!(writer.recent(5)?[0].id, 1);
        Ok(())
    }
}
