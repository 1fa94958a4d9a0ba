//! SQLite-backed trace, point and attachment storage.

use super::{AttachmentKey, BlobInfo, BlobStore, PointStore, TraceStore};
use crate::error::{Result, TraceError};
use crate::migrations;
use crate::points::{FixedBounds, StoredPoint};
use crate::trace::{NewTrace, Trace, Visibility};
use log::{debug, info};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeSet;
use std::io::{Cursor, Read};

const TRACE_COLUMNS: &str = "id, user_id, name, description, timestamp, visibility, visible, \
                             size, latitude, longitude, inserted";

/// Relational store on a single SQLite connection.
///
/// Not `Sync`: concurrent jobs open their own store on the same file.
pub struct SqliteStore {
    db: Connection,
}

impl SqliteStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) the database at `db_path` and migrate it.
    pub fn new(db_path: &str) -> Result<Self> {
        let mut db = Connection::open(db_path)?;
        Self::init_schema(&mut db)?;
        info!("[SqliteStore] Opened {}", db_path);
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn init_schema(conn: &mut Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::migrate(conn)
    }

    // ========================================================================
    // Row mapping
    // ========================================================================

    fn trace_from_row(row: &Row<'_>) -> rusqlite::Result<Trace> {
        let visibility: String = row.get(5)?;
        let visibility = Visibility::from_str(&visibility).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                format!("unknown visibility '{}'", visibility).into(),
            )
        })?;
        Ok(Trace {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            timestamp: row.get(4)?,
            visibility,
            visible: row.get(6)?,
            size: row.get(7)?,
            latitude: row.get(8)?,
            longitude: row.get(9)?,
            inserted: row.get(10)?,
            tags: BTreeSet::new(),
        })
    }

    fn load_tags(&self, trace_id: i64) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .db
            .prepare_cached("SELECT tag FROM trace_tags WHERE trace_id = ?")?;
        let tags = stmt
            .query_map(params![trace_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<String>>>()?;
        Ok(tags)
    }

    fn store_tags(conn: &Connection, trace_id: i64, tags: &BTreeSet<String>) -> Result<()> {
        conn.execute("DELETE FROM trace_tags WHERE trace_id = ?", params![trace_id])?;
        let mut stmt =
            conn.prepare_cached("INSERT INTO trace_tags (trace_id, tag) VALUES (?, ?)")?;
        for tag in tags {
            stmt.execute(params![trace_id, tag])?;
        }
        Ok(())
    }

    /// Run a trace query and attach each trace's tags.
    fn query_traces(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Trace>> {
        let mut stmt = self.db.prepare(sql)?;
        let mut traces = stmt
            .query_map(args, Self::trace_from_row)?
            .collect::<rusqlite::Result<Vec<Trace>>>()?;
        for trace in &mut traces {
            trace.tags = self.load_tags(trace.id)?;
        }
        Ok(traces)
    }
}

// ============================================================================
// Traces
// ============================================================================

impl TraceStore for SqliteStore {
    fn create_trace(&self, new: &NewTrace) -> Result<Trace> {
        let tx = self.db.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO traces (user_id, name, description, timestamp, visibility, visible, inserted)
             VALUES (?, ?, ?, ?, ?, 1, 0)",
            params![
                new.user_id,
                new.name,
                new.description,
                new.timestamp,
                new.visibility.as_str()
            ],
        )?;
        let id = tx.last_insert_rowid();
        Self::store_tags(&tx, id, &new.tags)?;
        tx.commit()?;

        debug!("[SqliteStore] Created trace {} for user {}", id, new.user_id);
        Ok(new.clone().into_trace(id))
    }

    fn find_trace(&self, id: i64) -> Result<Option<Trace>> {
        let sql = format!("SELECT {} FROM traces WHERE id = ?", TRACE_COLUMNS);
        let trace = self
            .db
            .query_row(&sql, params![id], Self::trace_from_row)
            .optional()?;
        match trace {
            Some(mut trace) => {
                trace.tags = self.load_tags(id)?;
                Ok(Some(trace))
            }
            None => Ok(None),
        }
    }

    fn update_trace(&self, trace: &Trace) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE traces SET user_id = ?, name = ?, description = ?, timestamp = ?,
                    visibility = ?, visible = ?, size = ?, latitude = ?, longitude = ?,
                    inserted = ?
             WHERE id = ?",
            params![
                trace.user_id,
                trace.name,
                trace.description,
                trace.timestamp,
                trace.visibility.as_str(),
                trace.visible,
                trace.size,
                trace.latitude,
                trace.longitude,
                trace.inserted,
                trace.id
            ],
        )?;
        if updated == 0 {
            return Err(TraceError::Persistence(rusqlite::Error::QueryReturnedNoRows));
        }
        Self::store_tags(&tx, trace.id, &trace.tags)?;
        tx.commit()?;
        Ok(())
    }

    fn delete_trace(&self, id: i64) -> Result<bool> {
        let deleted = self
            .db
            .execute("DELETE FROM traces WHERE id = ?", params![id])?;
        Ok(deleted > 0)
    }

    fn traces_for_user(&self, user_id: i64) -> Result<Vec<Trace>> {
        let sql = format!(
            "SELECT {} FROM traces WHERE user_id = ? ORDER BY id",
            TRACE_COLUMNS
        );
        self.query_traces(&sql, params![user_id])
    }

    fn traces_tagged(&self, tag: &str) -> Result<Vec<Trace>> {
        let sql = format!(
            "SELECT {} FROM traces
             WHERE visible = 1 AND id IN (SELECT trace_id FROM trace_tags WHERE tag = ?)
             ORDER BY id",
            TRACE_COLUMNS
        );
        self.query_traces(&sql, params![tag])
    }

    fn traces_visible_to(&self, user_id: i64) -> Result<Vec<Trace>> {
        let sql = format!(
            "SELECT {} FROM traces
             WHERE visible = 1 AND (user_id = ? OR visibility IN ('public', 'identifiable'))
             ORDER BY id",
            TRACE_COLUMNS
        );
        self.query_traces(&sql, params![user_id])
    }
}

// ============================================================================
// Points
// ============================================================================

impl PointStore for SqliteStore {
    fn insert_points(&self, points: &[StoredPoint]) -> Result<usize> {
        let tx = self.db.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO trace_points
                    (trace_id, latitude, longitude, altitude, timestamp, segment, tile)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for p in points {
                stmt.execute(params![
                    p.trace_id,
                    p.latitude,
                    p.longitude,
                    p.altitude,
                    p.timestamp,
                    p.segment,
                    p.tile
                ])?;
            }
        }
        tx.commit()?;
        Ok(points.len())
    }

    fn delete_points(&self, trace_id: i64) -> Result<usize> {
        let deleted = self.db.execute(
            "DELETE FROM trace_points WHERE trace_id = ?",
            params![trace_id],
        )?;
        Ok(deleted)
    }

    fn point_bounds(&self, trace_id: i64) -> Result<Option<FixedBounds>> {
        let bounds = self.db.query_row(
            "SELECT MIN(latitude), MIN(longitude), MAX(latitude), MAX(longitude)
             FROM trace_points WHERE trace_id = ?",
            params![trace_id],
            |row| {
                Ok((
                    row.get::<_, Option<i32>>(0)?,
                    row.get::<_, Option<i32>>(1)?,
                    row.get::<_, Option<i32>>(2)?,
                    row.get::<_, Option<i32>>(3)?,
                ))
            },
        )?;
        Ok(match bounds {
            (Some(min_lat), Some(min_lon), Some(max_lat), Some(max_lon)) => Some(FixedBounds {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            }),
            _ => None,
        })
    }

    fn point_count(&self, trace_id: i64) -> Result<usize> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM trace_points WHERE trace_id = ?",
            params![trace_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn load_points(&self, trace_id: i64) -> Result<Vec<StoredPoint>> {
        let mut stmt = self.db.prepare_cached(
            "SELECT trace_id, latitude, longitude, altitude, timestamp, segment, tile
             FROM trace_points WHERE trace_id = ? ORDER BY rowid",
        )?;
        let points = stmt
            .query_map(params![trace_id], |row| {
                Ok(StoredPoint {
                    trace_id: row.get(0)?,
                    latitude: row.get(1)?,
                    longitude: row.get(2)?,
                    altitude: row.get(3)?,
                    timestamp: row.get(4)?,
                    segment: row.get(5)?,
                    tile: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }
}

// ============================================================================
// Attachments
// ============================================================================

impl BlobStore for SqliteStore {
    fn attach(
        &self,
        key: AttachmentKey,
        bytes: &[u8],
        filename: &str,
        content_type: &str,
    ) -> Result<()> {
        self.db.execute(
            "INSERT OR REPLACE INTO attachments (trace_id, slot, filename, content_type, data)
             VALUES (?, ?, ?, ?, ?)",
            params![
                key.trace_id,
                key.slot.as_str(),
                filename,
                content_type,
                bytes
            ],
        )?;
        debug!(
            "[SqliteStore] Attached {} ({} bytes, {}) to trace {} {}",
            filename,
            bytes.len(),
            content_type,
            key.trace_id,
            key.slot
        );
        Ok(())
    }

    fn is_attached(&self, key: AttachmentKey) -> Result<bool> {
        Ok(self.blob_info(key)?.is_some())
    }

    fn blob_info(&self, key: AttachmentKey) -> Result<Option<BlobInfo>> {
        let info = self
            .db
            .query_row(
                "SELECT filename, content_type, length(data) FROM attachments
                 WHERE trace_id = ? AND slot = ?",
                params![key.trace_id, key.slot.as_str()],
                |row| {
                    Ok(BlobInfo {
                        filename: row.get(0)?,
                        content_type: row.get(1)?,
                        byte_size: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    fn open_for_read(&self, key: AttachmentKey) -> Result<Box<dyn Read>> {
        Ok(Box::new(Cursor::new(self.download(key)?)))
    }

    fn download(&self, key: AttachmentKey) -> Result<Vec<u8>> {
        self.db
            .query_row(
                "SELECT data FROM attachments WHERE trace_id = ? AND slot = ?",
                params![key.trace_id, key.slot.as_str()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?
            .ok_or(TraceError::MissingAttachment {
                trace_id: key.trace_id,
                slot: key.slot,
            })
    }

    fn update_filename(&self, key: AttachmentKey, filename: &str) -> Result<()> {
        let updated = self.db.execute(
            "UPDATE attachments SET filename = ? WHERE trace_id = ? AND slot = ?",
            params![filename, key.trace_id, key.slot.as_str()],
        )?;
        if updated == 0 {
            return Err(TraceError::MissingAttachment {
                trace_id: key.trace_id,
                slot: key.slot,
            });
        }
        Ok(())
    }

    fn purge(&self, key: AttachmentKey) -> Result<bool> {
        let deleted = self.db.execute(
            "DELETE FROM attachments WHERE trace_id = ? AND slot = ?",
            params![key.trace_id, key.slot.as_str()],
        )?;
        Ok(deleted > 0)
    }
}
