use log::info;
use rusqlite::Connection;
use rusqlite_migration::{M, Migrations, SchemaVersion};

use crate::error::Result;

/// Number of steps in [`migrations`].
const LATEST_VERSION: usize = 2;

/// Schema history. Append new steps; never edit a released one.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            r#"
            CREATE TABLE traces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                timestamp TEXT NOT NULL,
                visibility TEXT NOT NULL
                    CHECK(visibility IN ('private', 'public', 'trackable', 'identifiable')),
                visible INTEGER NOT NULL DEFAULT 1,
                size INTEGER,
                latitude REAL,
                longitude REAL,
                inserted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE trace_tags (
                trace_id INTEGER NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (trace_id, tag),
                FOREIGN KEY (trace_id) REFERENCES traces(id) ON DELETE CASCADE
            );

            -- Fixed-point coordinates (degrees * 10^7)
            CREATE TABLE trace_points (
                trace_id INTEGER NOT NULL,
                latitude INTEGER NOT NULL,
                longitude INTEGER NOT NULL,
                altitude REAL,
                timestamp TEXT NOT NULL,
                segment INTEGER NOT NULL,
                FOREIGN KEY (trace_id) REFERENCES traces(id) ON DELETE CASCADE
            );

            CREATE TABLE attachments (
                trace_id INTEGER NOT NULL,
                slot TEXT NOT NULL CHECK(slot IN ('file', 'image', 'icon')),
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (trace_id, slot)
            );

            CREATE INDEX idx_traces_user ON traces(user_id);
            CREATE INDEX idx_trace_tags_tag ON trace_tags(tag);
            CREATE INDEX idx_trace_points_trace ON trace_points(trace_id);
            "#,
        ),
        // QuadTile column for spatial lookups
        M::up(
            r#"
            ALTER TABLE trace_points ADD COLUMN tile INTEGER NOT NULL DEFAULT 0;
            CREATE INDEX idx_trace_points_tile ON trace_points(tile);
            "#,
        ),
    ])
}

/// Bring `conn` up to the latest schema version.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let migrations = migrations();
    let before = migrations.current_version(conn)?;
    migrations.to_latest(conn)?;
    let after = migrations.current_version(conn)?;
    if before != after {
        info!("[Migrations] Schema migrated from {:?} to {:?}", before, after);
    }
    Ok(())
}

/// True if the schema is behind the latest version.
pub fn needs_migration(conn: &Connection) -> Result<bool> {
    let current = migrations().current_version(conn)?;
    Ok(!matches!(current, SchemaVersion::Inside(v) if v.get() == LATEST_VERSION))
}
