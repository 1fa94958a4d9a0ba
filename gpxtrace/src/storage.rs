//! Moving trace artifacts between the legacy on-disk layout and blob storage,
//! and cleaning both up when a trace is destroyed.

use crate::config::Config;
use crate::content::{self, ContentKind};
use crate::error::{Result, TraceError};
use crate::render::GIF_CONTENT_TYPE;
use crate::store::{AttachmentKey, AttachmentSlot, BlobStore, TraceStore};
use crate::trace::Trace;
use log::{debug, info, warn};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

/// Deterministic legacy file locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyPaths {
    trace_dir: PathBuf,
    image_dir: PathBuf,
}

impl LegacyPaths {
    pub fn new(trace_dir: impl Into<PathBuf>, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            trace_dir: trace_dir.into(),
            image_dir: image_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.trace_dir, &config.image_dir)
    }

    pub fn trace_file(&self, trace_id: i64) -> PathBuf {
        self.trace_dir.join(format!("{}.gpx", trace_id))
    }

    pub fn picture(&self, trace_id: i64) -> PathBuf {
        self.image_dir.join(format!("{}.gif", trace_id))
    }

    pub fn icon(&self, trace_id: i64) -> PathBuf {
        self.image_dir.join(format!("{}_icon.gif", trace_id))
    }

    pub fn all(&self, trace_id: i64) -> [PathBuf; 3] {
        [
            self.trace_file(trace_id),
            self.picture(trace_id),
            self.icon(trace_id),
        ]
    }
}

/// Stored name of a trace's original file.
pub fn file_name_for(trace_id: i64, kind: ContentKind) -> String {
    format!("{}{}", trace_id, kind.extension())
}

/// Rename the attached original file to `{id}{extension}` for its content
/// type. Returns the resulting name.
pub fn sync_file_name(trace: &Trace, blobs: &dyn BlobStore) -> Result<String> {
    let key = AttachmentKey::file(trace.id);
    let info = blobs
        .blob_info(key)?
        .ok_or(TraceError::MissingAttachment {
            trace_id: trace.id,
            slot: AttachmentSlot::File,
        })?;
    let name = file_name_for(trace.id, ContentKind::from_content_type(&info.content_type));
    if info.filename != name {
        blobs.update_filename(key, &name)?;
        debug!(
            "[Storage] Renamed file of trace {}: {} -> {}",
            trace.id, info.filename, name
        );
    }
    Ok(name)
}

/// Attach a freshly uploaded original file, typed by its content.
pub fn attach_upload(trace: &Trace, bytes: &[u8], blobs: &dyn BlobStore) -> Result<ContentKind> {
    let kind = content::classify(bytes);
    blobs.attach(
        AttachmentKey::file(trace.id),
        bytes,
        &trace.name,
        kind.content_type(),
    )?;
    sync_file_name(trace, blobs)?;
    Ok(kind)
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Delete the legacy file, picture and icon. Missing files are skipped.
/// Returns how many files were removed.
pub fn remove_files(trace_id: i64, config: &Config) -> Result<usize> {
    let mut removed = 0;
    for path in LegacyPaths::from_config(config).all(trace_id) {
        if remove_if_present(&path)? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Move a trace's legacy on-disk artifacts into blob storage.
///
/// Picture and icon are migrated only for inserted traces. Every legacy file
/// is read before the first attach, and deleted only after everything is
/// attached. Returns false if all required blobs were already stored.
pub fn migrate_to_storage(trace: &Trace, blobs: &dyn BlobStore, config: &Config) -> Result<bool> {
    let mut required = vec![AttachmentKey::file(trace.id)];
    if trace.inserted {
        required.push(AttachmentKey::image(trace.id));
        required.push(AttachmentKey::icon(trace.id));
    }
    let mut pending = false;
    for key in &required {
        pending |= !blobs.is_attached(*key)?;
    }
    if !pending {
        return Ok(false);
    }

    let paths = LegacyPaths::from_config(config);
    let bytes = std::fs::read(paths.trace_file(trace.id))?;
    let images = if trace.inserted {
        let picture = std::fs::read(paths.picture(trace.id))?;
        let icon = std::fs::read(paths.icon(trace.id))?;
        Some((picture, icon))
    } else {
        None
    };

    let kind = content::classify(&bytes);
    blobs.attach(AttachmentKey::file(trace.id), &bytes, &trace.name, kind.content_type())?;
    if let Some((picture, icon)) = images {
        blobs.attach(
            AttachmentKey::image(trace.id),
            &picture,
            &format!("{}.gif", trace.id),
            GIF_CONTENT_TYPE,
        )?;
        blobs.attach(
            AttachmentKey::icon(trace.id),
            &icon,
            &format!("{}_icon.gif", trace.id),
            GIF_CONTENT_TYPE,
        )?;
    }

    sync_file_name(trace, blobs)?;
    let removed = remove_files(trace.id, config)?;
    info!(
        "[Storage] Migrated trace {} ({}), removed {} legacy files",
        trace.id, kind, removed
    );
    Ok(true)
}

/// Outcome of [`destroy_trace`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub trace_id: i64,
    /// The trace row existed and was deleted.
    pub row_deleted: bool,
    pub purged: Vec<AttachmentSlot>,
    pub files_removed: usize,
    /// One message per failed step.
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delete a trace with its points and tags, purge its attachments and remove
/// legacy files. Every step runs even when an earlier one fails.
pub fn destroy_trace(
    trace_id: i64,
    store: &dyn TraceStore,
    blobs: &dyn BlobStore,
    config: &Config,
) -> CleanupReport {
    let mut report = CleanupReport {
        trace_id,
        ..Default::default()
    };

    match store.delete_trace(trace_id) {
        Ok(deleted) => report.row_deleted = deleted,
        Err(e) => {
            warn!("[Storage] Trace {}: deleting row failed: {}", trace_id, e);
            report.failures.push(format!("row: {}", e));
        }
    }

    for slot in AttachmentSlot::ALL {
        match blobs.purge(AttachmentKey { trace_id, slot }) {
            Ok(true) => report.purged.push(slot),
            Ok(false) => {}
            Err(e) => {
                warn!("[Storage] Trace {}: purging {} failed: {}", trace_id, slot, e);
                report.failures.push(format!("{}: {}", slot, e));
            }
        }
    }

    for path in LegacyPaths::from_config(config).all(trace_id) {
        match remove_if_present(&path) {
            Ok(true) => report.files_removed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(
                    "[Storage] Trace {}: removing {} failed: {}",
                    trace_id,
                    path.display(),
                    e
                );
                report.failures.push(format!("{}: {}", path.display(), e));
            }
        }
    }

    info!(
        "[Storage] Destroyed trace {}: row={}, purged={:?}, files={}, failures={}",
        trace_id,
        report.row_deleted,
        report.purged,
        report.files_removed,
        report.failures.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::trace::{NewTrace, Visibility};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    const GPX: &[u8] = b"<?xml version=\"1.0\"?><gpx><trk><trkseg/></trk></gpx>";

    fn setup() -> (TempDir, Config, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let config = Config {
            trace_dir: dir.path().join("traces"),
            image_dir: dir.path().join("images"),
            ..Config::default()
        };
        std::fs::create_dir_all(&config.trace_dir).unwrap();
        std::fs::create_dir_all(&config.image_dir).unwrap();
        (dir, config, SqliteStore::in_memory().unwrap())
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn write_legacy(config: &Config, id: i64, file: &[u8], images: bool) {
        let paths = LegacyPaths::from_config(config);
        std::fs::write(paths.trace_file(id), file).unwrap();
        if images {
            std::fs::write(paths.picture(id), b"GIF89a-picture").unwrap();
            std::fs::write(paths.icon(id), b"GIF89a-icon").unwrap();
        }
    }

    #[test]
    fn test_legacy_paths() {
        let paths = LegacyPaths::new("/t", "/i");
        assert_eq!(paths.trace_file(9), PathBuf::from("/t/9.gpx"));
        assert_eq!(paths.picture(9), PathBuf::from("/i/9.gif"));
        assert_eq!(paths.icon(9), PathBuf::from("/i/9_icon.gif"));
    }

    #[test]
    fn test_attach_upload_names_file_by_content() {
        let (_dir, _config, store) = setup();
        let trace = store
            .create_trace(&NewTrace::new(1, "morning.xml", Visibility::Public))
            .unwrap();
        let kind = attach_upload(&trace, &gzip(GPX), &store).unwrap();
        assert_eq!(kind, ContentKind::Gzip);

        let info = store.blob_info(AttachmentKey::file(trace.id)).unwrap().unwrap();
        assert_eq!(info.filename, format!("{}.gpx.gz", trace.id));
        assert_eq!(info.content_type, "application/gzip");
    }

    #[test]
    fn test_sync_file_name_requires_attachment() {
        let (_dir, _config, store) = setup();
        let trace = NewTrace::new(1, "x.gpx", Visibility::Public).into_trace(3);
        assert!(matches!(
            sync_file_name(&trace, &store),
            Err(TraceError::MissingAttachment { trace_id: 3, .. })
        ));
    }

    #[test]
    fn test_migrate_inserted_trace() {
        let (_dir, config, store) = setup();
        let mut trace = store
            .create_trace(&NewTrace::new(1, "ride.gpx", Visibility::Public))
            .unwrap();
        trace.inserted = true;
        write_legacy(&config, trace.id, GPX, true);

        assert!(migrate_to_storage(&trace, &store, &config).unwrap());

        let file = store.blob_info(AttachmentKey::file(trace.id)).unwrap().unwrap();
        assert_eq!(file.filename, format!("{}.gpx", trace.id));
        assert_eq!(file.content_type, "application/gpx+xml");
        assert_eq!(store.download(AttachmentKey::file(trace.id)).unwrap(), GPX);
        assert_eq!(
            store.download(AttachmentKey::icon(trace.id)).unwrap(),
            b"GIF89a-icon"
        );
        for path in LegacyPaths::from_config(&config).all(trace.id) {
            assert!(!path.exists());
        }

        // Second run is a no-op.
        assert!(!migrate_to_storage(&trace, &store, &config).unwrap());
    }

    #[test]
    fn test_migrate_pending_trace_skips_images() {
        let (_dir, config, store) = setup();
        let trace = store
            .create_trace(&NewTrace::new(1, "ride.gpx", Visibility::Private))
            .unwrap();
        write_legacy(&config, trace.id, &gzip(GPX), false);

        migrate_to_storage(&trace, &store, &config).unwrap();
        assert!(!store.is_attached(AttachmentKey::image(trace.id)).unwrap());
        let file = store.blob_info(AttachmentKey::file(trace.id)).unwrap().unwrap();
        assert_eq!(file.filename, format!("{}.gpx.gz", trace.id));
    }

    #[test]
    fn test_migrate_missing_picture_attaches_nothing() {
        let (_dir, config, store) = setup();
        let mut trace = store
            .create_trace(&NewTrace::new(1, "ride.gpx", Visibility::Public))
            .unwrap();
        trace.inserted = true;
        write_legacy(&config, trace.id, GPX, false);

        assert!(matches!(
            migrate_to_storage(&trace, &store, &config),
            Err(TraceError::Io(_))
        ));
        assert!(!store.is_attached(AttachmentKey::file(trace.id)).unwrap());

        // Once the images exist the retry migrates everything.
        write_legacy(&config, trace.id, GPX, true);
        assert!(migrate_to_storage(&trace, &store, &config).unwrap());
        assert!(store.is_attached(AttachmentKey::image(trace.id)).unwrap());
        assert!(store.is_attached(AttachmentKey::icon(trace.id)).unwrap());
        for path in LegacyPaths::from_config(&config).all(trace.id) {
            assert!(!path.exists());
        }
    }

    #[test]
    fn test_migrate_completes_partial_migration() {
        let (_dir, config, store) = setup();
        let mut trace = store
            .create_trace(&NewTrace::new(1, "ride.gpx", Visibility::Public))
            .unwrap();
        trace.inserted = true;
        attach_upload(&trace, GPX, &store).unwrap();
        write_legacy(&config, trace.id, GPX, true);

        assert!(migrate_to_storage(&trace, &store, &config).unwrap());
        assert_eq!(
            store.download(AttachmentKey::image(trace.id)).unwrap(),
            b"GIF89a-picture"
        );
    }

    #[test]
    fn test_migrate_without_legacy_file_fails() {
        let (_dir, config, store) = setup();
        let trace = NewTrace::new(1, "gone.gpx", Visibility::Public).into_trace(77);
        assert!(matches!(
            migrate_to_storage(&trace, &store, &config),
            Err(TraceError::Io(_))
        ));
    }

    #[test]
    fn test_remove_files_tolerates_missing() {
        let (_dir, config, _store) = setup();
        write_legacy(&config, 4, GPX, false);
        assert_eq!(remove_files(4, &config).unwrap(), 1);
        assert_eq!(remove_files(4, &config).unwrap(), 0);
    }

    #[test]
    fn test_destroy_trace() {
        let (_dir, config, store) = setup();
        let trace = store
            .create_trace(&NewTrace::new(1, "ride.gpx", Visibility::Public))
            .unwrap();
        attach_upload(&trace, GPX, &store).unwrap();
        store
            .attach(AttachmentKey::icon(trace.id), b"GIF", "i.gif", GIF_CONTENT_TYPE)
            .unwrap();
        write_legacy(&config, trace.id, GPX, false);

        let report = destroy_trace(trace.id, &store, &store, &config);
        assert!(report.is_clean());
        assert!(report.row_deleted);
        assert_eq!(report.purged, vec![AttachmentSlot::File, AttachmentSlot::Icon]);
        assert_eq!(report.files_removed, 1);
        assert!(store.find_trace(trace.id).unwrap().is_none());
    }

    #[test]
    fn test_destroy_collects_failures() {
        let (_dir, config, store) = setup();
        let trace = store
            .create_trace(&NewTrace::new(1, "ride.gpx", Visibility::Public))
            .unwrap();
        // A directory where the picture should be cannot be removed as a file.
        std::fs::create_dir(LegacyPaths::from_config(&config).picture(trace.id)).unwrap();
        write_legacy(&config, trace.id, GPX, false);

        let report = destroy_trace(trace.id, &store, &store, &config);
        assert!(report.row_deleted);
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.failures.len(), 1);
    }
}
