//! End-to-end import scenarios against an on-disk SQLite database.
//!
//! Each test uploads a file, runs the import pipeline and checks the stored
//! points, attachments and derived trace fields.
//!
//! Run with: `cargo test -p gpxtrace --test import_scenarios`

use flate2::Compression;
use flate2::write::GzEncoder;
use gpxtrace::content;
use gpxtrace::storage::{attach_upload, destroy_trace};
use gpxtrace::{
    AttachmentKey, BlobStore, Bounds, Config, ContentKind, Extractor, ImportPipeline,
    LegacyPaths, NativeExtractor, NewTrace, PointStore, SqliteStore, Trace, TraceError,
    TraceStore, Visibility,
};
use std::collections::BTreeSet;
use std::io::Write;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Helper: temp dir with a database and legacy directories.
fn setup() -> (TempDir, Config, SqliteStore) {
    init_logging();
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let config = Config {
        trace_dir: tmp_dir.path().join("traces"),
        image_dir: tmp_dir.path().join("images"),
        ..Config::default()
    };
    std::fs::create_dir_all(&config.trace_dir).unwrap();
    std::fs::create_dir_all(&config.image_dir).unwrap();
    let db_path = tmp_dir.path().join("traces.db");
    let store = SqliteStore::new(db_path.to_str().unwrap()).expect("failed to open store");
    (tmp_dir, config, store)
}

/// Helper: create a trace and attach `file` as its upload.
fn upload(store: &SqliteStore, name: &str, file: &[u8]) -> Trace {
    let trace = store
        .create_trace(&NewTrace::new(1, name, Visibility::Identifiable))
        .expect("failed to create trace");
    attach_upload(&trace, file, store).expect("failed to attach upload");
    trace
}

fn trkpt(lat: &str, lon: &str, time: Option<&str>) -> String {
    match time {
        Some(t) => format!(
            r#"<trkpt lat="{}" lon="{}"><ele>312.5</ele><time>{}</time></trkpt>"#,
            lat, lon, t
        ),
        None => format!(r#"<trkpt lat="{}" lon="{}"/>"#, lat, lon),
    }
}

/// `count` valid points walking north-east from (47.0, 8.0).
fn walk(count: usize, offset: usize) -> Vec<String> {
    (offset..offset + count)
        .map(|i| {
            trkpt(
                &format!("{:.6}", 47.0 + i as f64 * 0.0001),
                &format!("{:.6}", 8.0 + i as f64 * 0.00015),
                Some(&format!("2024-06-01T08:{:02}:{:02}Z", (i / 60) % 60, i % 60)),
            )
        })
        .collect()
}

fn gpx(segments: &[Vec<String>]) -> Vec<u8> {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1"><trk><name>t</name>"#,
    );
    for seg in segments {
        xml.push_str("<trkseg>");
        for p in seg {
            xml.push_str(p);
        }
        xml.push_str("</trkseg>");
    }
    xml.push_str("</trk></gpx>");
    xml.into_bytes()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn tar_gz(name: &str, data: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
    gzip(&builder.into_inner().unwrap())
}

// ============================================================================
// Test: Two Segments With One Bad Point
// ============================================================================

#[test]
fn test_two_segments_with_unparsable_point() {
    let (_tmp, config, store) = setup();
    let mut first = walk(1200, 0);
    first.insert(600, trkpt("not-a-number", "8.0", Some("2024-06-01T09:00:00Z")));
    let second = walk(1300, 1200);
    let file = gpx(&[first, second]);
    let mut trace = upload(&store, "ridge.gpx", &file);

    let report = ImportPipeline::new(&config, &store, &store)
        .run(&mut trace)
        .expect("import failed");

    assert_eq!(report.possible_points, 2501);
    assert_eq!(report.actual_points, 2500);
    assert_eq!(report.segments, 2);
    assert_eq!(trace.size, Some(2500));
    assert!(trace.inserted);
    assert_eq!(trace.latitude, Some(47.0));
    assert_eq!(trace.longitude, Some(8.0));

    let points = store.load_points(trace.id).unwrap();
    assert_eq!(points.len(), 2500);
    let segments: BTreeSet<u32> = points.iter().map(|p| p.segment).collect();
    assert_eq!(segments.len(), 2);
    assert_eq!(points[0].altitude, Some(312.5));

    assert!(store.is_attached(AttachmentKey::image(trace.id)).unwrap());
    assert!(store.is_attached(AttachmentKey::icon(trace.id)).unwrap());
    let icon = store.blob_info(AttachmentKey::icon(trace.id)).unwrap().unwrap();
    assert_eq!(icon.filename, format!("{}_icon.gif", trace.id));
    assert_eq!(icon.content_type, "image/gif");

    // Stored aggregate agrees with the in-memory bounds of the decoded points.
    let decoded = gpxtrace::gpx::decode(&file).unwrap();
    assert_eq!(report.bounds, Bounds::from_points(&decoded.points));
}

// ============================================================================
// Test: Malformed Points Are Skipped
// ============================================================================

#[test]
fn test_three_malformed_of_thousand() {
    let (_tmp, config, store) = setup();
    let mut points = walk(997, 0);
    points.insert(10, trkpt("95.0", "8.0", Some("2024-06-01T09:00:00Z")));
    points.insert(500, trkpt("47.1", "8.1", None));
    points.insert(900, trkpt("47.1", "east", Some("2024-06-01T09:00:00Z")));
    assert_eq!(points.len(), 1000);
    let mut trace = upload(&store, "skips.gpx", &gpx(&[points]));

    ImportPipeline::new(&config, &store, &store)
        .run(&mut trace)
        .unwrap();

    assert_eq!(trace.size, Some(997));
    assert_eq!(store.point_count(trace.id).unwrap(), 997);
}

// ============================================================================
// Test: Empty Track
// ============================================================================

#[test]
fn test_empty_gpx_is_not_inserted() {
    let (_tmp, config, store) = setup();
    let mut trace = upload(&store, "empty.gpx", &gpx(&[vec![]]));

    let report = ImportPipeline::new(&config, &store, &store)
        .run(&mut trace)
        .unwrap();

    assert_eq!(report.actual_points, 0);
    assert_eq!(report.bounds, None);
    assert_eq!(trace.size, None);
    assert_eq!(trace.latitude, None);
    assert_eq!(trace.longitude, None);
    assert!(!trace.inserted);
    assert!(!store.is_attached(AttachmentKey::image(trace.id)).unwrap());
}

// ============================================================================
// Test: Re-import
// ============================================================================

#[test]
fn test_reimport_is_idempotent() {
    let (_tmp, config, store) = setup();
    let mut trace = upload(&store, "twice.gpx", &gpx(&[walk(1500, 0), walk(20, 3000)]));
    let pipeline = ImportPipeline::new(&config, &store, &store);

    let first = pipeline.run(&mut trace).unwrap();
    let picture = store.download(AttachmentKey::image(trace.id)).unwrap();
    let second = pipeline.run(&mut trace).unwrap();

    assert_eq!(first, second);
    assert_eq!(trace.size, Some(1520));
    assert_eq!(store.point_count(trace.id).unwrap(), 1520);
    assert_eq!(store.download(AttachmentKey::image(trace.id)).unwrap(), picture);
}

#[test]
fn test_run_by_id_returns_stored_trace() {
    let (_tmp, config, store) = setup();
    let trace = upload(&store, "by-id.gpx", &gpx(&[walk(5, 0)]));

    let (imported, report) = ImportPipeline::new(&config, &store, &store)
        .run_by_id(trace.id)
        .unwrap();
    assert_eq!(report.actual_points, 5);
    assert_eq!(store.find_trace(trace.id).unwrap().unwrap(), imported);
}

// ============================================================================
// Test: Containers
// ============================================================================

#[test]
fn test_tar_gzip_upload() {
    let (_tmp, config, store) = setup();
    let xml = gpx(&[walk(50, 0)]);
    let archive = tar_gz("track.gpx", &xml);

    assert_eq!(content::classify(&archive), ContentKind::TarGzip);
    let extracted = NativeExtractor::default()
        .extract(&archive, ContentKind::TarGzip)
        .unwrap();
    assert_eq!(extracted, xml);

    let mut trace = upload(&store, "archive.tgz", &archive);
    let file = store.blob_info(AttachmentKey::file(trace.id)).unwrap().unwrap();
    assert_eq!(file.filename, format!("{}.tar.gz", trace.id));

    let report = ImportPipeline::new(&config, &store, &store)
        .run(&mut trace)
        .unwrap();
    assert_eq!(report.kind, ContentKind::TarGzip);
    assert_eq!(trace.size, Some(50));
}

#[test]
fn test_gzip_named_xml_is_sniffed() {
    let (_tmp, config, store) = setup();
    let mut trace = upload(&store, "looks-plain.xml", &gzip(&gpx(&[walk(12, 0)])));

    let report = ImportPipeline::new(&config, &store, &store)
        .run(&mut trace)
        .unwrap();
    assert_eq!(report.kind, ContentKind::Gzip);
    assert_eq!(trace.size, Some(12));
    let file = store.blob_info(AttachmentKey::file(trace.id)).unwrap().unwrap();
    assert_eq!(file.filename, format!("{}.gpx.gz", trace.id));
}

// ============================================================================
// Test: Failures Leave Earlier Imports Intact
// ============================================================================

#[test]
fn test_malformed_xml_keeps_previous_points() {
    let (_tmp, config, store) = setup();
    let mut trace = upload(&store, "good.gpx", &gpx(&[walk(40, 0)]));
    let pipeline = ImportPipeline::new(&config, &store, &store);
    pipeline.run(&mut trace).unwrap();

    let broken = b"<?xml version=\"1.0\"?><gpx><trk><trkseg><trkpt lat=\"1\" lon=\"1\">";
    attach_upload(&trace, broken, &store).unwrap();
    let err = pipeline.run(&mut trace).unwrap_err();

    assert!(matches!(err, TraceError::Import { .. }));
    assert!(matches!(err.cause(), TraceError::MalformedGpx { .. }));
    assert_eq!(store.point_count(trace.id).unwrap(), 40);
    assert!(store.find_trace(trace.id).unwrap().unwrap().inserted);
}

#[test]
fn test_extraction_timeout_keeps_previous_points() {
    let (_tmp, config, store) = setup();
    let mut trace = upload(&store, "good.gpx", &gpx(&[walk(40, 0)]));
    ImportPipeline::new(&config, &store, &store)
        .run(&mut trace)
        .unwrap();

    // A large gzip stream cannot be expanded within a zero deadline.
    attach_upload(&trace, &gzip(&vec![b' '; 16 * 1024 * 1024]), &store).unwrap();
    let impatient = Config {
        extract_timeout_ms: 0,
        ..config.clone()
    };
    let err = ImportPipeline::new(&impatient, &store, &store)
        .run(&mut trace)
        .unwrap_err();

    match err.cause() {
        TraceError::ExtractionFailure { kind, source } => {
            assert_eq!(*kind, ContentKind::Gzip);
            assert_eq!(source.kind(), std::io::ErrorKind::TimedOut);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.point_count(trace.id).unwrap(), 40);
    assert!(trace.inserted);
}

// ============================================================================
// Test: Destroy
// ============================================================================

#[test]
fn test_destroy_removes_everything() {
    let (_tmp, config, store) = setup();
    let mut trace = upload(&store, "gone.gpx", &gpx(&[walk(30, 0)]));
    ImportPipeline::new(&config, &store, &store)
        .run(&mut trace)
        .unwrap();
    let legacy = LegacyPaths::from_config(&config);
    std::fs::write(legacy.icon(trace.id), b"GIF89a").unwrap();

    let report = destroy_trace(trace.id, &store, &store, &config);

    assert!(report.is_clean());
    assert!(report.row_deleted);
    assert_eq!(report.purged.len(), 3);
    assert_eq!(report.files_removed, 1);
    assert!(store.find_trace(trace.id).unwrap().is_none());
    assert_eq!(store.point_count(trace.id).unwrap(), 0);
    assert!(!legacy.icon(trace.id).exists());

    // Destroying again finds nothing but does not fail.
    let again = destroy_trace(trace.id, &store, &store, &config);
    assert!(again.is_clean());
    assert!(!again.row_deleted);
    assert!(again.purged.is_empty());
}
