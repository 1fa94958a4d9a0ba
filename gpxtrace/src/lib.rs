//! gpxtrace - GPS trace ingestion and rendering
//!
//! This crate provides:
//! - Content sniffing and archive extraction for uploaded track files
//! - A tolerant GPX track point decoder
//! - Batched point import into SQLite
//! - Animated GIF pictures and icons of imported tracks
//! - `gpx_file` metadata XML sync and legacy storage migration

// Errors and configuration
pub mod config;
pub mod error;
pub use config::{Config, RenderConfig};
pub use error::{Result, TraceError};

// Domain types
pub mod points;
pub mod trace;
pub use points::{Bounds, FixedBounds, StoredPoint};
pub use trace::{NewTrace, Trace, Visibility};

// Ingestion stages
pub mod content;
pub mod extract;
pub mod gpx;
pub mod import;
pub mod render;
pub use content::{ContentKind, ContentSniffer, MagicSniffer};
pub use extract::{Extractor, NativeExtractor, SandboxedExtractor};
pub use gpx::{DecodedPoint, DecodedTrack};
pub use import::PointImporter;
pub use render::RenderedImage;

// Entry points
pub mod metadata;
pub mod pipeline;
pub mod storage;
pub use metadata::{SyncMode, TraceMetadata};
pub use pipeline::{ImportPipeline, ImportReport};
pub use storage::{CleanupReport, LegacyPaths};

// Persistence layer with SQLite storage
pub mod migrations;
pub mod store;
pub use store::{
    AttachmentKey, AttachmentSlot, BlobInfo, BlobStore, PointStore, SqliteStore, Store, TraceStore,
};
