//! Persistence and blob storage interfaces.
//!
//! The pipeline only talks to these traits. [`SqliteStore`] implements all
//! three on a single SQLite database.

use crate::error::Result;
use crate::points::{FixedBounds, StoredPoint};
use crate::trace::{NewTrace, Trace};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Trace rows and their tags.
pub trait TraceStore {
    fn create_trace(&self, new: &NewTrace) -> Result<Trace>;
    fn find_trace(&self, id: i64) -> Result<Option<Trace>>;
    /// Write every field of `trace`, replacing its tag set.
    fn update_trace(&self, trace: &Trace) -> Result<()>;
    /// Delete the trace; points and tags go with it. Returns false if absent.
    fn delete_trace(&self, id: i64) -> Result<bool>;
    fn traces_for_user(&self, user_id: i64) -> Result<Vec<Trace>>;
    /// Visible traces carrying `tag`.
    fn traces_tagged(&self, tag: &str) -> Result<Vec<Trace>>;
    /// Visible traces that are owned by `user_id` or effectively public.
    fn traces_visible_to(&self, user_id: i64) -> Result<Vec<Trace>>;
}

/// Bulk point storage.
pub trait PointStore {
    /// Persist one batch as a single bulk operation. Returns rows written.
    fn insert_points(&self, points: &[StoredPoint]) -> Result<usize>;
    /// Remove every point of a trace. Returns rows deleted.
    fn delete_points(&self, trace_id: i64) -> Result<usize>;
    /// MIN/MAX aggregate over the trace's points, `None` when it has none.
    fn point_bounds(&self, trace_id: i64) -> Result<Option<FixedBounds>>;
    fn point_count(&self, trace_id: i64) -> Result<usize>;
    /// Points in insertion order.
    fn load_points(&self, trace_id: i64) -> Result<Vec<StoredPoint>>;
}

/// Everything the import pipeline needs from the relational store.
pub trait Store: TraceStore + PointStore {}

impl<T: TraceStore + PointStore> Store for T {}

/// Which artifact of a trace an attachment holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentSlot {
    /// The original upload.
    File,
    /// Full-size animated picture.
    Image,
    Icon,
}

impl AttachmentSlot {
    pub const ALL: [AttachmentSlot; 3] = [
        AttachmentSlot::File,
        AttachmentSlot::Image,
        AttachmentSlot::Icon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentSlot::File => "file",
            AttachmentSlot::Image => "image",
            AttachmentSlot::Icon => "icon",
        }
    }
}

impl fmt::Display for AttachmentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachment address: one slot of one trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    pub trace_id: i64,
    pub slot: AttachmentSlot,
}

impl AttachmentKey {
    pub fn file(trace_id: i64) -> Self {
        Self {
            trace_id,
            slot: AttachmentSlot::File,
        }
    }

    pub fn image(trace_id: i64) -> Self {
        Self {
            trace_id,
            slot: AttachmentSlot::Image,
        }
    }

    pub fn icon(trace_id: i64) -> Self {
        Self {
            trace_id,
            slot: AttachmentSlot::Icon,
        }
    }
}

/// Blob metadata without its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub filename: String,
    pub content_type: String,
    pub byte_size: u64,
}

/// Storage for original files and rendered images.
pub trait BlobStore {
    /// Attach (or replace) the blob in `key`'s slot.
    fn attach(&self, key: AttachmentKey, bytes: &[u8], filename: &str, content_type: &str)
    -> Result<()>;
    fn is_attached(&self, key: AttachmentKey) -> Result<bool>;
    fn blob_info(&self, key: AttachmentKey) -> Result<Option<BlobInfo>>;
    fn open_for_read(&self, key: AttachmentKey) -> Result<Box<dyn Read>>;
    fn download(&self, key: AttachmentKey) -> Result<Vec<u8>>;
    fn update_filename(&self, key: AttachmentKey, filename: &str) -> Result<()>;
    /// Remove the blob. Returns false if nothing was attached.
    fn purge(&self, key: AttachmentKey) -> Result<bool>;
}
