//! Unified error handling for trace ingestion.
//!
//! Every fallible operation in the crate returns [`Result`]. Per-point GPX
//! decode problems are not errors: they are counted and skipped by the decoder.

use crate::content::ContentKind;
use crate::store::AttachmentSlot;

/// Error type for trace ingestion, metadata sync and storage operations.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Decompression or archive extraction failed or timed out.
    #[error("failed to extract {kind} content: {source}")]
    ExtractionFailure {
        kind: ContentKind,
        #[source]
        source: std::io::Error,
    },

    /// The (extracted) document is not well-formed XML.
    #[error("malformed GPX: {message}")]
    MalformedGpx { message: String },

    /// Metadata XML is missing a required element or attribute.
    #[error("invalid trace XML: {message}")]
    InvalidMetadataXml { message: String },

    /// The `id` carried by an update payload names another trace.
    #[error("trace id mismatch: payload has {payload_id}, target trace is {trace_id}")]
    IdMismatch { payload_id: i64, trace_id: i64 },

    /// Caller supplied a value that can never be valid (e.g. a zero id).
    #[error("invalid input: {message}")]
    InvalidUserInput { message: String },

    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("schema migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("image rendering error: {0}")]
    Render(#[from] image::ImageError),

    #[error("XML write error: {0}")]
    XmlWrite(#[from] xml::writer::Error),

    #[error("trace {trace_id} has no {slot} attachment")]
    MissingAttachment { trace_id: i64, slot: AttachmentSlot },

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Context wrapper added by the import pipeline.
    #[error("import of trace {trace_id} failed: {source}")]
    Import {
        trace_id: i64,
        #[source]
        source: Box<TraceError>,
    },
}

impl TraceError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        TraceError::MalformedGpx {
            message: message.into(),
        }
    }

    pub(crate) fn bad_metadata(message: impl Into<String>) -> Self {
        TraceError::InvalidMetadataXml {
            message: message.into(),
        }
    }

    /// Wrap this error with the id of the trace being imported.
    pub fn for_trace(self, trace_id: i64) -> Self {
        match self {
            already @ TraceError::Import { .. } => already,
            other => TraceError::Import {
                trace_id,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any [`TraceError::Import`] context removed.
    pub fn cause(&self) -> &TraceError {
        match self {
            TraceError::Import { source, .. } => source.cause(),
            other => other,
        }
    }
}

/// Result type alias for gpxtrace operations.
pub type Result<T> = std::result::Result<T, TraceError>;
