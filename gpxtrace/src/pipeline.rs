//! Import pipeline: uploaded file to stored points and rendered images.
//!
//! ```text
//! download → classify → extract → decode → replace points → bounds → render → attach
//! ```
//!
//! Everything up to and including decoding happens before any mutation, so a
//! bad upload leaves previously imported points alone. The trace's derived
//! fields and `inserted` flag are written in one final update.

use crate::config::Config;
use crate::content::{ContentKind, ContentSniffer, MagicSniffer};
use crate::error::{Result, TraceError};
use crate::extract::Extractor;
use crate::gpx;
use crate::import::PointImporter;
use crate::points::Bounds;
use crate::render::{render_icon, render_picture};
use crate::store::{AttachmentKey, BlobStore, Store};
use crate::trace::Trace;
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Instant;

/// Summary of one import run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub trace_id: i64,
    pub kind: ContentKind,
    pub possible_points: usize,
    pub actual_points: usize,
    pub segments: u32,
    /// `None` when nothing decoded.
    pub bounds: Option<Bounds>,
}

/// Runs imports against one store and blob store.
pub struct ImportPipeline<'a> {
    config: &'a Config,
    store: &'a dyn Store,
    blobs: &'a dyn BlobStore,
    sniffer: Box<dyn ContentSniffer>,
    extractor: Box<dyn Extractor>,
}

impl<'a> ImportPipeline<'a> {
    /// Magic-number sniffing and a timeout-bounded extractor from `config`.
    pub fn new(config: &'a Config, store: &'a dyn Store, blobs: &'a dyn BlobStore) -> Self {
        Self {
            config,
            store,
            blobs,
            sniffer: Box::new(MagicSniffer),
            extractor: Box::new(config.extractor()),
        }
    }

    pub fn with_sniffer(mut self, sniffer: impl ContentSniffer + 'static) -> Self {
        self.sniffer = Box::new(sniffer);
        self
    }

    pub fn with_extractor(mut self, extractor: impl Extractor + 'static) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    /// Import the attached file of `trace`, updating it in place on success.
    pub fn run(&self, trace: &mut Trace) -> Result<ImportReport> {
        let trace_id = trace.id;
        self.import(trace).map_err(|e| {
            warn!("[ImportPipeline] Trace {} failed: {}", trace_id, e);
            e.for_trace(trace_id)
        })
    }

    /// Load the trace by id and import it.
    pub fn run_by_id(&self, trace_id: i64) -> Result<(Trace, ImportReport)> {
        let mut trace = self
            .store
            .find_trace(trace_id)
            .map_err(|e| e.for_trace(trace_id))?
            .ok_or_else(|| {
                TraceError::InvalidUserInput {
                    message: format!("no trace with id {}", trace_id),
                }
                .for_trace(trace_id)
            })?;
        let report = self.run(&mut trace)?;
        Ok((trace, report))
    }

    fn import(&self, trace: &mut Trace) -> Result<ImportReport> {
        let start = Instant::now();
        info!("[ImportPipeline] Importing trace {}", trace.id);

        // Pure stages
        let upload = self.blobs.download(AttachmentKey::file(trace.id))?;
        let kind = self.sniffer.classify(&upload);
        debug!(
            "[ImportPipeline] Trace {}: {} bytes classified as {}",
            trace.id,
            upload.len(),
            kind
        );
        let xml = self.extractor.extract(&upload, kind)?;
        let track = gpx::decode(&xml)?;
        if track.skipped() > 0 {
            warn!(
                "[ImportPipeline] Trace {}: skipped {} of {} points",
                trace.id,
                track.skipped(),
                track.possible_points
            );
        }

        let mut report = ImportReport {
            trace_id: trace.id,
            kind,
            possible_points: track.possible_points,
            actual_points: track.actual_points(),
            segments: track.segments,
            bounds: None,
        };

        // A re-import is not inserted until it completes.
        if trace.inserted {
            trace.reset_import_fields();
            self.store.update_trace(trace)?;
            self.purge_rendered(trace.id)?;
        }

        PointImporter::new(self.store)
            .with_batch_size(self.config.import_batch_size)
            .replace(trace.id, &track.points)?;

        let Some(first) = track.first() else {
            trace.reset_import_fields();
            self.store.update_trace(trace)?;
            self.purge_rendered(trace.id)?;
            info!(
                "[ImportPipeline] Trace {}: no valid points ({} candidates)",
                trace.id, track.possible_points
            );
            return Ok(report);
        };

        let bounds = self
            .store
            .point_bounds(trace.id)?
            .map(|b| b.to_degrees())
            .ok_or(TraceError::Persistence(rusqlite::Error::QueryReturnedNoRows))?;

        let render = &self.config.render;
        let picture = render_picture(trace.id, &track.points, &bounds, render)?;
        let icon = render_icon(trace.id, &track.points, &bounds, render)?;
        self.blobs.attach(
            AttachmentKey::image(trace.id),
            &picture.bytes,
            &picture.filename,
            picture.content_type,
        )?;
        self.blobs.attach(
            AttachmentKey::icon(trace.id),
            &icon.bytes,
            &icon.filename,
            icon.content_type,
        )?;

        let mut done = trace.clone();
        done.size = Some(track.actual_points() as u32);
        done.latitude = Some(first.latitude);
        done.longitude = Some(first.longitude);
        done.inserted = true;
        self.store.update_trace(&done)?;
        *trace = done;

        report.bounds = Some(bounds);
        info!(
            "[ImportPipeline] Trace {}: {} points in {} segments ({}) in {:?}",
            trace.id,
            report.actual_points,
            report.segments,
            kind,
            start.elapsed()
        );
        Ok(report)
    }

    /// Drop the picture and icon of a previous import.
    fn purge_rendered(&self, trace_id: i64) -> Result<()> {
        for key in [AttachmentKey::image(trace_id), AttachmentKey::icon(trace_id)] {
            if self.blobs.purge(key)? {
                debug!("[ImportPipeline] Purged {} of trace {}", key.slot, trace_id);
            }
        }
        Ok(())
    }
}
