//! Bulk replacement of a trace's stored points.

use crate::error::Result;
use crate::gpx::DecodedPoint;
use crate::points::StoredPoint;
use crate::store::PointStore;
use log::debug;

/// Default number of points per bulk write.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Writes decoded points in fixed-size batches, one bulk insert per batch.
pub struct PointImporter<'a, S: PointStore + ?Sized> {
    store: &'a S,
    batch_size: usize,
}

impl<'a, S: PointStore + ?Sized> PointImporter<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Zero is treated as 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Delete every existing point of `trace_id`, then insert `points` in order.
    ///
    /// Batches are not atomic with each other: a failure mid-way leaves the
    /// earlier batches written.
    pub fn replace(&self, trace_id: i64, points: &[DecodedPoint]) -> Result<usize> {
        let removed = self.store.delete_points(trace_id)?;
        if removed > 0 {
            debug!(
                "[PointImporter] Removed {} old points of trace {}",
                removed, trace_id
            );
        }

        let mut written = 0;
        for (i, chunk) in points.chunks(self.batch_size).enumerate() {
            let batch: Vec<StoredPoint> = chunk
                .iter()
                .map(|p| StoredPoint::from_decoded(trace_id, p))
                .collect();
            written += self.store.insert_points(&batch)?;
            debug!(
                "[PointImporter] Trace {} batch {}: {} points",
                trace_id,
                i + 1,
                batch.len()
            );
        }
        Ok(written)
    }
}
