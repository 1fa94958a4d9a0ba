//! Archive and compression extraction.
//!
//! Produces a single GPX byte stream from a classified upload. Multi-member
//! archives are concatenated in archive order. [`SandboxedExtractor`] runs the
//! work on its own thread and gives up after a deadline.

use crate::content::ContentKind;
use crate::error::{Result, TraceError};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use log::{debug, warn};
use std::io::{self, Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Resource-fork entries added by macOS archivers.
const MACOS_METADATA_PREFIX: &str = "__MACOSX/";

/// Turns a classified upload into GPX XML bytes.
pub trait Extractor: Send + Sync {
    fn extract(&self, data: &[u8], kind: ContentKind) -> Result<Vec<u8>>;
}

/// In-process extraction using flate2, bzip2, zip and tar.
#[derive(Debug, Clone)]
pub struct NativeExtractor {
    /// Upper bound on the decompressed output.
    pub max_output_bytes: u64,
}

impl Default for NativeExtractor {
    fn default() -> Self {
        Self {
            max_output_bytes: 512 * 1024 * 1024,
        }
    }
}

impl Extractor for NativeExtractor {
    fn extract(&self, data: &[u8], kind: ContentKind) -> Result<Vec<u8>> {
        let never = AtomicBool::new(false);
        self.extract_cancellable(data, kind, &never)
    }
}

impl NativeExtractor {
    pub fn new(max_output_bytes: u64) -> Self {
        Self { max_output_bytes }
    }

    /// Extract, failing at the next read once `cancel` is raised.
    pub fn extract_cancellable(
        &self,
        data: &[u8],
        kind: ContentKind,
        cancel: &AtomicBool,
    ) -> Result<Vec<u8>> {
        let source = CancellableReader { inner: data, cancel };
        let mut sink = BoundedSink::new(self.max_output_bytes, cancel);

        let outcome = match kind {
            ContentKind::PlainXml => sink.drain(source),
            ContentKind::Gzip => sink.drain(MultiGzDecoder::new(source)),
            ContentKind::Bzip2 => sink.drain(MultiBzDecoder::new(source)),
            ContentKind::Tar => extract_tar(source, &mut sink),
            ContentKind::TarGzip => extract_tar(MultiGzDecoder::new(source), &mut sink),
            ContentKind::TarBzip2 => extract_tar(MultiBzDecoder::new(source), &mut sink),
            ContentKind::Zip => extract_zip(data, &mut sink),
        };

        outcome.map_err(|source| TraceError::ExtractionFailure { kind, source })?;
        debug!(
            "[Extractor] {} input of {} bytes expanded to {} bytes",
            kind,
            data.len(),
            sink.buf.len()
        );
        Ok(sink.buf)
    }
}

fn extract_tar<R: Read>(reader: R, sink: &mut BoundedSink<'_>) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        sink.drain(entry)?;
    }
    Ok(())
}

fn extract_zip(data: &[u8], sink: &mut BoundedSink<'_>) -> io::Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(io::Error::other)?;
    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(io::Error::other)?;
        if entry.is_dir() || entry.name().starts_with(MACOS_METADATA_PREFIX) {
            debug!("[Extractor] Skipping zip entry {}", entry.name());
            continue;
        }
        sink.drain(entry)?;
    }
    Ok(())
}

/// Reader that fails once the shared cancel flag is raised.
///
/// The error kind must not be `Interrupted`: std and the decoders retry those.
struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a AtomicBool,
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(io::Error::other("extraction cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Output buffer with a hard size cap.
///
/// Decoded output is read through a [`CancellableReader`] as well, so a
/// decompressor that has already consumed its input still stops on cancel.
struct BoundedSink<'a> {
    buf: Vec<u8>,
    limit: u64,
    cancel: &'a AtomicBool,
}

impl<'a> BoundedSink<'a> {
    fn new(limit: u64, cancel: &'a AtomicBool) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            cancel,
        }
    }

    fn drain<R: Read>(&mut self, reader: R) -> io::Result<()> {
        let remaining = self.limit.saturating_sub(self.buf.len() as u64);
        let reader = CancellableReader {
            inner: reader,
            cancel: self.cancel,
        };
        // Read one byte past the budget so an overflow is detectable.
        let read = reader.take(remaining + 1).read_to_end(&mut self.buf)?;
        if read as u64 > remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("decompressed content exceeds {} bytes", self.limit),
            ));
        }
        Ok(())
    }
}

/// Runs a [`NativeExtractor`] on a worker thread, bounded by `timeout`.
///
/// On timeout the worker's cancel flag is raised so it stops at its next read
/// instead of running on in the background.
#[derive(Debug, Clone)]
pub struct SandboxedExtractor {
    inner: NativeExtractor,
    timeout: Duration,
    /// Worker threads that have not yet returned, shared between clones.
    active: Arc<AtomicUsize>,
}

impl SandboxedExtractor {
    pub fn new(inner: NativeExtractor, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of extraction threads still running, including abandoned ones.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Decrements the live worker count when the worker closure is dropped.
struct WorkerSlot(Arc<AtomicUsize>);

impl WorkerSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(active))
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Extractor for SandboxedExtractor {
    fn extract(&self, data: &[u8], kind: ContentKind) -> Result<Vec<u8>> {
        let start = Instant::now();
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let worker_cancel = Arc::clone(&cancel);
        let extractor = self.inner.clone();
        let input = data.to_vec();
        let slot = WorkerSlot::acquire(&self.active);
        let spawned = thread::Builder::new()
            .name(format!("gpxtrace-extract-{}", kind))
            .spawn(move || {
                let _slot = slot;
                let result = extractor.extract_cancellable(&input, kind, &worker_cancel);
                // The receiver is gone if we already timed out.
                let _ = tx.send(result);
            });
        if let Err(source) = spawned {
            return Err(TraceError::ExtractionFailure { kind, source });
        }

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                cancel.store(true, Ordering::Relaxed);
                warn!(
                    "[Extractor] {} extraction timed out after {} ms",
                    kind,
                    start.elapsed().as_millis()
                );
                Err(TraceError::ExtractionFailure {
                    kind,
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("extraction exceeded {} ms", self.timeout.as_millis()),
                    ),
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(TraceError::ExtractionFailure {
                kind,
                source: io::Error::other("extraction worker terminated unexpectedly"),
            }),
        }
    }
}
