//! Content sniffing for uploaded trace files.
//!
//! Uploads are routinely mislabeled, so the container/compression kind is
//! decided from the bytes alone. The file name is never consulted.

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

/// Tar headers occupy one 512-byte block.
const TAR_BLOCK: usize = 512;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b, 0x08];
const BZIP2_MAGIC: &[u8] = b"BZh";
const ZIP_MAGICS: [&[u8]; 3] = [b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];

/// Container/compression kind of an uploaded trace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    PlainXml,
    Gzip,
    Bzip2,
    Zip,
    Tar,
    TarGzip,
    TarBzip2,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::PlainXml => "xml",
            ContentKind::Gzip => "gzip",
            ContentKind::Bzip2 => "bzip2",
            ContentKind::Zip => "zip",
            ContentKind::Tar => "tar",
            ContentKind::TarGzip => "tar+gzip",
            ContentKind::TarBzip2 => "tar+bzip2",
        }
    }

    /// MIME type stored alongside the original file.
    pub fn content_type(&self) -> &'static str {
        match self {
            ContentKind::TarGzip => "application/x-tar+gzip",
            ContentKind::TarBzip2 => "application/x-tar+x-bzip2",
            ContentKind::Tar => "application/x-tar",
            ContentKind::Zip => "application/zip",
            ContentKind::Gzip => "application/gzip",
            ContentKind::Bzip2 => "application/x-bzip2",
            ContentKind::PlainXml => "application/gpx+xml",
        }
    }

    /// Inverse of [`ContentKind::content_type`]. Unknown types are plain XML.
    pub fn from_content_type(content_type: &str) -> Self {
        match content_type {
            "application/x-tar+gzip" => ContentKind::TarGzip,
            "application/x-tar+x-bzip2" => ContentKind::TarBzip2,
            "application/x-tar" => ContentKind::Tar,
            "application/zip" => ContentKind::Zip,
            "application/gzip" | "application/x-gzip" => ContentKind::Gzip,
            "application/x-bzip2" => ContentKind::Bzip2,
            _ => ContentKind::PlainXml,
        }
    }

    /// File extension (with leading dot) used for the stored trace file name.
    pub fn extension(&self) -> &'static str {
        match self {
            ContentKind::TarGzip => ".tar.gz",
            ContentKind::TarBzip2 => ".tar.bz2",
            ContentKind::Tar => ".tar",
            ContentKind::Zip => ".zip",
            ContentKind::Gzip => ".gpx.gz",
            ContentKind::Bzip2 => ".gpx.bz2",
            ContentKind::PlainXml => ".gpx",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies raw bytes into a [`ContentKind`].
pub trait ContentSniffer: Send + Sync {
    fn classify(&self, data: &[u8]) -> ContentKind;
}

/// Magic-number based sniffer. Probes inside gzip/bzip2 streams for tar headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MagicSniffer;

impl ContentSniffer for MagicSniffer {
    fn classify(&self, data: &[u8]) -> ContentKind {
        classify(data)
    }
}

/// Classify `data` by its magic signature.
pub fn classify(data: &[u8]) -> ContentKind {
    let kind = if data.starts_with(GZIP_MAGIC) {
        if stream_holds_tar(GzDecoder::new(data)) {
            ContentKind::TarGzip
        } else {
            ContentKind::Gzip
        }
    } else if is_bzip2(data) {
        if stream_holds_tar(BzDecoder::new(data)) {
            ContentKind::TarBzip2
        } else {
            ContentKind::Bzip2
        }
    } else if ZIP_MAGICS.iter().any(|magic| data.starts_with(magic)) {
        ContentKind::Zip
    } else if is_tar_header(data) {
        ContentKind::Tar
    } else {
        debug!(
            "[ContentSniffer] No container signature in {} bytes, treating as plain XML",
            data.len()
        );
        ContentKind::PlainXml
    };

    debug!("[ContentSniffer] Classified {} bytes as {}", data.len(), kind);
    kind
}

fn is_bzip2(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(BZIP2_MAGIC) && (b'1'..=b'9').contains(&data[3])
}

/// Decompress the first block of a stream and check it for a tar header.
/// A truncated or corrupt stream simply does not hold a tar.
fn stream_holds_tar<R: Read>(reader: R) -> bool {
    let mut block = Vec::with_capacity(TAR_BLOCK);
    match reader.take(TAR_BLOCK as u64).read_to_end(&mut block) {
        Ok(_) => is_tar_header(&block),
        Err(_) => false,
    }
}

/// True if `data` starts with a POSIX (`ustar`) or pre-POSIX tar header.
fn is_tar_header(data: &[u8]) -> bool {
    if data.len() < TAR_BLOCK {
        return false;
    }
    let header = &data[..TAR_BLOCK];
    if &header[257..262] == b"ustar" {
        return true;
    }

    // v7 archives have no magic; verify the header checksum instead.
    let Some(stored) = parse_octal(&header[148..156]) else {
        return false;
    };
    let computed: u64 = header
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { b' ' as u64 } else { b as u64 })
        .sum();
    // An all-zero block sums to 256 (the blank checksum field) and is not a header.
    header[0] != 0 && stored == computed
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let digits: Vec<u8> = field
        .iter()
        .copied()
        .skip_while(|b| *b == b' ')
        .take_while(|b| (b'0'..=b'7').contains(b))
        .collect();
    if digits.is_empty() {
        return None;
    }
    let text = std::str::from_utf8(&digits).ok()?;
    u64::from_str_radix(text, 8).ok()
}
