//! Streaming GPX track point decoder.
//!
//! Only `trkpt` elements are decoded. A point needs a parseable, in-range
//! latitude/longitude and a timestamp; anything else is skipped and counted.
//! Documents that are not well-formed XML fail as a whole.

use crate::error::{Result, TraceError};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use xml::reader::{EventReader, XmlEvent};

/// One successfully decoded track point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Index of the `trkseg` the point was recorded in.
    pub segment: u32,
}

/// Result of decoding a GPX document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodedTrack {
    /// Valid points in document order.
    pub points: Vec<DecodedPoint>,
    /// Number of `trkpt` elements seen, valid or not.
    pub possible_points: usize,
    /// Number of closed `trkseg` elements.
    pub segments: u32,
}

impl DecodedTrack {
    pub fn actual_points(&self) -> usize {
        self.points.len()
    }

    /// Points that were present but failed to decode.
    pub fn skipped(&self) -> usize {
        self.possible_points - self.points.len()
    }

    pub fn first(&self) -> Option<&DecodedPoint> {
        self.points.first()
    }
}

/// Point under construction while its children are read.
#[derive(Debug, Default)]
struct PendingPoint {
    latitude: Option<f64>,
    longitude: Option<f64>,
    altitude: Option<f64>,
    timestamp: Option<DateTime<Utc>>,
    segment: u32,
}

impl PendingPoint {
    fn finish(self) -> Option<DecodedPoint> {
        let latitude = self.latitude.filter(|lat| (-90.0..=90.0).contains(lat))?;
        let longitude = self.longitude.filter(|lon| (-180.0..=180.0).contains(lon))?;
        Some(DecodedPoint {
            latitude,
            longitude,
            altitude: self.altitude,
            timestamp: self.timestamp?,
            segment: self.segment,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TextField {
    Elevation,
    Time,
}

/// Decode all track points in `xml`.
///
/// Archives with several members arrive as concatenated documents; each one
/// is decoded in turn and segment numbering continues across them.
pub fn decode(xml: &[u8]) -> Result<DecodedTrack> {
    let mut track = DecodedTrack::default();
    for document in split_documents(xml) {
        decode_document(document, &mut track)?;
    }

    debug!(
        "[GpxDecoder] Decoded {} of {} points in {} segments",
        track.actual_points(),
        track.possible_points,
        track.segments
    );
    Ok(track)
}

fn decode_document(xml: &[u8], track: &mut DecodedTrack) -> Result<()> {
    let reader = EventReader::new(xml);
    let mut point: Option<PendingPoint> = None;
    let mut field: Option<TextField> = None;
    let mut text = String::new();

    for event in reader {
        let event = event.map_err(|e| TraceError::malformed(e.to_string()))?;
        match event {
            XmlEvent::StartElement {
                name, attributes, ..
            } => match name.local_name.as_str() {
                "trkpt" => {
                    track.possible_points += 1;
                    let mut pending = PendingPoint {
                        segment: track.segments,
                        ..Default::default()
                    };
                    for attr in &attributes {
                        match attr.name.local_name.as_str() {
                            "lat" => pending.latitude = parse_coordinate(&attr.value),
                            "lon" => pending.longitude = parse_coordinate(&attr.value),
                            _ => {}
                        }
                    }
                    point = Some(pending);
                }
                "ele" if point.is_some() => {
                    field = Some(TextField::Elevation);
                    text.clear();
                }
                "time" if point.is_some() => {
                    field = Some(TextField::Time);
                    text.clear();
                }
                _ => {}
            },
            XmlEvent::Characters(chunk) | XmlEvent::CData(chunk) if field.is_some() => {
                text.push_str(&chunk);
            }
            XmlEvent::EndElement { name } => match name.local_name.as_str() {
                "ele" | "time" => {
                    if let (Some(pending), Some(current)) = (point.as_mut(), field.take()) {
                        match current {
                            TextField::Elevation => pending.altitude = parse_coordinate(&text),
                            TextField::Time => pending.timestamp = parse_timestamp(&text),
                        }
                    }
                }
                "trkpt" => {
                    if let Some(decoded) = point.take().and_then(PendingPoint::finish) {
                        track.points.push(decoded);
                    }
                }
                "trkseg" => track.segments += 1,
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

fn parse_coordinate(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// RFC 3339, or a zone-less ISO 8601 timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Split concatenated XML documents at each declaration after the first.
fn split_documents(xml: &[u8]) -> Vec<&[u8]> {
    const DECL: &[u8] = b"<?xml";
    let mut starts: Vec<usize> = xml
        .windows(DECL.len())
        .enumerate()
        .filter(|(_, w)| *w == DECL)
        .map(|(i, _)| i)
        // `<?xml-stylesheet` and friends are processing instructions, not declarations.
        .filter(|&i| xml.get(i + DECL.len()).is_some_and(u8::is_ascii_whitespace))
        // A declaration only starts a new document once markup came before it.
        .filter(|&i| xml[..i].contains(&b'<'))
        .collect();
    starts.insert(0, 0);
    starts.dedup();

    let mut documents = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(xml.len());
        documents.push(&xml[start..end]);
    }
    documents
}
