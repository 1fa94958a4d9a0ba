//! `gpx_file` XML: applying external metadata onto a trace and writing a
//! trace back out.

use crate::error::{Result, TraceError};
use crate::trace::{Trace, Visibility};
use chrono::SecondsFormat;
use log::debug;
use std::collections::BTreeSet;
use xml::reader::{EventReader, XmlEvent as ReadEvent};
use xml::writer::{EmitterConfig, XmlEvent as WriteEvent};

/// Whether the payload creates a trace or updates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// `id` is ignored.
    Create,
    /// `id` is required and must name the target trace.
    Update,
}

/// Validated contents of a `gpx_file` element.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceMetadata {
    pub mode: SyncMode,
    /// Always `Some` in update mode.
    pub id: Option<i64>,
    pub visibility: Visibility,
    pub description: String,
    pub tags: BTreeSet<String>,
}

/// Raw element contents before validation.
#[derive(Debug, Default)]
struct RawGpxFile {
    id: Option<String>,
    visibility: Option<String>,
    description: Option<String>,
    tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Child {
    Description,
    Tag,
    Other,
}

fn read_gpx_file(xml: &str) -> Result<RawGpxFile> {
    let mut raw: Option<RawGpxFile> = None;
    // Depth below gpx_file; 0 while outside it.
    let mut depth = 0usize;
    let mut child = Child::Other;

    for event in EventReader::new(xml.as_bytes()) {
        let event = event.map_err(|e| TraceError::bad_metadata(format!("malformed XML: {}", e)))?;
        match event {
            ReadEvent::StartElement {
                name, attributes, ..
            } => {
                if depth > 0 {
                    depth += 1;
                    if depth == 2 {
                        child = match name.local_name.as_str() {
                            "description" => Child::Description,
                            "tag" => Child::Tag,
                            _ => Child::Other,
                        };
                        if let Some(raw) = raw.as_mut() {
                            match child {
                                Child::Description if raw.description.is_some() => {
                                    child = Child::Other
                                }
                                Child::Description => raw.description = Some(String::new()),
                                Child::Tag => raw.tags.push(String::new()),
                                Child::Other => {}
                            }
                        }
                    }
                } else if raw.is_none() && name.local_name == "gpx_file" {
                    let mut found = RawGpxFile::default();
                    for attr in attributes {
                        match attr.name.local_name.as_str() {
                            "id" => found.id = Some(attr.value),
                            "visibility" => found.visibility = Some(attr.value),
                            _ => {}
                        }
                    }
                    raw = Some(found);
                    depth = 1;
                }
            }
            ReadEvent::Characters(text) | ReadEvent::CData(text) if depth == 2 => {
                if let Some(raw) = raw.as_mut() {
                    match child {
                        Child::Description => {
                            if let Some(d) = raw.description.as_mut() {
                                d.push_str(&text);
                            }
                        }
                        Child::Tag => {
                            if let Some(t) = raw.tags.last_mut() {
                                t.push_str(&text);
                            }
                        }
                        Child::Other => {}
                    }
                }
            }
            ReadEvent::EndElement { .. } if depth > 0 => {
                depth -= 1;
                if depth == 1 {
                    child = Child::Other;
                }
            }
            _ => {}
        }
    }

    raw.ok_or_else(|| TraceError::bad_metadata("missing gpx_file element"))
}

fn parse_id(value: Option<&str>) -> Result<i64> {
    let value = value.ok_or_else(|| TraceError::bad_metadata("id is required"))?;
    match value.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(TraceError::InvalidUserInput {
            message: format!("invalid trace id '{}'", value),
        }),
    }
}

impl TraceMetadata {
    /// Parse and validate the first `gpx_file` element in `xml`.
    pub fn from_xml(xml: &str, mode: SyncMode) -> Result<Self> {
        let raw = read_gpx_file(xml)?;

        let visibility = raw
            .visibility
            .as_deref()
            .ok_or_else(|| TraceError::bad_metadata("visibility missing"))?;
        let visibility = Visibility::from_str(visibility).ok_or_else(|| {
            TraceError::bad_metadata(format!("unknown visibility '{}'", visibility))
        })?;

        let id = match mode {
            SyncMode::Create => None,
            SyncMode::Update => Some(parse_id(raw.id.as_deref())?),
        };

        let description = raw
            .description
            .ok_or_else(|| TraceError::bad_metadata("must specify a description"))?;

        let tags = raw
            .tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            mode,
            id,
            visibility,
            description,
            tags,
        })
    }

    /// Copy the metadata onto `trace`. In update mode the payload id must
    /// match; on mismatch the trace is left untouched.
    pub fn apply_to(&self, trace: &mut Trace) -> Result<()> {
        if let (SyncMode::Update, Some(payload_id)) = (self.mode, self.id) {
            if payload_id != trace.id {
                return Err(TraceError::IdMismatch {
                    payload_id,
                    trace_id: trace.id,
                });
            }
        }

        trace.visibility = self.visibility;
        trace.description = self.description.clone();
        trace.tags = self.tags.clone();
        trace.visible = true;
        debug!(
            "[Metadata] Applied to trace {}: {}, {} tags",
            trace.id,
            trace.visibility,
            trace.tags.len()
        );
        Ok(())
    }
}

/// Parse, validate and apply in one step. The trace changes only on success.
pub fn sync_from_xml(trace: &mut Trace, xml: &str, mode: SyncMode) -> Result<()> {
    TraceMetadata::from_xml(xml, mode)?.apply_to(trace)
}

/// Serialize `trace` as an `osm/gpx_file` document.
pub fn to_xml(trace: &Trace) -> Result<String> {
    let id = trace.id.to_string();
    let uid = trace.user_id.to_string();
    let pending = (!trace.inserted).to_string();
    let timestamp = trace.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    let position = match (trace.inserted, trace.latitude, trace.longitude) {
        (true, Some(lat), Some(lon)) => Some((lat.to_string(), lon.to_string())),
        _ => None,
    };

    let mut buf = Vec::new();
    {
        let mut writer = EmitterConfig::new()
            .perform_indent(true)
            .create_writer(&mut buf);

        writer.write(
            WriteEvent::start_element("osm")
                .attr("version", "0.6")
                .attr("generator", "gpxtrace"),
        )?;

        let mut gpx_file = WriteEvent::start_element("gpx_file")
            .attr("id", &id)
            .attr("name", &trace.name)
            .attr("uid", &uid)
            .attr("visibility", trace.visibility.as_str())
            .attr("pending", &pending)
            .attr("timestamp", &timestamp);
        if let Some((lat, lon)) = &position {
            gpx_file = gpx_file.attr("lat", lat).attr("lon", lon);
        }
        writer.write(gpx_file)?;

        writer.write(WriteEvent::start_element("description"))?;
        writer.write(WriteEvent::characters(&trace.description))?;
        writer.write(WriteEvent::end_element())?;

        for tag in &trace.tags {
            writer.write(WriteEvent::start_element("tag"))?;
            writer.write(WriteEvent::characters(tag))?;
            writer.write(WriteEvent::end_element())?;
        }

        writer.write(WriteEvent::end_element())?;
        writer.write(WriteEvent::end_element())?;
    }

    String::from_utf8(buf)
        .map_err(|e| TraceError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}
