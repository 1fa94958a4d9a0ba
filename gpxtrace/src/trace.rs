//! Trace entity and visibility rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Privacy/sharing mode of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
    Trackable,
    Identifiable,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
            Visibility::Trackable => "trackable",
            Visibility::Identifiable => "identifiable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Visibility::Private),
            "public" => Some(Visibility::Public),
            "trackable" => Some(Visibility::Trackable),
            "identifiable" => Some(Visibility::Identifiable),
            _ => None,
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, Visibility::Public | Visibility::Identifiable)
    }

    pub fn is_trackable(&self) -> bool {
        matches!(self, Visibility::Trackable | Visibility::Identifiable)
    }

    pub fn is_identifiable(&self) -> bool {
        matches!(self, Visibility::Identifiable)
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single uploaded GPS track and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub visibility: Visibility,
    /// Soft-delete flag, independent of visibility.
    pub visible: bool,
    /// Point count of the last completed import.
    pub size: Option<u32>,
    /// First decoded point of the last completed import.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// True once points and rendered images reflect a completed import.
    pub inserted: bool,
    pub tags: BTreeSet<String>,
}

impl Trace {
    pub fn is_public(&self) -> bool {
        self.visibility.is_public()
    }

    pub fn is_trackable(&self) -> bool {
        self.visibility.is_trackable()
    }

    pub fn is_identifiable(&self) -> bool {
        self.visibility.is_identifiable()
    }

    /// Tags as a single comma-separated string.
    pub fn tagstring(&self) -> String {
        self.tags.iter().cloned().collect::<Vec<_>>().join(", ")
    }

    /// Replace tags from user input. Commas separate tags when present,
    /// otherwise whitespace does.
    pub fn set_tagstring(&mut self, input: &str) {
        let tokens: Box<dyn Iterator<Item = &str>> = if input.contains(',') {
            Box::new(input.split(','))
        } else {
            Box::new(input.split_whitespace())
        };
        self.tags = tokens
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
    }

    /// Clear everything a completed import derives.
    pub(crate) fn reset_import_fields(&mut self) {
        self.size = None;
        self.latitude = None;
        self.longitude = None;
        self.inserted = false;
    }
}

/// Fields supplied when a trace is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrace {
    pub user_id: i64,
    pub name: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub visibility: Visibility,
    pub tags: BTreeSet<String>,
}

impl NewTrace {
    pub fn new(user_id: i64, name: impl Into<String>, visibility: Visibility) -> Self {
        Self {
            user_id,
            name: name.into(),
            description: String::new(),
            timestamp: Utc::now(),
            visibility,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// The trace as it looks right after creation.
    pub fn into_trace(self, id: i64) -> Trace {
        Trace {
            id,
            user_id: self.user_id,
            name: self.name,
            description: self.description,
            timestamp: self.timestamp,
            visibility: self.visibility,
            visible: true,
            size: None,
            latitude: None,
            longitude: None,
            inserted: false,
            tags: self.tags,
        }
    }
}
