use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face embedding vector (128-dimensional for the descriptor models in use).
///
/// Serialized as a bare JSON number array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Distance-derived similarity in [0, 1]: `max(0, 1 - distance)`.
    ///
    /// Identical embeddings score 1.0; anything at distance 1.0 or further
    /// scores 0.0. Only meaningful between embeddings of the same extractor.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        (1.0 - self.euclidean_distance(other)).max(0.0)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// A person on the roster, optionally carrying an enrolled face embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledUser {
    pub id: String,
    pub username: String,
    pub display_name: String,
    /// Contact address (email).
    pub contact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default)]
    pub embedding: Option<Embedding>,
    pub registered_at: DateTime<Utc>,
}

/// Registration fields; id and timestamp are assigned by the roster.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub display_name: String,
    pub contact: String,
    pub course_id: Option<String>,
    pub embedding: Option<Embedding>,
}

/// Entry in the course catalog, used to label exported attendance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub name: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructor: Option<String>,
}

impl Course {
    fn seeded(id: &str, name: &str, code: &str, instructor: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            code: code.into(),
            instructor: Some(instructor.into()),
        }
    }

    /// Catalog a fresh database starts with.
    pub fn default_catalog() -> Vec<Course> {
        vec![
            Course::seeded("1", "Computer Science 101", "CS101", "Dr. Smith"),
            Course::seeded("2", "Mathematics", "MATH201", "Prof. Johnson"),
            Course::seeded("3", "Physics", "PHY101", "Dr. Williams"),
        ]
    }

    /// Matches the course id exactly or its code case-insensitively.
    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.code.eq_ignore_ascii_case(key)
    }
}

/// A geolocation fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters.
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
            Self::Late => "Late",
            Self::Excused => "Excused",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown attendance status: {0} (expected present, absent, late or excused)")]
pub struct ParseStatusError(pub String);

impl FromStr for AttendanceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(Self::Present),
            "absent" => Ok(Self::Absent),
            "late" => Ok(Self::Late),
            "excused" => Ok(Self::Excused),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// A recorded attendance event. Immutable once appended to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    /// Local calendar day.
    pub date: NaiveDate,
    /// Local time of day, whole seconds.
    pub time: NaiveTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPosition>,
    /// Detection confidence in [0, 1].
    pub confidence: f32,
    pub status: AttendanceStatus,
    /// Provenance tag, e.g. "Biometric Face Recognition".
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// Fields for a new attendance event; the id is assigned by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttendance {
    pub user_id: String,
    pub course_id: Option<String>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub location: Option<GeoPosition>,
    pub confidence: f32,
    pub status: AttendanceStatus,
    pub method: String,
    pub notes: Option<String>,
    pub verified: bool,
    pub device: Option<String>,
}
