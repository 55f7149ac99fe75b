use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::violation::Priority;

/// Source tag for alerts raised by the camera pipeline.
pub const ALERT_SOURCE_CAMERA: &str = "CAMERA";

/// Alert lifecycle. The pipeline only ever creates `New`; later states are
/// set by downstream tooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    InProgress,
    Resolved,
    Dismissed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::InProgress => "in_progress",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(AlertStatus::New),
            "in_progress" => Ok(AlertStatus::InProgress),
            "resolved" => Ok(AlertStatus::Resolved),
            "dismissed" => Ok(AlertStatus::Dismissed),
            other => Err(anyhow!("unknown alert status '{}'", other)),
        }
    }
}

/// Alert about to be inserted. The repository assigns the id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewAlert {
    pub title: String,
    pub description: String,
    pub location: String,
    pub status: AlertStatus,
    pub priority: Priority,
    pub law_reference: String,
    pub source: String,
    pub image_url: String,
    pub camera_id: i64,
    pub created_at: SystemTime,
}

/// Persisted alert.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertRecord {
    pub id: i64,
    pub alert: NewAlert,
}

/// Human-readable description for a detection, e.g.
/// `Обнаружено: car с вероятностью 90%`. The percentage is truncated.
pub fn describe_detection(label: &str, confidence: f32) -> String {
    // Widen before scaling; in f32, 0.57 * 100.0 rounds up to 57.
    let percent = (f64::from(confidence.clamp(0.0, 1.0)) * 100.0) as u32;
    format!("Обнаружено: {} с вероятностью {}%", label, percent)
}
