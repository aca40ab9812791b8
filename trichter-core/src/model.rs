//! Run records as stored by the backend and replicated to viewers.
//!
//! JSON shape (camelCase, matches the REST snapshot and the event payloads):
//! ```text
//! {
//!   "id": "0b6c…",
//!   "name": null,
//!   "data": { "duration": 4.2, "rate": 1.9, "volume": 0.5 },
//!   "image": "trichter-images/placeholder.jpg",
//!   "createdAt": "2026-10-18T20:11:04Z",
//!   "user": { "id": "u1", "name": "Alice", "username": "alice" }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Image used when the measuring device did not upload a photo.
pub const PLACEHOLDER_IMAGE: &str = "trichter-images/placeholder.jpg";

/// Longest accepted run name, in characters.
pub const MAX_RUN_NAME_LEN: usize = 64;

/// Measurements of a single run. All values are strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunData {
    /// Seconds from first drop to empty funnel
    pub duration: f64,
    /// Litres per minute; this is the leaderboard score
    pub rate: f64,
    /// Litres
    pub volume: f64,
}

/// Identified user a run has been claimed by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: String,
    pub name: String,
    pub username: String,
}

impl Owner {
    pub fn new(id: impl Into<String>, name: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            username: username.into(),
        }
    }
}

/// A run joined with its (optional) owner.
///
/// The `id` is stable across updates and never reused for another run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWithOwner {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub data: RunData,
    #[serde(default = "placeholder_image")]
    pub image: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub user: Option<Owner>,
}

fn placeholder_image() -> String {
    PLACEHOLDER_IMAGE.to_string()
}

impl RunWithOwner {
    /// Display name of the owner, or `"Unknown"` for unclaimed runs.
    pub fn owner_name(&self) -> &str {
        self.user.as_ref().map_or("Unknown", |u| u.name.as_str())
    }

    pub fn is_claimed(&self) -> bool {
        self.user.is_some()
    }
}

/// Measurement validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{field} must be a positive number, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("name must be between 1 and {MAX_RUN_NAME_LEN} characters")]
    InvalidName,
}

/// Raw create-run input as posted by the measuring device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRun {
    pub duration: Option<f64>,
    pub rate: Option<f64>,
    pub volume: Option<f64>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// A [`NewRun`] that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidRun {
    pub data: RunData,
    pub image: String,
    pub user_id: Option<String>,
}

impl NewRun {
    pub fn new(duration: f64, rate: f64, volume: f64) -> Self {
        Self {
            duration: Some(duration),
            rate: Some(rate),
            volume: Some(volume),
            image: None,
            user_id: None,
        }
    }

    /// Check every measurement and fill in defaults.
    pub fn validate(self) -> Result<ValidRun, ValidationError> {
        let duration = positive("duration", self.duration)?;
        let rate = positive("rate", self.rate)?;
        let volume = positive("volume", self.volume)?;

        let image = self
            .image
            .filter(|i| !i.trim().is_empty())
            .unwrap_or_else(placeholder_image);
        let user_id = self.user_id.filter(|u| !u.trim().is_empty());

        Ok(ValidRun {
            data: RunData {
                duration,
                rate,
                volume,
            },
            image,
            user_id,
        })
    }
}

fn positive(field: &'static str, value: Option<f64>) -> Result<f64, ValidationError> {
    match value {
        None => Err(ValidationError::Missing { field }),
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        Some(v) => Err(ValidationError::NotPositive { field, value: v }),
    }
}

/// Trim and check a user-chosen run name.
pub fn validate_run_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > MAX_RUN_NAME_LEN {
        return Err(ValidationError::InvalidName);
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_run() -> RunWithOwner {
        RunWithOwner {
            id: "run-1".into(),
            name: None,
            data: RunData {
                duration: 4.2,
                rate: 1.9,
                volume: 0.5,
            },
            image: PLACEHOLDER_IMAGE.into(),
            created_at: Utc.with_ymd_and_hms(2026, 10, 18, 20, 11, 4).unwrap(),
            user: Some(Owner::new("u1", "Alice", "alice")),
        }
    }

    #[test]
    fn test_validate_accepts_positive_measurements() {
        let valid = NewRun::new(4.0, 2.5, 0.5).validate().unwrap();
        assert_eq!(valid.data.rate, 2.5);
        assert_eq!(valid.image, PLACEHOLDER_IMAGE);
        assert!(valid.user_id.is_none());
    }

    #[test]
    fn test_validate_rejects_missing_field() {
        let input = NewRun {
            rate: None,
            ..NewRun::new(4.0, 2.5, 0.5)
        };
        assert_eq!(
            input.validate(),
            Err(ValidationError::Missing { field: "rate" })
        );
    }

    #[test]
    fn test_validate_rejects_non_positive_and_nan() {
        assert!(matches!(
            NewRun::new(0.0, 2.5, 0.5).validate(),
            Err(ValidationError::NotPositive { field: "duration", .. })
        ));
        assert!(matches!(
            NewRun::new(4.0, -1.0, 0.5).validate(),
            Err(ValidationError::NotPositive { field: "rate", .. })
        ));
        assert!(matches!(
            NewRun::new(4.0, 2.0, f64::NAN).validate(),
            Err(ValidationError::NotPositive { field: "volume", .. })
        ));
    }

    #[test]
    fn test_validate_keeps_explicit_image_and_user() {
        let input = NewRun {
            image: Some("trichter-images/abc.jpg".into()),
            user_id: Some("u7".into()),
            ..NewRun::new(4.0, 2.5, 0.5)
        };
        let valid = input.validate().unwrap();
        assert_eq!(valid.image, "trichter-images/abc.jpg");
        assert_eq!(valid.user_id.as_deref(), Some("u7"));
    }

    #[test]
    fn test_run_name_validation() {
        assert_eq!(validate_run_name("  Rocket  ").unwrap(), "Rocket");
        assert_eq!(validate_run_name("   "), Err(ValidationError::InvalidName));
        let long = "x".repeat(MAX_RUN_NAME_LEN + 1);
        assert_eq!(validate_run_name(&long), Err(ValidationError::InvalidName));
    }

    #[test]
    fn test_run_json_is_camel_case() {
        let json = serde_json::to_value(sample_run()).unwrap();
        assert_eq!(json["createdAt"], "2026-10-18T20:11:04Z");
        assert_eq!(json["user"]["username"], "alice");
        assert_eq!(json["data"]["rate"], 1.9);
    }

    #[test]
    fn test_unclaimed_run_parses_with_null_user() {
        let json = r#"{
            "id": "r2",
            "data": { "duration": 3.0, "rate": 2.0, "volume": 0.4 },
            "createdAt": "2026-10-18T20:11:04Z",
            "user": null
        }"#;
        let run: RunWithOwner = serde_json::from_str(json).unwrap();
        assert!(!run.is_claimed());
        assert_eq!(run.owner_name(), "Unknown");
        assert_eq!(run.image, PLACEHOLDER_IMAGE);
    }
}
