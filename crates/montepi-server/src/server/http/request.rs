//! Validation of `POST /api/calculate` bodies.
//!
//! Fields arrive as raw JSON values so that every rule can report its own
//! message, and all failing fields are reported together.

use super::error::{ApiError, FieldErrors};
use montepi::{MAX_POINTS, MIN_POINTS, Mode, SubmitRequest};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
pub struct CalculateBody {
    #[serde(default)]
    pub total_points: Option<Value>,
    #[serde(default)]
    pub mode: Option<Value>,
}

impl CalculateBody {
    pub fn validate(self) -> Result<SubmitRequest, ApiError> {
        let mut errors = FieldErrors::new();

        let total_points = match total_points(self.total_points.as_ref()) {
            Ok(points) => Some(points),
            Err(message) => {
                errors.entry("total_points").or_default().push(message);
                None
            }
        };

        let mode = match mode(self.mode.as_ref()) {
            Ok(mode) => Some(mode),
            Err(message) => {
                errors.entry("mode").or_default().push(message);
                None
            }
        };

        match (total_points, mode) {
            (Some(points), Some(mode)) if errors.is_empty() => {
                Ok(SubmitRequest::new(points).with_mode(mode))
            }
            _ => Err(ApiError::Validation(errors)),
        }
    }
}

fn total_points(value: Option<&Value>) -> Result<u64, String> {
    let points = match value {
        None | Some(Value::Null) => return Err("The total points field is required.".into()),
        Some(Value::String(s)) if s.trim().is_empty() => {
            return Err("The total points field is required.".into());
        }
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    }
    .ok_or_else(|| "The total points must be an integer.".to_string())?;

    if points < MIN_POINTS as i64 {
        return Err(format!("The total points must be at least {MIN_POINTS}."));
    }
    if points > MAX_POINTS as i64 {
        return Err(format!("The total points must not exceed {MAX_POINTS}."));
    }
    Ok(points as u64)
}

fn mode(value: Option<&Value>) -> Result<Mode, String> {
    match value {
        None | Some(Value::Null) => Ok(Mode::default()),
        Some(Value::String(s)) => s.parse().map_err(|_| invalid_mode()),
        Some(_) => Err(invalid_mode()),
    }
}

fn invalid_mode() -> String {
    "The mode must be either single or distributed.".to_string()
}
