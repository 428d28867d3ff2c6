use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use montepi::Error;
use serde_json::json;
use std::collections::BTreeMap;

/// Field name to the messages that rejected it.
pub type FieldErrors = BTreeMap<&'static str, Vec<String>>;

/// Every failure an HTTP handler can return.
#[derive(Debug)]
pub enum ApiError {
    /// The request body failed validation (`422`).
    Validation(FieldErrors),
    /// A calculation was created but could not be carried out (`500`).
    CalculationFailed(Error),
    /// Anything raised by the engine outside of submission.
    Engine(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Engine(err)
    }
}

/// `"first message"` or `"first message (and N more errors)"`.
fn summarize(errors: &FieldErrors) -> String {
    let mut messages = errors.values().flatten();
    let Some(first) = messages.next() else {
        return "The given data was invalid.".to_string();
    };
    match messages.count() {
        0 => first.clone(),
        1 => format!("{first} (and 1 more error)"),
        n => format!("{first} (and {n} more errors)"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "message": summarize(&errors), "errors": errors }),
            ),
            Self::Engine(Error::InvalidRequest { field, reason }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "message": reason, "errors": { (field): [reason] } }),
            ),
            Self::Engine(err @ Error::NotFound { .. }) => (
                StatusCode::NOT_FOUND,
                json!({ "message": err.to_string() }),
            ),
            Self::Engine(err @ Error::ServiceShutdown)
            | Self::CalculationFailed(err @ Error::ServiceShutdown) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "message": err.to_string() }),
            ),
            Self::CalculationFailed(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "message": "Calculation failed", "error": err.to_string() }),
            ),
            Self::Engine(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "message": "Server Error", "error": err.to_string() }),
            ),
        };
        (status, Json(body)).into_response()
    }
}
