//! Shared error type, bounds and configuration.
//!
//! - [`error`] - the engine-wide [`Error`](error::Error) enum.
//! - [`types`] - point bounds, chunking constants and
//!   [`EngineConfig`](types::EngineConfig).

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
