//! Core utilities shared by the cadence crates.
//!
//! This crate provides foundational types used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Configuration loading

mod config;
mod error;
mod logging;
mod timer;

pub use config::{PresentationConfig, RenderConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use logging::{init_logging, init_logging_with_filter};
pub use timer::Timer;
