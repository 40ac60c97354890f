//! Shared foundations for the Flock workspace.
//!
//! This crate carries the pieces every other member depends on:
//! - [`config`]: unified configuration loaded from `~/.flock/config.json`
//! - [`error`]: the engine error taxonomy
//! - [`logging`]: tracing subscriber initialization

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{EngineError, Result};
pub use logging::init_logging;
