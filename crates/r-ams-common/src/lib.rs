//! ---
//! ams_section: "01-core-functionality"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Shared primitives and utilities for the core runtime."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Core shared primitives for the R-AMS workspace.
//! This crate exposes configuration loading, logging, and clock
//! utilities consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{AppConfig, LinkingConfig, LoggingConfig, MetricsConfig, SeedConfig};
pub use logging::{init_tracing, LogFormat};
pub use time::{now_millis, Clock, FixedClock, SystemClock};
