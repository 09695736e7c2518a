//! Gleaner CLI - Command-line interface for the Gleaner harvesting pipeline
//!
//! This crate provides the `gleaner` binary that wires the PostgreSQL store,
//! the HTTP collaborators and the core services together.

pub mod config;

pub use config::{Command, Config, StatusFormat};
