//! # Odin Level 0 Core
//!
//! Runtime-free logic for the Level 0 ingestion pipeline: data models,
//! the Level 0 telemetry formats, the retry policy, the pure execution
//! state machine, and the collaborator traits the pipeline is wired
//! against.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. The
//! native application (`odin-level0`) supplies the adapters.
//!
//! ```text
//!   arrival ──▶ FileDescriptor ──▶ machine::transition ──▶ Directive
//!                                        │
//!            format::{ac, fba, shk, attitude} ──▶ MeasurementRows
//! ```

pub mod backoff;
pub mod error;
pub mod event;
pub mod format;
pub mod machine;
pub mod models;
pub mod ports;
pub mod routing;
