//! # Odin Level 0 pipeline
//!
//! Event-driven ingestion of Odin Level 0 telemetry files. Every file that
//! lands in raw storage is announced on an arrival buffer, gets exactly one
//! durable execution, is routed by file type to its importer, committed to
//! the relational store in one transaction, and finally announced to the
//! downstream subscribers interested in that file type.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Raw storage │──▶│ arrival      │──▶│ Activation   │
//! │  (FS / S3)  │   │ buffer       │   │ Controller   │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             ▼
//!                   ┌──────────────┐   ┌──────────────┐
//!                   │ Import       │◀──│ Orchestrator │
//!                   │ Transformer  │   │ (executions) │
//!                   └──────┬───────┘   └──────┬───────┘
//!                          ▼                  ▼
//!                   ┌──────────────┐   ┌──────────────┐
//!                   │ Level 0      │   │ Notification │
//!                   │ tables       │   │ Emitter      │
//!                   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! level0 init                        # create database
//! level0 enqueue event.json          # announce a stored file
//! level0 run --once                  # drain the buffer and drive executions
//! level0 executions --state failed   # inspect failures
//! level0 serve                       # operator HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`storage`] | Raw object store (filesystem mirror) |
//! | [`storage_s3`] | Raw object store (S3) |
//! | [`buffer`] | Durable arrival buffer with dead letters |
//! | [`executions`] | Durable execution records |
//! | [`activation`] | Arrival events to executions |
//! | [`import`] | Read, verify, parse and commit one file |
//! | [`sqlite_store`] | Level 0 tables |
//! | [`notify`] | Subscriber selection and delivery |
//! | [`orchestrator`] | Drives executions through the state machine |
//! | [`worker`] | Concurrent buffer polling and driving |
//! | [`pipeline`] | Wiring from configuration |
//! | [`resend`] | Re-announcing stored files |
//! | [`status`] | Operator CLI views |
//! | [`server`] | Operator HTTP API |

pub mod activation;
pub mod buffer;
pub mod config;
pub mod db;
pub mod executions;
pub mod import;
pub mod migrate;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod resend;
pub mod server;
pub mod sqlite_store;
pub mod status;
pub mod storage;
pub mod storage_s3;
pub mod worker;
