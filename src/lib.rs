//! # Course Harness
//!
//! Bulk enrichment and migration for the course data of an education
//! application.
//!
//! Course Harness walks a two-level hierarchy of records (courses and
//! their questions), enriches each record through an external service or
//! a deterministic migration, and rewrites the store in bounded batches.
//! It tolerates partial failure, paces itself under rate limits, and can
//! take and restore backups around risky migrations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────────────────────┐   ┌──────────┐
//! │  Store   │──▶│ Engine                         │──▶│  Store   │
//! │ (scan)   │   │ limiter → retry → enrichment   │   │ (batched │
//! └──────────┘   │ validate → stage → flush       │   │  commit) │
//!                └───────────────┬────────────────┘   └──────────┘
//!                                │ progress
//!                  ┌─────────────┴─────────────┐
//!                  ▼                           ▼
//!             ┌──────────┐               ┌──────────┐
//!             │   CLI    │               │   HTTP   │
//!             │(coursectl)│              │ triggers │
//!             └──────────┘               └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! coursectl init
//! coursectl import ./data/courses.json
//! coursectl migrate list
//! coursectl migrate run course-category
//! coursectl enhance
//! coursectl health
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error taxonomy |
//! | [`retry`] | Exponential-backoff retry controller |
//! | [`batch`] | Bounded mutation buffer |
//! | [`progress`] | Progress reporters |
//! | [`enrichment`] | Enrichment service abstraction and clients |
//! | [`engine`] | Per-record run engine |
//! | [`operations`] | Enhancement and field-inference operations |
//! | [`backup`] | Backup create, verify, export, restore |
//! | [`planner`] | Migration plans and scope estimation |
//! | [`health`] | Health probes and integrity report |
//! | [`pipeline`] | Facade over all of the above |
//! | [`sqlite_store`] | SQLite [`Store`](course_harness_core::store::Store) backend |
//! | [`import`] | JSON import |
//! | [`server`] | HTTP trigger surface |
//! | [`commands`] | CLI output |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod backup;
pub mod batch;
pub mod commands;
pub mod config;
pub mod db;
pub mod engine;
pub mod enrichment;
pub mod error;
pub mod health;
pub mod import;
pub mod migrate;
pub mod operations;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod server;
pub mod sqlite_store;
