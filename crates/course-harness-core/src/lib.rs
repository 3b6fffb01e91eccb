//! # Course Harness Core
//!
//! Shared, runtime-free logic for Course Harness: the record model,
//! the store abstraction, the fixed-window rate limiter, record shape
//! validation, and the keyword inference table used by field migrations.
//!
//! This crate contains no tokio, sqlx, network, or filesystem
//! dependencies. Everything that waits, retries, or talks to the outside
//! world lives in the `course-harness` crate.

pub mod inference;
pub mod models;
pub mod progress;
pub mod rate_limit;
pub mod store;
pub mod validate;
