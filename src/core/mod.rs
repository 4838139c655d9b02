//! Core modules: storage plumbing and shared primitives.
//!
//! Everything domain-specific lives under [`crate::requirements`]; this
//! module owns the store handle, the DB broker, schema DDL, errors, config,
//! and time/envelope helpers.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod schemas;
pub mod store;
pub mod time;
