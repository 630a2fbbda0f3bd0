//! Presence verification for class sessions.
//!
//! Two independent attendance signals, RFID tag scans and room headcounts, are
//! appended to an event log per class session ([`db`]), bucketed into fixed
//! time windows ([`aggregate`]) and compared window by window ([`reconcile`]).
//! [`service::VerificationService`] ties these together for callers, and
//! [`api`] exposes it over HTTP.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod reconcile;
pub mod service;

pub use error::{Error, Result};
