//! Shared utilities for VeilLink components.
//!
//! This crate provides the ambient plumbing used by both the connection
//! core and the trust subsystem: configuration loading, structured
//! logging setup, the cipher protecting the trust store at rest, and
//! small time helpers.

pub mod config;
pub mod crypto;
pub mod logging;
pub mod time;

pub use config::{ClientConfig, ConfigError};
