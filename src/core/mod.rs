//! Core infrastructure: error taxonomy and configuration.

pub mod config;
pub mod error;
