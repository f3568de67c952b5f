//! Core runtime infrastructure.
//!
//! This module contains the essential components for running Tessera:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Main runtime orchestration
//! - [`time`] - Injectable clocks
//! - [`error`] - Error types and gRPC status mapping

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
