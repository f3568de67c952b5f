//! Tessera - discovery control plane with automatic rollback.
//!
//! Tessera serves versioned proxy configuration over the aggregated discovery
//! protocol. Every distinct content of a `ConfigRequest` is recorded as an
//! immutable `ConfigRevision`; exactly one revision per node is published into
//! the snapshot cache. When a client rejects (NACKs) a pushed version, the
//! revision behind it is tainted and the most recent untainted revision is
//! published in its place.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  watch   ┌─────────────────────┐  create/patch  ┌──────────────────┐
//! │ ConfigRequest│ ───────► │ Request reconciler  │ ─────────────► │  ConfigRevision  │
//! │    store     │          │ (ensure, select,    │                │      store       │
//! └──────────────┘          │  retain, status)    │                └──────────────────┘
//!                           └─────────────────────┘                    │ watch   ▲ taint
//!                                                                      ▼         │
//! ┌──────────────┐  build   ┌─────────────────────┐  set   ┌────────────────┐   │
//! │ Secret store │ ───────► │ Revision reconciler │ ─────► │ Snapshot cache │   │
//! └──────────────┘          │  + cache builder    │        └────────────────┘   │
//!                           └─────────────────────┘                │ subscribe  │
//!                                                                  ▼            │
//!                                                      ┌──────────────────────┐ │
//!                                                      │ ADS server (streams) │─┘
//!                                                      └──────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Main runtime orchestration
//! - [`core::time`] - Injectable clocks
//! - [`core::error`] - Error types and status mapping
//!
//! ## Data model and storage
//! - [`api`] - `ConfigRequest`, `ConfigRevision`, resource declarations, conditions
//! - [`store`] - Versioned object store, revision queries, secrets, manifests
//!
//! ## Reconciliation
//! - [`reconcile::request`] - Revision selection, rollback and retention
//! - [`reconcile::revision`] - Publishing revisions into the snapshot cache
//! - [`reconcile::controller`] - Work queue driven controllers
//!
//! ## Serving
//! - [`cache`] - Decoding, content hashing, snapshots and the snapshot cache
//! - [`xds`] - Aggregated discovery gRPC server and rejection handling
//!
//! ## Operations
//! - [`ops::observability`] - Metrics registry and Prometheus export
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations

// Core infrastructure
pub mod core;

// Data model
pub mod api;

// Object, revision and secret stores
pub mod store;

// Snapshot cache
pub mod cache;

// Controllers
pub mod reconcile;

// Discovery protocol
pub mod xds;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use ops::observability;
