//! Operations and observability.
//!
//! - [`observability`] - Metrics registry and Prometheus text export

pub mod observability;
