//! Health probes and operator introspection.

pub mod health;

pub use health::{health_router, status_router, HealthState};
