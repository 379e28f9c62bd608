//! Observability: structured logging and Prometheus counters.
//!
//! - Logging is initialised once by the binary through [`init_tracing`]
//!   (requires the `server` feature for `tracing-subscriber`).
//! - Counters are recorded through [`metrics`] and are no-ops unless the
//!   `prometheus` feature is enabled and the exporter was installed.

pub mod metrics;
#[cfg(feature = "server")]
mod tracing_init;

#[cfg(feature = "server")]
pub use tracing_init::*;
