//! Kafka → Pub/Sub Bridge Observability
//!
//! Prometheus metrics for the bridge engine and the HTTP exporter that serves
//! them. The engine's `MetricsObserver` is the only writer; the binary mounts
//! [`create_metrics_router`] on `metrics_addr`.
//!
//! ```no_run
//! use pubsub_bridge_observability::{create_metrics_router, metrics};
//!
//! metrics::init();
//! let router = create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use exporter::create_metrics_router;
pub use metrics::REGISTRY;
