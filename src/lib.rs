//! Reconstructs end-to-end packet paths from per-host logs of an
//! address-hopping gateway testbed.
//!
//! Hosts log what they send and receive; gateways additionally log how they
//! rewrite packets. [`core::tracer::Tracer`] links every send to the receive
//! it produced, [`core::resolver::TrueEndpointResolver`] spreads the real
//! sender and recipient along each chain, and [`core::walker::TraceWalker`]
//! walks the finished chains.

pub mod config;
pub mod core;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod persist;
pub mod run;
pub mod stats;

pub use config::{RunConfig, TimeRange, TracerConfig, WalkerConfig};
pub use error::{ConfigurationError, IngestError, StoreError, TraceError, TraceResult};
pub use run::{execute, RunReport};
