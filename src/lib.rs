//! editflow library crate
//!
//! Queue-driven agent that turns a natural-language instruction into a
//! verified change set on a hosted repository. The binary wires these
//! modules to stdin/stdout; tests and benchmarks use them directly.

pub mod chat_sync;
pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod index;
pub mod job;
pub mod notify;
pub mod patch;
pub mod propose;
pub mod queue;
pub mod telemetry;
pub mod util;
pub mod worker;
