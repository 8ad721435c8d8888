//! SceneCast Test - Harness for end-to-end session tests
//!
//! Provides:
//! - In-process participant meshes on a loopback hub ([`Mesh`])
//! - Direct and discovery-based topologies sharing one manual clock
//! - An event recorder with per-scene queries ([`RecordingHandler`])
//! - Criterion benchmarks for the worker pool and flush ordering

pub mod harness;
pub mod recorder;

pub use harness::*;
pub use recorder::*;

#[cfg(test)]
mod network;
#[cfg(test)]
mod scenarios;
