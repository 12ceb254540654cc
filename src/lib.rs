//! ppk-rs: acquisition pipeline for power-profiler probes
//!
//! Decodes the raw byte stream of a probe into calibrated current samples,
//! stores them in a paged on-disk log with a multi-resolution minimap, and
//! bundles finished sessions into a self-checking export container.

pub mod acquisition;
pub mod common;
pub mod config;
pub mod decoder;
pub mod emulator;
pub mod folding;
pub mod session;
pub mod storage;
pub mod transport;
pub mod trigger;
