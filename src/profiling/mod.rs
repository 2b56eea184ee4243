//! Scope-based attribution of worker execution time

pub mod profiler;

pub use profiler::*;
