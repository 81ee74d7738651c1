//! # herd-util: shared pure utilities
//!
//! Small, dependency-free helpers used across the herd crates. Everything in
//! here is a pure function: no I/O, no clocks, no global state.

pub mod fnv;

pub use fnv::{fnv32a, fnv64a, fnv128a, fnv32a_seeded, fnv64a_seeded, fnv128a_seeded};
