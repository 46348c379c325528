//! Stackform: declarative infrastructure stacks.
//!
//! Resource graphs with lazily resolved outputs, incremental planning
//! against BLAKE3-hashed state, and bounded-parallel apply.

pub mod cli;
pub mod core;
pub mod providers;
pub mod transport;
pub mod tripwire;
