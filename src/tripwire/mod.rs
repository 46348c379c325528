//! Tripwire: provenance tracing and BLAKE3 input hashing.

pub mod eventlog;
pub mod hasher;
