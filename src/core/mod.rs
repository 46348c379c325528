//! Core engine: types, parsing, graph, outputs, planning, execution, state.

pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod output;
pub mod parser;
pub mod planner;
pub mod state;
pub mod types;
