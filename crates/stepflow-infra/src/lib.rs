//! Infrastructure layer for stepflow.
//!
//! Implements the collaborator traits defined in `stepflow-core` against the
//! local filesystem: subflow discovery from flow directories and TOML engine
//! configuration, plus [`engine::build_engine`] which wires them together.

pub mod config;
pub mod engine;
pub mod flow_source;
