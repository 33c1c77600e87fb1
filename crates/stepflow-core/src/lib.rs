//! Execution engine for stepflow.
//!
//! This crate holds the interpreter and everything it consults while walking
//! a flow. It depends only on `stepflow-types`; filesystem discovery and
//! config loading live in `stepflow-infra`.

pub mod event;
pub mod flow;
pub mod task;
