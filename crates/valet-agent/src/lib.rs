//! Valet agent library logic.
//!
//! The conversation layer (LLM tool registration, speech pipeline) attaches
//! to this crate from outside: it calls the [`tools::ToolContext`] methods
//! for tool invocations and subscribes to the [`session::SessionSink`] for
//! spoken output. The binary in `main.rs` wires the store, the handler
//! registry, and the two polling loops together.

pub mod config;
pub mod handlers;
pub mod session;
pub mod tools;
pub mod workflows;
