// ABOUTME: Library root for cutover - exposes the orchestration engine.
// ABOUTME: The CLI binary is in main.rs.

pub mod bluegreen;
pub mod config;
pub mod deploy;
pub mod error;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod rolling;
pub mod runtime;
pub mod shutdown;
pub mod state;
pub mod types;
